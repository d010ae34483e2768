//! Validation layer message routing.
//!
//! The debug messenger forwards every message to a [`DebugSink`] supplied at
//! context construction. The sink pointer travels through the messenger's
//! user data, so there is no process-wide callback state.

use std::ffi::{c_void, CStr};
use std::sync::Arc;

use ash::{vk, Entry, Instance};
use ash::ext::debug_utils;

use crate::error::{RenderError, RenderResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DebugSeverity {
    Verbose,
    Info,
    Warning,
    Error,
}

impl DebugSeverity {
    pub fn from_flags(flags: vk::DebugUtilsMessageSeverityFlagsEXT) -> Self {
        if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
            DebugSeverity::Error
        } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
            DebugSeverity::Warning
        } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
            DebugSeverity::Info
        } else {
            DebugSeverity::Verbose
        }
    }
}

/// Message kind label: "validation", "performance" or "general".
pub fn message_kind(types: vk::DebugUtilsMessageTypeFlagsEXT) -> &'static str {
    if types.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
        "validation"
    } else if types.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
        "performance"
    } else {
        "general"
    }
}

/// Receiver for driver and validation layer messages.
pub trait DebugSink: Send + Sync {
    fn message(&self, severity: DebugSeverity, kind: &str, text: &str);
}

/// Default sink: forwards to `tracing` under the `vulkan` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DebugSink for TracingSink {
    fn message(&self, severity: DebugSeverity, kind: &str, text: &str) {
        match severity {
            DebugSeverity::Error => tracing::error!(target: "vulkan", kind, "{}", text),
            DebugSeverity::Warning => tracing::warn!(target: "vulkan", kind, "{}", text),
            DebugSeverity::Info => tracing::debug!(target: "vulkan", kind, "{}", text),
            DebugSeverity::Verbose => tracing::trace!(target: "vulkan", kind, "{}", text),
        }
    }
}

/// Live debug messenger. Owns the boxed sink its callback points at.
pub(crate) struct DebugMessenger {
    loader: debug_utils::Instance,
    handle: vk::DebugUtilsMessengerEXT,
    // Boxed twice so the user data pointer is thin and stable.
    _sink: Box<Arc<dyn DebugSink>>,
}

impl DebugMessenger {
    pub(crate) unsafe fn new(
        entry: &Entry,
        instance: &Instance,
        sink: Arc<dyn DebugSink>,
    ) -> RenderResult<Self> {
        let loader = debug_utils::Instance::new(entry, instance);
        let sink = Box::new(sink);
        let user_data = &*sink as *const Arc<dyn DebugSink> as *mut c_void;

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR |
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING |
                vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL |
                vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION |
                vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
            )
            .pfn_user_callback(Some(debug_callback))
            .user_data(user_data);

        let handle = loader
            .create_debug_utils_messenger(&create_info, None)
            .map_err(RenderError::construction("create debug messenger"))?;

        Ok(Self { loader, handle, _sink: sink })
    }

    pub(crate) unsafe fn destroy(&self) {
        self.loader.destroy_debug_utils_messenger(self.handle, None);
    }
}

/// Route one message to a sink.
pub(crate) fn dispatch(
    sink: &dyn DebugSink,
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    text: &str,
) {
    sink.message(DebugSeverity::from_flags(severity), message_kind(types), text);
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    user_data: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || user_data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }

    let sink = &*(user_data as *const Arc<dyn DebugSink>);
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();
    dispatch(sink.as_ref(), severity, types, &message);

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<(DebugSeverity, String, String)>>,
    }

    impl DebugSink for RecordingSink {
        fn message(&self, severity: DebugSeverity, kind: &str, text: &str) {
            self.messages.lock().push((severity, kind.to_string(), text.to_string()));
        }
    }

    #[test]
    fn test_severity_picks_most_severe_bit() {
        let flags = vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR;
        assert_eq!(DebugSeverity::from_flags(flags), DebugSeverity::Error);
        assert_eq!(
            DebugSeverity::from_flags(vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE),
            DebugSeverity::Verbose
        );
    }

    #[test]
    fn test_dispatch_reaches_injected_sink() {
        let sink = RecordingSink::default();
        dispatch(
            &sink,
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            "slow path",
        );
        let messages = sink.messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0], (DebugSeverity::Warning, "performance".to_string(), "slow path".to_string()));
    }

    #[test]
    fn test_callback_reads_sink_from_user_data() {
        let recorder = Arc::new(RecordingSink::default());
        let sink: Box<Arc<dyn DebugSink>> = Box::new(recorder.clone());
        let user_data = &*sink as *const Arc<dyn DebugSink> as *mut c_void;

        let text = c"object leaked";
        let data = vk::DebugUtilsMessengerCallbackDataEXT {
            p_message: text.as_ptr(),
            ..Default::default()
        };

        let result = unsafe {
            debug_callback(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
                &data,
                user_data,
            )
        };

        assert_eq!(result, vk::FALSE);
        let messages = recorder.messages.lock();
        assert_eq!(messages[0].0, DebugSeverity::Error);
        assert_eq!(messages[0].1, "validation");
        assert_eq!(messages[0].2, "object leaked");
    }

    #[test]
    fn test_callback_ignores_null_user_data() {
        let data = vk::DebugUtilsMessengerCallbackDataEXT::default();
        let result = unsafe {
            debug_callback(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL,
                &data,
                std::ptr::null_mut(),
            )
        };
        assert_eq!(result, vk::FALSE);
    }
}
