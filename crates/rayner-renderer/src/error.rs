//! Renderer error type.

use std::fmt;
use std::path::PathBuf;

use ash::vk;
use gpu_allocator::AllocationError;
use thiserror::Error;

/// Coarse classification used for the process exit diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Device, pipeline or acceleration structure could not be created.
    Construction,
    /// A fence wait exceeded its bound.
    Timeout,
    /// Allocation failure. The only category a caller may retry.
    ResourceExhaustion,
    /// Some other Vulkan call failed at runtime.
    Device,
    /// The API was used out of order or with bad arguments.
    Usage,
    /// Reading shader binaries failed.
    Io,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Construction => "construction",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ResourceExhaustion => "out-of-memory",
            ErrorCategory::Device => "device",
            ErrorCategory::Usage => "usage",
            ErrorCategory::Io => "io",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("{0}")]
    Construction(String),

    #[error("{call} failed: {result:?}")]
    Vulkan { call: &'static str, result: vk::Result },

    #[error("timed out after {timeout_ms} ms waiting for {what}")]
    Timeout { what: &'static str, timeout_ms: u64 },

    #[error("out of memory allocating {what}")]
    OutOfMemory { what: String },

    #[error("allocation of {what} failed: {source}")]
    Allocation {
        what: String,
        #[source]
        source: AllocationError,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("failed to load shader {}: {source}", path.display())]
    ShaderLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type RenderResult<T> = Result<T, RenderError>;

impl RenderError {
    /// Map a failed runtime call. Memory exhaustion gets its own variant.
    pub fn vk(call: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                RenderError::OutOfMemory { what: call.to_string() }
            }
            _ => RenderError::Vulkan { call, result },
        }
    }

    /// Map a failed creation call to a fatal construction error.
    pub fn construction(what: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                RenderError::OutOfMemory { what: what.to_string() }
            }
            _ => RenderError::Construction(format!("Failed to {}: {:?}", what, result)),
        }
    }

    /// Map an allocator failure for the named resource.
    pub fn allocation(what: &str, error: AllocationError) -> Self {
        match error {
            AllocationError::OutOfMemory => RenderError::OutOfMemory { what: what.to_string() },
            source => RenderError::Allocation { what: what.to_string(), source },
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            RenderError::Construction(_) => ErrorCategory::Construction,
            RenderError::Vulkan { .. } => ErrorCategory::Device,
            RenderError::Timeout { .. } => ErrorCategory::Timeout,
            RenderError::OutOfMemory { .. } => ErrorCategory::ResourceExhaustion,
            RenderError::Allocation { .. } => ErrorCategory::Device,
            RenderError::InvalidInput(_) | RenderError::InvalidState(_) => ErrorCategory::Usage,
            RenderError::ShaderLoad { .. } => ErrorCategory::Io,
        }
    }

    /// True only for resource exhaustion.
    pub fn is_recoverable(&self) -> bool {
        self.category() == ErrorCategory::ResourceExhaustion
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // Categories
    // ============================================================

    #[test]
    fn test_out_of_device_memory_is_exhaustion() {
        let err = RenderError::vk("vkQueueSubmit")(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert_eq!(err.category(), ErrorCategory::ResourceExhaustion);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_construction_failure_is_fatal() {
        let err = RenderError::construction("create ray tracing pipeline")(vk::Result::ERROR_UNKNOWN);
        assert_eq!(err.category(), ErrorCategory::Construction);
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("create ray tracing pipeline"));
    }

    #[test]
    fn test_construction_out_of_memory_stays_distinct() {
        let err = RenderError::construction("create buffer")(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        assert!(matches!(err, RenderError::OutOfMemory { .. }));
    }

    #[test]
    fn test_allocator_out_of_memory_maps_to_exhaustion() {
        let err = RenderError::allocation("vertices", AllocationError::OutOfMemory);
        assert!(matches!(err, RenderError::OutOfMemory { ref what } if what == "vertices"));
    }

    #[test]
    fn test_other_allocator_errors_are_not_exhaustion() {
        let err = RenderError::allocation("vertices", AllocationError::NoCompatibleMemoryTypeFound);
        assert_eq!(err.category(), ErrorCategory::Device);
    }

    #[test]
    fn test_timeout_is_distinct_from_construction() {
        let err = RenderError::Timeout { what: "frame slot fence", timeout_ms: 10 };
        assert_eq!(err.category(), ErrorCategory::Timeout);
        assert_eq!(err.category().to_string(), "timeout");
    }

    #[test]
    fn test_other_vulkan_errors_are_device_errors() {
        let err = RenderError::vk("vkQueuePresentKHR")(vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(err, RenderError::Vulkan { result: vk::Result::ERROR_DEVICE_LOST, .. }));
        assert_eq!(err.category(), ErrorCategory::Device);
    }
}
