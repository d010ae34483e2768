//! Vulkan 1.3 backend: device setup, memory, presentation, and ray tracing.

pub mod context;
pub mod debug;
pub mod surface;
pub mod swapchain;
pub mod frame;
pub mod memory;
pub mod commands;
pub mod descriptors;
pub mod shader;
pub mod pipeline;
pub mod raytracing;

pub use context::{ContextOptions, RtProperties, VulkanContext};
pub use debug::{DebugSeverity, DebugSink, TracingSink};
pub use surface::VulkanSurface;
pub use swapchain::{drawable_extent, ExtentSource, Swapchain};
pub use frame::{AcquiredFrame, FrameScheduler, SlotState, SlotTracker, MAX_FRAMES_IN_FLIGHT};
pub use memory::{Buffer, Image, MemoryManager};
pub use commands::{BufferHazard, CommandManager};
pub use descriptors::{FrameDescriptors, TraceBindings, TraceDescriptors};
pub use pipeline::{GraphicsConfig, GraphicsPipeline, Pipeline, Topology};

use ash::vk;
use std::ffi::CStr;

/// Required Vulkan version.
pub const REQUIRED_VK_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);

/// Application name for Vulkan instance.
pub const APP_NAME: &CStr = c"Rayner";

/// Engine name for Vulkan instance.
pub const ENGINE_NAME: &CStr = c"Rayner";

/// Engine version.
pub const ENGINE_VERSION: u32 = vk::make_api_version(0, 0, 1, 0);

/// Pass `result` through, running `cleanup` first when it is an error.
pub(crate) fn or_cleanup<T, E>(result: Result<T, E>, cleanup: impl FnOnce()) -> Result<T, E> {
    if result.is_err() {
        cleanup();
    }
    result
}

/// Create `count` objects in order. On the first failure the ones already
/// created go to `destroy`, newest first.
pub(crate) fn create_all<T, E>(
    count: usize,
    mut create: impl FnMut(usize) -> Result<T, E>,
    mut destroy: impl FnMut(T),
) -> Result<Vec<T>, E> {
    let mut created = Vec::with_capacity(count);
    for i in 0..count {
        match create(i) {
            Ok(object) => created.push(object),
            Err(e) => {
                while let Some(object) = created.pop() {
                    destroy(object);
                }
                return Err(e);
            }
        }
    }
    Ok(created)
}
