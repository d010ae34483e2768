//! Frame slot scheduling.
//!
//! Two slots rotate; each owns an image-available semaphore, a
//! render-finished semaphore and a fence created signaled. The host never
//! records into a slot until that slot's fence has been waited.

use ash::vk;

use super::{Swapchain, VulkanContext};
use crate::error::{RenderError, RenderResult};

/// Number of frames the host may record ahead of the device.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Host-side view of one frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Free for recording.
    Idle,
    /// Submitted; the device may still be executing it.
    Submitted,
    /// Fence observed signaled, not yet recycled.
    Complete,
}

/// Tracks slot states and the current slot.
#[derive(Debug, Clone)]
pub struct SlotTracker {
    states: [SlotState; MAX_FRAMES_IN_FLIGHT],
    current: usize,
}

impl Default for SlotTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotTracker {
    pub fn new() -> Self {
        Self {
            states: [SlotState::Idle; MAX_FRAMES_IN_FLIGHT],
            current: 0,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.states[slot % MAX_FRAMES_IN_FLIGHT]
    }

    /// The current slot's fence was waited.
    pub fn on_fence_signaled(&mut self) {
        if self.states[self.current] == SlotState::Submitted {
            self.states[self.current] = SlotState::Complete;
        }
    }

    /// An image was acquired for the current slot; it is ready to record.
    pub fn on_acquire(&mut self) -> RenderResult<()> {
        match self.states[self.current] {
            SlotState::Submitted => Err(RenderError::InvalidState(format!(
                "slot {} acquired before its fence was waited",
                self.current
            ))),
            _ => {
                self.states[self.current] = SlotState::Idle;
                Ok(())
            }
        }
    }

    pub fn on_submit(&mut self) -> RenderResult<()> {
        if self.states[self.current] != SlotState::Idle {
            return Err(RenderError::InvalidState(format!(
                "slot {} submitted while {:?}",
                self.current, self.states[self.current]
            )));
        }
        self.states[self.current] = SlotState::Submitted;
        Ok(())
    }

    /// Move to the next slot.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % MAX_FRAMES_IN_FLIGHT;
    }

    pub fn in_flight(&self) -> usize {
        self.states.iter().filter(|s| **s == SlotState::Submitted).count()
    }
}

/// Per-slot synchronization primitives.
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

/// Result of a successful acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredFrame {
    pub slot: usize,
    pub image_index: u32,
    /// The image is usable but the swapchain should be rebuilt after present.
    pub suboptimal: bool,
}

/// Drives acquire, submit and present for the rotating frame slots.
pub struct FrameScheduler {
    sync: Vec<FrameSync>,
    tracker: SlotTracker,
    needs_recreate: bool,
}

impl FrameScheduler {
    pub unsafe fn new(ctx: &VulkanContext) -> RenderResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let fence_info = vk::FenceCreateInfo::default()
            .flags(vk::FenceCreateFlags::SIGNALED);

        let mut scheduler = Self {
            sync: Vec::with_capacity(MAX_FRAMES_IN_FLIGHT),
            tracker: SlotTracker::new(),
            needs_recreate: false,
        };

        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            let created = (|| -> RenderResult<FrameSync> {
                let image_available = ctx.device.create_semaphore(&semaphore_info, None)
                    .map_err(RenderError::construction("create semaphore"))?;
                let render_finished = match ctx.device.create_semaphore(&semaphore_info, None) {
                    Ok(s) => s,
                    Err(e) => {
                        ctx.device.destroy_semaphore(image_available, None);
                        return Err(RenderError::construction("create semaphore")(e));
                    }
                };
                let in_flight = match ctx.device.create_fence(&fence_info, None) {
                    Ok(f) => f,
                    Err(e) => {
                        ctx.device.destroy_semaphore(image_available, None);
                        ctx.device.destroy_semaphore(render_finished, None);
                        return Err(RenderError::construction("create fence")(e));
                    }
                };
                Ok(FrameSync { image_available, render_finished, in_flight })
            })();

            match created {
                Ok(sync) => scheduler.sync.push(sync),
                Err(e) => {
                    scheduler.destroy(ctx);
                    return Err(e);
                }
            }
        }

        Ok(scheduler)
    }

    pub fn current_slot(&self) -> usize {
        self.tracker.current()
    }

    pub fn tracker(&self) -> &SlotTracker {
        &self.tracker
    }

    pub fn needs_recreate(&self) -> bool {
        self.needs_recreate
    }

    pub fn request_recreate(&mut self) {
        self.needs_recreate = true;
    }

    pub fn clear_recreate(&mut self) {
        self.needs_recreate = false;
    }

    /// Wait for the current slot and acquire the next image.
    ///
    /// Returns `Ok(None)` when the swapchain is out of date; the caller
    /// should recreate it and try again next iteration.
    pub unsafe fn acquire(&mut self, ctx: &VulkanContext, swapchain: &Swapchain) -> RenderResult<Option<AcquiredFrame>> {
        let slot = self.tracker.current();
        let sync = &self.sync[slot];

        ctx.wait_for_fence(sync.in_flight, "frame slot fence")?;
        self.tracker.on_fence_signaled();

        let result = ctx.swapchain_loader()?.acquire_next_image(
            swapchain.handle,
            ctx.fence_timeout_ns(),
            sync.image_available,
            vk::Fence::null(),
        );

        let (image_index, suboptimal) = match result {
            Ok(acquired) => acquired,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                tracing::warn!("swapchain out of date on acquire");
                self.needs_recreate = true;
                return Ok(None);
            }
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => {
                return Err(RenderError::Timeout {
                    what: "swapchain image",
                    timeout_ms: ctx.fence_timeout.as_millis() as u64,
                });
            }
            Err(e) => return Err(RenderError::vk("vkAcquireNextImageKHR")(e)),
        };

        if suboptimal {
            tracing::warn!("swapchain suboptimal on acquire");
            self.needs_recreate = true;
        }

        self.tracker.on_acquire()?;

        Ok(Some(AcquiredFrame { slot, image_index, suboptimal }))
    }

    /// Submit the slot's command buffer.
    pub unsafe fn submit(&mut self, ctx: &VulkanContext, cmd: vk::CommandBuffer) -> RenderResult<()> {
        let sync = &self.sync[self.tracker.current()];

        // Reset only once work is guaranteed to be submitted
        ctx.device.reset_fences(&[sync.in_flight])
            .map_err(RenderError::vk("vkResetFences"))?;

        let wait_semaphores = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [sync.render_finished];
        let command_buffers = [cmd];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        ctx.device.queue_submit(ctx.graphics_queue, &[submit_info], sync.in_flight)
            .map_err(RenderError::vk("vkQueueSubmit"))?;

        self.tracker.on_submit()
    }

    /// Present and advance to the next slot.
    pub unsafe fn present(&mut self, ctx: &VulkanContext, swapchain: &Swapchain, image_index: u32) -> RenderResult<()> {
        let sync = &self.sync[self.tracker.current()];

        let swapchains = [swapchain.handle];
        let image_indices = [image_index];
        let wait_semaphores = [sync.render_finished];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = ctx.swapchain_loader()?.queue_present(ctx.present_queue, &present_info);

        self.tracker.advance();

        match result {
            Ok(false) => Ok(()),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::SUBOPTIMAL_KHR) => {
                tracing::warn!("swapchain needs recreation after present");
                self.needs_recreate = true;
                Ok(())
            }
            Err(e) => Err(RenderError::vk("vkQueuePresentKHR")(e)),
        }
    }

    /// Destroy all sync objects. The device must be idle.
    pub unsafe fn destroy(&mut self, ctx: &VulkanContext) {
        for sync in self.sync.drain(..) {
            ctx.device.destroy_semaphore(sync.image_available, None);
            ctx.device.destroy_semaphore(sync.render_finished, None);
            ctx.device.destroy_fence(sync.in_flight, None);
        }
    }
}
