//! Command buffer management and synchronization.
//!
//! Each frame slot owns a resettable pool with one primary buffer. One-shot
//! work (uploads, acceleration structure builds, readbacks) goes through a
//! transient pool and is waited on with a fence bounded by the context's
//! fence timeout.

use ash::vk;

use super::{create_all, or_cleanup, Buffer, VulkanContext, MAX_FRAMES_IN_FLIGHT};
use crate::error::{RenderError, RenderResult};

/// Command pool and buffer for a single frame slot.
pub struct FrameCommands {
    pub pool: vk::CommandPool,
    pub primary: vk::CommandBuffer,
}

/// Buffer hazards the renderer synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferHazard {
    /// Last frame's vertex fetch of trace output before the trace overwrites it.
    VertexReadToTraceWrite,
    /// Trace output consumed as vertex data in the same frame.
    TraceWriteToVertexRead,
    /// Trace output read back on the host after a fence wait.
    TraceWriteToHostRead,
    /// Acceleration structure build consumed by a later build or trace.
    BuildWriteToBuildRead,
}

impl BufferHazard {
    /// (src access, dst access, src stage, dst stage)
    pub fn masks(self) -> (vk::AccessFlags, vk::AccessFlags, vk::PipelineStageFlags, vk::PipelineStageFlags) {
        match self {
            BufferHazard::VertexReadToTraceWrite => (
                vk::AccessFlags::SHADER_READ,
                vk::AccessFlags::SHADER_WRITE,
                vk::PipelineStageFlags::VERTEX_SHADER,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            ),
            BufferHazard::TraceWriteToVertexRead => (
                vk::AccessFlags::SHADER_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::PipelineStageFlags::VERTEX_SHADER,
            ),
            BufferHazard::TraceWriteToHostRead => (
                vk::AccessFlags::SHADER_WRITE,
                vk::AccessFlags::HOST_READ,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::PipelineStageFlags::HOST,
            ),
            BufferHazard::BuildWriteToBuildRead => (
                vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
                vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                    | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            ),
        }
    }
}

/// One-shot command pool bound to a queue.
struct OneShotPool {
    pool: vk::CommandPool,
    queue: vk::Queue,
}

/// Command buffer manager with per-frame pools.
pub struct CommandManager {
    frames: Vec<FrameCommands>,
    transient: OneShotPool,
    transfer: Option<OneShotPool>,
    device: ash::Device,
}

impl CommandManager {
    /// Create a new command manager.
    pub unsafe fn new(ctx: &VulkanContext) -> RenderResult<Self> {
        let graphics_family = ctx.queue_families.graphics
            .ok_or_else(|| RenderError::Construction("No graphics queue family".to_string()))?;

        let device = &ctx.device;

        // Destroying a frame pool also frees its primary buffer.
        let frames = create_all(
            MAX_FRAMES_IN_FLIGHT,
            |_| -> RenderResult<FrameCommands> {
                let pool_info = vk::CommandPoolCreateInfo::default()
                    .queue_family_index(graphics_family)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

                let pool = device.create_command_pool(&pool_info, None)
                    .map_err(RenderError::construction("create command pool"))?;

                let alloc_info = vk::CommandBufferAllocateInfo::default()
                    .command_pool(pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1);

                let buffers = or_cleanup(
                    device.allocate_command_buffers(&alloc_info)
                        .map_err(RenderError::construction("allocate command buffer")),
                    || device.destroy_command_pool(pool, None),
                )?;

                Ok(FrameCommands { pool, primary: buffers[0] })
            },
            |frame| device.destroy_command_pool(frame.pool, None),
        )?;
        let destroy_frames = || {
            for frame in &frames {
                device.destroy_command_pool(frame.pool, None);
            }
        };

        let transient_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(graphics_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let transient = OneShotPool {
            pool: or_cleanup(
                device.create_command_pool(&transient_info, None)
                    .map_err(RenderError::construction("create transient pool")),
                destroy_frames,
            )?,
            queue: ctx.graphics_queue,
        };

        let transfer = match (ctx.queue_families.transfer, ctx.transfer_queue) {
            (Some(family), Some(queue)) if family != graphics_family => {
                let info = vk::CommandPoolCreateInfo::default()
                    .queue_family_index(family)
                    .flags(vk::CommandPoolCreateFlags::TRANSIENT);
                let pool = or_cleanup(
                    device.create_command_pool(&info, None)
                        .map_err(RenderError::construction("create transfer pool")),
                    || {
                        device.destroy_command_pool(transient.pool, None);
                        destroy_frames();
                    },
                )?;
                tracing::debug!(family, "using dedicated transfer queue for uploads");
                Some(OneShotPool { pool, queue })
            }
            _ => None,
        };

        Ok(Self {
            frames,
            transient,
            transfer,
            device: ctx.device.clone(),
        })
    }

    fn frame(&self, slot: usize) -> RenderResult<&FrameCommands> {
        self.frames.get(slot).ok_or_else(|| {
            RenderError::InvalidInput(format!("frame slot {} out of range", slot))
        })
    }

    /// Begin recording commands for a frame slot.
    pub unsafe fn begin_frame(&self, slot: usize) -> RenderResult<vk::CommandBuffer> {
        let frame = self.frame(slot)?;

        self.device.reset_command_buffer(frame.primary, vk::CommandBufferResetFlags::empty())
            .map_err(RenderError::vk("vkResetCommandBuffer"))?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        self.device.begin_command_buffer(frame.primary, &begin_info)
            .map_err(RenderError::vk("vkBeginCommandBuffer"))?;

        Ok(frame.primary)
    }

    /// End recording commands for a frame slot.
    pub unsafe fn end_frame(&self, slot: usize) -> RenderResult<()> {
        let frame = self.frame(slot)?;
        self.device.end_command_buffer(frame.primary)
            .map_err(RenderError::vk("vkEndCommandBuffer"))
    }

    unsafe fn begin_one_shot(&self, pool: &OneShotPool) -> RenderResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = self.device.allocate_command_buffers(&alloc_info)
            .map_err(RenderError::vk("vkAllocateCommandBuffers"))?[0];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        if let Err(e) = self.device.begin_command_buffer(cmd, &begin_info) {
            self.device.free_command_buffers(pool.pool, &[cmd]);
            return Err(RenderError::vk("vkBeginCommandBuffer")(e));
        }

        Ok(cmd)
    }

    unsafe fn end_one_shot(&self, ctx: &VulkanContext, pool: &OneShotPool, cmd: vk::CommandBuffer) -> RenderResult<()> {
        let result = self.submit_and_wait(ctx, pool.queue, cmd);
        self.device.free_command_buffers(pool.pool, &[cmd]);
        result
    }

    unsafe fn submit_and_wait(&self, ctx: &VulkanContext, queue: vk::Queue, cmd: vk::CommandBuffer) -> RenderResult<()> {
        self.device.end_command_buffer(cmd)
            .map_err(RenderError::vk("vkEndCommandBuffer"))?;

        let fence = self.device.create_fence(&vk::FenceCreateInfo::default(), None)
            .map_err(RenderError::vk("vkCreateFence"))?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);

        let result = self.device.queue_submit(queue, &[submit_info], fence)
            .map_err(RenderError::vk("vkQueueSubmit"))
            .and_then(|()| ctx.wait_for_fence(fence, "one-shot command buffer"));

        self.device.destroy_fence(fence, None);
        result
    }

    /// Begin a single-use command buffer on the graphics queue.
    pub unsafe fn begin_single_time(&self) -> RenderResult<vk::CommandBuffer> {
        self.begin_one_shot(&self.transient)
    }

    /// End and submit a single-use command buffer, waiting for completion.
    pub unsafe fn end_single_time(&self, ctx: &VulkanContext, cmd: vk::CommandBuffer) -> RenderResult<()> {
        self.end_one_shot(ctx, &self.transient, cmd)
    }

    /// Record `record` into a one-shot graphics buffer and wait for it.
    pub unsafe fn run_graphics<F>(&self, ctx: &VulkanContext, record: F) -> RenderResult<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let cmd = self.begin_single_time()?;
        record(cmd);
        self.end_single_time(ctx, cmd)
    }

    /// Record `record` into a one-shot buffer on the transfer queue (the
    /// graphics queue when the device has no separate one) and wait for it.
    pub unsafe fn run_transfer<F>(&self, ctx: &VulkanContext, record: F) -> RenderResult<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let pool = self.transfer.as_ref().unwrap_or(&self.transient);
        let cmd = self.begin_one_shot(pool)?;
        record(cmd);
        self.end_one_shot(ctx, pool, cmd)
    }

    /// Record a whole-buffer memory barrier for `hazard`.
    pub unsafe fn buffer_barrier(&self, cmd: vk::CommandBuffer, buffer: &Buffer, hazard: BufferHazard) {
        let (src_access, dst_access, src_stage, dst_stage) = hazard.masks();

        let barrier = vk::BufferMemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer.handle)
            .offset(0)
            .size(vk::WHOLE_SIZE);

        self.device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[barrier],
            &[],
        );
    }

    /// Record a global memory barrier for `hazard`.
    pub unsafe fn memory_barrier(&self, cmd: vk::CommandBuffer, hazard: BufferHazard) {
        let (src_access, dst_access, src_stage, dst_stage) = hazard.masks();

        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);

        self.device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }

    /// Destroy all command pools.
    pub unsafe fn destroy(&mut self, ctx: &VulkanContext) {
        for frame in self.frames.drain(..) {
            ctx.device.destroy_command_pool(frame.pool, None);
        }
        ctx.device.destroy_command_pool(self.transient.pool, None);
        if let Some(transfer) = self.transfer.take() {
            ctx.device.destroy_command_pool(transfer.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_hazards_mirror_each_other() {
        let (src_a, dst_a, src_stage_a, dst_stage_a) = BufferHazard::VertexReadToTraceWrite.masks();
        let (src_b, dst_b, src_stage_b, dst_stage_b) = BufferHazard::TraceWriteToVertexRead.masks();
        assert_eq!(src_a, dst_b);
        assert_eq!(dst_a, src_b);
        assert_eq!(src_stage_a, dst_stage_b);
        assert_eq!(dst_stage_a, src_stage_b);
    }

    #[test]
    fn test_trace_write_waits_on_vertex_stage() {
        let (_, dst, src_stage, dst_stage) = BufferHazard::VertexReadToTraceWrite.masks();
        assert_eq!(src_stage, vk::PipelineStageFlags::VERTEX_SHADER);
        assert_eq!(dst_stage, vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR);
        assert!(dst.contains(vk::AccessFlags::SHADER_WRITE));
    }

    #[test]
    fn test_host_readback_waits_for_trace() {
        let (_, dst, src_stage, dst_stage) = BufferHazard::TraceWriteToHostRead.masks();
        assert_eq!(dst, vk::AccessFlags::HOST_READ);
        assert_eq!(src_stage, vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR);
        assert_eq!(dst_stage, vk::PipelineStageFlags::HOST);
    }

    #[test]
    fn test_build_hazard_covers_trace_stage() {
        let (_, dst, _, dst_stage) = BufferHazard::BuildWriteToBuildRead.masks();
        assert!(dst.contains(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR));
        assert!(dst_stage.contains(vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR));
    }
}
