//! Per-frame orchestration: acquire, optional trace, raster passes, present.

use ash::vk;
use glam::Mat4;

use rayner_common::{FrameRequest, RaynerConfig};

use crate::error::{RenderError, RenderResult};
use crate::geometry::GeometryBuffers;
use crate::raytracer::RayTracer;
use crate::vulkan::raytracing::RtConsts;
use crate::vulkan::{
    drawable_extent, CommandManager, ExtentSource, FrameDescriptors, FrameScheduler, GraphicsConfig, GraphicsPipeline,
    MemoryManager, Pipeline, Swapchain, Topology, VulkanContext, VulkanSurface,
};

/// Width of ray segments when the device supports wide lines.
pub const RAY_LINE_WIDTH: f32 = 5.0;

const CLEAR_COLOR: [f32; 4] = [0.01, 0.01, 0.01, 1.0];
const CLEAR_DEPTH: f32 = 1.0;

/// One raster pass over the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Indexed mesh draw.
    Triangles,
    /// `2 * ray_count` vertices, origin then hit.
    Rays(u32),
    /// Sampled points.
    Points(u32),
    /// Hit positions, drawn with the points pipeline.
    Hits(u32),
}

/// Raster passes `request` asks for, in draw order. Passes with nothing to
/// draw are left out.
pub fn plan_passes(request: &FrameRequest) -> Vec<Pass> {
    let mut passes = Vec::with_capacity(4);
    if request.show_triangles {
        passes.push(Pass::Triangles);
    }
    if request.show_rays && request.ray_count > 0 {
        passes.push(Pass::Rays(request.ray_count * 2));
    }
    if request.show_points && request.point_count > 0 {
        passes.push(Pass::Points(request.point_count));
    }
    if request.show_hits && request.ray_count > 0 {
        passes.push(Pass::Hits(request.ray_count));
    }
    passes
}

/// What has to happen before a frame can be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePrep {
    /// The swapchain is current.
    Render,
    /// Rebuild the swapchain at this extent first.
    Rebuild(vk::Extent2D),
    /// The window is minimized. Skip the frame and keep the rebuild pending.
    Skip,
}

/// Decide how to start a frame. Reads the extent once and never waits, so a
/// minimized window hands control back to the event loop.
pub fn prepare_frame(needs_recreate: bool, window: &dyn ExtentSource) -> FramePrep {
    if !needs_recreate {
        return FramePrep::Render;
    }
    match drawable_extent(window) {
        Some(extent) => FramePrep::Rebuild(extent),
        None => FramePrep::Skip,
    }
}

/// Line width to use given the enabled device features.
pub fn line_width(features: &vk::PhysicalDeviceFeatures) -> f32 {
    if features.wide_lines == vk::TRUE {
        RAY_LINE_WIDTH
    } else {
        1.0
    }
}

pub struct Renderer {
    pub surface: VulkanSurface,
    pub swapchain: Swapchain,
    pub scheduler: FrameScheduler,
    frame_descriptors: FrameDescriptors,
    triangles: Pipeline,
    lines: Pipeline,
    points: Pipeline,
    line_width: f32,
    idle_after_trace: bool,
}

impl Renderer {
    pub unsafe fn new(
        ctx: &VulkanContext,
        memory: &MemoryManager,
        window: &winit::window::Window,
        config: &RaynerConfig,
    ) -> RenderResult<Self> {
        let mut surface = VulkanSurface::from_winit(ctx, window)?;

        let (width, height) = window.current_extent();
        let desired = vk::Extent2D { width: width.max(1), height: height.max(1) };
        let mut swapchain = match Swapchain::new(ctx, &surface, memory, desired) {
            Ok(swapchain) => swapchain,
            Err(e) => {
                surface.destroy(ctx);
                return Err(e);
            }
        };

        let created = FrameScheduler::new(ctx).and_then(|mut scheduler| {
            match Self::create_passes(ctx, memory, swapchain.render_pass, config) {
                Ok(passes) => Ok((scheduler, passes)),
                Err(e) => {
                    scheduler.destroy(ctx);
                    Err(e)
                }
            }
        });

        let (scheduler, (frame_descriptors, [triangles, lines, points])) = match created {
            Ok(created) => created,
            Err(e) => {
                swapchain.destroy(ctx, memory);
                surface.destroy(ctx);
                return Err(e);
            }
        };

        tracing::info!(
            width = swapchain.extent.width,
            height = swapchain.extent.height,
            images = swapchain.images.len(),
            "renderer ready"
        );

        Ok(Self {
            surface,
            swapchain,
            scheduler,
            frame_descriptors,
            triangles,
            lines,
            points,
            line_width: line_width(&ctx.device_features),
            idle_after_trace: config.idle_after_trace,
        })
    }

    unsafe fn create_passes(
        ctx: &VulkanContext,
        memory: &MemoryManager,
        render_pass: vk::RenderPass,
        config: &RaynerConfig,
    ) -> RenderResult<(FrameDescriptors, [Pipeline; 3])> {
        let mut frame_descriptors = FrameDescriptors::new(ctx, memory)?;

        let mut pipelines: Vec<Pipeline> = Vec::with_capacity(3);
        for topology in [Topology::Triangles, Topology::Lines, Topology::Points] {
            let graphics_config = GraphicsConfig::for_topology(topology, &config.shader_dir);
            match GraphicsPipeline::new(ctx, render_pass, frame_descriptors.layout(), &graphics_config) {
                Ok(pipeline) => pipelines.push(Pipeline::Graphics(pipeline)),
                Err(e) => {
                    for pipeline in pipelines {
                        pipeline.destroy(ctx, memory);
                    }
                    frame_descriptors.destroy(ctx, memory);
                    return Err(e);
                }
            }
        }

        let mut pipelines = pipelines.into_iter();
        match (pipelines.next(), pipelines.next(), pipelines.next()) {
            (Some(triangles), Some(lines), Some(points)) => Ok((frame_descriptors, [triangles, lines, points])),
            _ => {
                frame_descriptors.destroy(ctx, memory);
                Err(RenderError::InvalidState("graphics pipelines were not all created".to_string()))
            }
        }
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    /// Flag the swapchain for recreation, e.g. after a window resize.
    pub fn resize(&mut self) {
        self.scheduler.request_recreate();
    }

    /// Render one frame. Returns false when the frame was skipped, either
    /// because the swapchain had to be rebuilt first or because the window
    /// is minimized.
    pub unsafe fn render(
        &mut self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        geometry: &GeometryBuffers,
        raytracer: &RayTracer,
        request: &FrameRequest,
        view_projection: &Mat4,
        window: &dyn ExtentSource,
    ) -> RenderResult<bool> {
        if !self.recreate_if_needed(ctx, memory, window)? {
            return Ok(false);
        }

        let frame = match self.scheduler.acquire(ctx, &self.swapchain)? {
            Some(frame) => frame,
            None => {
                self.recreate_if_needed(ctx, memory, window)?;
                return Ok(false);
            }
        };

        self.frame_descriptors.update(frame.slot, view_projection)?;

        let cmd = commands.begin_frame(frame.slot)?;

        if let Some(trace) = &request.trace {
            raytracer.record_trace(ctx, commands, cmd, trace)?;
        }

        self.record_passes(ctx, cmd, frame.slot, frame.image_index, geometry, raytracer.consts(), request)?;

        commands.end_frame(frame.slot)?;

        self.scheduler.submit(ctx, cmd)?;
        self.scheduler.present(ctx, &self.swapchain, frame.image_index)?;

        if self.idle_after_trace && request.trace.is_some() {
            ctx.wait_idle()?;
        }

        self.recreate_if_needed(ctx, memory, window)?;

        Ok(true)
    }

    unsafe fn record_passes(
        &self,
        ctx: &VulkanContext,
        cmd: vk::CommandBuffer,
        slot: usize,
        image_index: u32,
        geometry: &GeometryBuffers,
        consts: RtConsts,
        request: &FrameRequest,
    ) -> RenderResult<()> {
        let device = &ctx.device;
        let framebuffer = self.swapchain.framebuffers.get(image_index as usize).copied().ok_or_else(|| {
            RenderError::InvalidState(format!("no framebuffer for image {}", image_index))
        })?;

        let clear_values = [
            vk::ClearValue { color: vk::ClearColorValue { float32: CLEAR_COLOR } },
            vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth: CLEAR_DEPTH, stencil: 0 } },
        ];

        let extent = self.swapchain.extent;
        let render_pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.swapchain.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent })
            .clear_values(&clear_values);

        device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent };
        device.cmd_set_viewport(cmd, 0, &[viewport]);
        device.cmd_set_scissor(cmd, 0, &[scissor]);

        let set = self.frame_descriptors.set(slot);

        for pass in plan_passes(request) {
            let (pipeline, pass_consts) = match pass {
                Pass::Triangles => (&self.triangles, consts),
                Pass::Rays(_) => (&self.lines, consts),
                Pass::Points(_) => (&self.points, consts),
                Pass::Hits(_) => (&self.points, RtConsts { output: consts.hits, ..consts }),
            };

            pipeline.bind(device, cmd);
            pipeline.bind_descriptor_set(device, cmd, set);
            pipeline.push_constants(device, cmd, &pass_consts);

            match pass {
                Pass::Triangles => geometry.draw(device, cmd),
                Pass::Rays(count) => {
                    device.cmd_set_line_width(cmd, self.line_width);
                    device.cmd_draw(cmd, count, 1, 0, 0);
                }
                Pass::Points(count) | Pass::Hits(count) => device.cmd_draw(cmd, count, 1, 0, 0),
            }
        }

        device.cmd_end_render_pass(cmd);
        Ok(())
    }

    /// Rebuild the swapchain if flagged. Returns false while the window is
    /// minimized; the flag stays set so a later frame retries.
    unsafe fn recreate_if_needed(
        &mut self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        window: &dyn ExtentSource,
    ) -> RenderResult<bool> {
        let extent = match prepare_frame(self.scheduler.needs_recreate(), window) {
            FramePrep::Render => return Ok(true),
            FramePrep::Skip => {
                tracing::debug!("window has zero extent, frame skipped");
                return Ok(false);
            }
            FramePrep::Rebuild(extent) => extent,
        };

        self.swapchain.recreate(ctx, &mut self.surface, memory, extent)?;
        self.scheduler.clear_recreate();
        tracing::info!(
            width = self.swapchain.extent.width,
            height = self.swapchain.extent.height,
            "swapchain recreated"
        );
        Ok(true)
    }

    /// Wait for the device and destroy everything the renderer owns.
    pub unsafe fn destroy(mut self, ctx: &VulkanContext, memory: &MemoryManager) {
        if let Err(e) = ctx.wait_idle() {
            tracing::error!("wait idle before renderer teardown failed: {}", e);
        }
        self.points.destroy(ctx, memory);
        self.lines.destroy(ctx, memory);
        self.triangles.destroy(ctx, memory);
        self.frame_descriptors.destroy(ctx, memory);
        self.scheduler.destroy(ctx);
        self.swapchain.destroy(ctx, memory);
        self.surface.destroy(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn request() -> FrameRequest {
        FrameRequest {
            show_triangles: true,
            show_rays: true,
            show_points: true,
            show_hits: true,
            trace: None,
            point_count: 0,
            ray_count: 0,
        }
    }

    #[test]
    fn test_empty_buffers_draw_only_triangles() {
        assert_eq!(plan_passes(&request()), vec![Pass::Triangles]);
    }

    #[test]
    fn test_rays_draw_two_vertices_each() {
        let frame = FrameRequest { ray_count: 1000, ..request() };
        assert_eq!(
            plan_passes(&frame),
            vec![Pass::Triangles, Pass::Rays(2000), Pass::Hits(1000)]
        );
    }

    #[test]
    fn test_toggles_remove_passes() {
        let frame = FrameRequest {
            show_triangles: false,
            show_hits: false,
            ray_count: 4,
            point_count: 8,
            ..request()
        };
        assert_eq!(plan_passes(&frame), vec![Pass::Rays(8), Pass::Points(8)]);
    }

    // ============================================================
    // Swapchain recreation
    // ============================================================

    struct CountingWindow {
        extent: (u32, u32),
        reads: Cell<u32>,
    }

    impl ExtentSource for CountingWindow {
        fn current_extent(&self) -> (u32, u32) {
            self.reads.set(self.reads.get() + 1);
            self.extent
        }
    }

    #[test]
    fn test_minimized_window_skips_without_blocking() {
        let window = CountingWindow { extent: (1000, 0), reads: Cell::new(0) };
        assert_eq!(prepare_frame(true, &window), FramePrep::Skip);
        assert_eq!(prepare_frame(true, &window), FramePrep::Skip);
        assert_eq!(window.reads.get(), 2);
    }

    #[test]
    fn test_restored_window_rebuilds_at_its_extent() {
        let window = CountingWindow { extent: (800, 600), reads: Cell::new(0) };
        assert_eq!(
            prepare_frame(true, &window),
            FramePrep::Rebuild(vk::Extent2D { width: 800, height: 600 })
        );
    }

    #[test]
    fn test_skip_then_restore_rebuilds_once_at_same_extent() {
        let mut window = CountingWindow { extent: (0, 0), reads: Cell::new(0) };
        let mut needs_recreate = true;
        assert_eq!(prepare_frame(needs_recreate, &window), FramePrep::Skip);

        window.extent = (640, 480);
        let first = prepare_frame(needs_recreate, &window);
        let again = prepare_frame(needs_recreate, &window);
        assert_eq!(first, again);
        assert_eq!(first, FramePrep::Rebuild(vk::Extent2D { width: 640, height: 480 }));

        // Cleared after the rebuild, as recreate_if_needed does.
        needs_recreate = false;
        assert_eq!(prepare_frame(needs_recreate, &window), FramePrep::Render);
    }

    #[test]
    fn test_current_swapchain_does_not_read_extent() {
        let window = CountingWindow { extent: (0, 0), reads: Cell::new(0) };
        assert_eq!(prepare_frame(false, &window), FramePrep::Render);
        assert_eq!(window.reads.get(), 0);
    }

    #[test]
    fn test_line_width_falls_back_without_wide_lines() {
        let mut features = vk::PhysicalDeviceFeatures::default();
        assert_eq!(line_width(&features), 1.0);
        features.wide_lines = vk::TRUE;
        assert_eq!(line_width(&features), RAY_LINE_WIDTH);
    }
}
