//! Vulkan swapchain management.
//!
//! The swapchain owns everything whose size follows the window: images,
//! views, depth attachments, the render pass and framebuffers. Frame slot
//! synchronization lives in [`frame`](super::frame) and survives recreation.

use ash::vk;

use super::memory::DEPTH_FORMAT;
use super::{Image, MemoryManager, VulkanContext, VulkanSurface};
use crate::error::{RenderError, RenderResult};

/// Anything that can report the current drawable size in pixels.
pub trait ExtentSource {
    fn current_extent(&self) -> (u32, u32);
}

impl ExtentSource for winit::window::Window {
    fn current_extent(&self) -> (u32, u32) {
        let size = self.inner_size();
        (size.width, size.height)
    }
}

/// Fixed extent, for headless use.
impl ExtentSource for (u32, u32) {
    fn current_extent(&self) -> (u32, u32) {
        *self
    }
}

/// Current drawable size, or `None` while the window is minimized.
pub fn drawable_extent(source: &dyn ExtentSource) -> Option<vk::Extent2D> {
    let (width, height) = source.current_extent();
    (width > 0 && height > 0).then_some(vk::Extent2D { width, height })
}

/// Clamp the desired extent to the surface limits, unless the surface
/// dictates its size.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, desired: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: desired.width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: desired.height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count != 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

/// Negotiated swapchain parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainPlan {
    pub extent: vk::Extent2D,
    pub image_count: u32,
}

pub fn negotiate(caps: &vk::SurfaceCapabilitiesKHR, desired: vk::Extent2D) -> SwapchainPlan {
    SwapchainPlan {
        extent: choose_extent(caps, desired),
        image_count: choose_image_count(caps),
    }
}

/// Vulkan swapchain with its size-dependent attachments.
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub depth_images: Vec<Image>,
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
}

impl Swapchain {
    /// Create a new swapchain.
    pub unsafe fn new(
        ctx: &VulkanContext,
        surface: &VulkanSurface,
        memory: &MemoryManager,
        desired: vk::Extent2D,
    ) -> RenderResult<Self> {
        let mut swapchain = Self {
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            format: surface.format.format,
            extent: desired,
            depth_images: Vec::new(),
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
        };

        if let Err(e) = swapchain.build(ctx, surface, memory, desired) {
            swapchain.destroy(ctx, memory);
            return Err(e);
        }
        Ok(swapchain)
    }

    /// (Re)build everything, chaining the current handle as the old swapchain.
    unsafe fn build(
        &mut self,
        ctx: &VulkanContext,
        surface: &VulkanSurface,
        memory: &MemoryManager,
        desired: vk::Extent2D,
    ) -> RenderResult<()> {
        let loader = ctx.swapchain_loader()?;
        let plan = negotiate(&surface.capabilities, desired);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle)
            .min_image_count(plan.image_count)
            .image_format(surface.format.format)
            .image_color_space(surface.format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(surface.present_mode)
            .clipped(true)
            .old_swapchain(self.handle);

        let handle = loader
            .create_swapchain(&create_info, None)
            .map_err(RenderError::construction("create swapchain"))?;

        // Retire the old swapchain
        if self.handle != vk::SwapchainKHR::null() {
            loader.destroy_swapchain(self.handle, None);
        }
        self.handle = handle;
        self.extent = plan.extent;
        self.format = surface.format.format;

        self.images = loader
            .get_swapchain_images(handle)
            .map_err(RenderError::vk("vkGetSwapchainImagesKHR"))?;

        for &image in &self.images {
            let view = create_color_view(ctx, image, self.format)?;
            self.image_views.push(view);
        }

        for i in 0..self.images.len() {
            let depth = memory.create_depth_image(plan.extent, &format!("depth_{}", i))?;
            self.depth_images.push(depth);
        }

        self.render_pass = create_render_pass(ctx, self.format)?;

        for (view, depth) in self.image_views.iter().zip(&self.depth_images) {
            let attachments = [*view, depth.view];
            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(plan.extent.width)
                .height(plan.extent.height)
                .layers(1);

            let framebuffer = ctx.device.create_framebuffer(&framebuffer_info, None)
                .map_err(RenderError::construction("create framebuffer"))?;
            self.framebuffers.push(framebuffer);
        }

        tracing::info!(
            width = plan.extent.width,
            height = plan.extent.height,
            images = self.images.len(),
            "swapchain ready"
        );

        Ok(())
    }

    /// Destroy size-dependent resources, keeping the swapchain handle.
    unsafe fn destroy_attachments(&mut self, ctx: &VulkanContext, memory: &MemoryManager) {
        for framebuffer in self.framebuffers.drain(..) {
            ctx.device.destroy_framebuffer(framebuffer, None);
        }
        if self.render_pass != vk::RenderPass::null() {
            ctx.device.destroy_render_pass(self.render_pass, None);
            self.render_pass = vk::RenderPass::null();
        }
        for depth in self.depth_images.drain(..) {
            memory.destroy_image(depth);
        }
        for view in self.image_views.drain(..) {
            ctx.device.destroy_image_view(view, None);
        }
        self.images.clear();
    }

    /// Recreate after a resize or an out-of-date result. `desired` must be
    /// non-zero; callers skip the frame while the window is minimized.
    /// Frame slot sync objects are not touched.
    pub unsafe fn recreate(
        &mut self,
        ctx: &VulkanContext,
        surface: &mut VulkanSurface,
        memory: &MemoryManager,
        desired: vk::Extent2D,
    ) -> RenderResult<()> {
        if desired.width == 0 || desired.height == 0 {
            return Err(RenderError::InvalidInput(format!(
                "cannot recreate a {}x{} swapchain",
                desired.width, desired.height
            )));
        }

        ctx.wait_idle()?;
        surface.refresh_capabilities(ctx)?;

        self.destroy_attachments(ctx, memory);
        self.build(ctx, surface, memory, desired)
    }

    /// Destroy the swapchain and all associated resources.
    pub unsafe fn destroy(&mut self, ctx: &VulkanContext, memory: &MemoryManager) {
        self.destroy_attachments(ctx, memory);
        if self.handle != vk::SwapchainKHR::null() {
            if let Ok(loader) = ctx.swapchain_loader() {
                loader.destroy_swapchain(self.handle, None);
            }
            self.handle = vk::SwapchainKHR::null();
        }
    }
}

unsafe fn create_color_view(ctx: &VulkanContext, image: vk::Image, format: vk::Format) -> RenderResult<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    ctx.device.create_image_view(&create_info, None)
        .map_err(RenderError::construction("create image view"))
}

/// Single subpass: one color attachment presented afterwards, one depth
/// attachment cleared every frame.
unsafe fn create_render_pass(ctx: &VulkanContext, format: vk::Format) -> RenderResult<vk::RenderPass> {
    let attachments = [
        vk::AttachmentDescription::default()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR),
        vk::AttachmentDescription::default()
            .format(DEPTH_FORMAT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
    ];

    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };

    let subpasses = [vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .depth_stencil_attachment(&depth_ref)];

    let dependencies = [vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        )
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )];

    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    ctx.device.create_render_pass(&create_info, None)
        .map_err(RenderError::construction("create render pass"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32, current: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: current,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            ..Default::default()
        }
    }

    const UNDEFINED: vk::Extent2D = vk::Extent2D { width: u32::MAX, height: u32::MAX };

    // ============================================================
    // Negotiation
    // ============================================================

    #[test]
    fn test_current_extent_wins() {
        let c = caps(2, 3, vk::Extent2D { width: 800, height: 600 });
        let extent = choose_extent(&c, vk::Extent2D { width: 1000, height: 500 });
        assert_eq!(extent, vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn test_desired_extent_is_clamped() {
        let c = caps(2, 3, UNDEFINED);
        let extent = choose_extent(&c, vk::Extent2D { width: 9000, height: 0 });
        assert_eq!(extent, vk::Extent2D { width: 4096, height: 1 });
    }

    #[test]
    fn test_image_count_is_min_plus_one_capped() {
        assert_eq!(choose_image_count(&caps(2, 0, UNDEFINED)), 3);
        assert_eq!(choose_image_count(&caps(2, 8, UNDEFINED)), 3);
        assert_eq!(choose_image_count(&caps(3, 3, UNDEFINED)), 3);
    }

    #[test]
    fn test_negotiation_is_idempotent() {
        let c = caps(2, 4, UNDEFINED);
        let desired = vk::Extent2D { width: 1000, height: 500 };
        let first = negotiate(&c, desired);
        let second = negotiate(&c, first.extent);
        assert_eq!(first, second);
    }

    // ============================================================
    // Minimized window
    // ============================================================

    #[test]
    fn test_zero_extent_is_not_drawable() {
        assert_eq!(drawable_extent(&(1000u32, 0u32)), None);
        assert_eq!(drawable_extent(&(0u32, 500u32)), None);
    }

    #[test]
    fn test_nonzero_extent_is_drawable() {
        assert_eq!(drawable_extent(&(640u32, 480u32)), Some(vk::Extent2D { width: 640, height: 480 }));
    }

    #[test]
    fn test_restored_extent_renegotiates_to_same_plan() {
        let c = caps(2, 4, UNDEFINED);
        let restored = drawable_extent(&(1000u32, 500u32)).unwrap();
        let first = negotiate(&c, restored);
        let again = negotiate(&c, drawable_extent(&(first.extent.width, first.extent.height)).unwrap());
        assert_eq!(first, again);
    }
}
