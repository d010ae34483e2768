//! Vulkan surface creation from window handles.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};

use super::VulkanContext;
use crate::error::{RenderError, RenderResult};

/// Wrapper around a Vulkan surface.
pub struct VulkanSurface {
    pub handle: vk::SurfaceKHR,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub capabilities: vk::SurfaceCapabilitiesKHR,
}

impl VulkanSurface {
    /// Create a new Vulkan surface from window handles.
    ///
    /// # Safety
    /// The window handles must be valid and outlive the surface.
    pub unsafe fn new(
        ctx: &VulkanContext,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> RenderResult<Self> {
        let handle = ash_window::create_surface(
            &ctx.entry,
            &ctx.instance,
            display_handle,
            window_handle,
            None,
        ).map_err(RenderError::construction("create Vulkan surface"))?;

        match Self::query(ctx, handle) {
            Ok(surface) => Ok(surface),
            Err(e) => {
                ctx.surface_loader.destroy_surface(handle, None);
                Err(e)
            }
        }
    }

    unsafe fn query(ctx: &VulkanContext, handle: vk::SurfaceKHR) -> RenderResult<Self> {
        let graphics = ctx.queue_families.graphics
            .ok_or_else(|| RenderError::Construction("No graphics queue family".to_string()))?;

        let supported = ctx.surface_loader
            .get_physical_device_surface_support(ctx.physical_device, graphics, handle)
            .map_err(RenderError::vk("vkGetPhysicalDeviceSurfaceSupportKHR"))?;
        if !supported {
            return Err(RenderError::Construction(
                "Graphics queue family cannot present to this surface".to_string(),
            ));
        }

        let capabilities = ctx.surface_loader
            .get_physical_device_surface_capabilities(ctx.physical_device, handle)
            .map_err(RenderError::vk("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))?;

        let formats = ctx.surface_loader
            .get_physical_device_surface_formats(ctx.physical_device, handle)
            .map_err(RenderError::vk("vkGetPhysicalDeviceSurfaceFormatsKHR"))?;

        let present_modes = ctx.surface_loader
            .get_physical_device_surface_present_modes(ctx.physical_device, handle)
            .map_err(RenderError::vk("vkGetPhysicalDeviceSurfacePresentModesKHR"))?;

        let format = choose_surface_format(&formats);
        let present_mode = choose_present_mode(&present_modes);

        tracing::info!(format = ?format.format, ?present_mode, "surface created");

        Ok(Self {
            handle,
            format,
            present_mode,
            capabilities,
        })
    }

    /// Create a surface from a winit window.
    pub unsafe fn from_winit(
        ctx: &VulkanContext,
        window: &winit::window::Window,
    ) -> RenderResult<Self> {
        let display_handle = window.display_handle()
            .map_err(|e| RenderError::Construction(format!("Failed to get display handle: {:?}", e)))?
            .as_raw();
        let window_handle = window.window_handle()
            .map_err(|e| RenderError::Construction(format!("Failed to get window handle: {:?}", e)))?
            .as_raw();

        Self::new(ctx, display_handle, window_handle)
    }

    /// Refresh surface capabilities (e.g., after window resize).
    pub unsafe fn refresh_capabilities(&mut self, ctx: &VulkanContext) -> RenderResult<()> {
        self.capabilities = ctx.surface_loader
            .get_physical_device_surface_capabilities(ctx.physical_device, self.handle)
            .map_err(RenderError::vk("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))?;
        Ok(())
    }

    /// Destroy the surface.
    pub unsafe fn destroy(&mut self, ctx: &VulkanContext) {
        ctx.surface_loader.destroy_surface(self.handle, None);
        self.handle = vk::SurfaceKHR::null();
    }
}

/// Choose the best surface format.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    // Prefer SRGB B8G8R8A8
    for format in formats {
        if format.format == vk::Format::B8G8R8A8_SRGB &&
           format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR {
            return *format;
        }
    }

    formats.first().copied().unwrap_or(vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_SRGB,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    })
}

/// Mailbox when available, otherwise FIFO (always supported).
pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR }
    }

    #[test]
    fn test_prefers_srgb_bgra() {
        let formats = [format(vk::Format::R8G8B8A8_UNORM), format(vk::Format::B8G8R8A8_SRGB)];
        assert_eq!(choose_surface_format(&formats).format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn test_falls_back_to_first_format() {
        let formats = [format(vk::Format::R8G8B8A8_UNORM), format(vk::Format::B8G8R8A8_UNORM)];
        assert_eq!(choose_surface_format(&formats).format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn test_present_mode_prefers_mailbox() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE]), vk::PresentModeKHR::FIFO);
    }
}
