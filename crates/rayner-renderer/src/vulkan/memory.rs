//! GPU memory management using gpu-allocator.
//!
//! Every buffer and image is requested through [`MemoryManager`] and must be
//! handed back to it explicitly. Nothing here frees memory on drop.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc, Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{CommandManager, VulkanContext};
use crate::error::{RenderError, RenderResult};

/// GPU buffer with associated memory.
#[derive(Debug)]
pub struct Buffer {
    pub handle: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub device_address: Option<vk::DeviceAddress>,
}

impl Buffer {
    /// Pointer to the mapped memory, for host-visible buffers.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation.as_ref().and_then(|a| a.mapped_ptr()).map(|p| p.as_ptr() as *mut u8)
    }

    /// Device address; errors unless created with `SHADER_DEVICE_ADDRESS`.
    pub fn address(&self) -> RenderResult<vk::DeviceAddress> {
        self.device_address.ok_or_else(|| {
            RenderError::InvalidInput(format!(
                "buffer {:?} was created without SHADER_DEVICE_ADDRESS",
                self.handle
            ))
        })
    }

    /// Copy `data` to the start of a host-visible buffer.
    pub fn write<T: Pod>(&self, data: &[T]) -> RenderResult<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as vk::DeviceSize > self.size {
            return Err(RenderError::InvalidInput(format!(
                "write of {} bytes into a {} byte buffer",
                bytes.len(),
                self.size
            )));
        }
        let ptr = self.mapped_ptr().ok_or_else(|| {
            RenderError::InvalidState("buffer is not host visible".to_string())
        })?;

        // SAFETY: the mapping covers at least `size` bytes and we checked the length.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
        }
        Ok(())
    }

    /// Copy the first `count` elements out of a host-visible buffer.
    pub fn read<T: Pod>(&self, count: usize) -> RenderResult<Vec<T>> {
        let len = count * std::mem::size_of::<T>();
        if len as vk::DeviceSize > self.size {
            return Err(RenderError::InvalidInput(format!(
                "read of {} bytes from a {} byte buffer",
                len, self.size
            )));
        }
        let ptr = self.mapped_ptr().ok_or_else(|| {
            RenderError::InvalidState("buffer is not host visible".to_string())
        })?;

        let mut out = vec![<T as Zeroable>::zeroed(); count];
        // SAFETY: as in `write`.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr as *const u8, bytemuck::cast_slice_mut::<T, u8>(&mut out).as_mut_ptr(), len);
        }
        Ok(out)
    }
}

/// GPU image with associated memory.
pub struct Image {
    pub handle: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}

/// Memory manager wrapping gpu-allocator.
pub struct MemoryManager {
    allocator: Arc<Mutex<Allocator>>,
    device: ash::Device,
    // Families sharing buffers filled through the transfer queue
    shared_families: Option<[u32; 2]>,
}

impl MemoryManager {
    /// Create a new memory manager.
    pub unsafe fn new(ctx: &VulkanContext) -> RenderResult<Self> {
        let mut debug_settings = gpu_allocator::AllocatorDebugSettings::default();
        debug_settings.log_memory_information = cfg!(debug_assertions);
        debug_settings.log_leaks_on_shutdown = true;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.physical_device,
            debug_settings,
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        }).map_err(|e| RenderError::Construction(format!("Failed to create allocator: {}", e)))?;

        let shared_families = match (ctx.queue_families.graphics, ctx.queue_families.transfer) {
            (Some(graphics), Some(transfer)) if graphics != transfer => Some([graphics, transfer]),
            _ => None,
        };

        Ok(Self {
            allocator: Arc::new(Mutex::new(allocator)),
            device: ctx.device.clone(),
            shared_families,
        })
    }

    /// Create a buffer with the specified usage and memory location.
    ///
    /// The device address is queried iff `usage` contains
    /// `SHADER_DEVICE_ADDRESS`.
    pub unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> RenderResult<Buffer> {
        if size == 0 {
            return Err(RenderError::InvalidInput(format!("buffer '{}' has zero size", name)));
        }

        let mut buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // Transfer destinations may be written by the transfer family and
        // read by the graphics family
        if let Some(families) = self.shared_families.as_ref().filter(|_| usage.contains(vk::BufferUsageFlags::TRANSFER_DST)) {
            buffer_info = buffer_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(families);
        }

        let handle = self.device.create_buffer(&buffer_info, None)
            .map_err(RenderError::vk("vkCreateBuffer"))?;

        let requirements = self.device.get_buffer_memory_requirements(handle);

        let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_buffer(handle, None);
                return Err(RenderError::allocation(name, e));
            }
        };

        if let Err(e) = self.device.bind_buffer_memory(handle, allocation.memory(), allocation.offset()) {
            self.device.destroy_buffer(handle, None);
            self.free(allocation, name);
            return Err(RenderError::vk("vkBindBufferMemory")(e));
        }

        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let addr_info = vk::BufferDeviceAddressInfo::default().buffer(handle);
            Some(self.device.get_buffer_device_address(&addr_info))
        } else {
            None
        };

        tracing::trace!(name, size, ?location, "created buffer");

        Ok(Buffer {
            handle,
            allocation: Some(allocation),
            size,
            usage,
            device_address,
        })
    }

    /// Device address of a buffer created with `SHADER_DEVICE_ADDRESS`.
    pub fn device_address(&self, buffer: &Buffer) -> RenderResult<vk::DeviceAddress> {
        buffer.address()
    }

    /// Write into a mapped host-visible buffer.
    pub fn write_buffer<T: Pod>(&self, buffer: &Buffer, data: &[T]) -> RenderResult<()> {
        buffer.write(data)
    }

    /// Upload `data` into a new device-local buffer through a staging copy.
    ///
    /// Blocks until the copy has completed. The copy runs on the dedicated
    /// transfer queue when the device has one.
    pub unsafe fn upload_with_staging<T: Pod>(
        &self,
        ctx: &VulkanContext,
        commands: &CommandManager,
        data: &[T],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> RenderResult<Buffer> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = bytes.len() as vk::DeviceSize;
        if size == 0 {
            return Err(RenderError::InvalidInput(format!("upload of '{}' has no data", name)));
        }

        let staging = self.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            &format!("{}_staging", name),
        )?;

        let result = staging.write(bytes).and_then(|()| {
            let dst = self.create_buffer(size, usage | vk::BufferUsageFlags::TRANSFER_DST, MemoryLocation::GpuOnly, name)?;
            let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
            match commands.run_transfer(ctx, |cmd| {
                self.device.cmd_copy_buffer(cmd, staging.handle, dst.handle, &[region]);
            }) {
                Ok(()) => Ok(dst),
                Err(e) => {
                    self.destroy_buffer(dst);
                    Err(e)
                }
            }
        });

        self.destroy_buffer(staging);

        if result.is_ok() {
            tracing::debug!(name, size, "uploaded through staging buffer");
        }
        result
    }

    /// Read `count` elements back from a buffer.
    ///
    /// Host-visible buffers are read in place. Device-local buffers need
    /// `TRANSFER_SRC` usage and go through a readback copy.
    pub unsafe fn read_buffer<T: Pod>(
        &self,
        ctx: &VulkanContext,
        commands: &CommandManager,
        buffer: &Buffer,
        count: usize,
    ) -> RenderResult<Vec<T>> {
        if buffer.mapped_ptr().is_some() {
            return buffer.read(count);
        }

        if !buffer.usage.contains(vk::BufferUsageFlags::TRANSFER_SRC) {
            return Err(RenderError::InvalidInput(
                "device-local buffer needs TRANSFER_SRC usage to be read back".to_string(),
            ));
        }

        let size = (count * std::mem::size_of::<T>()) as vk::DeviceSize;
        if size > buffer.size {
            return Err(RenderError::InvalidInput(format!(
                "read of {} bytes from a {} byte buffer",
                size, buffer.size
            )));
        }
        if size == 0 {
            return Ok(Vec::new());
        }

        let readback = self.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
            "readback",
        )?;

        let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
        let result = commands
            .run_graphics(ctx, |cmd| {
                self.device.cmd_copy_buffer(cmd, buffer.handle, readback.handle, &[region]);
            })
            .and_then(|()| readback.read(count));

        self.destroy_buffer(readback);
        result
    }

    /// Create a 2D image with a matching view.
    pub unsafe fn create_image(
        &self,
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect_mask: vk::ImageAspectFlags,
        name: &str,
    ) -> RenderResult<Image> {
        let extent = vk::Extent3D { width, height, depth: 1 };

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let handle = self.device.create_image(&image_info, None)
            .map_err(RenderError::vk("vkCreateImage"))?;

        let requirements = self.device.get_image_memory_requirements(handle);

        let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_image(handle, None);
                return Err(RenderError::allocation(name, e));
            }
        };

        let view = self.device.bind_image_memory(handle, allocation.memory(), allocation.offset())
            .map_err(RenderError::vk("vkBindImageMemory"))
            .and_then(|()| {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(handle)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });
                self.device.create_image_view(&view_info, None)
                    .map_err(RenderError::vk("vkCreateImageView"))
            });

        match view {
            Ok(view) => Ok(Image {
                handle,
                view,
                allocation: Some(allocation),
                format,
                extent,
            }),
            Err(e) => {
                self.device.destroy_image(handle, None);
                self.free(allocation, name);
                Err(e)
            }
        }
    }

    /// Create a depth attachment.
    pub unsafe fn create_depth_image(&self, extent: vk::Extent2D, name: &str) -> RenderResult<Image> {
        self.create_image(
            extent.width,
            extent.height,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
            name,
        )
    }

    /// Destroy a buffer and free its memory.
    pub unsafe fn destroy_buffer(&self, buffer: Buffer) {
        self.device.destroy_buffer(buffer.handle, None);
        if let Some(allocation) = buffer.allocation {
            self.free(allocation, "buffer");
        }
    }

    /// Destroy an image and free its memory.
    pub unsafe fn destroy_image(&self, image: Image) {
        self.device.destroy_image_view(image.view, None);
        self.device.destroy_image(image.handle, None);
        if let Some(allocation) = image.allocation {
            self.free(allocation, "image");
        }
    }

    fn free(&self, allocation: Allocation, what: &str) {
        let result = self.allocator.lock().free(allocation);
        report_free(what, result);
    }
}

/// Log a failed free. Returns false when the memory was not released.
fn report_free(what: &str, result: Result<(), gpu_allocator::AllocationError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(what, "failed to free memory: {}", e);
            false
        }
    }
}

/// Depth attachment format.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

#[cfg(test)]
mod tests {
    use super::*;

    fn unmapped(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Buffer {
        Buffer {
            handle: vk::Buffer::null(),
            allocation: None,
            size,
            usage,
            device_address: None,
        }
    }

    #[test]
    fn test_failed_free_is_reported() {
        assert!(report_free("trace_hits", Ok(())));
        assert!(!report_free("trace_hits", Err(gpu_allocator::AllocationError::OutOfMemory)));
    }

    #[test]
    fn test_address_requires_device_address_usage() {
        let buffer = unmapped(64, vk::BufferUsageFlags::STORAGE_BUFFER);
        assert!(matches!(buffer.address(), Err(RenderError::InvalidInput(_))));
    }

    #[test]
    fn test_address_returns_queried_value() {
        let mut buffer = unmapped(64, vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        buffer.device_address = Some(0x1000);
        assert_eq!(buffer.address().unwrap(), 0x1000);
    }

    #[test]
    fn test_write_rejects_oversized_data() {
        let buffer = unmapped(8, vk::BufferUsageFlags::UNIFORM_BUFFER);
        let err = buffer.write(&[0u32; 4]).unwrap_err();
        assert!(matches!(err, RenderError::InvalidInput(_)));
    }

    #[test]
    fn test_write_to_unmapped_buffer_is_invalid_state() {
        let buffer = unmapped(16, vk::BufferUsageFlags::UNIFORM_BUFFER);
        let err = buffer.write(&[1.0f32; 4]).unwrap_err();
        assert!(matches!(err, RenderError::InvalidState(_)));
    }

    #[test]
    fn test_read_rejects_past_end() {
        let buffer = unmapped(16, vk::BufferUsageFlags::STORAGE_BUFFER);
        assert!(matches!(buffer.read::<f32>(5), Err(RenderError::InvalidInput(_))));
    }
}
