//! Shader Binding Table (SBT) management for ray tracing pipelines.
//!
//! Group order in the pipeline, and therefore in the handle array, is
//! raygen, hit groups, miss shaders. Each region starts on a
//! `shaderGroupBaseAlignment` boundary; records within a region are spaced by
//! the handle size rounded up to `shaderGroupHandleAlignment`.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::error::{RenderError, RenderResult};
use crate::vulkan::{Buffer, MemoryManager, RtProperties, VulkanContext};

/// Byte range of one SBT region, relative to the table start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SbtRegion {
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
}

/// Computed placement of every region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u32,
    pub raygen: SbtRegion,
    pub hit: SbtRegion,
    pub miss: SbtRegion,
    pub hit_count: u32,
    pub miss_count: u32,
    pub base_alignment: u32,
}

/// Round `value` up to a multiple of `alignment` (a power of two).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

impl SbtLayout {
    pub fn new(
        handle_size: u32,
        handle_alignment: u32,
        base_alignment: u32,
        hit_count: u32,
        miss_count: u32,
    ) -> RenderResult<Self> {
        if handle_size == 0 {
            return Err(RenderError::InvalidInput("shader group handle size is zero".to_string()));
        }
        for (name, alignment) in [("handle", handle_alignment), ("base", base_alignment)] {
            if !alignment.is_power_of_two() {
                return Err(RenderError::InvalidInput(format!(
                    "shader group {} alignment {} is not a power of two",
                    name, alignment
                )));
            }
        }

        let ha = handle_alignment as u64;
        let ba = base_alignment as u64;
        let record = align_up(handle_size as u64, ha);

        let raygen_size = align_up(record, ba);
        let raygen = SbtRegion { offset: 0, stride: raygen_size, size: raygen_size };

        let hit = SbtRegion {
            offset: raygen.size,
            stride: record,
            size: align_up(hit_count as u64 * record, ba),
        };

        let miss = SbtRegion {
            offset: raygen.size + hit.size,
            stride: record,
            size: align_up(miss_count as u64 * record, ba),
        };

        Ok(Self {
            handle_size,
            raygen,
            hit,
            miss,
            hit_count,
            miss_count,
            base_alignment,
        })
    }

    pub fn from_properties(props: &RtProperties, hit_count: u32, miss_count: u32) -> RenderResult<Self> {
        Self::new(
            props.shader_group_handle_size,
            props.shader_group_handle_alignment,
            props.shader_group_base_alignment,
            hit_count,
            miss_count,
        )
    }

    pub fn group_count(&self) -> u32 {
        1 + self.hit_count + self.miss_count
    }

    pub fn total_size(&self) -> u64 {
        self.raygen.size + self.hit.size + self.miss.size
    }

    /// Place the tightly packed `handles` (as returned by
    /// `vkGetRayTracingShaderGroupHandlesKHR`) at their record offsets.
    pub fn pack(&self, handles: &[u8]) -> RenderResult<Vec<u8>> {
        let hs = self.handle_size as usize;
        let expected = self.group_count() as usize * hs;
        if handles.len() != expected {
            return Err(RenderError::InvalidInput(format!(
                "expected {} bytes of shader group handles, got {}",
                expected,
                handles.len()
            )));
        }

        let mut table = vec![0u8; self.total_size() as usize];
        let records = std::iter::once(self.raygen.offset)
            .chain((0..self.hit_count as u64).map(|i| self.hit.offset + i * self.hit.stride))
            .chain((0..self.miss_count as u64).map(|i| self.miss.offset + i * self.miss.stride));

        for (handle, offset) in handles.chunks_exact(hs).zip(records) {
            let offset = offset as usize;
            table[offset..offset + hs].copy_from_slice(handle);
        }

        Ok(table)
    }
}

/// Shader Binding Table for ray tracing.
pub struct ShaderBindingTable {
    pub buffer: Buffer,
    pub layout: SbtLayout,
    pub raygen_region: vk::StridedDeviceAddressRegionKHR,
    pub hit_region: vk::StridedDeviceAddressRegionKHR,
    pub miss_region: vk::StridedDeviceAddressRegionKHR,
    pub callable_region: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    /// Query group handles from `pipeline` and write them into a host-visible
    /// table.
    pub unsafe fn new(
        ctx: &VulkanContext,
        memory: &MemoryManager,
        pipeline: vk::Pipeline,
        hit_count: u32,
        miss_count: u32,
    ) -> RenderResult<Self> {
        let layout = SbtLayout::from_properties(&ctx.rt_properties, hit_count, miss_count)?;

        let handles = ctx.rt_pipeline_loader.get_ray_tracing_shader_group_handles(
            pipeline,
            0,
            layout.group_count(),
            layout.group_count() as usize * layout.handle_size as usize,
        ).map_err(RenderError::construction("get shader group handles"))?;

        let table = layout.pack(&handles)?;

        // The allocation is not guaranteed to honor the base alignment, so
        // leave room to shift the table start
        let slack = layout.base_alignment as u64;
        let buffer = memory.create_buffer(
            layout.total_size() + slack,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
            "shader_binding_table",
        )?;

        let result = buffer.address().and_then(|address| {
            let base = align_up(address, slack);
            let start = (base - address) as usize;
            let ptr = buffer.mapped_ptr().ok_or_else(|| {
                RenderError::InvalidState("shader binding table is not host visible".to_string())
            })?;
            std::ptr::copy_nonoverlapping(table.as_ptr(), ptr.add(start), table.len());
            Ok(base)
        });

        let base = match result {
            Ok(base) => base,
            Err(e) => {
                memory.destroy_buffer(buffer);
                return Err(e);
            }
        };

        let region = |r: SbtRegion| vk::StridedDeviceAddressRegionKHR {
            device_address: base + r.offset,
            stride: r.stride,
            size: r.size,
        };

        tracing::debug!(
            total = layout.total_size(),
            raygen = ?layout.raygen,
            hit = ?layout.hit,
            miss = ?layout.miss,
            "shader binding table"
        );

        Ok(Self {
            buffer,
            layout,
            raygen_region: region(layout.raygen),
            hit_region: region(layout.hit),
            miss_region: region(layout.miss),
            callable_region: vk::StridedDeviceAddressRegionKHR::default(),
        })
    }

    /// Record a trace rays command.
    pub unsafe fn trace_rays(
        &self,
        ctx: &VulkanContext,
        cmd: vk::CommandBuffer,
        width: u32,
        height: u32,
        depth: u32,
    ) {
        ctx.rt_pipeline_loader.cmd_trace_rays(
            cmd,
            &self.raygen_region,
            &self.miss_region,
            &self.hit_region,
            &self.callable_region,
            width,
            height,
            depth,
        );
    }

    /// Destroy the shader binding table.
    pub unsafe fn destroy(self, memory: &MemoryManager) {
        memory.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // Layout
    // ============================================================

    #[test]
    fn test_typical_device_layout() {
        let layout = SbtLayout::new(32, 32, 64, 1, 1).unwrap();
        assert_eq!(layout.raygen, SbtRegion { offset: 0, stride: 64, size: 64 });
        assert_eq!(layout.hit, SbtRegion { offset: 64, stride: 32, size: 64 });
        assert_eq!(layout.miss, SbtRegion { offset: 128, stride: 32, size: 64 });
        assert_eq!(layout.total_size(), 192);
    }

    #[test]
    fn test_handle_size_equal_to_alignment() {
        let layout = SbtLayout::new(32, 32, 32, 1, 1).unwrap();
        assert_eq!(layout.hit.stride, 32);
        assert_eq!(layout.raygen.size, 32);
    }

    #[test]
    fn test_handle_size_one_over_alignment_rounds_up() {
        let layout = SbtLayout::new(33, 32, 64, 1, 1).unwrap();
        assert_eq!(layout.hit.stride, 64);
        assert_eq!(layout.raygen.stride, 64);
        assert_eq!(layout.hit.size, 64);
    }

    #[test]
    fn test_multiple_records_round_region_up() {
        let layout = SbtLayout::new(32, 32, 64, 3, 2).unwrap();
        assert_eq!(layout.hit.size, 128);
        assert_eq!(layout.miss.offset, 64 + 128);
        assert_eq!(layout.miss.size, 64);
    }

    #[test]
    fn test_region_invariants_over_grid() {
        for handle_size in [16u32, 24, 32, 33, 48, 64] {
            for handle_alignment in [4u32, 16, 32, 64] {
                for base_alignment in [32u32, 64, 128] {
                    for count in 1..4u32 {
                        let l = SbtLayout::new(handle_size, handle_alignment, base_alignment, count, count).unwrap();
                        let ba = base_alignment as u64;
                        for (r, n) in [(l.raygen, 1u64), (l.hit, count as u64), (l.miss, count as u64)] {
                            assert_eq!(r.offset % ba, 0);
                            assert_eq!(r.size % ba, 0);
                            assert_eq!(r.stride % handle_alignment as u64, 0);
                            assert!(r.stride >= handle_size as u64);
                            assert!(r.size >= n * r.stride);
                        }
                        assert_eq!(l.raygen.stride, l.raygen.size);
                        assert_eq!(l.hit.offset, l.raygen.size);
                        assert_eq!(l.miss.offset, l.raygen.size + l.hit.size);
                    }
                }
            }
        }
    }

    #[test]
    fn test_rejects_bad_alignment() {
        assert!(SbtLayout::new(32, 0, 64, 1, 1).is_err());
        assert!(SbtLayout::new(32, 32, 48, 1, 1).is_err());
        assert!(SbtLayout::new(0, 32, 64, 1, 1).is_err());
    }

    // ============================================================
    // Packing
    // ============================================================

    #[test]
    fn test_pack_places_handles_at_region_offsets() {
        let layout = SbtLayout::new(4, 4, 16, 1, 2).unwrap();
        let handles = [1u8, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4];
        let table = layout.pack(&handles).unwrap();

        assert_eq!(table.len() as u64, layout.total_size());
        assert_eq!(&table[0..4], &[1, 1, 1, 1]);
        assert_eq!(&table[16..20], &[2, 2, 2, 2]);
        assert_eq!(&table[32..36], &[3, 3, 3, 3]);
        assert_eq!(&table[36..40], &[4, 4, 4, 4]);
        assert!(table[4..16].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_pack_rejects_wrong_handle_count() {
        let layout = SbtLayout::new(4, 4, 16, 1, 1).unwrap();
        assert!(layout.pack(&[0u8; 8]).is_err());
    }
}
