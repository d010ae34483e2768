//! Acceleration structure management for ray tracing.
//!
//! One bottom-level structure over the scene triangles and one top-level
//! structure holding a single instance of it. Builds run synchronously on a
//! one-shot command buffer, each with its own scratch buffer.

use ash::vk;
use ash::khr::acceleration_structure;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::MemoryLocation;

use rayner_common::VERTEX_STRIDE;

use super::sbt::align_up;
use crate::error::{RenderError, RenderResult};
use crate::vulkan::{Buffer, BufferHazard, CommandManager, MemoryManager, VulkanContext};

/// Where the builder is in its one-shot BLAS then TLAS sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Empty,
    BlasBuilt,
    TlasBuilt,
}

/// Sizes reported by the driver for one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildSizes {
    pub acceleration_structure_size: vk::DeviceSize,
    pub build_scratch_size: vk::DeviceSize,
}

/// A built acceleration structure and its backing storage.
pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub buffer: Buffer,
    pub device_address: vk::DeviceAddress,
    pub sizes: BuildSizes,
}

/// Instance data for TLAS building. Layout matches
/// `VkAccelerationStructureInstanceKHR`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RtInstance {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [[f32; 4]; 3],
    pub instance_custom_index_and_mask: u32,
    pub instance_shader_binding_table_record_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl RtInstance {
    pub const IDENTITY: [[f32; 4]; 3] = [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
    ];

    /// Create a new instance with the given transform and BLAS reference.
    pub fn new(transform: [[f32; 4]; 3], custom_index: u32, blas_address: vk::DeviceAddress) -> Self {
        Self {
            transform,
            instance_custom_index_and_mask: (0xFF << 24) | (custom_index & 0xFFFFFF),
            instance_shader_binding_table_record_offset_and_flags: 0,
            acceleration_structure_reference: blas_address,
        }
    }

    /// Set the SBT offset and flags.
    pub fn with_sbt_offset(mut self, offset: u32, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.instance_shader_binding_table_record_offset_and_flags =
            ((flags.as_raw() & 0xFF) << 24) | (offset & 0xFFFFFF);
        self
    }

    pub fn mask(&self) -> u8 {
        (self.instance_custom_index_and_mask >> 24) as u8
    }

    pub fn custom_index(&self) -> u32 {
        self.instance_custom_index_and_mask & 0xFFFFFF
    }

    pub fn sbt_offset(&self) -> u32 {
        self.instance_shader_binding_table_record_offset_and_flags & 0xFFFFFF
    }

    pub fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(self.instance_shader_binding_table_record_offset_and_flags >> 24)
    }
}

/// The single scene instance: identity rotation, `translation`, visible to
/// every ray mask, no face culling.
pub fn instance_record(blas_address: vk::DeviceAddress, translation: [f32; 3]) -> RtInstance {
    let mut transform = RtInstance::IDENTITY;
    for (row, t) in transform.iter_mut().zip(translation) {
        row[3] = t;
    }
    RtInstance::new(transform, 0, blas_address)
        .with_sbt_offset(0, vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE)
}

/// Builds and owns the scene's BLAS and TLAS.
pub struct AccelerationStructureBuilder {
    loader: acceleration_structure::Device,
    state: BuildState,
    blas: Option<AccelerationStructure>,
    tlas: Option<AccelerationStructure>,
    instance_buffer: Option<Buffer>,
    instance: Option<RtInstance>,
}

impl AccelerationStructureBuilder {
    pub fn new(ctx: &VulkanContext) -> Self {
        Self {
            loader: ctx.accel_struct_loader.clone(),
            state: BuildState::Empty,
            blas: None,
            tlas: None,
            instance_buffer: None,
            instance: None,
        }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn blas_address(&self) -> Option<vk::DeviceAddress> {
        self.blas.as_ref().map(|b| b.device_address)
    }

    pub fn tlas_address(&self) -> Option<vk::DeviceAddress> {
        self.tlas.as_ref().map(|t| t.device_address)
    }

    pub fn tlas_handle(&self) -> Option<vk::AccelerationStructureKHR> {
        self.tlas.as_ref().map(|t| t.handle)
    }

    /// The uploaded TLAS instance.
    pub fn instance(&self) -> Option<&RtInstance> {
        self.instance.as_ref()
    }

    /// Build the bottom-level structure over `triangle_count` indexed
    /// triangles. Positions are the first three floats of each vertex.
    pub unsafe fn build_blas(
        &mut self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        vertex_address: vk::DeviceAddress,
        index_address: vk::DeviceAddress,
        vertex_count: u32,
        triangle_count: u32,
    ) -> RenderResult<BuildSizes> {
        if self.state != BuildState::Empty {
            return Err(RenderError::InvalidState(format!("build_blas called in state {:?}", self.state)));
        }
        if triangle_count == 0 || vertex_count == 0 {
            return Err(RenderError::InvalidInput(format!(
                "BLAS needs geometry: {} vertices, {} triangles",
                vertex_count, triangle_count
            )));
        }

        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR { device_address: vertex_address })
            .vertex_stride(VERTEX_STRIDE as vk::DeviceSize)
            .max_vertex(vertex_count - 1)
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR { device_address: index_address });

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(vk::GeometryFlagsKHR::OPAQUE);

        let blas = self.build(
            ctx,
            memory,
            commands,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            geometry,
            triangle_count,
            "blas",
        )?;

        let sizes = blas.sizes;
        tracing::info!(
            triangles = triangle_count,
            size = sizes.acceleration_structure_size,
            scratch = sizes.build_scratch_size,
            "built BLAS"
        );

        self.blas = Some(blas);
        self.state = BuildState::BlasBuilt;
        Ok(sizes)
    }

    /// Build the top-level structure with one instance of the BLAS.
    pub unsafe fn build_tlas(
        &mut self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        translation: [f32; 3],
    ) -> RenderResult<BuildSizes> {
        let blas_address = match (self.state, self.blas_address()) {
            (BuildState::BlasBuilt, Some(address)) => address,
            _ => return Err(RenderError::InvalidState(format!("build_tlas called in state {:?}", self.state))),
        };

        let instance = instance_record(blas_address, translation);
        let instance_buffer = memory.upload_with_staging(
            ctx,
            commands,
            &[instance],
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            "tlas_instances",
        )?;

        let built = instance_buffer.address().and_then(|instance_address| {
            let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR { device_address: instance_address });

            let geometry = vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { instances: instances_data });

            self.build(
                ctx,
                memory,
                commands,
                vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD,
                geometry,
                1,
                "tlas",
            )
        });

        let tlas = match built {
            Ok(tlas) => tlas,
            Err(e) => {
                memory.destroy_buffer(instance_buffer);
                return Err(e);
            }
        };

        let sizes = tlas.sizes;
        tracing::info!(
            size = sizes.acceleration_structure_size,
            scratch = sizes.build_scratch_size,
            ?translation,
            "built TLAS"
        );

        self.tlas = Some(tlas);
        self.instance_buffer = Some(instance_buffer);
        self.instance = Some(instance);
        self.state = BuildState::TlasBuilt;
        Ok(sizes)
    }

    /// Size query, storage, scratch, build and wait for one geometry.
    #[allow(clippy::too_many_arguments)]
    unsafe fn build(
        &self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        ty: vk::AccelerationStructureTypeKHR,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        geometry: vk::AccelerationStructureGeometryKHR<'_>,
        primitive_count: u32,
        name: &str,
    ) -> RenderResult<AccelerationStructure> {
        let geometries = [geometry];
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(ty)
            .flags(flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let primitive_counts = [primitive_count];
        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        self.loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &primitive_counts,
            &mut size_info,
        );

        let sizes = BuildSizes {
            acceleration_structure_size: size_info.acceleration_structure_size,
            build_scratch_size: size_info.build_scratch_size,
        };
        tracing::debug!(name, ?sizes, "acceleration structure build sizes");

        let buffer = memory.create_buffer(
            sizes.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            &format!("{}_storage", name),
        )?;

        let as_create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.handle)
            .size(sizes.acceleration_structure_size)
            .ty(ty);

        let handle = match self.loader.create_acceleration_structure(&as_create_info, None) {
            Ok(handle) => handle,
            Err(e) => {
                memory.destroy_buffer(buffer);
                return Err(RenderError::construction("create acceleration structure")(e));
            }
        };

        if let Err(e) = self.record_build(ctx, memory, commands, build_info, handle, primitive_count, sizes, name) {
            self.loader.destroy_acceleration_structure(handle, None);
            memory.destroy_buffer(buffer);
            return Err(e);
        }

        let addr_info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(handle);
        let device_address = self.loader.get_acceleration_structure_device_address(&addr_info);

        Ok(AccelerationStructure {
            handle,
            buffer,
            device_address,
            sizes,
        })
    }

    #[allow(clippy::too_many_arguments)]
    unsafe fn record_build(
        &self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        build_info: vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        handle: vk::AccelerationStructureKHR,
        primitive_count: u32,
        sizes: BuildSizes,
        name: &str,
    ) -> RenderResult<()> {
        let alignment = (ctx.rt_properties.min_scratch_offset_alignment as u64).max(1);
        let scratch = memory.create_buffer(
            align_up(sizes.build_scratch_size, alignment) + alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            &format!("{}_scratch", name),
        )?;

        let result = scratch.address().and_then(|address| {
            let build_info = build_info
                .dst_acceleration_structure(handle)
                .scratch_data(vk::DeviceOrHostAddressKHR { device_address: align_up(address, alignment) });

            let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
                .primitive_count(primitive_count)
                .primitive_offset(0)
                .first_vertex(0)
                .transform_offset(0);
            let build_ranges: &[vk::AccelerationStructureBuildRangeInfoKHR] = &[build_range];

            commands.run_graphics(ctx, |cmd| {
                self.loader.cmd_build_acceleration_structures(cmd, &[build_info], &[build_ranges]);
                commands.memory_barrier(cmd, BufferHazard::BuildWriteToBuildRead);
            })
        });

        memory.destroy_buffer(scratch);
        result
    }

    /// Destroy TLAS, instance buffer, then BLAS.
    pub unsafe fn destroy(&mut self, memory: &MemoryManager) {
        if let Some(tlas) = self.tlas.take() {
            self.loader.destroy_acceleration_structure(tlas.handle, None);
            memory.destroy_buffer(tlas.buffer);
        }
        if let Some(instances) = self.instance_buffer.take() {
            memory.destroy_buffer(instances);
        }
        if let Some(blas) = self.blas.take() {
            self.loader.destroy_acceleration_structure(blas.handle, None);
            memory.destroy_buffer(blas.buffer);
        }
        self.instance = None;
        self.state = BuildState::Empty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_layout_matches_vulkan() {
        assert_eq!(
            std::mem::size_of::<RtInstance>(),
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>()
        );
        assert_eq!(std::mem::size_of::<RtInstance>(), 64);
    }

    #[test]
    fn test_scene_instance_fields() {
        let instance = instance_record(0xDEAD_0000, [0.0, 0.0, 0.0]);
        assert_eq!(instance.mask(), 0xFF);
        assert_eq!(instance.custom_index(), 0);
        assert_eq!(instance.sbt_offset(), 0);
        assert_eq!(instance.flags(), vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE);
        assert_eq!(instance.transform, RtInstance::IDENTITY);
        assert_eq!(instance.acceleration_structure_reference, 0xDEAD_0000);
    }

    #[test]
    fn test_translation_fills_last_column() {
        let instance = instance_record(1, [1.5, -2.0, 3.0]);
        assert_eq!(instance.transform[0], [1.0, 0.0, 0.0, 1.5]);
        assert_eq!(instance.transform[1], [0.0, 1.0, 0.0, -2.0]);
        assert_eq!(instance.transform[2], [0.0, 0.0, 1.0, 3.0]);
    }

    #[test]
    fn test_flags_do_not_clobber_offset() {
        let instance = RtInstance::new(RtInstance::IDENTITY, 7, 0)
            .with_sbt_offset(3, vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE);
        assert_eq!(instance.custom_index(), 7);
        assert_eq!(instance.sbt_offset(), 3);
        assert_eq!(instance.flags(), vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE);
    }
}
