//! Device-local copies of the static mesh.

use ash::vk;

use rayner_common::{Mesh, MeshSubset};

use crate::error::{RenderError, RenderResult};
use crate::vulkan::{Buffer, CommandManager, MemoryManager, VulkanContext};

/// Usage shared by both geometry buffers: readable by the rasterizer, by
/// shaders through device addresses and by acceleration structure builds.
/// `TRANSFER_SRC` lets tests read the uploaded data back.
const SHARED_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw()
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR.as_raw()
        | vk::BufferUsageFlags::TRANSFER_SRC.as_raw(),
);

#[derive(Debug)]
pub struct GeometryBuffers {
    pub vertex_buffer: Buffer,
    pub index_buffer: Buffer,
    pub vertex_count: u32,
    pub index_count: u32,
    pub subsets: Vec<MeshSubset>,
}

impl GeometryBuffers {
    /// Upload `mesh` once. The mesh must have at least one triangle.
    pub unsafe fn upload(
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        mesh: &Mesh,
    ) -> RenderResult<Self> {
        if mesh.triangle_count() == 0 {
            return Err(RenderError::InvalidInput("mesh has no triangles".to_string()));
        }

        let vertex_buffer = memory.upload_with_staging(
            ctx,
            commands,
            mesh.vertices(),
            vk::BufferUsageFlags::VERTEX_BUFFER | SHARED_USAGE,
            "mesh_vertices",
        )?;

        let index_buffer = match memory.upload_with_staging(
            ctx,
            commands,
            mesh.indices(),
            vk::BufferUsageFlags::INDEX_BUFFER | SHARED_USAGE,
            "mesh_indices",
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                memory.destroy_buffer(vertex_buffer);
                return Err(e);
            }
        };

        tracing::info!(
            vertices = mesh.vertex_count(),
            triangles = mesh.triangle_count(),
            subsets = mesh.subsets().len(),
            "mesh uploaded"
        );

        Ok(Self {
            vertex_buffer,
            index_buffer,
            vertex_count: mesh.vertex_count(),
            index_count: mesh.indices().len() as u32,
            subsets: mesh.subsets().to_vec(),
        })
    }

    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }

    pub fn vertex_address(&self) -> RenderResult<vk::DeviceAddress> {
        self.vertex_buffer.address()
    }

    pub fn index_address(&self) -> RenderResult<vk::DeviceAddress> {
        self.index_buffer.address()
    }

    /// Encoded selectors of every subset, in mesh order.
    pub fn selectors(&self) -> Vec<u64> {
        self.subsets.iter().map(MeshSubset::selector).collect()
    }

    /// Record an indexed draw of the whole mesh.
    pub unsafe fn draw(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.handle], &[0]);
        device.cmd_bind_index_buffer(cmd, self.index_buffer.handle, 0, vk::IndexType::UINT32);
        device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
    }

    pub unsafe fn destroy(self, memory: &MemoryManager) {
        memory.destroy_buffer(self.vertex_buffer);
        memory.destroy_buffer(self.index_buffer);
    }
}
