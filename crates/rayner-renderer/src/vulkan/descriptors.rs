//! Descriptor sets for the graphics passes and the ray tracing pipelines.

use ash::vk;
use glam::Mat4;
use gpu_allocator::MemoryLocation;
use rayner_common::CameraUniform;

use super::{Buffer, MemoryManager, VulkanContext, MAX_FRAMES_IN_FLIGHT};
use crate::error::{RenderError, RenderResult};

/// Binding indices of the trace descriptor set.
pub mod binding {
    pub const TLAS: u32 = 0;
    pub const OUTPUT: u32 = 1;
    pub const ORIGINS: u32 = 2;
    pub const DIRECTIONS: u32 = 3;
    pub const HITS: u32 = 4;
}

unsafe fn create_layout(
    ctx: &VulkanContext,
    bindings: &[vk::DescriptorSetLayoutBinding],
) -> RenderResult<vk::DescriptorSetLayout> {
    let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
        .bindings(bindings);

    ctx.device.create_descriptor_set_layout(&layout_info, None)
        .map_err(RenderError::construction("create descriptor set layout"))
}

unsafe fn allocate_sets(
    ctx: &VulkanContext,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    count: usize,
) -> RenderResult<Vec<vk::DescriptorSet>> {
    let layouts = vec![layout; count];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);

    ctx.device.allocate_descriptor_sets(&alloc_info)
        .map_err(RenderError::vk("vkAllocateDescriptorSets"))
}

/// Per-slot camera uniform, bound at set 0 by the graphics pipelines.
pub struct FrameDescriptors {
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    sets: Vec<vk::DescriptorSet>,
    buffers: Vec<Buffer>,
}

impl FrameDescriptors {
    pub unsafe fn new(ctx: &VulkanContext, memory: &MemoryManager) -> RenderResult<Self> {
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: MAX_FRAMES_IN_FLIGHT as u32,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(MAX_FRAMES_IN_FLIGHT as u32);

        let mut this = Self {
            pool: ctx.device.create_descriptor_pool(&pool_info, None)
                .map_err(RenderError::construction("create descriptor pool"))?,
            layout: vk::DescriptorSetLayout::null(),
            sets: Vec::new(),
            buffers: Vec::with_capacity(MAX_FRAMES_IN_FLIGHT),
        };

        if let Err(e) = this.init(ctx, memory) {
            this.destroy(ctx, memory);
            return Err(e);
        }
        Ok(this)
    }

    unsafe fn init(&mut self, ctx: &VulkanContext, memory: &MemoryManager) -> RenderResult<()> {
        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::VERTEX),
        ];
        self.layout = create_layout(ctx, &bindings)?;
        self.sets = allocate_sets(ctx, self.pool, self.layout, MAX_FRAMES_IN_FLIGHT)?;

        let size = std::mem::size_of::<CameraUniform>() as vk::DeviceSize;
        for slot in 0..MAX_FRAMES_IN_FLIGHT {
            let buffer = memory.create_buffer(
                size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryLocation::CpuToGpu,
                &format!("camera_uniform_{}", slot),
            )?;
            buffer.write(&[CameraUniform::new(Mat4::IDENTITY)])?;
            self.buffers.push(buffer);
        }

        for (set, buffer) in self.sets.iter().zip(&self.buffers) {
            let buffer_info = [vk::DescriptorBufferInfo {
                buffer: buffer.handle,
                offset: 0,
                range: size,
            }];
            let write = vk::WriteDescriptorSet::default()
                .dst_set(*set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_info);
            ctx.device.update_descriptor_sets(&[write], &[]);
        }

        Ok(())
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn set(&self, slot: usize) -> vk::DescriptorSet {
        self.sets[slot % MAX_FRAMES_IN_FLIGHT]
    }

    /// Write the camera matrix for `slot`. Only call once the slot's fence
    /// has been waited.
    pub fn update(&self, slot: usize, view_projection: &Mat4) -> RenderResult<()> {
        let buffer = self.buffers.get(slot).ok_or_else(|| {
            RenderError::InvalidInput(format!("frame slot {} out of range", slot))
        })?;
        buffer.write(&[CameraUniform::new(*view_projection)])
    }

    pub unsafe fn destroy(&mut self, ctx: &VulkanContext, memory: &MemoryManager) {
        for buffer in self.buffers.drain(..) {
            memory.destroy_buffer(buffer);
        }
        ctx.device.destroy_descriptor_pool(self.pool, None);
        if self.layout != vk::DescriptorSetLayout::null() {
            ctx.device.destroy_descriptor_set_layout(self.layout, None);
        }
        self.sets.clear();
    }
}

/// Resources bound to the trace descriptor set.
pub struct TraceBindings<'a> {
    pub tlas: vk::AccelerationStructureKHR,
    pub output: &'a Buffer,
    pub origins: &'a Buffer,
    pub directions: &'a Buffer,
    pub hits: &'a Buffer,
}

/// TLAS plus the four storage buffers the ray tracing shaders read and write.
pub struct TraceDescriptors {
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
}

impl TraceDescriptors {
    pub unsafe fn new(ctx: &VulkanContext) -> RenderResult<Self> {
        let stages = vk::ShaderStageFlags::RAYGEN_KHR
            | vk::ShaderStageFlags::CLOSEST_HIT_KHR
            | vk::ShaderStageFlags::MISS_KHR;

        let storage = |binding| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(stages)
        };

        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding::TLAS)
                .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .descriptor_count(1)
                .stage_flags(stages),
            storage(binding::OUTPUT),
            storage(binding::ORIGINS),
            storage(binding::DIRECTIONS),
            storage(binding::HITS),
        ];

        let layout = create_layout(ctx, &bindings)?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                descriptor_count: 1,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 4,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(1);

        let pool = match ctx.device.create_descriptor_pool(&pool_info, None) {
            Ok(pool) => pool,
            Err(e) => {
                ctx.device.destroy_descriptor_set_layout(layout, None);
                return Err(RenderError::construction("create descriptor pool")(e));
            }
        };

        let set = match allocate_sets(ctx, pool, layout, 1) {
            Ok(sets) => sets[0],
            Err(e) => {
                ctx.device.destroy_descriptor_pool(pool, None);
                ctx.device.destroy_descriptor_set_layout(layout, None);
                return Err(e);
            }
        };

        Ok(Self { pool, layout, set })
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Point every binding at `bindings`.
    pub unsafe fn write(&self, ctx: &VulkanContext, bindings: &TraceBindings<'_>) {
        let structures = [bindings.tlas];
        let mut as_info = vk::WriteDescriptorSetAccelerationStructureKHR::default()
            .acceleration_structures(&structures);

        // The count is not inferred through push_next
        let tlas_write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(binding::TLAS)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .descriptor_count(1)
            .push_next(&mut as_info);

        let infos = [
            (binding::OUTPUT, bindings.output),
            (binding::ORIGINS, bindings.origins),
            (binding::DIRECTIONS, bindings.directions),
            (binding::HITS, bindings.hits),
        ]
        .map(|(binding, buffer)| {
            (binding, [vk::DescriptorBufferInfo {
                buffer: buffer.handle,
                offset: 0,
                range: vk::WHOLE_SIZE,
            }])
        });

        let mut writes = vec![tlas_write];
        for (binding, info) in &infos {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(*binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(info),
            );
        }

        ctx.device.update_descriptor_sets(&writes, &[]);
    }

    pub unsafe fn destroy(&mut self, ctx: &VulkanContext) {
        ctx.device.destroy_descriptor_pool(self.pool, None);
        ctx.device.destroy_descriptor_set_layout(self.layout, None);
    }
}
