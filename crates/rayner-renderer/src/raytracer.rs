//! Acceleration structures, trace buffers and the two trace pipelines.

use ash::vk;
use gpu_allocator::MemoryLocation;

use rayner_common::{RaynerConfig, TraceKind, TraceRequest};

use crate::error::{RenderError, RenderResult};
use crate::geometry::GeometryBuffers;
use crate::vulkan::raytracing::{AccelerationStructureBuilder, RayTracingPipeline, RtConsts, RtShaderPaths};
use crate::vulkan::{
    Buffer, BufferHazard, CommandManager, MemoryManager, Pipeline, TraceBindings, TraceDescriptors,
    VulkanContext,
};

/// One `vec4` per ray or point.
pub const TRACE_ELEMENT_SIZE: vk::DeviceSize = 16;

const TRACE_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw()
        | vk::BufferUsageFlags::TRANSFER_SRC.as_raw(),
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceSlot {
    Output,
    Origins,
    Directions,
    Hits,
    Energy,
}

impl TraceSlot {
    /// Every trace generates its own inputs, so neither kind reads what the
    /// other wrote.
    pub fn written_by(kind: TraceKind) -> &'static [TraceSlot] {
        match kind {
            TraceKind::Points => &[TraceSlot::Output],
            TraceKind::Rays => &[TraceSlot::Origins, TraceSlot::Directions, TraceSlot::Hits, TraceSlot::Energy],
        }
    }
}

/// Host-visible buffers written by the trace shaders and drawn by the
/// raster passes.
pub struct TraceBuffers {
    /// Sampled points.
    pub output: Buffer,
    pub origins: Buffer,
    pub directions: Buffer,
    /// Hit positions; `w` is 1 for a hit and 0 for a miss.
    pub hits: Buffer,
    /// Per-ray cosine term at the hit in `x`, the hit triangle in `y`
    /// (-1 for a miss).
    pub energy: Buffer,
    pub capacity: u32,
}

impl TraceBuffers {
    pub unsafe fn new(memory: &MemoryManager, capacity: u32) -> RenderResult<Self> {
        if capacity == 0 {
            return Err(RenderError::InvalidInput("trace buffer capacity is zero".to_string()));
        }
        let size = capacity as vk::DeviceSize * TRACE_ELEMENT_SIZE;

        let mut created: Vec<Buffer> = Vec::with_capacity(5);
        for name in ["trace_output", "trace_origins", "trace_directions", "trace_hits", "trace_energy"] {
            match memory.create_buffer(size, TRACE_USAGE, MemoryLocation::CpuToGpu, name) {
                Ok(buffer) => created.push(buffer),
                Err(e) => {
                    for buffer in created {
                        memory.destroy_buffer(buffer);
                    }
                    return Err(e);
                }
            }
        }

        let mut buffers = created.into_iter();
        match (buffers.next(), buffers.next(), buffers.next(), buffers.next(), buffers.next()) {
            (Some(output), Some(origins), Some(directions), Some(hits), Some(energy)) => Ok(Self {
                output,
                origins,
                directions,
                hits,
                energy,
                capacity,
            }),
            _ => Err(RenderError::InvalidState("trace buffers were not all created".to_string())),
        }
    }

    pub fn slot(&self, slot: TraceSlot) -> &Buffer {
        match slot {
            TraceSlot::Output => &self.output,
            TraceSlot::Origins => &self.origins,
            TraceSlot::Directions => &self.directions,
            TraceSlot::Hits => &self.hits,
            TraceSlot::Energy => &self.energy,
        }
    }

    /// Buffers a trace of `kind` writes.
    pub fn written_by(&self, kind: TraceKind) -> impl Iterator<Item = &Buffer> {
        TraceSlot::written_by(kind).iter().map(move |&slot| self.slot(slot))
    }

    pub unsafe fn destroy(self, memory: &MemoryManager) {
        memory.destroy_buffer(self.output);
        memory.destroy_buffer(self.origins);
        memory.destroy_buffer(self.directions);
        memory.destroy_buffer(self.hits);
        memory.destroy_buffer(self.energy);
    }
}

pub struct RayTracer {
    pub accel: AccelerationStructureBuilder,
    pub buffers: TraceBuffers,
    descriptors: TraceDescriptors,
    points: Pipeline,
    rays: Pipeline,
    consts: RtConsts,
}

impl RayTracer {
    /// Build BLAS then TLAS over `geometry`, create the trace buffers and both
    /// pipelines.
    pub unsafe fn new(
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        geometry: &GeometryBuffers,
        config: &RaynerConfig,
    ) -> RenderResult<Self> {
        let mut accel = AccelerationStructureBuilder::new(ctx);

        let built = accel
            .build_blas(
                ctx,
                memory,
                commands,
                geometry.vertex_address()?,
                geometry.index_address()?,
                geometry.vertex_count,
                geometry.triangle_count(),
            )
            .and_then(|_| accel.build_tlas(ctx, memory, commands, config.translation()));
        if let Err(e) = built {
            accel.destroy(memory);
            return Err(e);
        }

        let buffers = match TraceBuffers::new(memory, config.max_rays) {
            Ok(buffers) => buffers,
            Err(e) => {
                accel.destroy(memory);
                return Err(e);
            }
        };

        let created = Self::base_consts(geometry, &buffers).and_then(|consts| {
            Self::create_pipelines(ctx, memory, &accel, &buffers, config).map(|p| (consts, p))
        });

        match created {
            Ok((consts, (descriptors, points, rays))) => {
                tracing::info!(capacity = config.max_rays, "ray tracer ready");
                Ok(Self { accel, buffers, descriptors, points, rays, consts })
            }
            Err(e) => {
                buffers.destroy(memory);
                accel.destroy(memory);
                Err(e)
            }
        }
    }

    fn base_consts(geometry: &GeometryBuffers, buffers: &TraceBuffers) -> RenderResult<RtConsts> {
        Ok(RtConsts {
            vertices: geometry.vertex_address()?,
            indices: geometry.index_address()?,
            output: buffers.output.address()?,
            origins: buffers.origins.address()?,
            directions: buffers.directions.address()?,
            hits: buffers.hits.address()?,
            energy: buffers.energy.address()?,
            mesh_selector: geometry.subsets.first().map_or(0, |s| s.selector()),
        })
    }

    unsafe fn create_pipelines(
        ctx: &VulkanContext,
        memory: &MemoryManager,
        accel: &AccelerationStructureBuilder,
        buffers: &TraceBuffers,
        config: &RaynerConfig,
    ) -> RenderResult<(TraceDescriptors, Pipeline, Pipeline)> {
        let tlas = accel
            .tlas_handle()
            .ok_or_else(|| RenderError::InvalidState("TLAS missing after build".to_string()))?;

        let mut descriptors = TraceDescriptors::new(ctx)?;
        descriptors.write(ctx, &TraceBindings {
            tlas,
            output: &buffers.output,
            origins: &buffers.origins,
            directions: &buffers.directions,
            hits: &buffers.hits,
        });

        let points_paths = RtShaderPaths::for_kind(TraceKind::Points, &config.shader_dir);
        let points = match RayTracingPipeline::new(ctx, memory, descriptors.layout(), &points_paths) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                descriptors.destroy(ctx);
                return Err(e);
            }
        };

        let rays_paths = RtShaderPaths::for_kind(TraceKind::Rays, &config.shader_dir);
        let rays = match RayTracingPipeline::new(ctx, memory, descriptors.layout(), &rays_paths) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                points.destroy(ctx, memory);
                descriptors.destroy(ctx);
                return Err(e);
            }
        };

        Ok((descriptors, Pipeline::RayTracing(points), Pipeline::RayTracing(rays)))
    }

    /// Push constants with every address filled in and the first subset
    /// selected.
    pub fn consts(&self) -> RtConsts {
        self.consts
    }

    pub fn capacity(&self) -> u32 {
        self.buffers.capacity
    }

    fn pipeline(&self, kind: TraceKind) -> &Pipeline {
        match kind {
            TraceKind::Points => &self.points,
            TraceKind::Rays => &self.rays,
        }
    }

    /// Record one trace into `cmd`, fenced by barriers against the raster
    /// passes that read the same buffers. Returns false when nothing was
    /// recorded.
    pub unsafe fn record_trace(
        &self,
        ctx: &VulkanContext,
        commands: &CommandManager,
        cmd: vk::CommandBuffer,
        request: &TraceRequest,
    ) -> RenderResult<bool> {
        if request.count > self.buffers.capacity {
            return Err(RenderError::InvalidInput(format!(
                "trace of {} exceeds buffer capacity {}",
                request.count, self.buffers.capacity
            )));
        }
        if request.count == 0 {
            return Ok(false);
        }

        let written: Vec<&Buffer> = self.buffers.written_by(request.kind).collect();
        for buffer in &written {
            commands.buffer_barrier(cmd, buffer, BufferHazard::VertexReadToTraceWrite);
        }

        let pipeline = self.pipeline(request.kind);
        let consts = RtConsts { mesh_selector: request.mesh_selector, ..self.consts };

        pipeline.bind(&ctx.device, cmd);
        pipeline.bind_descriptor_set(&ctx.device, cmd, self.descriptors.set());
        pipeline.push_constants(&ctx.device, cmd, &consts);
        let recorded = pipeline.dispatch(ctx, cmd, request.count)?;

        for buffer in &written {
            commands.buffer_barrier(cmd, buffer, BufferHazard::TraceWriteToVertexRead);
        }

        tracing::debug!(kind = ?request.kind, count = request.count, selector = request.mesh_selector, "trace recorded");
        Ok(recorded)
    }

    /// Trace once on a one-shot command buffer and wait for it.
    pub unsafe fn trace_blocking(
        &self,
        ctx: &VulkanContext,
        commands: &CommandManager,
        request: &TraceRequest,
    ) -> RenderResult<()> {
        let mut result = Ok(false);
        commands.run_graphics(ctx, |cmd| {
            result = self.record_trace(ctx, commands, cmd, request);
            if let Ok(true) = result {
                for buffer in self.buffers.written_by(request.kind) {
                    commands.buffer_barrier(cmd, buffer, BufferHazard::TraceWriteToHostRead);
                }
            }
        })?;
        result.map(|_| ())
    }

    /// First `count` hit records, `[x, y, z, hit]`.
    pub fn read_hits(&self, count: u32) -> RenderResult<Vec<[f32; 4]>> {
        self.read(&self.buffers.hits, count)
    }

    /// First `count` sampled points.
    pub fn read_points(&self, count: u32) -> RenderResult<Vec<[f32; 4]>> {
        self.read(&self.buffers.output, count)
    }

    pub fn read_energy(&self, count: u32) -> RenderResult<Vec<[f32; 4]>> {
        self.read(&self.buffers.energy, count)
    }

    /// Triangle hit by each of the first `count` rays, `None` for a miss.
    pub fn read_hit_triangles(&self, count: u32) -> RenderResult<Vec<Option<u32>>> {
        Ok(self.read_energy(count)?.iter().map(|e| hit_triangle(e[1])).collect())
    }

    fn read(&self, buffer: &Buffer, count: u32) -> RenderResult<Vec<[f32; 4]>> {
        if count > self.buffers.capacity {
            return Err(RenderError::InvalidInput(format!(
                "read of {} exceeds buffer capacity {}",
                count, self.buffers.capacity
            )));
        }
        buffer.read(count as usize)
    }

    /// Destroy in reverse creation order. The BLAS goes last since the TLAS
    /// references it.
    pub unsafe fn destroy(mut self, ctx: &VulkanContext, memory: &MemoryManager) {
        self.rays.destroy(ctx, memory);
        self.points.destroy(ctx, memory);
        self.descriptors.destroy(ctx);
        self.buffers.destroy(memory);
        self.accel.destroy(memory);
    }
}

fn hit_triangle(encoded: f32) -> Option<u32> {
    (encoded >= 0.0).then(|| encoded.round() as u32)
}
