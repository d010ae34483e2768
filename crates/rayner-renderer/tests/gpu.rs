//! Device tests. They need a Vulkan 1.3 driver with ray tracing and run
//! headless, so they are ignored by default:
//!
//! ```text
//! cargo test -p rayner-renderer --test gpu -- --ignored
//! ```
//!
//! Tests that trace rays also need compiled SPIR-V, taken from
//! `RAYNER_SHADER_DIR` or else from the build script output.

use std::path::PathBuf;

use ash::vk;

use rayner_common::{Mesh, RaynerConfig, TraceKind, TraceRequest};
use rayner_renderer::vulkan::raytracing::{AccelerationStructureBuilder, BuildState, RtInstance};
use rayner_renderer::vulkan::{CommandManager, ContextOptions, MemoryManager, VulkanContext};
use rayner_renderer::{ErrorCategory, GeometryBuffers, RayTracer, RenderError, BUILT_SHADER_DIR};

/// Context plus allocator and command pools, torn down in dependency order.
struct Gpu {
    commands: CommandManager,
    memory: Option<MemoryManager>,
    ctx: VulkanContext,
}

impl Gpu {
    fn new() -> Self {
        unsafe {
            let ctx = VulkanContext::new(None, ContextOptions::default()).expect("headless context");
            let memory = MemoryManager::new(&ctx).expect("allocator");
            let commands = CommandManager::new(&ctx).expect("command pools");
            Self { commands, memory: Some(memory), ctx }
        }
    }

    fn memory(&self) -> &MemoryManager {
        self.memory.as_ref().expect("allocator alive")
    }
}

impl Drop for Gpu {
    fn drop(&mut self) {
        unsafe {
            let _ = self.ctx.wait_idle();
            self.commands.destroy(&self.ctx);
        }
        // The allocator frees its blocks through the device.
        self.memory.take();
    }
}

fn shader_dir() -> PathBuf {
    std::env::var_os("RAYNER_SHADER_DIR").map_or_else(|| PathBuf::from(BUILT_SHADER_DIR), PathBuf::from)
}

// ============================================================
// Staging upload
// ============================================================

#[test]
#[ignore = "requires a Vulkan device with ray tracing"]
fn test_staging_upload_round_trips_bit_for_bit() {
    let gpu = Gpu::new();
    let data: Vec<f32> = (0..1024u32)
        .map(|i| f32::from_bits(i.wrapping_mul(0x9E37_79B9) & 0x7F7F_FFFF))
        .collect();

    unsafe {
        let buffer = gpu
            .memory()
            .upload_with_staging(
                &gpu.ctx,
                &gpu.commands,
                &data,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
                "round_trip",
            )
            .unwrap();

        let back: Vec<f32> = gpu.memory().read_buffer(&gpu.ctx, &gpu.commands, &buffer, data.len()).unwrap();
        gpu.memory().destroy_buffer(buffer);

        let expected: Vec<u32> = data.iter().map(|f| f.to_bits()).collect();
        let actual: Vec<u32> = back.iter().map(|f| f.to_bits()).collect();
        assert_eq!(actual, expected);
    }
}

#[test]
#[ignore = "requires a Vulkan device with ray tracing"]
fn test_empty_upload_is_rejected() {
    let gpu = Gpu::new();
    unsafe {
        let err = gpu
            .memory()
            .upload_with_staging::<f32>(&gpu.ctx, &gpu.commands, &[], vk::BufferUsageFlags::STORAGE_BUFFER, "empty")
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Usage);
    }
}

// ============================================================
// Acceleration structures
// ============================================================

#[test]
#[ignore = "requires a Vulkan device with ray tracing"]
fn test_quad_builds_blas_then_tlas() {
    let gpu = Gpu::new();
    unsafe {
        let geometry = GeometryBuffers::upload(&gpu.ctx, gpu.memory(), &gpu.commands, &Mesh::unit_quad()).unwrap();
        let mut builder = AccelerationStructureBuilder::new(&gpu.ctx);

        let blas_sizes = builder
            .build_blas(
                &gpu.ctx,
                gpu.memory(),
                &gpu.commands,
                geometry.vertex_address().unwrap(),
                geometry.index_address().unwrap(),
                geometry.vertex_count,
                geometry.triangle_count(),
            )
            .unwrap();
        assert!(blas_sizes.acceleration_structure_size > 0);
        assert_eq!(builder.state(), BuildState::BlasBuilt);

        builder.build_tlas(&gpu.ctx, gpu.memory(), &gpu.commands, [0.0; 3]).unwrap();
        assert_eq!(builder.state(), BuildState::TlasBuilt);

        let blas = builder.blas_address().unwrap();
        let tlas = builder.tlas_address().unwrap();
        assert_ne!(blas, 0);
        assert_ne!(tlas, 0);
        assert_ne!(tlas, blas);

        let instance = builder.instance().unwrap();
        assert_eq!(instance.mask(), 0xFF);
        assert_eq!(instance.transform, RtInstance::IDENTITY);
        assert_eq!(instance.acceleration_structure_reference, blas);

        builder.destroy(gpu.memory());
        geometry.destroy(gpu.memory());
    }
}

#[test]
#[ignore = "requires a Vulkan device with ray tracing"]
fn test_zero_triangles_rejected_before_size_query() {
    let gpu = Gpu::new();
    unsafe {
        let geometry = GeometryBuffers::upload(&gpu.ctx, gpu.memory(), &gpu.commands, &Mesh::unit_quad()).unwrap();
        let mut builder = AccelerationStructureBuilder::new(&gpu.ctx);

        let err = builder
            .build_blas(
                &gpu.ctx,
                gpu.memory(),
                &gpu.commands,
                geometry.vertex_address().unwrap(),
                geometry.index_address().unwrap(),
                geometry.vertex_count,
                0,
            )
            .unwrap_err();
        assert!(matches!(err, RenderError::InvalidInput(_)));
        assert_eq!(builder.state(), BuildState::Empty);

        geometry.destroy(gpu.memory());
    }
}

#[test]
#[ignore = "requires a Vulkan device with ray tracing"]
fn test_tlas_before_blas_is_invalid_state() {
    let gpu = Gpu::new();
    unsafe {
        let mut builder = AccelerationStructureBuilder::new(&gpu.ctx);
        let err = builder.build_tlas(&gpu.ctx, gpu.memory(), &gpu.commands, [0.0; 3]).unwrap_err();
        assert!(matches!(err, RenderError::InvalidState(_)));
    }
}

#[test]
#[ignore = "requires a Vulkan device with ray tracing"]
fn test_empty_mesh_upload_is_rejected() {
    let gpu = Gpu::new();
    unsafe {
        let mesh = Mesh::new(vec![], vec![], vec![]).unwrap();
        let err = GeometryBuffers::upload(&gpu.ctx, gpu.memory(), &gpu.commands, &mesh).unwrap_err();
        assert!(matches!(err, RenderError::InvalidInput(_)));
    }
}

// ============================================================
// Tracing
// ============================================================

fn assert_on_quad(hit: &[f32; 4]) {
    assert_eq!(hit[3], 1.0, "ray missed: {:?}", hit);
    assert!(hit[2].abs() < 1e-3);
    assert!(hit[0].abs() <= 0.5 + 1e-3 && hit[1].abs() <= 0.5 + 1e-3);
}

#[test]
#[ignore = "requires a Vulkan device with ray tracing"]
fn test_rays_before_points_trace_the_selected_subset() {
    let gpu = Gpu::new();
    let config = RaynerConfig { shader_dir: shader_dir(), max_rays: 256, ..Default::default() };
    let mesh = Mesh::unit_quad();

    unsafe {
        let geometry = GeometryBuffers::upload(&gpu.ctx, gpu.memory(), &gpu.commands, &mesh).unwrap();
        let tracer = RayTracer::new(&gpu.ctx, gpu.memory(), &gpu.commands, &geometry, &config).unwrap();

        // No points have been sampled on this tracer.
        let lower = mesh.subsets()[0].selector();
        let request = TraceRequest { kind: TraceKind::Rays, count: 200, mesh_selector: lower };
        tracer.trace_blocking(&gpu.ctx, &gpu.commands, &request).unwrap();

        let hits = tracer.read_hits(200).unwrap();
        let energy = tracer.read_energy(200).unwrap();
        let triangles = tracer.read_hit_triangles(200).unwrap();
        for ((hit, e), triangle) in hits.iter().zip(&energy).zip(&triangles) {
            assert_on_quad(hit);
            // The lower triangle is the half with y <= x.
            assert!(hit[1] <= hit[0] + 1e-3, "hit outside lower triangle: {:?}", hit);
            assert!(e[0] > 0.5 && e[0] <= 1.0 + 1e-4);
            let triangle = triangle.expect("hit records its triangle");
            assert_eq!(mesh.subset_of_triangle(triangle), Some(0));
        }

        tracer.destroy(&gpu.ctx, gpu.memory());
        geometry.destroy(gpu.memory());
    }
}

#[test]
#[ignore = "requires a Vulkan device with ray tracing"]
fn test_points_and_rays_trace_independently() {
    let gpu = Gpu::new();
    let config = RaynerConfig { shader_dir: shader_dir(), max_rays: 256, ..Default::default() };
    let mesh = Mesh::unit_quad();

    unsafe {
        let geometry = GeometryBuffers::upload(&gpu.ctx, gpu.memory(), &gpu.commands, &mesh).unwrap();
        let tracer = RayTracer::new(&gpu.ctx, gpu.memory(), &gpu.commands, &geometry, &config).unwrap();

        let whole = u64::from(mesh.triangle_count()) << 32;
        let points = TraceRequest { kind: TraceKind::Points, count: 200, mesh_selector: whole };
        tracer.trace_blocking(&gpu.ctx, &gpu.commands, &points).unwrap();
        let sampled = tracer.read_points(200).unwrap();
        sampled.iter().for_each(assert_on_quad);

        // More rays than points, on the other subset.
        let upper = mesh.subsets()[1].selector();
        let rays = TraceRequest { kind: TraceKind::Rays, count: 256, mesh_selector: upper };
        tracer.trace_blocking(&gpu.ctx, &gpu.commands, &rays).unwrap();
        let hits = tracer.read_hits(256).unwrap();
        for hit in &hits {
            assert_on_quad(hit);
            assert!(hit[1] >= hit[0] - 1e-3, "hit outside upper triangle: {:?}", hit);
        }
        let triangles = tracer.read_hit_triangles(256).unwrap();
        assert!(triangles.iter().all(|t| *t == Some(1)));

        // The ray trace leaves the sampled points alone.
        let after = tracer.read_points(200).unwrap();
        assert_eq!(after, sampled);

        let over = TraceRequest { kind: TraceKind::Rays, count: 257, mesh_selector: whole };
        assert!(tracer.trace_blocking(&gpu.ctx, &gpu.commands, &over).is_err());

        tracer.destroy(&gpu.ctx, gpu.memory());
        geometry.destroy(gpu.memory());
    }
}
