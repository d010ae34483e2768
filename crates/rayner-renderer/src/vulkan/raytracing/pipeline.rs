//! Ray tracing pipelines: one raygen, one triangle hit group, one miss.

use std::path::{Path, PathBuf};

use ash::vk;
use bytemuck::{Pod, Zeroable};

use rayner_common::TraceKind;

use super::sbt::ShaderBindingTable;
use crate::error::{RenderError, RenderResult};
use crate::vulkan::shader::{destroy_shader_modules, load_shader_modules, ENTRY_POINT};
use crate::vulkan::{MemoryManager, VulkanContext};

/// Push constants shared by the trace shaders and the graphics passes.
/// Every field but `mesh_selector` is a buffer device address.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RtConsts {
    pub vertices: u64,
    pub indices: u64,
    pub output: u64,
    pub origins: u64,
    pub directions: u64,
    pub hits: u64,
    pub energy: u64,
    /// `(triangle_count << 32) | first_triangle`
    pub mesh_selector: u64,
}

/// Size of [`RtConsts`] in bytes.
pub const RT_CONSTS_SIZE: u32 = std::mem::size_of::<RtConsts>() as u32;

/// Push constant size every Vulkan implementation supports.
pub const GUARANTEED_PUSH_CONSTANT_SIZE: u32 = 128;

/// Primary rays only; no shader traces from a hit or miss.
pub const PIPELINE_RECURSION_DEPTH: u32 = 1;

/// Launch dimensions for `ray_count` rays.
pub fn trace_extent(ray_count: u32) -> (u32, u32, u32) {
    (ray_count, 1, 1)
}

/// Fails when the device cannot run [`PIPELINE_RECURSION_DEPTH`] levels.
pub fn check_recursion_depth(max_ray_recursion_depth: u32) -> RenderResult<()> {
    if max_ray_recursion_depth < PIPELINE_RECURSION_DEPTH {
        return Err(RenderError::Construction(format!(
            "ray recursion depth {} needed, device allows {}",
            PIPELINE_RECURSION_DEPTH, max_ray_recursion_depth
        )));
    }
    Ok(())
}

/// Records `vkCmdTraceRaysKHR` launches.
pub trait TraceLauncher {
    unsafe fn trace_rays(&self, width: u32, height: u32, depth: u32);
}

struct SbtLauncher<'a> {
    ctx: &'a VulkanContext,
    cmd: vk::CommandBuffer,
    sbt: &'a ShaderBindingTable,
}

impl TraceLauncher for SbtLauncher<'_> {
    unsafe fn trace_rays(&self, width: u32, height: u32, depth: u32) {
        self.sbt.trace_rays(self.ctx, self.cmd, width, height, depth);
    }
}

/// Record one launch of `ray_count` rays. Nothing is recorded for zero.
pub unsafe fn launch_rays(launcher: &dyn TraceLauncher, ray_count: u32) -> bool {
    if ray_count == 0 {
        return false;
    }
    let (width, height, depth) = trace_extent(ray_count);
    launcher.trace_rays(width, height, depth);
    true
}

/// SPIR-V files for one pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtShaderPaths {
    pub raygen: PathBuf,
    pub closest_hit: PathBuf,
    pub miss: PathBuf,
}

impl RtShaderPaths {
    /// `rt.*` for point sampling, `rttri.*` for ray casting.
    pub fn for_kind(kind: TraceKind, shader_dir: &Path) -> Self {
        let stem = match kind {
            TraceKind::Points => "rt",
            TraceKind::Rays => "rttri",
        };
        Self {
            raygen: shader_dir.join(format!("{}.rgen.spv", stem)),
            closest_hit: shader_dir.join(format!("{}.rchit.spv", stem)),
            miss: shader_dir.join(format!("{}.rmiss.spv", stem)),
        }
    }
}

const RT_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::MISS_KHR.as_raw(),
);

pub struct RayTracingPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub sbt: ShaderBindingTable,
}

impl RayTracingPipeline {
    pub unsafe fn new(
        ctx: &VulkanContext,
        memory: &MemoryManager,
        set_layout: vk::DescriptorSetLayout,
        paths: &RtShaderPaths,
    ) -> RenderResult<Self> {
        let limit = ctx.device_properties.limits.max_push_constants_size;
        if RT_CONSTS_SIZE > limit {
            return Err(RenderError::Construction(format!(
                "push constants need {} bytes, device allows {}",
                RT_CONSTS_SIZE, limit
            )));
        }
        check_recursion_depth(ctx.rt_properties.max_ray_recursion_depth)?;

        let push_ranges = [vk::PushConstantRange {
            stage_flags: RT_STAGES,
            offset: 0,
            size: RT_CONSTS_SIZE,
        }];
        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);

        let layout = ctx.device.create_pipeline_layout(&layout_info, None)
            .map_err(RenderError::construction("create ray tracing pipeline layout"))?;

        let pipeline = match Self::create_pipeline(ctx, layout, paths) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                ctx.device.destroy_pipeline_layout(layout, None);
                return Err(e);
            }
        };

        let sbt = match ShaderBindingTable::new(ctx, memory, pipeline, 1, 1) {
            Ok(sbt) => sbt,
            Err(e) => {
                ctx.device.destroy_pipeline(pipeline, None);
                ctx.device.destroy_pipeline_layout(layout, None);
                return Err(e);
            }
        };

        tracing::info!(raygen = %paths.raygen.display(), "ray tracing pipeline created");

        Ok(Self { pipeline, layout, sbt })
    }

    unsafe fn create_pipeline(
        ctx: &VulkanContext,
        layout: vk::PipelineLayout,
        paths: &RtShaderPaths,
    ) -> RenderResult<vk::Pipeline> {
        let modules = load_shader_modules(
            ctx,
            &[paths.raygen.as_path(), paths.closest_hit.as_path(), paths.miss.as_path()],
        )?;

        let stages = [
            (vk::ShaderStageFlags::RAYGEN_KHR, modules[0]),
            (vk::ShaderStageFlags::CLOSEST_HIT_KHR, modules[1]),
            (vk::ShaderStageFlags::MISS_KHR, modules[2]),
        ]
        .map(|(stage, module)| {
            vk::PipelineShaderStageCreateInfo::default()
                .stage(stage)
                .module(module)
                .name(ENTRY_POINT)
        });

        // Group order fixes the SBT order: raygen, hit, miss
        let groups = [
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(0)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(1)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(2)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
        ];

        let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(PIPELINE_RECURSION_DEPTH)
            .layout(layout);

        let result = ctx.rt_pipeline_loader.create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            &[create_info],
            None,
        );

        destroy_shader_modules(ctx, &modules);

        match result {
            Ok(pipelines) => Ok(pipelines[0]),
            Err((pipelines, e)) => {
                for pipeline in pipelines.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                    ctx.device.destroy_pipeline(pipeline, None);
                }
                Err(RenderError::construction("create ray tracing pipeline")(e))
            }
        }
    }

    pub unsafe fn bind(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, self.pipeline);
    }

    pub unsafe fn push_constants(&self, device: &ash::Device, cmd: vk::CommandBuffer, consts: &RtConsts) {
        device.cmd_push_constants(cmd, self.layout, RT_STAGES, 0, bytemuck::bytes_of(consts));
    }

    pub unsafe fn bind_descriptor_set(&self, device: &ash::Device, cmd: vk::CommandBuffer, set: vk::DescriptorSet) {
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            self.layout,
            0,
            &[set],
            &[],
        );
    }

    /// Record one trace of `ray_count` rays. Nothing is recorded for zero.
    pub unsafe fn dispatch(&self, ctx: &VulkanContext, cmd: vk::CommandBuffer, ray_count: u32) -> bool {
        launch_rays(&SbtLauncher { ctx, cmd, sbt: &self.sbt }, ray_count)
    }

    pub unsafe fn destroy(self, ctx: &VulkanContext, memory: &MemoryManager) {
        self.sbt.destroy(memory);
        ctx.device.destroy_pipeline(self.pipeline, None);
        ctx.device.destroy_pipeline_layout(self.layout, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingLauncher {
        launches: RefCell<Vec<(u32, u32, u32)>>,
    }

    impl TraceLauncher for RecordingLauncher {
        unsafe fn trace_rays(&self, width: u32, height: u32, depth: u32) {
            self.launches.borrow_mut().push((width, height, depth));
        }
    }

    #[test]
    fn test_push_constants_fit_guaranteed_limit() {
        assert_eq!(RT_CONSTS_SIZE, 64);
        assert!(RT_CONSTS_SIZE <= GUARANTEED_PUSH_CONSTANT_SIZE);
    }

    #[test]
    fn test_selector_is_last_field() {
        let consts = RtConsts { mesh_selector: 0x0000_0002_0000_0004, ..Default::default() };
        let bytes = bytemuck::bytes_of(&consts);
        assert_eq!(&bytes[56..64], &0x0000_0002_0000_0004u64.to_ne_bytes());
    }

    #[test]
    fn test_thousand_rays_launch_one_dimension() {
        assert_eq!(trace_extent(1000), (1000, 1, 1));
    }

    #[test]
    fn test_dispatch_records_one_launch() {
        let launcher = RecordingLauncher::default();
        assert!(unsafe { launch_rays(&launcher, 1000) });
        assert_eq!(*launcher.launches.borrow(), vec![(1000, 1, 1)]);
    }

    #[test]
    fn test_dispatch_of_zero_records_nothing() {
        let launcher = RecordingLauncher::default();
        assert!(!unsafe { launch_rays(&launcher, 0) });
        assert!(launcher.launches.borrow().is_empty());
    }

    #[test]
    fn test_recursion_depth_check() {
        assert!(check_recursion_depth(1).is_ok());
        assert!(check_recursion_depth(31).is_ok());
        let err = check_recursion_depth(0).unwrap_err();
        assert!(matches!(err, RenderError::Construction(_)));
    }

    #[test]
    fn test_shader_paths_per_kind() {
        let points = RtShaderPaths::for_kind(TraceKind::Points, Path::new("spv"));
        assert_eq!(points.raygen, Path::new("spv/rt.rgen.spv"));
        let rays = RtShaderPaths::for_kind(TraceKind::Rays, Path::new("spv"));
        assert_eq!(rays.closest_hit, Path::new("spv/rttri.rchit.spv"));
        assert_eq!(rays.miss, Path::new("spv/rttri.rmiss.spv"));
    }
}
