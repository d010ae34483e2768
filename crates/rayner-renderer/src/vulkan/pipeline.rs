//! Graphics pipelines for the raster passes, and the pipeline variant type.

use std::path::{Path, PathBuf};

use ash::vk;

use rayner_common::VERTEX_STRIDE;
use rayner_common::mesh::COLOR_OFFSET;

use super::raytracing::pipeline::RT_CONSTS_SIZE;
use super::raytracing::{RayTracingPipeline, RtConsts};
use super::shader::{destroy_shader_modules, load_shader_modules, ENTRY_POINT};
use super::{MemoryManager, VulkanContext};
use crate::error::{RenderError, RenderResult};

/// Primitive type drawn by a graphics pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    /// Indexed mesh triangles from the vertex buffer.
    Triangles,
    /// Ray segments, vertices pulled from device addresses.
    Lines,
    /// Sample or hit points, vertices pulled from device addresses.
    Points,
}

impl Topology {
    pub fn primitive(self) -> vk::PrimitiveTopology {
        match self {
            Topology::Triangles => vk::PrimitiveTopology::TRIANGLE_LIST,
            Topology::Lines => vk::PrimitiveTopology::LINE_LIST,
            Topology::Points => vk::PrimitiveTopology::POINT_LIST,
        }
    }

    /// Only triangles read the bound vertex buffer.
    pub fn uses_vertex_input(self) -> bool {
        self == Topology::Triangles
    }

    pub fn dynamic_states(self) -> &'static [vk::DynamicState] {
        match self {
            Topology::Lines => &[vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR, vk::DynamicState::LINE_WIDTH],
            _ => &[vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
        }
    }

    fn shader_stem(self) -> &'static str {
        match self {
            Topology::Triangles => "tri",
            Topology::Lines => "lin",
            Topology::Points => "pts",
        }
    }
}

/// Which shaders draw which topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsConfig {
    pub topology: Topology,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
}

impl GraphicsConfig {
    pub fn for_topology(topology: Topology, shader_dir: &Path) -> Self {
        let stem = topology.shader_stem();
        Self {
            topology,
            vertex_shader: shader_dir.join(format!("{}.vert.spv", stem)),
            fragment_shader: shader_dir.join(format!("{}.frag.spv", stem)),
        }
    }
}

/// Vertex buffer binding matching [`rayner_common::Vertex`].
pub fn vertex_bindings() -> [vk::VertexInputBindingDescription; 1] {
    [vk::VertexInputBindingDescription::default()
        .binding(0)
        .stride(VERTEX_STRIDE as u32)
        .input_rate(vk::VertexInputRate::VERTEX)]
}

pub fn vertex_attributes() -> [vk::VertexInputAttributeDescription; 2] {
    [
        vk::VertexInputAttributeDescription::default()
            .binding(0)
            .location(0)
            .format(vk::Format::R32G32B32A32_SFLOAT)
            .offset(0),
        vk::VertexInputAttributeDescription::default()
            .binding(0)
            .location(1)
            .format(vk::Format::R32G32B32A32_SFLOAT)
            .offset(COLOR_OFFSET as u32),
    ]
}

const GRAPHICS_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::VERTEX.as_raw() | vk::ShaderStageFlags::FRAGMENT.as_raw(),
);

pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub topology: Topology,
}

impl GraphicsPipeline {
    pub unsafe fn new(
        ctx: &VulkanContext,
        render_pass: vk::RenderPass,
        set_layout: vk::DescriptorSetLayout,
        config: &GraphicsConfig,
    ) -> RenderResult<Self> {
        let push_ranges = [vk::PushConstantRange {
            stage_flags: GRAPHICS_STAGES,
            offset: 0,
            size: RT_CONSTS_SIZE,
        }];
        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);

        let layout = ctx.device.create_pipeline_layout(&layout_info, None)
            .map_err(RenderError::construction("create pipeline layout"))?;

        match Self::create_pipeline(ctx, render_pass, layout, config) {
            Ok(pipeline) => {
                tracing::debug!(topology = ?config.topology, "graphics pipeline created");
                Ok(Self { pipeline, layout, topology: config.topology })
            }
            Err(e) => {
                ctx.device.destroy_pipeline_layout(layout, None);
                Err(e)
            }
        }
    }

    unsafe fn create_pipeline(
        ctx: &VulkanContext,
        render_pass: vk::RenderPass,
        layout: vk::PipelineLayout,
        config: &GraphicsConfig,
    ) -> RenderResult<vk::Pipeline> {
        let modules = load_shader_modules(
            ctx,
            &[config.vertex_shader.as_path(), config.fragment_shader.as_path()],
        )?;

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(modules[0])
                .name(ENTRY_POINT),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(modules[1])
                .name(ENTRY_POINT),
        ];

        let bindings = vertex_bindings();
        let attributes = vertex_attributes();
        let vertex_input = if config.topology.uses_vertex_input() {
            vk::PipelineVertexInputStateCreateInfo::default()
                .vertex_binding_descriptions(&bindings)
                .vertex_attribute_descriptions(&attributes)
        } else {
            vk::PipelineVertexInputStateCreateInfo::default()
        };

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(config.topology.primitive())
            .primitive_restart_enable(false);

        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default()
            .dynamic_states(config.topology.dynamic_states());

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);

        let result = ctx.device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None);

        destroy_shader_modules(ctx, &modules);

        match result {
            Ok(pipelines) => Ok(pipelines[0]),
            Err((pipelines, e)) => {
                for pipeline in pipelines.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                    ctx.device.destroy_pipeline(pipeline, None);
                }
                Err(RenderError::construction("create graphics pipeline")(e))
            }
        }
    }

    pub unsafe fn bind(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
    }

    pub unsafe fn push_constants(&self, device: &ash::Device, cmd: vk::CommandBuffer, consts: &RtConsts) {
        device.cmd_push_constants(cmd, self.layout, GRAPHICS_STAGES, 0, bytemuck::bytes_of(consts));
    }

    pub unsafe fn bind_descriptor_set(&self, device: &ash::Device, cmd: vk::CommandBuffer, set: vk::DescriptorSet) {
        device.cmd_bind_descriptor_sets(cmd, vk::PipelineBindPoint::GRAPHICS, self.layout, 0, &[set], &[]);
    }

    pub unsafe fn destroy(self, ctx: &VulkanContext) {
        ctx.device.destroy_pipeline(self.pipeline, None);
        ctx.device.destroy_pipeline_layout(self.layout, None);
    }
}

/// Either kind of pipeline, dispatched on the tag.
pub enum Pipeline {
    Graphics(GraphicsPipeline),
    RayTracing(RayTracingPipeline),
}

impl Pipeline {
    pub unsafe fn bind(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        match self {
            Pipeline::Graphics(p) => p.bind(device, cmd),
            Pipeline::RayTracing(p) => p.bind(device, cmd),
        }
    }

    pub unsafe fn push_constants(&self, device: &ash::Device, cmd: vk::CommandBuffer, consts: &RtConsts) {
        match self {
            Pipeline::Graphics(p) => p.push_constants(device, cmd, consts),
            Pipeline::RayTracing(p) => p.push_constants(device, cmd, consts),
        }
    }

    pub unsafe fn bind_descriptor_set(&self, device: &ash::Device, cmd: vk::CommandBuffer, set: vk::DescriptorSet) {
        match self {
            Pipeline::Graphics(p) => p.bind_descriptor_set(device, cmd, set),
            Pipeline::RayTracing(p) => p.bind_descriptor_set(device, cmd, set),
        }
    }

    /// Launch `ray_count` rays. Only ray tracing pipelines can dispatch.
    pub unsafe fn dispatch(&self, ctx: &VulkanContext, cmd: vk::CommandBuffer, ray_count: u32) -> RenderResult<bool> {
        match self {
            Pipeline::RayTracing(p) => Ok(p.dispatch(ctx, cmd, ray_count)),
            Pipeline::Graphics(p) => Err(RenderError::InvalidState(format!(
                "cannot trace rays with the {:?} graphics pipeline",
                p.topology
            ))),
        }
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        match self {
            Pipeline::Graphics(p) => p.layout,
            Pipeline::RayTracing(p) => p.layout,
        }
    }

    pub unsafe fn destroy(self, ctx: &VulkanContext, memory: &MemoryManager) {
        match self {
            Pipeline::Graphics(p) => p.destroy(ctx),
            Pipeline::RayTracing(p) => p.destroy(ctx, memory),
        }
    }
}
