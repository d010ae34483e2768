//! Ray tracing support via Vulkan KHR extensions.
//!
//! Acceleration structures (BLAS/TLAS), shader binding tables, and ray
//! tracing pipeline creation.

pub mod acceleration;
pub mod pipeline;
pub mod sbt;

pub use acceleration::{AccelerationStructureBuilder, BuildSizes, BuildState, RtInstance, instance_record};
pub use pipeline::{launch_rays, RayTracingPipeline, RtConsts, RtShaderPaths, TraceLauncher, trace_extent};
pub use sbt::{SbtLayout, SbtRegion, ShaderBindingTable};
