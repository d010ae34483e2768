#![allow(clippy::too_many_arguments, clippy::missing_safety_doc, clippy::type_complexity)]
// Vulkan 1.3 hybrid rasterizer with hardware ray tracing

pub mod error;
pub mod vulkan;

pub mod geometry;
pub mod raytracer;
pub mod renderer;

pub use error::{ErrorCategory, RenderError, RenderResult};
pub use geometry::GeometryBuffers;
pub use raytracer::{RayTracer, TraceBuffers};
pub use renderer::{Pass, Renderer};

/// Where the build script put the compiled SPIR-V. Empty unless glslc was
/// available at build time.
pub const BUILT_SHADER_DIR: &str = env!("RAYNER_SPIRV_DIR");
