#![allow(clippy::too_many_arguments, clippy::manual_range_contains)]
// Data shared between the renderer and the application shell

pub mod camera;
pub mod config;
pub mod mesh;
pub mod request;

pub use camera::{Camera, CameraController, CameraUniform, MoveInput};
pub use config::{ConfigError, MeshKind, RaynerConfig};
pub use mesh::{Mesh, MeshError, MeshSubset, Vertex, VERTEX_STRIDE};
pub use request::{CommandQueue, FrameRequest, RenderCommand, RequestBuilder, TraceKind, TraceRequest};
