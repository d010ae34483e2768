//! Runtime configuration.
//!
//! Every setting has a default, so `RaynerConfig::default()` is a complete
//! configuration. The binary fills it from the command line through clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::mesh::Mesh;

/// Built-in meshes selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MeshKind {
    Quad,
    Cube,
}

impl MeshKind {
    pub fn build(self) -> Mesh {
        match self {
            MeshKind::Quad => Mesh::unit_quad(),
            MeshKind::Cube => Mesh::colored_cube(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("window size must be non-zero, got {0}x{1}")]
    ZeroWindow(u32, u32),

    #[error("max_rays must be non-zero")]
    ZeroCapacity,

    #[error("{what} count {count} exceeds max_rays {max}")]
    CountTooLarge { what: &'static str, count: u32, max: u32 },

    #[error("fence timeout must be non-zero")]
    ZeroTimeout,

    #[error("TLAS translation must be finite, got {0:?}")]
    NonFiniteTranslation([f32; 3]),
}

/// Renderer and ray tracer settings.
#[derive(Debug, Clone, PartialEq, Parser)]
#[command(name = "rayner", version, about = "Hybrid rasterizer and hardware ray tracer")]
pub struct RaynerConfig {
    /// Initial window width
    #[arg(long, default_value_t = 1000)]
    pub width: u32,

    /// Initial window height
    #[arg(long, default_value_t = 500)]
    pub height: u32,

    /// Window title
    #[arg(long, default_value = "RYNR v0.1")]
    pub title: String,

    /// Directory holding the compiled SPIR-V shaders
    #[arg(long, default_value = "spv")]
    pub shader_dir: PathBuf,

    /// Mesh to load
    #[arg(long, value_enum, default_value_t = MeshKind::Quad)]
    pub mesh: MeshKind,

    /// Enable the Khronos validation layer
    #[arg(long)]
    pub validation: bool,

    /// Capacity of the ray and point buffers
    #[arg(long, default_value_t = 4096)]
    pub max_rays: u32,

    /// Rays traced per ray launch
    #[arg(long, default_value_t = 1000)]
    pub rays: u32,

    /// Points sampled per point launch
    #[arg(long, default_value_t = 1000)]
    pub points: u32,

    /// Upper bound for any fence wait, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    pub fence_timeout_ms: u64,

    /// Wait for the device to go idle after every frame that traces rays
    #[arg(long)]
    pub idle_after_trace: bool,

    /// Translation of the single TLAS instance
    #[arg(long, value_delimiter = ',', default_values_t = [0.0, 0.0, 0.0])]
    pub tlas_translation: Vec<f32>,
}

impl Default for RaynerConfig {
    fn default() -> Self {
        Self {
            width: 1000,
            height: 500,
            title: "RYNR v0.1".to_string(),
            shader_dir: PathBuf::from("spv"),
            mesh: MeshKind::Quad,
            validation: false,
            max_rays: 4096,
            rays: 1000,
            points: 1000,
            fence_timeout_ms: 10_000,
            idle_after_trace: false,
            tlas_translation: vec![0.0, 0.0, 0.0],
        }
    }
}

impl RaynerConfig {
    /// Check cross-field constraints clap cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::ZeroWindow(self.width, self.height));
        }
        if self.max_rays == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.rays > self.max_rays {
            return Err(ConfigError::CountTooLarge { what: "ray", count: self.rays, max: self.max_rays });
        }
        if self.points > self.max_rays {
            return Err(ConfigError::CountTooLarge { what: "point", count: self.points, max: self.max_rays });
        }
        if self.fence_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        let translation = self.translation();
        if translation.iter().any(|c| !c.is_finite()) {
            return Err(ConfigError::NonFiniteTranslation(translation));
        }
        Ok(())
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    /// TLAS instance translation; missing components are zero.
    pub fn translation(&self) -> [f32; 3] {
        let mut out = [0.0; 3];
        for (dst, src) in out.iter_mut().zip(&self.tlas_translation) {
            *dst = *src;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // Defaults
    // ============================================================

    #[test]
    fn test_default_is_valid() {
        assert_eq!(RaynerConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_parse_without_arguments_matches_default() {
        let parsed = RaynerConfig::try_parse_from(["rayner"]).unwrap();
        assert_eq!(parsed, RaynerConfig::default());
    }

    // ============================================================
    // Command line
    // ============================================================

    #[test]
    fn test_parse_overrides() {
        let parsed = RaynerConfig::try_parse_from([
            "rayner",
            "--width", "640",
            "--mesh", "cube",
            "--rays", "8",
            "--idle-after-trace",
            "--tlas-translation", "1,2,3",
        ])
        .unwrap();
        assert_eq!(parsed.width, 640);
        assert_eq!(parsed.mesh, MeshKind::Cube);
        assert_eq!(parsed.rays, 8);
        assert!(parsed.idle_after_trace);
        assert_eq!(parsed.translation(), [1.0, 2.0, 3.0]);
    }

    // ============================================================
    // Validation
    // ============================================================

    #[test]
    fn test_validate_rejects_zero_window() {
        let config = RaynerConfig { height: 0, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::ZeroWindow(1000, 0)));
    }

    #[test]
    fn test_validate_rejects_rays_over_capacity() {
        let config = RaynerConfig { rays: 5000, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::CountTooLarge { what: "ray", .. })));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = RaynerConfig { fence_timeout_ms: 0, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::ZeroTimeout));
    }

    #[test]
    fn test_translation_pads_missing_components() {
        let config = RaynerConfig { tlas_translation: vec![4.0], ..Default::default() };
        assert_eq!(config.translation(), [4.0, 0.0, 0.0]);
    }
}
