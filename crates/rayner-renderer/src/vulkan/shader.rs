//! SPIR-V loading.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use ash::vk;

use super::VulkanContext;
use crate::error::{RenderError, RenderResult};

/// Shader entry point shared by every stage.
pub const ENTRY_POINT: &std::ffi::CStr = c"main";

/// Read a SPIR-V binary into words, checking magic and alignment.
pub fn read_spirv(path: &Path) -> RenderResult<Vec<u32>> {
    let load_error = |source| RenderError::ShaderLoad { path: path.to_path_buf(), source };
    let file = File::open(path).map_err(load_error)?;
    ash::util::read_spv(&mut BufReader::new(file)).map_err(load_error)
}

/// Create a shader module from a SPIR-V file.
pub unsafe fn load_shader_module(ctx: &VulkanContext, path: &Path) -> RenderResult<vk::ShaderModule> {
    let code = read_spirv(path)?;
    let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

    let module = ctx.device.create_shader_module(&create_info, None)
        .map_err(|e| RenderError::Construction(format!(
            "Failed to create shader module from {}: {:?}",
            path.display(),
            e
        )))?;

    tracing::debug!(path = %path.display(), words = code.len(), "loaded shader");
    Ok(module)
}

/// Load several modules; on failure, modules created so far are destroyed.
pub unsafe fn load_shader_modules(ctx: &VulkanContext, paths: &[&Path]) -> RenderResult<Vec<vk::ShaderModule>> {
    let mut modules = Vec::with_capacity(paths.len());
    for path in paths {
        match load_shader_module(ctx, path) {
            Ok(module) => modules.push(module),
            Err(e) => {
                destroy_shader_modules(ctx, &modules);
                return Err(e);
            }
        }
    }
    Ok(modules)
}

pub unsafe fn destroy_shader_modules(ctx: &VulkanContext, modules: &[vk::ShaderModule]) {
    for module in modules {
        ctx.device.destroy_shader_module(*module, None);
    }
}
