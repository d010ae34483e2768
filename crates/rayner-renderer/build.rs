use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

fn main() {
    let dest = env::var("OUT_DIR").unwrap();
    let spirv_dir = Path::new(&dest).join("spirv");

    // The directory is exported even when nothing gets compiled so the
    // runtime can fall back to it.
    println!("cargo:rustc-env=RAYNER_SPIRV_DIR={}", spirv_dir.display());
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");

    // ========================================================================
    // SPIR-V Shader Compilation (via glslc from Vulkan SDK)
    // ========================================================================
    // Ray tracing stages need SPIR-V 1.4 or newer; everything targets
    // Vulkan 1.3 / SPIR-V 1.6.
    let shader_dir = Path::new("shaders");
    if !shader_dir.exists() {
        return;
    }

    let glslc = match find_glslc() {
        Some(path) => path,
        None => {
            println!(
                "cargo:warning=glslc not found, shaders not compiled. Install the Vulkan SDK \
                 or pass --shader-dir with prebuilt SPIR-V."
            );
            return;
        }
    };

    fs::create_dir_all(&spirv_dir).unwrap();

    // (source, glslc stage)
    let shaders = [
        // Rasterization
        ("tri.vert.glsl", "vertex"),
        ("tri.frag.glsl", "fragment"),
        ("lin.vert.glsl", "vertex"),
        ("lin.frag.glsl", "fragment"),
        ("pts.vert.glsl", "vertex"),
        ("pts.frag.glsl", "fragment"),
        // Point sampling
        ("rt.rgen.glsl", "rgen"),
        ("rt.rchit.glsl", "rchit"),
        ("rt.rmiss.glsl", "rmiss"),
        // Ray casting
        ("rttri.rgen.glsl", "rgen"),
        ("rttri.rchit.glsl", "rchit"),
        ("rttri.rmiss.glsl", "rmiss"),
    ];

    println!("cargo:rerun-if-changed=shaders/common.glsl");

    for (filename, stage) in &shaders {
        let src_path = shader_dir.join(filename);
        let spv_path = spirv_dir.join(filename.replace(".glsl", ".spv"));

        compile_shader(&glslc, shader_dir, &src_path, &spv_path, stage, filename);
        println!("cargo:rerun-if-changed=shaders/{filename}");
    }
}

/// Compile a single shader file to SPIR-V. Failures are reported as build
/// warnings; the runtime reports the missing module when it loads it.
fn compile_shader(glslc: &Path, include: &Path, src_path: &Path, spv_path: &Path, stage: &str, filename: &str) -> bool {
    let output = Command::new(glslc)
        .arg(format!("-fshader-stage={stage}"))
        .args(["--target-env=vulkan1.3", "--target-spv=spv1.6", "-O"])
        .arg("-I")
        .arg(include)
        .arg("-o")
        .arg(spv_path)
        .arg(src_path)
        .output();

    match output {
        Ok(result) => {
            let stderr = String::from_utf8_lossy(&result.stderr);
            if result.status.success() {
                if !stderr.is_empty() {
                    println!("cargo:warning=glslc {filename}: {stderr}");
                }
                true
            } else {
                println!("cargo:warning=glslc FAILED {filename}: {stderr}");
                false
            }
        }
        Err(e) => {
            println!("cargo:warning=glslc: failed to run for {filename}: {e}");
            false
        }
    }
}

/// Find glslc: PATH first, then VULKAN_SDK.
fn find_glslc() -> Option<PathBuf> {
    if let Ok(output) = Command::new("glslc").arg("--version").output() {
        if output.status.success() {
            return Some(PathBuf::from("glslc"));
        }
    }

    let sdk = env::var("VULKAN_SDK").ok()?;
    ["Bin/glslc.exe", "bin/glslc"]
        .iter()
        .map(|rel| PathBuf::from(&sdk).join(rel))
        .find(|path| path.exists())
}
