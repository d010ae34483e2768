// Entry point: command line, logging, window and the frame loop.
//
// winit drives everything. The window and all Vulkan state are created on the
// first `resumed` call; every redraw runs one frame; `exiting` tears the
// renderer down after the device goes idle.

mod input;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use raw_window_handle::HasDisplayHandle;
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::PhysicalKey;
use winit::window::{Window, WindowId};

use rayner_common::{Camera, CameraController, CommandQueue, ConfigError, RaynerConfig, RequestBuilder};
use rayner_renderer::vulkan::{CommandManager, ContextOptions, MemoryManager, TracingSink, VulkanContext};
use rayner_renderer::{GeometryBuffers, RayTracer, RenderError, Renderer, BUILT_SHADER_DIR};

use input::{command_for_key, Counts, HeldKeys};

/// Environment variable holding the log filter.
const LOG_ENV: &str = "RAYNER_LOG";

/// Everything that lives on the GPU. Field order is teardown order for the
/// parts that drop implicitly: the allocator before the device.
struct Gpu {
    renderer: Option<Renderer>,
    raytracer: Option<RayTracer>,
    geometry: Option<GeometryBuffers>,
    commands: CommandManager,
    memory: Option<MemoryManager>,
    ctx: VulkanContext,
}

impl Gpu {
    unsafe fn new(window: &Window, config: &RaynerConfig) -> Result<Self> {
        let display = window
            .display_handle()
            .context("window has no display handle")?
            .as_raw();

        let options = ContextOptions {
            enable_validation: config.validation,
            fence_timeout: config.fence_timeout(),
            sink: Arc::new(TracingSink),
        };
        let ctx = VulkanContext::new(Some(display), options)?;
        let memory = MemoryManager::new(&ctx)?;
        let commands = CommandManager::new(&ctx)?;

        let mut gpu = Self {
            renderer: None,
            raytracer: None,
            geometry: None,
            commands,
            memory: Some(memory),
            ctx,
        };

        let mesh = config.mesh.build();
        let memory = gpu.memory()?;
        let geometry = GeometryBuffers::upload(&gpu.ctx, memory, &gpu.commands, &mesh)?;
        gpu.geometry = Some(geometry);

        let (memory, geometry) = (gpu.memory()?, gpu.geometry()?);
        let raytracer = RayTracer::new(&gpu.ctx, memory, &gpu.commands, geometry, config)?;
        gpu.raytracer = Some(raytracer);

        let renderer = Renderer::new(&gpu.ctx, gpu.memory()?, window, config)?;
        gpu.renderer = Some(renderer);

        Ok(gpu)
    }

    fn memory(&self) -> Result<&MemoryManager, RenderError> {
        self.memory.as_ref().ok_or_else(|| RenderError::InvalidState("allocator already released".to_string()))
    }

    fn geometry(&self) -> Result<&GeometryBuffers, RenderError> {
        self.geometry.as_ref().ok_or_else(|| RenderError::InvalidState("mesh not uploaded".to_string()))
    }

    fn selectors(&self) -> Vec<u64> {
        self.geometry.as_ref().map_or_else(Vec::new, GeometryBuffers::selectors)
    }
}

impl Drop for Gpu {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.ctx.wait_idle() {
                tracing::error!("wait idle before shutdown failed: {}", e);
            }
            if let Some(memory) = self.memory.as_ref() {
                if let Some(renderer) = self.renderer.take() {
                    renderer.destroy(&self.ctx, memory);
                }
                if let Some(raytracer) = self.raytracer.take() {
                    raytracer.destroy(&self.ctx, memory);
                }
                if let Some(geometry) = self.geometry.take() {
                    geometry.destroy(memory);
                }
            }
            self.commands.destroy(&self.ctx);
        }
        self.memory.take();
        tracing::info!("GPU resources released");
    }
}

/// Application state for the winit event loop.
struct RaynerApp {
    config: RaynerConfig,
    gpu: Option<Gpu>,
    window: Option<Arc<Window>>,
    requests: Option<(RequestBuilder, CommandQueue)>,
    counts: Counts,
    held: HeldKeys,
    camera: Camera,
    controller: CameraController,
    last_frame: Instant,
    error: Option<anyhow::Error>,
}

impl RaynerApp {
    fn new(config: RaynerConfig) -> Self {
        let counts = Counts::new(config.rays, config.points, config.max_rays);
        Self {
            config,
            gpu: None,
            window: None,
            requests: None,
            counts,
            held: HeldKeys::default(),
            camera: Camera::default(),
            controller: CameraController::default(),
            last_frame: Instant::now(),
            error: None,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attributes = Window::default_attributes()
            .with_title(self.config.title.clone())
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        let window = Arc::new(event_loop.create_window(attributes).context("failed to create window")?);

        let gpu = unsafe { Gpu::new(&window, &self.config)? };

        let (builder, queue) =
            RequestBuilder::new(gpu.selectors(), self.config.max_rays, self.config.rays, self.config.points);

        tracing::info!(
            mesh = ?self.config.mesh,
            rays = self.config.rays,
            points = self.config.points,
            "keys: 1-4 toggle layers, P/R trace, [ ] subset, WASD/QE/arrows camera"
        );

        self.requests = Some((builder, queue));
        self.gpu = Some(gpu);
        self.window = Some(window);
        self.last_frame = Instant::now();
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        tracing::error!("{:#}", error);
        self.error = Some(error);
        event_loop.exit();
    }

    fn frame(&mut self) -> Result<()> {
        let (Some(window), Some(gpu), Some((builder, _))) =
            (self.window.as_ref(), self.gpu.as_mut(), self.requests.as_mut())
        else {
            return Ok(());
        };

        let now = Instant::now();
        let dt = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;

        let (Some(renderer), Some(raytracer), Some(geometry), Some(memory)) = (
            gpu.renderer.as_mut(),
            gpu.raytracer.as_ref(),
            gpu.geometry.as_ref(),
            gpu.memory.as_ref(),
        ) else {
            return Ok(());
        };

        self.camera.set_aspect(renderer.aspect_ratio());
        self.controller.update(self.held.move_input(), dt, &mut self.camera);

        let request = builder.next_frame();
        let view_projection = self.camera.projection() * self.camera.view();

        unsafe {
            renderer.render(
                &gpu.ctx,
                memory,
                &gpu.commands,
                geometry,
                raytracer,
                &request,
                &view_projection,
                &**window,
            )?;
        }
        Ok(())
    }

    fn send(&self, command: rayner_common::RenderCommand) {
        if let Some((_, queue)) = self.requests.as_ref() {
            if !queue.send(command) {
                tracing::warn!(?command, "render command dropped");
            }
        }
    }
}

impl ApplicationHandler for RaynerApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        if let Err(e) = self.init(event_loop) {
            self.fail(event_loop, e);
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                event_loop.exit();
            }

            WindowEvent::Resized(_) => {
                if let Some(renderer) = self.gpu.as_mut().and_then(|gpu| gpu.renderer.as_mut()) {
                    renderer.resize();
                }
            }

            WindowEvent::Focused(false) => {
                self.held.clear();
            }

            WindowEvent::KeyboardInput { event, .. } => {
                let PhysicalKey::Code(key) = event.physical_key else {
                    return;
                };
                match event.state {
                    ElementState::Pressed => {
                        self.held.press(key);
                        if !event.repeat {
                            if let Some(command) = command_for_key(key, &mut self.counts) {
                                self.send(command);
                            }
                        }
                    }
                    ElementState::Released => self.held.release(key),
                }
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.frame() {
                    self.fail(event_loop, e);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // GPU state goes before the window its surface was created from.
        self.gpu.take();
        self.window.take();
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Short label for the exit diagnostic.
fn error_category(error: &anyhow::Error) -> &'static str {
    if let Some(render) = error.downcast_ref::<RenderError>() {
        render.category().as_str()
    } else if error.downcast_ref::<ConfigError>().is_some() {
        "config"
    } else {
        "error"
    }
}

/// Use the build script's SPIR-V when the configured directory is missing.
fn resolve_shader_dir(config: &mut RaynerConfig) {
    let built = Path::new(BUILT_SHADER_DIR);
    if !config.shader_dir.is_dir() && built.is_dir() {
        tracing::info!(
            "shader dir {} not found, using {}",
            config.shader_dir.display(),
            built.display()
        );
        config.shader_dir = built.to_path_buf();
    }
}

fn run(mut config: RaynerConfig) -> Result<()> {
    config.validate()?;
    resolve_shader_dir(&mut config);

    let event_loop = EventLoop::new().context("failed to create event loop")?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = RaynerApp::new(config);
    event_loop.run_app(&mut app).context("event loop error")?;

    match app.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn main() {
    init_logging();
    let config = RaynerConfig::parse();

    if let Err(e) = run(config) {
        eprintln!("[{}] {:#}", error_category(&e), e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_errors_keep_their_category() {
        let error = anyhow::Error::new(RenderError::Timeout { what: "frame slot fence", timeout_ms: 10 });
        assert_eq!(error_category(&error), "timeout");
    }

    #[test]
    fn test_config_errors_are_labelled() {
        let error = anyhow::Error::new(ConfigError::ZeroTimeout);
        assert_eq!(error_category(&error), "config");
        assert_eq!(error_category(&anyhow::anyhow!("other")), "error");
    }

    #[test]
    fn test_existing_shader_dir_is_kept() {
        let dir = std::env::temp_dir();
        let mut config = RaynerConfig { shader_dir: dir.clone(), ..Default::default() };
        resolve_shader_dir(&mut config);
        assert_eq!(config.shader_dir, dir);
    }

    #[test]
    fn test_context_keeps_render_category() {
        let error = anyhow::Error::new(RenderError::InvalidInput("x".to_string())).context("uploading mesh");
        assert_eq!(error_category(&error), "usage");
    }
}
