// =============================================================================
// VULKAN FRAMES - Model viewer and GPU particle simulation
// =============================================================================
//
// Two small apps on top of one frames-in-flight renderer core.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (window, input, resize)                       │
// │    └── RenderApp (ModelViewer | ParticleSimulation)             │
// │          └── Renderer (FrameLoop + swapchain targets)           │
// │                └── backend: device, swapchain, sync, resources  │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW (per frame slot):
// 1. Wait for the slot's fences
// 2. Acquire a swapchain image
// 3. (particles) Dispatch compute over the slot's storage buffer
// 4. Record and submit graphics work
// 5. Present, recreate the swapchain if needed, advance the slot
//
// =============================================================================

mod apps;
mod backend;
mod config;
mod frame;
mod mesh;
mod renderer;

use anyhow::{Context, Result};
use apps::{AppKind, RenderApp};
use config::Config;
use frame::FrameStatus;
use std::fs::OpenOptions;
use std::io::{BufRead, Write};
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting Vulkan renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let kind = prompt_app_kind()?;

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config, kind);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn prompt_app_kind() -> Result<AppKind> {
    print!("APPLICATIONS:\n\t0. DRAW MODEL\n\t1. DRAW PARTICLES\n> ");
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read application choice")?;

    line.parse()
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);

    // Create/clear log file if enabled; everything after the header goes there
    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Vulkan Renderer Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Window loop state.
///
/// Field order matters for Drop: the render app owns the Vulkan surface,
/// so it must go before the window.
struct App {
    config: Config,
    kind: AppKind,

    render_app: Option<Box<dyn RenderApp>>,
    window: Option<Window>,

    is_fullscreen: bool,
    is_minimized: bool,
    /// First error that stopped the loop, reported from `main`
    fatal: Option<anyhow::Error>,

    // Timing
    last_update: Instant,
    last_fps_update: Instant,
    frame_count: u32,
}

impl App {
    fn new(config: Config, kind: AppKind) -> Self {
        let now = Instant::now();
        Self {
            is_fullscreen: config.window.fullscreen,
            config,
            kind,
            render_app: None,
            window: None,
            is_minimized: false,
            fatal: None,
            last_update: now,
            last_fps_update: now,
            frame_count: 0,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:?}", error);
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        event_loop.exit();
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(app) = self.render_app.as_mut() {
            if let Err(e) = app.cleanup() {
                log::error!("Failed to wait for the GPU: {:?}", e);
            }
        }
        event_loop.exit();
    }

    fn redraw(&mut self) -> Result<()> {
        let (Some(app), Some(window)) = (self.render_app.as_mut(), self.window.as_ref()) else {
            return Ok(());
        };

        let now = Instant::now();
        let delta = now.duration_since(self.last_update);
        self.last_update = now;

        if self.is_minimized {
            return Ok(());
        }

        app.update(delta);
        match app.render(window)? {
            FrameStatus::Presented { recreated } => {
                if recreated {
                    log::debug!("Swapchain recreated");
                }
                self.update_fps();
            }
            FrameStatus::Skipped => log::debug!("Frame skipped, swapchain out of date"),
        }

        Ok(())
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            if let Some(app) = self.render_app.as_mut() {
                app.notify_resized();
            }
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let (Some(window), Some(app)) = (&self.window, &self.render_app) {
                window.set_title(&format!(
                    "{} [{}] - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    app.name(),
                    fps,
                    1000.0 / fps.max(f32::EPSILON)
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => w,
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match self.kind.setup(&self.config, &window) {
            Ok(app) => {
                log::info!("{} ready", app.name());
                self.render_app = Some(app);
                self.window = Some(window);
                self.last_update = Instant::now();
            }
            Err(e) => self.fail(event_loop, e.context("Failed to initialize Vulkan")),
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                self.is_minimized = size.width == 0 || size.height == 0;
                if let Some(app) = self.render_app.as_mut() {
                    app.notify_resized();
                }
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.redraw() {
                    self.fail(event_loop, e.context("Render error"));
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.shutdown(event_loop);
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        // Render app first: it owns the surface created from the window
        self.render_app = None;
        self.window = None;
        log::info!("Cleanup complete");
    }
}
