// Application variants
//
// Both apps share the renderer core and differ only in their Scene: what
// gets uploaded, which pipelines exist and what each frame records.

pub mod model;
pub mod particles;

use anyhow::Result;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use winit::window::Window;

use crate::backend::VulkanDevice;
use crate::config::Config;
use crate::frame::FrameStatus;
use crate::renderer::{Renderer, Scene};

/// Lifecycle the window loop drives: setup happens in `AppKind::setup`,
/// teardown in `cleanup` followed by drop.
pub trait RenderApp {
    fn name(&self) -> &'static str;
    fn update(&mut self, delta: Duration);
    fn render(&mut self, window: &Window) -> Result<FrameStatus>;
    fn notify_resized(&mut self);
    /// Block until the GPU has finished every submitted frame
    fn cleanup(&mut self) -> Result<()>;
}

/// Which app the startup prompt selected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppKind {
    ModelViewer,
    ParticleSimulation,
}

impl FromStr for AppKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "0" => Ok(AppKind::ModelViewer),
            "1" => Ok(AppKind::ParticleSimulation),
            other => anyhow::bail!("Unknown application '{}': expected 0 or 1", other),
        }
    }
}

impl AppKind {
    pub fn title(self) -> &'static str {
        match self {
            AppKind::ModelViewer => "Model Viewer",
            AppKind::ParticleSimulation => "Particle Simulation",
        }
    }

    pub fn setup(self, config: &Config, window: &Window) -> Result<Box<dyn RenderApp>> {
        log::info!("Setting up {}", self.title());

        let device = VulkanDevice::new(
            &config.window.title,
            config.validation_enabled(),
            config.graphics.msaa,
            window,
        )?;

        let with_compute = self == AppKind::ParticleSimulation;
        let renderer = Renderer::new(
            &device,
            window,
            config.graphics.max_frames_in_flight,
            config.present_mode(),
            config.graphics.clear_color,
            with_compute,
        )?;

        let app: Box<dyn RenderApp> = match self {
            AppKind::ModelViewer => {
                let scene = model::ModelScene::new(&renderer, config)?;
                Box::new(SceneApp::new(self, scene, renderer, device))
            }
            AppKind::ParticleSimulation => {
                let scene = particles::ParticleScene::new(&renderer, config)?;
                Box::new(SceneApp::new(self, scene, renderer, device))
            }
        };

        Ok(app)
    }
}

/// Per-frame state an app keeps between renders
pub trait Animated {
    fn advance(&mut self, delta: Duration);
}

struct SceneApp<S: Scene + Animated> {
    kind: AppKind,
    // Scene resources must go before the renderer and device
    scene: S,
    renderer: Renderer,
    _device: Arc<VulkanDevice>,
}

impl<S: Scene + Animated> SceneApp<S> {
    fn new(kind: AppKind, scene: S, renderer: Renderer, device: Arc<VulkanDevice>) -> Self {
        Self {
            kind,
            scene,
            renderer,
            _device: device,
        }
    }
}

impl<S: Scene + Animated> RenderApp for SceneApp<S> {
    fn name(&self) -> &'static str {
        self.kind.title()
    }

    fn update(&mut self, delta: Duration) {
        self.scene.advance(delta);
    }

    fn render(&mut self, window: &Window) -> Result<FrameStatus> {
        self.renderer.render(&mut self.scene, window)
    }

    fn notify_resized(&mut self) {
        self.renderer.notify_resized();
    }

    fn cleanup(&mut self) -> Result<()> {
        self.renderer.wait_idle()
    }
}

impl<S: Scene + Animated> Drop for SceneApp<S> {
    fn drop(&mut self) {
        log::info!("Cleaning up {}...", self.kind.title());
        let _ = self.renderer.wait_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("0", AppKind::ModelViewer)]
    #[case("1\n", AppKind::ParticleSimulation)]
    #[case("  0  ", AppKind::ModelViewer)]
    fn parses_menu_choice(#[case] input: &str, #[case] expected: AppKind) {
        assert_eq!(input.parse::<AppKind>().unwrap(), expected);
    }

    #[rstest]
    #[case("2")]
    #[case("")]
    #[case("model")]
    fn rejects_unknown_choice(#[case] input: &str) {
        assert!(input.parse::<AppKind>().is_err());
    }
}
