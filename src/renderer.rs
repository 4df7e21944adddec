// Renderer - shared core of both apps
//
// Owns the swapchain and everything sized by it (MSAA color, depth,
// framebuffers), the per-slot sync objects and command buffers, and drives
// FrameLoop through FrameDriver. Apps plug in through the Scene trait.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use crate::backend::command::{begin_frame_commands, end_commands};
use crate::backend::image::Image;
use crate::backend::pipeline::{check_target_format, Framebuffers, Pipeline, RenderPass};
use crate::backend::swapchain::{
    choose_surface_format, wait_for_nonzero_extent, FramebufferSource, SurfaceSupport,
};
use crate::backend::sync::create_frame_syncs;
use crate::backend::{
    AcquireOutcome, CommandPool, FrameSync, PresentOutcome, Swapchain, TransferContext,
    VulkanDevice,
};
use crate::frame::{FrameBackend, FrameLoop, FrameStatus, GraphicsWait, WaitSemaphore};

/// App-specific part of a frame
pub trait Scene {
    fn graphics_pipeline(&self) -> &Pipeline;

    /// Write this slot's uniform buffer before its commands are submitted
    fn update_uniforms(&mut self, slot: usize, extent: vk::Extent2D) -> Result<()>;

    /// Bind buffers + descriptor set and issue the draw, inside the render pass
    fn draw(&self, device: &ash::Device, cmd: vk::CommandBuffer, slot: usize);

    fn uses_compute(&self) -> bool {
        false
    }

    fn record_compute(&self, _device: &ash::Device, _cmd: vk::CommandBuffer, _slot: usize) {}
}

/// Everything rebuilt when the swapchain is recreated
struct PresentTargets {
    framebuffers: Framebuffers,
    _depth: Image,
    _color: Option<Image>,
    swapchain: Swapchain,
}

impl PresentTargets {
    fn new(
        transfer: &TransferContext,
        render_pass: &RenderPass,
        present_mode: vk::PresentModeKHR,
        (width, height): (u32, u32),
    ) -> Result<Self> {
        let device = transfer.device();
        let swapchain = Swapchain::new(Arc::clone(device), present_mode, width, height)?;
        check_target_format(render_pass.color_format, swapchain.format)?;

        let color = if render_pass.is_multisampled() {
            Some(Image::color_target(
                device,
                swapchain.extent,
                swapchain.format,
                render_pass.samples,
            )?)
        } else {
            None
        };
        let depth = Image::depth_target(transfer, swapchain.extent, render_pass.samples)?;

        let framebuffers = Framebuffers::new(
            device,
            render_pass,
            &swapchain.image_views,
            color.as_ref().map(|image| image.view),
            depth.view,
            swapchain.extent,
        )?;

        Ok(Self {
            framebuffers,
            _depth: depth,
            _color: color,
            swapchain,
        })
    }
}

struct RenderCore {
    syncs: Vec<FrameSync>,
    graphics_commands: Vec<vk::CommandBuffer>,
    compute_commands: Vec<vk::CommandBuffer>,
    targets: Option<PresentTargets>,
    render_pass: RenderPass,
    _command_pool: CommandPool,
    transfer: TransferContext,
    present_mode: vk::PresentModeKHR,
    clear_color: [f32; 4],
    device: Arc<VulkanDevice>,
}

impl RenderCore {
    fn targets(&self) -> Result<&PresentTargets> {
        self.targets
            .as_ref()
            .context("Swapchain targets missing after a failed recreation")
    }

    fn extent(&self) -> vk::Extent2D {
        self.targets
            .as_ref()
            .map(|targets| targets.swapchain.extent)
            .unwrap_or_default()
    }

    fn recreate_swapchain(&mut self, window: &dyn FramebufferSource) -> Result<()> {
        let size = wait_for_nonzero_extent(window);
        self.device.wait_idle()?;

        log::info!("Recreating swapchain: {}x{}", size.0, size.1);

        // Old targets go first; the surface allows one swapchain at a time
        self.targets = None;
        self.targets = Some(PresentTargets::new(
            &self.transfer,
            &self.render_pass,
            self.present_mode,
            size,
        )?);

        Ok(())
    }

    fn record_graphics(&self, scene: &dyn Scene, slot: usize, image_index: u32) -> Result<()> {
        let device = &self.device.device;
        let cmd = self.graphics_commands[slot];
        let targets = self.targets()?;
        let extent = targets.swapchain.extent;

        begin_frame_commands(device, cmd)?;

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass.render_pass)
            .framebuffer(targets.framebuffers.get(image_index)?)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        unsafe {
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                scene.graphics_pipeline().pipeline,
            );
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[scissor]);
        }

        scene.draw(device, cmd, slot);

        unsafe { device.cmd_end_render_pass(cmd) };

        end_commands(device, cmd)
    }
}

pub struct Renderer {
    frames: FrameLoop,
    core: RenderCore,
}

impl Renderer {
    pub fn new(
        device: &Arc<VulkanDevice>,
        window: &dyn FramebufferSource,
        frames_in_flight: usize,
        present_mode: vk::PresentModeKHR,
        clear_color: [f32; 4],
        with_compute: bool,
    ) -> Result<Self> {
        let frames = FrameLoop::new(frames_in_flight)?;
        let transfer = TransferContext::new(device)?;

        let size = wait_for_nonzero_extent(window);
        // Render pass needs the surface format before targets exist
        let support =
            SurfaceSupport::query(&device.surface_loader, device.physical_device, device.surface)?;
        let swapchain_format = choose_surface_format(&support.formats)
            .context("No suitable surface format")?
            .format;
        let depth_format = device.find_depth_format()?;
        let render_pass =
            RenderPass::new(device, swapchain_format, depth_format, device.msaa_samples)?;

        let targets = PresentTargets::new(&transfer, &render_pass, present_mode, size)?;

        let command_pool = CommandPool::resettable(device)?;
        let graphics_commands = command_pool.allocate(frames_in_flight)?;
        let compute_commands = if with_compute {
            command_pool.allocate(frames_in_flight)?
        } else {
            Vec::new()
        };

        let syncs = create_frame_syncs(device, frames_in_flight, with_compute)?;

        log::info!(
            "Renderer ready: {} frames in flight, {} swapchain images, compute: {}",
            frames_in_flight,
            targets.swapchain.image_count(),
            with_compute
        );

        Ok(Self {
            frames,
            core: RenderCore {
                syncs,
                graphics_commands,
                compute_commands,
                targets: Some(targets),
                render_pass,
                _command_pool: command_pool,
                transfer,
                present_mode,
                clear_color,
                device: Arc::clone(device),
            },
        })
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.core.device
    }

    pub fn transfer(&self) -> &TransferContext {
        &self.core.transfer
    }

    pub fn render_pass(&self) -> &RenderPass {
        &self.core.render_pass
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.frames_in_flight()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.core.extent()
    }

    pub fn notify_resized(&mut self) {
        self.frames.notify_resized();
    }

    /// Run one iteration of the frame protocol for `scene`
    pub fn render<S: Scene>(
        &mut self,
        scene: &mut S,
        window: &dyn FramebufferSource,
    ) -> Result<FrameStatus> {
        let slot = self.frames.current_frame();
        let mut driver = FrameDriver {
            core: &mut self.core,
            scene,
            window,
        };
        let status = self.frames.draw_frame(&mut driver)?;

        log::trace!(
            "Frame slot {} {:?}, left {:?}",
            slot,
            status,
            self.frames.slot_state(slot)
        );

        Ok(status)
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.core.device.wait_idle()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Destroying renderer...");
        let _ = self.core.device.wait_idle();
    }
}

/// Vulkan implementation of the frame protocol steps
struct FrameDriver<'a, S: Scene> {
    core: &'a mut RenderCore,
    scene: &'a mut S,
    window: &'a dyn FramebufferSource,
}

impl<S: Scene> FrameBackend for FrameDriver<'_, S> {
    fn uses_compute(&self) -> bool {
        self.scene.uses_compute()
    }

    fn wait_compute_fence(&mut self, slot: usize) -> Result<()> {
        self.core.syncs[slot].compute()?.in_flight.wait()
    }

    fn wait_graphics_fence(&mut self, slot: usize) -> Result<()> {
        self.core.syncs[slot].in_flight.wait()
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        let semaphore = self.core.syncs[slot].image_available.handle;
        self.core.targets()?.swapchain.acquire_next_image(semaphore)
    }

    fn reset_compute_fence(&mut self, slot: usize) -> Result<()> {
        self.core.syncs[slot].compute()?.in_flight.reset()
    }

    fn reset_graphics_fence(&mut self, slot: usize) -> Result<()> {
        self.core.syncs[slot].in_flight.reset()
    }

    fn update_uniforms(&mut self, slot: usize) -> Result<()> {
        let extent = self.core.extent();
        self.scene.update_uniforms(slot, extent)
    }

    fn record_compute(&mut self, slot: usize) -> Result<()> {
        let device = &self.core.device.device;
        let cmd = *self
            .core
            .compute_commands
            .get(slot)
            .context("No compute command buffer for frame slot")?;

        begin_frame_commands(device, cmd)?;
        self.scene.record_compute(device, cmd, slot);
        end_commands(device, cmd)
    }

    fn submit_compute(&mut self, slot: usize) -> Result<()> {
        let compute = self.core.syncs[slot].compute()?;
        let command_buffers = [self.core.compute_commands[slot]];
        let signal_semaphores = [compute.finished.handle];

        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.core.device.device.queue_submit(
                self.core.device.compute_queue,
                &[submit_info.build()],
                compute.in_flight.handle,
            )
        }
        .context("Failed to submit compute command buffer")?;

        Ok(())
    }

    fn record_graphics(&mut self, slot: usize, image_index: u32) -> Result<()> {
        self.core.record_graphics(&*self.scene, slot, image_index)
    }

    fn submit_graphics(&mut self, slot: usize, waits: &[GraphicsWait]) -> Result<()> {
        let sync = &self.core.syncs[slot];

        let mut wait_semaphores = Vec::with_capacity(waits.len());
        let mut wait_stages = Vec::with_capacity(waits.len());
        for &(semaphore, stage) in waits {
            wait_semaphores.push(match semaphore {
                WaitSemaphore::ComputeFinished => sync.compute()?.finished.handle,
                WaitSemaphore::ImageAvailable => sync.image_available.handle,
            });
            wait_stages.push(stage);
        }

        let command_buffers = [self.core.graphics_commands[slot]];
        let signal_semaphores = [sync.render_finished.handle];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.core.device.device.queue_submit(
                self.core.device.graphics_queue,
                &[submit_info.build()],
                sync.in_flight.handle,
            )
        }
        .context("Failed to submit draw command buffer")?;

        Ok(())
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        let wait = [self.core.syncs[slot].render_finished.handle];
        self.core.targets()?.swapchain.present(
            self.core.device.present_queue,
            image_index,
            &wait,
        )
    }

    fn recreate_swapchain(&mut self) -> Result<()> {
        self.core.recreate_swapchain(self.window)
    }
}
