// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Acquire and present report out-of-date/suboptimal as values; only real
// device errors come back as Err.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;
use std::time::Duration;
use winit::window::Window;

use super::VulkanDevice;

/// Surface capabilities of one physical device
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(
        surface_loader: &khr::Surface,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        unsafe {
            Ok(Self {
                capabilities: surface_loader
                    .get_physical_device_surface_capabilities(physical_device, surface)?,
                formats: surface_loader
                    .get_physical_device_surface_formats(physical_device, surface)?,
                present_modes: surface_loader
                    .get_physical_device_surface_present_modes(physical_device, surface)?,
            })
        }
    }
}

/// Prefer B8G8R8A8_SRGB with SRGB_NONLINEAR, else the first format offered
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// Use the configured mode when the surface offers it.
/// FIFO is always supported, so it's the fallback.
pub fn choose_present_mode(
    preferred: vk::PresentModeKHR,
    available: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Surface-dictated extent, or the framebuffer size clamped to the caps
pub fn choose_extent(
    caps: &vk::SurfaceCapabilitiesKHR,
    framebuffer: (u32, u32),
) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: framebuffer
            .0
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: framebuffer
            .1
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped when the surface has a maximum
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && image_count > caps.max_image_count {
        caps.max_image_count
    } else {
        image_count
    }
}

/// Result of acquiring a swapchain image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready(u32),
    /// Image acquired and semaphore signaled; recreate after presenting
    Suboptimal(u32),
    /// Nothing acquired; recreate before rendering
    OutOfDate,
}

/// Result of presenting a swapchain image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Optimal,
    Suboptimal,
    OutOfDate,
}

impl PresentOutcome {
    pub fn needs_recreate(self) -> bool {
        self != PresentOutcome::Optimal
    }
}

/// Where the current drawable size comes from.
///
/// Minimized windows report a zero extent; recreation blocks on
/// `wait_events` until both dimensions are nonzero.
pub trait FramebufferSource {
    fn framebuffer_extent(&self) -> (u32, u32);
    fn wait_events(&self);
}

impl FramebufferSource for Window {
    fn framebuffer_extent(&self) -> (u32, u32) {
        let size = self.inner_size();
        (size.width, size.height)
    }

    fn wait_events(&self) {
        // winit owns the event loop; poll again after a short nap
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Block until the framebuffer has a drawable size
pub fn wait_for_nonzero_extent(source: &dyn FramebufferSource) -> (u32, u32) {
    loop {
        let (width, height) = source.framebuffer_extent();
        if width > 0 && height > 0 {
            return (width, height);
        }
        source.wait_events();
    }
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        preferred_present_mode: vk::PresentModeKHR,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let support =
            SurfaceSupport::query(&device.surface_loader, device.physical_device, device.surface)?;

        let surface_format =
            choose_surface_format(&support.formats).context("No suitable surface format")?;
        let present_mode = choose_present_mode(preferred_present_mode, &support.present_modes);
        let extent = choose_extent(&support.capabilities, (width, height));
        let image_count = choose_image_count(&support.capabilities);

        log::info!("Present mode: {:?}", present_mode);

        let swapchain_loader = khr::Swapchain::new(&device.instance, &device.device);

        // Separate present family needs concurrent access to the images
        let families = device.queue_families;
        let family_indices = [families.graphics, families.present];
        let (sharing_mode, shared_indices): (vk::SharingMode, &[u32]) = if families.is_shared() {
            (vk::SharingMode::EXCLUSIVE, &[])
        } else {
            (vk::SharingMode::CONCURRENT, &family_indices)
        };

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(shared_indices)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let images = unsafe { swapchain_loader.get_swapchain_images(swapchain) }?;

        log::info!("Created swapchain with {} images", images.len());

        let image_views: Result<Vec<_>> = images
            .iter()
            .map(|&image| {
                super::image::create_image_view(
                    &device,
                    image,
                    surface_format.format,
                    vk::ImageAspectFlags::COLOR,
                    1,
                )
            })
            .collect();

        let image_views = match image_views {
            Ok(views) => views,
            Err(e) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e);
            }
        };

        Ok(Self {
            swapchain,
            swapchain_loader,
            images,
            image_views,
            format: surface_format.format,
            extent,
            device,
        })
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire next image for rendering, signaling `semaphore` when ready
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, false)) => Ok(AcquireOutcome::Ready(index)),
            Ok((index, true)) => Ok(AcquireOutcome::Suboptimal(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(anyhow::anyhow!("Failed to acquire swapchain image: {:?}", e)),
        }
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(false) => Ok(PresentOutcome::Optimal),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(anyhow::anyhow!("Failed to present swapchain image: {:?}", e)),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::cell::{Cell, RefCell};

    fn caps(current: (u32, u32), min_count: u32, max_count: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            min_image_count: min_count,
            max_image_count: max_count,
            ..Default::default()
        }
    }

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    #[test]
    fn prefers_srgb_surface_format() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];

        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn falls_back_to_first_surface_format() {
        let formats = [format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR)];

        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
        assert!(choose_surface_format(&[]).is_none());
    }

    #[rstest]
    #[case(vk::PresentModeKHR::MAILBOX, &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX], vk::PresentModeKHR::MAILBOX)]
    #[case(vk::PresentModeKHR::MAILBOX, &[vk::PresentModeKHR::FIFO], vk::PresentModeKHR::FIFO)]
    #[case(vk::PresentModeKHR::IMMEDIATE, &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE], vk::PresentModeKHR::IMMEDIATE)]
    fn present_mode_selection(
        #[case] preferred: vk::PresentModeKHR,
        #[case] available: &[vk::PresentModeKHR],
        #[case] expected: vk::PresentModeKHR,
    ) {
        assert_eq!(choose_present_mode(preferred, available), expected);
    }

    #[test]
    fn extent_follows_surface_when_defined() {
        let extent = choose_extent(&caps((1280, 720), 2, 3), (800, 600));
        assert_eq!((extent.width, extent.height), (1280, 720));
    }

    #[test]
    fn extent_clamps_framebuffer_when_surface_undefined() {
        let extent = choose_extent(&caps((u32::MAX, u32::MAX), 2, 3), (8000, 600));
        assert_eq!((extent.width, extent.height), (4096, 600));
    }

    #[rstest]
    #[case(2, 3, 3)]
    #[case(3, 3, 3)]
    #[case(2, 0, 3)]
    fn image_count_selection(#[case] min: u32, #[case] max: u32, #[case] expected: u32) {
        assert_eq!(choose_image_count(&caps((800, 600), min, max)), expected);
    }

    #[test]
    fn present_outcome_recreate_flag() {
        assert!(!PresentOutcome::Optimal.needs_recreate());
        assert!(PresentOutcome::Suboptimal.needs_recreate());
        assert!(PresentOutcome::OutOfDate.needs_recreate());
    }

    struct ScriptedWindow {
        sizes: RefCell<Vec<(u32, u32)>>,
        waits: Cell<usize>,
    }

    impl FramebufferSource for ScriptedWindow {
        fn framebuffer_extent(&self) -> (u32, u32) {
            let mut sizes = self.sizes.borrow_mut();
            if sizes.len() > 1 {
                sizes.remove(0)
            } else {
                sizes[0]
            }
        }

        fn wait_events(&self) {
            self.waits.set(self.waits.get() + 1);
        }
    }

    #[test]
    fn minimized_window_blocks_until_both_dimensions_nonzero() {
        let window = ScriptedWindow {
            sizes: RefCell::new(vec![(0, 0), (0, 0), (0, 600), (800, 600)]),
            waits: Cell::new(0),
        };

        assert_eq!(wait_for_nonzero_extent(&window), (800, 600));
        assert_eq!(window.waits.get(), 3);
    }
}
