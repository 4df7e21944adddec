// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync.
// One FrameSync per frame in flight; fences start signaled so the first
// wait on each slot returns immediately.

use anyhow::Result;
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

pub struct Semaphore {
    pub handle: vk::Semaphore,
    device: Arc<VulkanDevice>,
}

impl Semaphore {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let info = vk::SemaphoreCreateInfo::builder();
        let handle = unsafe { device.device.create_semaphore(&info, None) }?;

        Ok(Self {
            handle,
            device: Arc::clone(device),
        })
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_semaphore(self.handle, None) };
    }
}

pub struct Fence {
    pub handle: vk::Fence,
    device: Arc<VulkanDevice>,
}

impl Fence {
    pub fn new(device: &Arc<VulkanDevice>, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        let handle = unsafe { device.device.create_fence(&info, None) }?;

        Ok(Self {
            handle,
            device: Arc::clone(device),
        })
    }

    /// Block until the GPU signals this fence
    pub fn wait(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.handle], true, u64::MAX)
        }?;
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[self.handle]) }?;
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_fence(self.handle, None) };
    }
}

/// Compute-side primitives, only created when a compute pass runs
pub struct ComputeSync {
    pub finished: Semaphore,
    pub in_flight: Fence,
}

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: Semaphore,
    pub render_finished: Semaphore,
    pub in_flight: Fence,
    pub compute: Option<ComputeSync>,
}

impl FrameSync {
    pub fn new(device: &Arc<VulkanDevice>, with_compute: bool) -> Result<Self> {
        let compute = if with_compute {
            Some(ComputeSync {
                finished: Semaphore::new(device)?,
                in_flight: Fence::new(device, true)?,
            })
        } else {
            None
        };

        Ok(Self {
            image_available: Semaphore::new(device)?,
            render_finished: Semaphore::new(device)?,
            in_flight: Fence::new(device, true)?,
            compute,
        })
    }

    pub fn compute(&self) -> Result<&ComputeSync> {
        self.compute
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Frame slot has no compute sync objects"))
    }
}

pub fn create_frame_syncs(
    device: &Arc<VulkanDevice>,
    count: usize,
    with_compute: bool,
) -> Result<Vec<FrameSync>> {
    (0..count)
        .map(|_| FrameSync::new(device, with_compute))
        .collect()
}
