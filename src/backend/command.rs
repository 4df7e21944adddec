// Command pools and one-shot transfer submission
//
// Per-frame command buffers are allocated from a resettable pool and
// re-recorded every frame. Uploads go through TransferContext, which
// records into a throwaway buffer and waits for the queue to drain.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

pub struct CommandPool {
    pub pool: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    pub fn new(
        device: &Arc<VulkanDevice>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self {
            pool,
            device: Arc::clone(device),
        })
    }

    /// Pool whose buffers can be reset individually each frame
    pub fn resettable(device: &Arc<VulkanDevice>) -> Result<Self> {
        Self::new(
            device,
            device.queue_families.graphics,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )
    }

    pub fn allocate(&self, count: usize) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);

        let buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;

        Ok(buffers)
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}

/// Reset a per-frame command buffer and start recording into it
pub fn begin_frame_commands(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    unsafe {
        device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
        let begin_info = vk::CommandBufferBeginInfo::builder();
        device
            .begin_command_buffer(cmd, &begin_info)
            .context("Failed to begin recording command buffer")?;
    }
    Ok(())
}

pub fn end_commands(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    unsafe { device.end_command_buffer(cmd) }.context("Failed to record command buffer")?;
    Ok(())
}

/// Number of workgroups needed to cover `items` invocations
pub fn workgroup_count(items: u32, local_size: u32) -> u32 {
    items.div_ceil(local_size)
}

/// Synchronous uploads on the graphics queue
pub struct TransferContext {
    pool: CommandPool,
    device: Arc<VulkanDevice>,
}

impl TransferContext {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let pool = CommandPool::new(
            device,
            device.queue_families.graphics,
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;

        Ok(Self {
            pool,
            device: Arc::clone(device),
        })
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    /// Record `record` into a one-time buffer, submit it and block until
    /// the queue is idle. The buffer is freed on both success and failure.
    pub fn one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = &self.device.device;
        let cmd = self
            .pool
            .allocate(1)?
            .into_iter()
            .next()
            .context("Command pool returned no buffer")?;

        let result = (|| -> Result<()> {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

            unsafe {
                device.begin_command_buffer(cmd, &begin_info)?;
                record(device, cmd);
                device.end_command_buffer(cmd)?;

                let command_buffers = [cmd];
                let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

                device
                    .queue_submit(
                        self.device.graphics_queue,
                        &[submit_info.build()],
                        vk::Fence::null(),
                    )
                    .context("Failed to submit transfer commands")?;
                device.queue_wait_idle(self.device.graphics_queue)?;
            }
            Ok(())
        })();

        unsafe { device.free_command_buffers(self.pool.pool, &[cmd]) };

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(8192, 256, 32)]
    #[case(8000, 256, 32)]
    #[case(256, 256, 1)]
    #[case(1, 256, 1)]
    #[case(0, 256, 0)]
    fn workgroup_count_rounds_up(#[case] items: u32, #[case] local: u32, #[case] expected: u32) {
        assert_eq!(workgroup_count(items, local), expected);
    }
}
