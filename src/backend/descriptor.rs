// Descriptor set layouts, pools and per-frame sets

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::{Buffer, VulkanDevice};

pub fn layout_binding(
    binding: u32,
    descriptor_type: vk::DescriptorType,
    stages: vk::ShaderStageFlags,
) -> vk::DescriptorSetLayoutBinding {
    vk::DescriptorSetLayoutBinding::builder()
        .binding(binding)
        .descriptor_type(descriptor_type)
        .descriptor_count(1)
        .stage_flags(stages)
        .build()
}

pub struct DescriptorSetLayout {
    pub layout: vk::DescriptorSetLayout,
    device: Arc<VulkanDevice>,
}

impl DescriptorSetLayout {
    pub fn new(
        device: &Arc<VulkanDevice>,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<Self> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);

        let layout = unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
            .context("Failed to create descriptor set layout")?;

        Ok(Self {
            layout,
            device: Arc::clone(device),
        })
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .device
                .destroy_descriptor_set_layout(self.layout, None)
        };
    }
}

/// Pool sized for `sets` sets; sets are freed with the pool
pub struct DescriptorPool {
    pub pool: vk::DescriptorPool,
    device: Arc<VulkanDevice>,
}

impl DescriptorPool {
    pub fn new(
        device: &Arc<VulkanDevice>,
        sizes: &[vk::DescriptorPoolSize],
        sets: u32,
    ) -> Result<Self> {
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(sizes)
            .max_sets(sets);

        let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;

        Ok(Self {
            pool,
            device: Arc::clone(device),
        })
    }

    /// One set per frame slot, all with the same layout
    pub fn allocate(
        &self,
        layout: &DescriptorSetLayout,
        count: usize,
    ) -> Result<Vec<vk::DescriptorSet>> {
        let layouts = vec![layout.layout; count];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor sets")?;

        Ok(sets)
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_descriptor_pool(self.pool, None) };
    }
}

/// Point `binding` of `set` at a whole buffer
pub fn write_buffer(
    device: &ash::Device,
    set: vk::DescriptorSet,
    binding: u32,
    descriptor_type: vk::DescriptorType,
    buffer: vk::Buffer,
    range: vk::DeviceSize,
) {
    let buffer_info = [vk::DescriptorBufferInfo {
        buffer,
        offset: 0,
        range,
    }];

    let write = vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(binding)
        .dst_array_element(0)
        .descriptor_type(descriptor_type)
        .buffer_info(&buffer_info)
        .build();

    unsafe { device.update_descriptor_sets(&[write], &[]) };
}

pub fn write_combined_image_sampler(
    device: &ash::Device,
    set: vk::DescriptorSet,
    binding: u32,
    view: vk::ImageView,
    sampler: vk::Sampler,
) {
    let image_info = [vk::DescriptorImageInfo {
        sampler,
        image_view: view,
        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }];

    let write = vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(binding)
        .dst_array_element(0)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .image_info(&image_info)
        .build();

    unsafe { device.update_descriptor_sets(&[write], &[]) };
}

/// Which per-slot buffer copy a descriptor binding points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSource {
    Uniform(usize),
    Storage(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub source: BufferSource,
}

impl BufferBinding {
    pub fn uniform(binding: u32, index: usize) -> Self {
        Self {
            binding,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            source: BufferSource::Uniform(index),
        }
    }

    pub fn storage(binding: u32, index: usize) -> Self {
        Self {
            binding,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            source: BufferSource::Storage(index),
        }
    }
}

/// Write every binding of `plan` into `set`, each covering its whole buffer
pub fn write_buffer_bindings(
    device: &ash::Device,
    set: vk::DescriptorSet,
    plan: &[BufferBinding],
    uniform_buffers: &[Buffer],
    storage_buffers: &[Buffer],
) -> Result<()> {
    for entry in plan {
        let buffer = match entry.source {
            BufferSource::Uniform(index) => uniform_buffers.get(index),
            BufferSource::Storage(index) => storage_buffers.get(index),
        }
        .with_context(|| format!("No buffer for {:?}", entry.source))?;

        write_buffer(
            device,
            set,
            entry.binding,
            entry.descriptor_type,
            buffer.buffer,
            buffer.size,
        );
    }
    Ok(())
}

/// Storage buffer indices bound by frame slot `slot`.
///
/// The compute pass reads last frame's particles and writes this frame's,
/// so the buffers form a ring: slot i reads i-1 and writes i.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticleBindings {
    pub previous: usize,
    pub current: usize,
}

impl ParticleBindings {
    pub fn for_slot(slot: usize, frames_in_flight: usize) -> Self {
        Self {
            previous: (slot + frames_in_flight - 1) % frames_in_flight,
            current: slot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 2, 1, 0)]
    #[case(1, 2, 0, 1)]
    #[case(0, 3, 2, 0)]
    #[case(2, 3, 1, 2)]
    #[case(0, 1, 0, 0)]
    fn storage_buffers_form_a_ring(
        #[case] slot: usize,
        #[case] frames: usize,
        #[case] previous: usize,
        #[case] current: usize,
    ) {
        assert_eq!(
            ParticleBindings::for_slot(slot, frames),
            ParticleBindings { previous, current }
        );
    }

    #[test]
    fn layout_binding_is_single_descriptor() {
        let binding = layout_binding(
            2,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::ShaderStageFlags::COMPUTE,
        );

        assert_eq!(binding.binding, 2);
        assert_eq!(binding.descriptor_count, 1);
        assert_eq!(binding.stage_flags, vk::ShaderStageFlags::COMPUTE);
    }
}
