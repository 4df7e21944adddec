// Buffer utilities for vertex, index, uniform and storage buffers
//
// Every buffer gets its own dedicated allocation. Device-local buffers are
// filled through a host-visible staging buffer; uniform buffers stay
// persistently mapped for their whole lifetime.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use std::ffi::c_void;
use std::sync::Arc;

use super::command::TransferContext;
use super::error::ResourceError;
use super::VulkanDevice;

/// First memory type allowed by `type_filter` that has all `properties`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32, ResourceError> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            let has_type = (type_filter & (1 << i)) != 0;
            let has_properties = memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties);
            has_type && has_properties
        })
        .ok_or(ResourceError::NoCompatibleMemoryType {
            type_filter,
            properties,
        })
}

/// Allocate and bind dedicated memory for `requirements`
pub(crate) fn allocate_memory(
    device: &VulkanDevice,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(
        &device.memory_properties,
        requirements.memory_type_bits,
        properties,
    )?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    let memory = unsafe { device.device.allocate_memory(&alloc_info, None) }
        .context("Failed to allocate device memory")?;

    Ok(memory)
}

pub struct Buffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    mapped: Option<*mut c_void>,
    device: Arc<VulkanDevice>,
}

impl Buffer {
    /// Create a GPU buffer with specified usage and memory properties
    pub fn new(
        device: &Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let memory = match allocate_memory(device, requirements, properties) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        // Owned from here on, so Drop covers the remaining failure paths
        let buffer = Self {
            buffer,
            memory,
            size,
            mapped: None,
            device: Arc::clone(device),
        };

        unsafe { device.device.bind_buffer_memory(buffer.buffer, buffer.memory, 0) }
            .context("Failed to bind buffer memory")?;

        Ok(buffer)
    }

    /// Host-visible buffer that stays mapped until dropped
    pub fn mapped(
        device: &Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let mut buffer = Self::new(
            device,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let ptr = unsafe {
            device
                .device
                .map_memory(buffer.memory, 0, size, vk::MemoryMapFlags::empty())
        }
        .context("Failed to map buffer memory")?;
        buffer.mapped = Some(ptr);

        Ok(buffer)
    }

    /// Device-local buffer filled with `data` through a staging copy
    pub fn device_local_with_data<T: Pod>(
        transfer: &TransferContext,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let device = transfer.device();
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = bytes.len() as vk::DeviceSize;

        let staging = Self::new(
            device,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        staging.write(data)?;

        let buffer = Self::new(
            device,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;

        transfer.one_shot(|d, cmd| {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size,
            };
            unsafe { d.cmd_copy_buffer(cmd, staging.buffer, buffer.buffer, &[region]) };
        })?;

        Ok(buffer)
    }

    /// Copy `data` into the start of a host-visible buffer
    pub fn write<T: Pod>(&self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let len = bytes.len() as vk::DeviceSize;
        if len > self.size {
            anyhow::bail!("Write of {} bytes overflows {}-byte buffer", len, self.size);
        }

        unsafe {
            match self.mapped {
                Some(ptr) => {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
                }
                None => {
                    let ptr = self.device.device.map_memory(
                        self.memory,
                        0,
                        len,
                        vk::MemoryMapFlags::empty(),
                    )?;
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
                    self.device.device.unmap_memory(self.memory);
                }
            }
        }

        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            if self.mapped.take().is_some() {
                self.device.device.unmap_memory(self.memory);
            }
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &flags) in types.iter().enumerate() {
            props.memory_types[i].property_flags = flags;
        }
        props
    }

    #[test]
    fn picks_first_type_with_required_properties() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);

        let index = find_memory_type(
            &props,
            0b111,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        assert_eq!(index, Ok(1));
    }

    #[test]
    fn respects_type_filter() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);

        let index = find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL);
        assert_eq!(index, Ok(1));
    }

    #[test]
    fn reports_missing_memory_type() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);

        let result = find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert_eq!(
            result,
            Err(ResourceError::NoCompatibleMemoryType {
                type_filter: 0b1,
                properties: vk::MemoryPropertyFlags::HOST_VISIBLE,
            })
        );
    }
}
