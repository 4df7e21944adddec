// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. build.rs compiles the GLSL sources in
// shaders/ with glslc; modules are loaded from those .spv files at runtime.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use super::error::ResourceError;
use super::VulkanDevice;

/// Reinterpret SPIR-V bytes as 32-bit words
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(ResourceError::InvalidSpirvLength(bytes.len()).into());
    }

    let words = ash::util::read_spv(&mut Cursor::new(bytes)).context("Malformed SPIR-V")?;
    Ok(words)
}

pub fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader {}", path.display()))?;
    spirv_words(&bytes).with_context(|| format!("Invalid shader {}", path.display()))
}

/// Shader module that lives only as long as pipeline creation needs it
pub struct ShaderModule {
    pub module: vk::ShaderModule,
    device: Arc<VulkanDevice>,
}

impl ShaderModule {
    pub fn new(device: &Arc<VulkanDevice>, code: &[u32]) -> Result<Self> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .context("Failed to create shader module")?;

        Ok(Self {
            module,
            device: Arc::clone(device),
        })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_shader_module(self.module, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn rejects_truncated_bytecode() {
        let err = spirv_words(&[0x03, 0x02, 0x23, 0x07, 0x00]).unwrap_err();

        assert_eq!(
            err.downcast_ref::<ResourceError>(),
            Some(&ResourceError::InvalidSpirvLength(5))
        );
    }

    #[test]
    fn reads_little_endian_words() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());

        let words = spirv_words(&bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }
}
