// Resource-manager invariant violations
//
// These indicate a logic error or an unsupported device rather than a
// transient condition. They travel through anyhow as fatal errors.

use ash::vk;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// No memory type matches both the type filter and the property flags
    #[error("No memory type matches filter {type_filter:#b} with properties {properties:?}")]
    NoCompatibleMemoryType {
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    },

    /// The layout pair is not in the transition table
    #[error("Unsupported layout transition: {old:?} -> {new:?}")]
    UnsupportedLayoutTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    /// Mip generation needs linear-filter blits for the format
    #[error("Format {0:?} does not support linear blitting")]
    LinearBlitUnsupported(vk::Format),

    /// None of the candidate formats support the requested features
    #[error("No supported format among {0:?}")]
    NoSupportedFormat(Vec<vk::Format>),

    /// SPIR-V bytecode is a stream of 32-bit words
    #[error("SPIR-V length {0} is not a multiple of 4")]
    InvalidSpirvLength(usize),
}
