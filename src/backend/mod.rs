// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Every handle is owned by exactly one RAII type and dropped in reverse
// order of creation.

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use buffer::Buffer;
pub use command::{CommandPool, TransferContext};
pub use device::VulkanDevice;
pub use swapchain::{AcquireOutcome, PresentOutcome, Swapchain};
pub use sync::FrameSync;
