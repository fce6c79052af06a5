// Backend module - Vulkan abstraction layer
//
// Design: thin RAII wrappers around ash. Each wrapper holds an Arc to the
// object it was created from, so a parent always outlives its children.

pub mod buffer;
pub mod context;
pub mod device;
pub mod pipeline;
pub mod renderer;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod targets;

pub use context::{GraphicsContext, SurfaceHandle};
pub use device::VulkanDevice;
pub use renderer::VulkanRenderer;
pub use swapchain::Swapchain;
