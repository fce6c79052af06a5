// Error taxonomy
//
// Every fatal failure has its own variant so the caller can report exactly
// which construction step failed. A stale swapchain is NOT an error: it is
// reported through `Acquired::OutOfDate` / `Presented::Stale` instead.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load the Vulkan library: {0}")]
    Loader(#[from] ash::LoadingError),

    #[error("Failed to create Vulkan instance: {0}")]
    InstanceCreation(vk::Result),

    #[error("Validation layer {0} was requested but is not installed")]
    ValidationLayerMissing(String),

    #[error("Failed to create window surface: {0}")]
    SurfaceCreation(String),

    #[error("No suitable GPU found (checked {checked} adapter(s))")]
    NoSuitableDevice { checked: usize },

    #[error("Failed to create logical device: {0}")]
    DeviceCreation(vk::Result),

    #[error("Failed to create GPU allocator: {0}")]
    Allocator(#[from] gpu_allocator::AllocationError),

    #[error("Failed to create swapchain: {0}")]
    SwapchainCreation(vk::Result),

    #[error("Failed to create graphics pipeline: {0}")]
    PipelineCreation(vk::Result),

    #[error("Failed to load {stage} shader from {path:?}: {source}")]
    ShaderLoad {
        stage: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create {0} buffer: {1}")]
    BufferCreation(&'static str, vk::Result),

    #[error("{0} needs a swapchain but none is alive")]
    NoSwapchain(&'static str),

    #[error("Vulkan call {op} failed: {result}")]
    Vulkan { op: &'static str, result: vk::Result },
}

pub type Result<T, E = RenderError> = std::result::Result<T, E>;

/// Attach the name of the failing call to a raw `vk::Result`.
pub(crate) trait VkResultExt<T> {
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|result| RenderError::Vulkan { op, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_errors_name_the_failing_call() {
        let err = Err::<(), _>(vk::Result::ERROR_DEVICE_LOST)
            .op("vkQueueSubmit")
            .unwrap_err();
        assert!(matches!(
            err,
            RenderError::Vulkan {
                op: "vkQueueSubmit",
                result: vk::Result::ERROR_DEVICE_LOST
            }
        ));
        assert!(err.to_string().contains("vkQueueSubmit"));
    }

    #[test]
    fn startup_failures_are_distinguishable() {
        let no_device = RenderError::NoSuitableDevice { checked: 2 };
        let swapchain = RenderError::SwapchainCreation(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        assert!(no_device.to_string().contains("2 adapter"));
        assert!(swapchain.to_string().starts_with("Failed to create swapchain"));
    }

    #[test]
    fn missing_chain_is_not_reported_as_a_driver_result() {
        let err = RenderError::NoSwapchain("record");
        assert!(!matches!(err, RenderError::Vulkan { .. }));
        assert_eq!(err.to_string(), "record needs a swapchain but none is alive");
    }
}
