// Quad renderer - Vulkan context, swapchain lifecycle and frame pacing
//
// The binary in main.rs wires these together; everything GPU-free (device
// selection rules, swapchain policies, the frame protocol) is testable here.

pub mod assets;
pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
pub mod window;

pub use config::Config;
pub use error::{RenderError, Result};
