// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every tunable the renderer exposes lives here: frame-slot count, device
// extensions, validation layers, preferred surface format / present mode and
// the requested window extent. Missing keys fall back to defaults.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::ffi::CString;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub shaders: ShaderConfig,
    pub debug: DebugConfig,
    /// File the settings were read from; `None` when running on defaults
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// Window settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Quad Renderer".to_string(),
            width: 800,
            height: 600,
            resizable: true,
        }
    }
}

/// Graphics settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub max_frames_in_flight: usize,
    pub device_extensions: Vec<String>,
    pub surface_format: String,
    pub color_space: String,
    pub present_mode: String,
    pub clear_color: [f32; 4],
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            device_extensions: vec!["VK_KHR_swapchain".to_string()],
            surface_format: "b8g8r8a8_srgb".to_string(),
            color_space: "srgb_nonlinear".to_string(),
            present_mode: "mailbox".to_string(),
            clear_color: [0.25, 0.25, 0.25, 1.0],
        }
    }
}

/// Compiled SPIR-V locations
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: PathBuf::from("shaders/quad.vert.spv"),
            fragment: PathBuf::from("shaders/quad.frag.spv"),
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation: bool,
    pub validation_layers: Vec<String>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation: true,
            validation_layers: vec!["VK_LAYER_KHRONOS_validation".to_string()],
            log_level: "info".to_string(),
            log_file: None,
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from a specific path, using defaults if it doesn't exist
    ///
    /// Runs before the logger exists, so the outcome is reported by `log_source`.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {:?}", path))?;
        config.source = Some(path.to_path_buf());

        Ok(config)
    }

    pub fn log_source(&self) {
        match &self.source {
            Some(path) => log::info!("Loaded configuration from {:?}", path),
            None => log::info!("No config file found, using defaults"),
        }
        log::debug!("Config: {:?}", self);
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the renderer can't work with before any GPU object exists
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.graphics.max_frames_in_flight >= 1,
            "graphics.max_frames_in_flight must be at least 1"
        );
        anyhow::ensure!(
            self.window.width > 0 && self.window.height > 0,
            "window size must be non-zero, got {}x{}",
            self.window.width,
            self.window.height
        );
        anyhow::ensure!(
            self.graphics
                .device_extensions
                .iter()
                .any(|ext| ext.as_bytes() == ash::khr::swapchain::NAME.to_bytes()),
            "graphics.device_extensions must include {:?}",
            ash::khr::swapchain::NAME
        );
        self.graphics.preferred_surface_format()?;
        self.graphics.preferred_present_mode()?;
        self.graphics.extension_names()?;
        self.debug.layer_names()?;
        Ok(())
    }
}

impl GraphicsConfig {
    /// Preferred (format, color space) pair as Vulkan enums
    pub fn preferred_surface_format(&self) -> Result<vk::SurfaceFormatKHR> {
        let format = match self.surface_format.to_lowercase().as_str() {
            "b8g8r8a8_srgb" => vk::Format::B8G8R8A8_SRGB,
            "b8g8r8a8_unorm" => vk::Format::B8G8R8A8_UNORM,
            "r8g8b8a8_srgb" => vk::Format::R8G8B8A8_SRGB,
            "r8g8b8a8_unorm" => vk::Format::R8G8B8A8_UNORM,
            "a2b10g10r10_unorm" => vk::Format::A2B10G10R10_UNORM_PACK32,
            other => anyhow::bail!("Unknown surface format '{}'", other),
        };
        let color_space = match self.color_space.to_lowercase().as_str() {
            "srgb_nonlinear" => vk::ColorSpaceKHR::SRGB_NONLINEAR,
            "extended_srgb_linear" => vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
            "display_p3_nonlinear" => vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT,
            other => anyhow::bail!("Unknown color space '{}'", other),
        };
        Ok(vk::SurfaceFormatKHR { format, color_space })
    }

    /// Get present mode as Vulkan enum
    pub fn preferred_present_mode(&self) -> Result<vk::PresentModeKHR> {
        match self.present_mode.to_lowercase().as_str() {
            "immediate" => Ok(vk::PresentModeKHR::IMMEDIATE),
            "mailbox" => Ok(vk::PresentModeKHR::MAILBOX),
            "fifo" => Ok(vk::PresentModeKHR::FIFO),
            "fifo_relaxed" => Ok(vk::PresentModeKHR::FIFO_RELAXED),
            other => anyhow::bail!("Unknown present mode '{}'", other),
        }
    }

    pub fn extension_names(&self) -> Result<Vec<CString>> {
        to_cstrings(&self.device_extensions).context("Invalid device extension name")
    }
}

impl DebugConfig {
    /// Validation only runs in debug builds, whatever the file says
    pub fn validation_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.validation
    }

    pub fn layer_names(&self) -> Result<Vec<CString>> {
        to_cstrings(&self.validation_layers).context("Invalid validation layer name")
    }
}

fn to_cstrings(names: &[String]) -> Result<Vec<CString>> {
    names
        .iter()
        .map(|name| CString::new(name.as_str()).with_context(|| format!("{:?}", name)))
        .collect()
}
