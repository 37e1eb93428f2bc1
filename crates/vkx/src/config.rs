//! # Example Configuration
//!
//! Configuration for a single example program: window, frame pacing,
//! presentation, validation and the device features it asks for. Files are
//! read as TOML or RON depending on the extension.

use serde::{Deserialize, Serialize};

use crate::features::FeatureRequest;

/// Upper bound on frames in flight accepted by [`FrameConfig::validate`]
pub const MAX_FRAMES_IN_FLIGHT_LIMIT: usize = 8;

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(path, &contents)
    }

    /// Parse configuration text, choosing the format from `path`'s extension
    fn parse(path: &str, contents: &str) -> Result<Self, ConfigError> {
        if path.ends_with(".toml") {
            toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else if path.ends_with(".ron") {
            ron::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
    }

    /// Render configuration text in the format implied by `path`
    fn render(&self, path: &str) -> Result<String, ConfigError> {
        if path.ends_with(".toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
        } else if path.ends_with(".ron") {
            ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = self.render(path)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A value is out of range
    #[error("Invalid value: {0}")]
    Invalid(String),
}

/// Window creation parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Initial width in screen coordinates
    pub width: u32,
    /// Initial height in screen coordinates
    pub height: u32,
    /// Whether the user may resize the window
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            resizable: true,
        }
    }
}

/// Frame pacing and synchronization limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Number of frames the CPU may record ahead of the GPU
    pub max_frames_in_flight: usize,
    /// Upper bound on any single fence wait, in nanoseconds
    pub fence_timeout_ns: u64,
    /// Upper bound on waiting for a presentable image, in nanoseconds
    pub acquire_timeout_ns: u64,
}

impl FrameConfig {
    /// Validate the frame limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frames_in_flight == 0 {
            return Err(ConfigError::Invalid("max_frames_in_flight must be at least 1".to_string()));
        }
        if self.max_frames_in_flight > MAX_FRAMES_IN_FLIGHT_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_frames_in_flight must not exceed {MAX_FRAMES_IN_FLIGHT_LIMIT}"
            )));
        }
        if self.fence_timeout_ns == 0 {
            return Err(ConfigError::Invalid("fence_timeout_ns must be non-zero".to_string()));
        }
        Ok(())
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            fence_timeout_ns: 1_000_000_000,
            acquire_timeout_ns: u64::MAX,
        }
    }
}

/// Preferred presentation mode; FIFO is used when the preference is unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentModePreference {
    /// Vsync, always available
    Fifo,
    /// Low-latency triple buffering
    Mailbox,
    /// No vsync, may tear
    Immediate,
}

/// Complete configuration for one example program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExampleConfig {
    /// Example name; used as window title and shader directory
    pub name: String,
    /// Window parameters
    pub window: WindowConfig,
    /// Frames-in-flight settings
    pub frame: FrameConfig,
    /// Presentation mode preference
    pub present_mode: PresentModePreference,
    /// Whether to enable Vulkan validation layers (`None` = debug builds only)
    pub validation: Option<bool>,
    /// Default log filter when `RUST_LOG` is not set
    pub log_level: String,
    /// Root directory of the `shaders/`, `models/` and `textures/` folders
    pub assets_root: String,
    /// Device features the example enables
    pub features: Vec<FeatureRequest>,
}

impl ExampleConfig {
    /// Create a configuration with defaults for the named example
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the initial window size
    #[must_use]
    pub const fn with_window_size(mut self, width: u32, height: u32) -> Self {
        self.window.width = width;
        self.window.height = height;
        self
    }

    /// Set maximum frames in flight
    #[must_use]
    pub const fn with_max_frames_in_flight(mut self, frames: usize) -> Self {
        self.frame.max_frames_in_flight = frames;
        self
    }

    /// Set the presentation mode preference
    #[must_use]
    pub const fn with_present_mode(mut self, mode: PresentModePreference) -> Self {
        self.present_mode = mode;
        self
    }

    /// Enable or disable validation layers
    #[must_use]
    pub const fn with_validation(mut self, enabled: bool) -> Self {
        self.validation = Some(enabled);
        self
    }

    /// Request a device feature
    #[must_use]
    pub fn with_feature(mut self, request: FeatureRequest) -> Self {
        self.features.push(request);
        self
    }

    /// Whether validation layers should be enabled for this build
    pub fn validation_enabled(&self) -> bool {
        self.validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("example name cannot be empty".to_string()));
        }
        if self.window.width == 0 || self.window.height == 0 {
            return Err(ConfigError::Invalid("window size must be non-zero".to_string()));
        }
        self.frame.validate()
    }
}

impl Default for ExampleConfig {
    fn default() -> Self {
        Self {
            name: "vkx example".to_string(),
            window: WindowConfig::default(),
            frame: FrameConfig::default(),
            present_mode: PresentModePreference::Fifo,
            validation: None,
            log_level: "info".to_string(),
            assets_root: ".".to_string(),
            features: Vec::new(),
        }
    }
}

impl Config for ExampleConfig {}
