//! Error types shared by every vkx module

use ash::vk;
use thiserror::Error;

use crate::config::ConfigError;
use crate::window::WindowError;

/// Errors raised by the frame protocol, staging and Vulkan wrappers
#[derive(Error, Debug)]
pub enum VkxError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Instance, device or swapchain setup failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// A feature the example cannot run without is not supported by the GPU
    #[error("Required device feature not supported: {feature}")]
    MissingFeature {
        /// Name of the missing feature
        feature: &'static str,
    },

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// A frame slot was submitted again before its previous submission completed
    #[error("Frame slot {slot} is still in flight")]
    FrameInFlight {
        /// Index of the frame slot
        slot: usize,
    },

    /// A frame acquired before a swapchain recreation was used afterwards
    #[error("Frame from swapchain epoch {frame_epoch} used after recreation (current epoch {current_epoch})")]
    StaleFrame {
        /// Epoch the frame was acquired in
        frame_epoch: u64,
        /// Epoch of the current swapchain
        current_epoch: u64,
    },

    /// Waiting on a fence exceeded the configured timeout
    #[error("Fence wait timed out after {timeout_ns} ns")]
    FenceTimeout {
        /// The timeout that elapsed
        timeout_ns: u64,
    },

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Windowing system error
    #[error("Window error: {0}")]
    Window(#[from] WindowError),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Shader, model or texture file could not be loaded
    #[error("Asset error for {path}: {reason}")]
    Asset {
        /// Path of the asset
        path: String,
        /// What went wrong
        reason: String,
    },
}

impl VkxError {
    /// Shorthand for [`VkxError::InvalidOperation`]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidOperation { reason: reason.into() }
    }

    /// Whether the error means the swapchain no longer matches the surface
    pub const fn is_out_of_date(&self) -> bool {
        matches!(self, Self::Api(vk::Result::ERROR_OUT_OF_DATE_KHR))
    }
}

/// Result type for vkx operations
pub type VkxResult<T> = Result<T, VkxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_date_detection() {
        assert!(VkxError::Api(vk::Result::ERROR_OUT_OF_DATE_KHR).is_out_of_date());
        assert!(!VkxError::Api(vk::Result::ERROR_DEVICE_LOST).is_out_of_date());
        assert!(!VkxError::invalid("nope").is_out_of_date());
    }

    #[test]
    fn test_error_messages() {
        let err = VkxError::FrameInFlight { slot: 1 };
        assert_eq!(err.to_string(), "Frame slot 1 is still in flight");

        let err = VkxError::MissingFeature { feature: "tessellationShader" };
        assert!(err.to_string().contains("tessellationShader"));
    }
}
