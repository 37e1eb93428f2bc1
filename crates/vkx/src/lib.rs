//! # vkx
//!
//! Shared helper layer for small Vulkan example programs. Every example
//! needs the same frame lifecycle: acquire a swapchain image, record and
//! submit command buffers in dependency order, present, and stage host data
//! into device-local memory through transient command buffers. This crate
//! implements that protocol once.
//!
//! ## Layout
//!
//! - [`backend`]: the device traits the protocol is written against
//! - [`sync`]: frames-in-flight bookkeeping (`FrameSync`)
//! - [`staging`]: fenced staging uploads and deferred staging release
//! - [`targets`]: per-swapchain-image views/framebuffers rebuilt as a unit
//! - [`vulkan`]: the `ash` implementation of the backend traits
//! - [`example`]: composition-based example runner
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vkx::prelude::*;
//!
//! struct Blank;
//!
//! impl Example for Blank {
//!     const NAME: &'static str = "blank";
//!
//!     fn prepare(_base: &mut ExampleBase) -> VkxResult<Self> {
//!         Ok(Self)
//!     }
//!
//!     fn record(&mut self, _base: &ExampleBase, _frame: &FrameContext, _recorder: &mut CommandRecorder) -> VkxResult<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     vkx::example::run::<Blank>(ExampleConfig::new("blank"))?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod assets;
pub mod backend;
pub mod config;
pub mod error;
pub mod example;
pub mod features;
pub mod logging;
pub mod staging;
pub mod sync;
pub mod targets;
pub mod vulkan;
pub mod window;

#[cfg(test)]
mod mock;

pub use error::{VkxError, VkxResult};

/// Common imports for example programs
pub mod prelude {
    pub use crate::{
        assets::{AssetPaths, ShaderStage},
        config::{Config, ExampleConfig, FrameConfig, PresentModePreference, WindowConfig},
        error::{VkxError, VkxResult},
        example::{Example, ExampleBase, FrameContext},
        features::{DeviceFeature, FeatureRequest},
        staging::{DeferredStaging, ImageDesc, ImageFinalLayout, StagingTransfer},
        sync::{FrameStatus, FrameSync, PassSubmit, PresentOutcome},
        vulkan::{CommandRecorder, GraphicsDevice, RecordingContext},
    };
}
