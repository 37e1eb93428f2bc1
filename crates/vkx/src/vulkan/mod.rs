//! `ash` implementation of the backend traits
//!
//! Every wrapper owns its Vulkan object and destroys it on drop. Objects
//! created from a [`GraphicsDevice`] must be dropped before it.

pub mod commands;
pub mod device;
pub mod framebuffer;
pub mod instance;
pub mod memory;
pub mod render_pass;
pub mod swapchain;

pub use commands::{ActiveRenderPass, CommandRecorder, RecordingContext};
pub use device::{GraphicsDevice, PhysicalDeviceInfo};
pub use framebuffer::{ImageTarget, ImageTargetFactory};
pub use instance::{Surface, VulkanInstance};
pub use memory::{find_memory_type, Buffer, Image};
pub use render_pass::RenderPass;
pub use swapchain::Swapchain;
