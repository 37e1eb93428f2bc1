//! Device traits the frame protocol is written against
//!
//! `FrameSync`, `StagingTransfer` and `SwapchainTargets` only need a small
//! slice of the Vulkan object model: semaphores, fences, queue submission,
//! command buffer lifetime, staging/device memory and presentation. These
//! traits name that slice. [`crate::vulkan`] implements them over `ash`.

use std::fmt::Debug;

use ash::vk;

use crate::error::VkxResult;

/// A semaphore wait with the pipeline stages that must not start before it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSemaphore<S> {
    /// Semaphore to wait on
    pub semaphore: S,
    /// Stages blocked until the semaphore is signalled
    pub stage: vk::PipelineStageFlags,
}

/// One queue submission: waits, command buffers, and semaphores to signal
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a, S, C> {
    /// Semaphores waited on, each with its own stage mask
    pub waits: &'a [WaitSemaphore<S>],
    /// Command buffers executed in order
    pub command_buffers: &'a [C],
    /// Semaphores signalled on completion, for downstream consumers
    pub signals: &'a [S],
}

/// GPU-GPU and CPU-GPU synchronization plus queue submission
pub trait SyncDevice {
    /// Binary semaphore handle
    type Semaphore: Copy + Eq + Debug;
    /// Fence handle
    type Fence: Copy + Eq + Debug;
    /// Command buffer handle
    type CommandBuffer: Copy + Eq + Debug;

    /// Create a binary semaphore
    fn create_semaphore(&self) -> VkxResult<Self::Semaphore>;
    /// Destroy a semaphore no pending work references
    fn destroy_semaphore(&self, semaphore: Self::Semaphore);

    /// Create a fence, optionally already signalled
    fn create_fence(&self, signaled: bool) -> VkxResult<Self::Fence>;
    /// Destroy a fence no pending submission references
    fn destroy_fence(&self, fence: Self::Fence);
    /// Block until the fence is signalled or `timeout_ns` elapses
    fn wait_fence(&self, fence: Self::Fence, timeout_ns: u64) -> VkxResult<()>;
    /// Return the fence to the unsignalled state
    fn reset_fence(&self, fence: Self::Fence) -> VkxResult<()>;
    /// Non-blocking fence status query
    fn fence_signaled(&self, fence: Self::Fence) -> VkxResult<bool>;

    /// Submit work to the graphics queue, signalling `fence` when it completes
    fn submit(
        &self,
        submission: &Submission<'_, Self::Semaphore, Self::CommandBuffer>,
        fence: Option<Self::Fence>,
    ) -> VkxResult<()>;

    /// Block until all queued work has finished
    fn wait_idle(&self) -> VkxResult<()>;
}

/// Command buffer allocation and recording on an explicit recording context
///
/// Command pools are not externally synchronized, so every allocation names
/// the context it comes from instead of reaching for thread-local state.
pub trait CommandDevice: SyncDevice {
    /// Per-thread owner of a command pool
    type RecordingContext;

    /// Allocate primary command buffers
    fn allocate_command_buffers(
        &self,
        context: &Self::RecordingContext,
        count: u32,
    ) -> VkxResult<Vec<Self::CommandBuffer>>;

    /// Return command buffers to their pool
    fn free_command_buffers(&self, context: &Self::RecordingContext, buffers: &[Self::CommandBuffer]);

    /// Begin recording for a single submission
    fn begin_one_shot(&self, command_buffer: Self::CommandBuffer) -> VkxResult<()>;

    /// Finish recording
    fn end_command_buffer(&self, command_buffer: Self::CommandBuffer) -> VkxResult<()>;
}

/// Image layout transitions used around staging copies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutTransition {
    /// Freshly created image about to receive a copy
    UndefinedToTransferDst,
    /// Copied image about to be sampled by fragment shaders
    TransferDstToShaderRead,
    /// Copied image about to be used as a blit/copy source
    TransferDstToTransferSrc,
}

/// Everything a pipeline barrier needs for one [`LayoutTransition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierSpec {
    /// Layout before the barrier
    pub old_layout: vk::ImageLayout,
    /// Layout after the barrier
    pub new_layout: vk::ImageLayout,
    /// Accesses made available
    pub src_access: vk::AccessFlags,
    /// Accesses made visible
    pub dst_access: vk::AccessFlags,
    /// Stages that must finish first
    pub src_stage: vk::PipelineStageFlags,
    /// Stages that wait
    pub dst_stage: vk::PipelineStageFlags,
}

impl LayoutTransition {
    /// Access masks, stages and layouts for the transition
    pub const fn barrier(self) -> BarrierSpec {
        match self {
            Self::UndefinedToTransferDst => BarrierSpec {
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                src_access: vk::AccessFlags::empty(),
                dst_access: vk::AccessFlags::TRANSFER_WRITE,
                src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                dst_stage: vk::PipelineStageFlags::TRANSFER,
            },
            Self::TransferDstToShaderRead => BarrierSpec {
                old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            },
            Self::TransferDstToTransferSrc => BarrierSpec {
                old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::TRANSFER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::TRANSFER,
            },
        }
    }
}

/// Memory barrier making a transfer write to a buffer visible to its consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrierSpec {
    /// Accesses made available
    pub src_access: vk::AccessFlags,
    /// Accesses made visible
    pub dst_access: vk::AccessFlags,
    /// Stages that must finish first
    pub src_stage: vk::PipelineStageFlags,
    /// Stages that wait
    pub dst_stage: vk::PipelineStageFlags,
}

impl BufferBarrierSpec {
    /// Barrier after a staging copy into a buffer created with `usage`
    pub fn after_upload(usage: vk::BufferUsageFlags) -> Self {
        let shader_stages = vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER;
        let mut dst_access = vk::AccessFlags::empty();
        let mut dst_stage = vk::PipelineStageFlags::empty();

        if usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER) {
            dst_access |= vk::AccessFlags::VERTEX_ATTRIBUTE_READ;
            dst_stage |= vk::PipelineStageFlags::VERTEX_INPUT;
        }
        if usage.contains(vk::BufferUsageFlags::INDEX_BUFFER) {
            dst_access |= vk::AccessFlags::INDEX_READ;
            dst_stage |= vk::PipelineStageFlags::VERTEX_INPUT;
        }
        if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
            dst_access |= vk::AccessFlags::UNIFORM_READ;
            dst_stage |= shader_stages;
        }
        if usage.intersects(
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER
                | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER,
        ) {
            dst_access |= vk::AccessFlags::SHADER_READ;
            dst_stage |= shader_stages;
        }
        if usage.contains(vk::BufferUsageFlags::INDIRECT_BUFFER) {
            dst_access |= vk::AccessFlags::INDIRECT_COMMAND_READ;
            dst_stage |= vk::PipelineStageFlags::DRAW_INDIRECT;
        }
        if usage.contains(vk::BufferUsageFlags::TRANSFER_SRC) {
            dst_access |= vk::AccessFlags::TRANSFER_READ;
            dst_stage |= vk::PipelineStageFlags::TRANSFER;
        }
        if dst_stage.is_empty() {
            dst_access = vk::AccessFlags::MEMORY_READ;
            dst_stage = vk::PipelineStageFlags::ALL_COMMANDS;
        }

        Self {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage,
        }
    }
}

/// Description of a 2D device-local image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Texel format
    pub format: vk::Format,
    /// Usage beyond `TRANSFER_DST`, which is always added
    pub usage: vk::ImageUsageFlags,
}

impl ImageDesc {
    /// RGBA8 sRGB image sampled by shaders
    pub const fn rgba8_sampled(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: vk::Format::R8G8B8A8_SRGB,
            usage: vk::ImageUsageFlags::SAMPLED,
        }
    }

    /// Size in bytes of one texel, for the formats the helpers upload
    pub const fn bytes_per_texel(&self) -> Option<u64> {
        match self.format {
            vk::Format::R8_UNORM => Some(1),
            vk::Format::R8G8_UNORM => Some(2),
            vk::Format::R8G8B8A8_UNORM
            | vk::Format::R8G8B8A8_SRGB
            | vk::Format::B8G8R8A8_UNORM
            | vk::Format::B8G8R8A8_SRGB
            | vk::Format::R32_SFLOAT => Some(4),
            vk::Format::R16G16B16A16_SFLOAT => Some(8),
            vk::Format::R32G32B32A32_SFLOAT => Some(16),
            _ => None,
        }
    }

    /// Expected payload size for a tightly packed upload
    pub const fn byte_size(&self) -> Option<u64> {
        match self.bytes_per_texel() {
            Some(texel) => Some(self.width as u64 * self.height as u64 * texel),
            None => None,
        }
    }
}

/// Host-visible staging memory, device-local targets and the copies between them
pub trait TransferDevice: CommandDevice {
    /// Host-visible buffer holding a staging payload
    type HostBuffer;
    /// Device-local buffer
    type DeviceBuffer;
    /// Device-local image
    type DeviceImage;

    /// Create a host-visible buffer and copy `data` into it (map, copy, unmap)
    fn create_host_buffer(&self, data: &[u8]) -> VkxResult<Self::HostBuffer>;
    /// Release a staging buffer; the GPU must no longer reference it
    fn destroy_host_buffer(&self, buffer: Self::HostBuffer);

    /// Create a device-local buffer usable as a copy destination
    fn create_device_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> VkxResult<Self::DeviceBuffer>;
    /// Create a device-local image usable as a copy destination
    fn create_device_image(&self, desc: &ImageDesc) -> VkxResult<Self::DeviceImage>;

    /// Record a whole-buffer copy
    fn cmd_copy_buffer(
        &self,
        command_buffer: Self::CommandBuffer,
        src: &Self::HostBuffer,
        dst: &Self::DeviceBuffer,
        size: u64,
    );

    /// Record a buffer memory barrier over the whole buffer
    fn cmd_buffer_barrier(
        &self,
        command_buffer: Self::CommandBuffer,
        buffer: &Self::DeviceBuffer,
        barrier: BufferBarrierSpec,
    );

    /// Record a tightly packed buffer-to-image copy into `TRANSFER_DST_OPTIMAL`
    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: Self::CommandBuffer,
        src: &Self::HostBuffer,
        dst: &Self::DeviceImage,
        desc: &ImageDesc,
    );

    /// Record a layout transition barrier on the image
    fn cmd_transition_image(
        &self,
        command_buffer: Self::CommandBuffer,
        image: &Self::DeviceImage,
        transition: LayoutTransition,
    );
}

/// Result of asking the presentation engine for an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image index was returned; its semaphore signals when it is writable
    Acquired {
        /// Index into the swapchain image array
        image_index: u32,
        /// The swapchain still works but no longer matches the surface exactly
        suboptimal: bool,
    },
    /// The swapchain must be recreated before rendering
    OutOfDate,
}

/// Result of queueing an image for presentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Presented normally
    Presented,
    /// Presented, but the swapchain should be recreated
    Suboptimal,
    /// Not presented; the swapchain must be recreated
    OutOfDate,
}

impl PresentOutcome {
    /// Whether the caller must rebuild the swapchain
    pub const fn needs_recreate(self) -> bool {
        !matches!(self, Self::Presented)
    }
}

/// Presentable image set with acquire and present
pub trait PresentationEngine<D: SyncDevice> {
    /// Number of images in the swapchain
    fn image_count(&self) -> usize;

    /// Acquire the next image; `signal` fires when it is safe to write
    fn acquire_next_image(&self, signal: D::Semaphore, timeout_ns: u64) -> VkxResult<AcquireOutcome>;

    /// Queue `image_index` for presentation once `wait` is signalled
    fn present(&self, image_index: u32, wait: D::Semaphore) -> VkxResult<PresentOutcome>;
}
