//! Staging uploads into device-local memory
//!
//! Host data reaches device-local buffers and images through a transient
//! host-visible staging buffer and a one-shot command buffer. The staging
//! buffer is released only after the copy's fence has been observed
//! signalled: either immediately ([`StagingTransfer`]) or later, when the
//! caller retires finished uploads ([`DeferredStaging`]).

use ash::vk;
use bytemuck::Pod;

use crate::backend::{BufferBarrierSpec, LayoutTransition, Submission, SyncDevice, TransferDevice};
use crate::error::{VkxError, VkxResult};

pub use crate::backend::ImageDesc;

/// Layout an uploaded image is left in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFinalLayout {
    /// `SHADER_READ_ONLY_OPTIMAL`, for sampled textures
    ShaderRead,
    /// `TRANSFER_SRC_OPTIMAL`, for images later blitted or copied from
    TransferSrc,
}

impl ImageFinalLayout {
    const fn transition(self) -> LayoutTransition {
        match self {
            Self::ShaderRead => LayoutTransition::TransferDstToShaderRead,
            Self::TransferSrc => LayoutTransition::TransferDstToTransferSrc,
        }
    }

    /// Vulkan layout value
    pub const fn layout(self) -> vk::ImageLayout {
        self.transition().barrier().new_layout
    }
}

fn check_image_payload(pixels: &[u8], desc: &ImageDesc) -> VkxResult<()> {
    if desc.width == 0 || desc.height == 0 {
        return Err(VkxError::invalid("image upload with zero extent"));
    }
    let expected = desc
        .byte_size()
        .ok_or_else(|| VkxError::invalid(format!("no texel size known for {:?}", desc.format)))?;
    if pixels.len() as u64 != expected {
        return Err(VkxError::invalid(format!(
            "image payload is {} bytes, {}x{} {:?} needs {expected}",
            pixels.len(),
            desc.width,
            desc.height,
            desc.format
        )));
    }
    Ok(())
}

/// One-shot command buffer recorded and ended; not yet submitted
struct RecordedCopy<D: TransferDevice> {
    command_buffer: D::CommandBuffer,
    staging: D::HostBuffer,
}

/// Allocate, begin, record and end a one-shot command buffer reading `staging`
///
/// On failure nothing was submitted, so the command buffer and the staging
/// buffer are released before returning.
fn record_one_shot<D, F>(
    device: &D,
    context: &D::RecordingContext,
    staging: D::HostBuffer,
    record: F,
) -> VkxResult<RecordedCopy<D>>
where
    D: TransferDevice,
    F: FnOnce(D::CommandBuffer, &D::HostBuffer),
{
    let allocated = device.allocate_command_buffers(context, 1).and_then(|buffers| {
        buffers
            .first()
            .copied()
            .ok_or_else(|| VkxError::invalid("command pool returned no command buffer"))
    });
    let command_buffer = match allocated {
        Ok(command_buffer) => command_buffer,
        Err(err) => {
            device.destroy_host_buffer(staging);
            return Err(err);
        }
    };

    let recorded = device.begin_one_shot(command_buffer).and_then(|()| {
        record(command_buffer, &staging);
        device.end_command_buffer(command_buffer)
    });
    if let Err(err) = recorded {
        device.free_command_buffers(context, &[command_buffer]);
        device.destroy_host_buffer(staging);
        return Err(err);
    }

    Ok(RecordedCopy { command_buffer, staging })
}

fn record_buffer_copy<D: TransferDevice>(
    device: &D,
    context: &D::RecordingContext,
    data: &[u8],
    usage: vk::BufferUsageFlags,
) -> VkxResult<(RecordedCopy<D>, D::DeviceBuffer)> {
    if data.is_empty() {
        return Err(VkxError::invalid("buffer upload with empty payload"));
    }
    let size = data.len() as u64;

    let staging = device.create_host_buffer(data)?;
    let destination = match device.create_device_buffer(size, usage | vk::BufferUsageFlags::TRANSFER_DST) {
        Ok(destination) => destination,
        Err(err) => {
            device.destroy_host_buffer(staging);
            return Err(err);
        }
    };

    // Later submissions read the buffer without any semaphore from this copy
    let visible = BufferBarrierSpec::after_upload(usage);
    let copy = record_one_shot(device, context, staging, |command_buffer, staging| {
        device.cmd_copy_buffer(command_buffer, staging, &destination, size);
        device.cmd_buffer_barrier(command_buffer, &destination, visible);
    })?;

    Ok((copy, destination))
}

fn record_image_copy<D: TransferDevice>(
    device: &D,
    context: &D::RecordingContext,
    pixels: &[u8],
    desc: &ImageDesc,
    final_layout: ImageFinalLayout,
) -> VkxResult<(RecordedCopy<D>, D::DeviceImage)> {
    check_image_payload(pixels, desc)?;

    let staging = device.create_host_buffer(pixels)?;
    let destination = match device.create_device_image(desc) {
        Ok(destination) => destination,
        Err(err) => {
            device.destroy_host_buffer(staging);
            return Err(err);
        }
    };

    let copy = record_one_shot(device, context, staging, |command_buffer, staging| {
        device.cmd_transition_image(command_buffer, &destination, LayoutTransition::UndefinedToTransferDst);
        device.cmd_copy_buffer_to_image(command_buffer, staging, &destination, desc);
        device.cmd_transition_image(command_buffer, &destination, final_layout.transition());
    })?;

    Ok((copy, destination))
}

fn submit_with_fence<D: SyncDevice>(device: &D, command_buffer: D::CommandBuffer) -> VkxResult<D::Fence> {
    let fence = device.create_fence(false)?;
    let command_buffers = [command_buffer];
    let submission = Submission {
        waits: &[],
        command_buffers: &command_buffers,
        signals: &[],
    };
    if let Err(err) = device.submit(&submission, Some(fence)) {
        device.destroy_fence(fence);
        return Err(err);
    }
    Ok(fence)
}

/// Uploads that block until the copy has finished
pub struct StagingTransfer<'a, D: TransferDevice> {
    device: &'a D,
    context: &'a D::RecordingContext,
    timeout_ns: u64,
}

impl<'a, D: TransferDevice> StagingTransfer<'a, D> {
    /// Create an uploader recording on `context`
    pub const fn new(device: &'a D, context: &'a D::RecordingContext, timeout_ns: u64) -> Self {
        Self {
            device,
            context,
            timeout_ns,
        }
    }

    /// Upload raw bytes into a new device-local buffer
    pub fn upload_buffer(&self, data: &[u8], usage: vk::BufferUsageFlags) -> VkxResult<D::DeviceBuffer> {
        let (copy, destination) = record_buffer_copy(self.device, self.context, data, usage)?;
        let destination = self.finish(copy, destination)?;
        log::debug!("Uploaded {} bytes through staging", data.len());
        Ok(destination)
    }

    /// Upload a slice of plain-old-data values (vertices, indices, uniforms)
    pub fn upload_slice<T: Pod>(&self, values: &[T], usage: vk::BufferUsageFlags) -> VkxResult<D::DeviceBuffer> {
        self.upload_buffer(bytemuck::cast_slice(values), usage)
    }

    /// Upload tightly packed texels into a new device-local image
    pub fn upload_image(
        &self,
        pixels: &[u8],
        desc: &ImageDesc,
        final_layout: ImageFinalLayout,
    ) -> VkxResult<D::DeviceImage> {
        let (copy, destination) = record_image_copy(self.device, self.context, pixels, desc, final_layout)?;
        let destination = self.finish(copy, destination)?;
        log::debug!("Uploaded {}x{} image through staging", desc.width, desc.height);
        Ok(destination)
    }

    fn finish<T>(&self, copy: RecordedCopy<D>, destination: T) -> VkxResult<T> {
        let fence = match submit_with_fence(self.device, copy.command_buffer) {
            Ok(fence) => fence,
            Err(err) => {
                // Nothing was queued, release right away
                self.device.free_command_buffers(self.context, &[copy.command_buffer]);
                self.device.destroy_host_buffer(copy.staging);
                return Err(err);
            }
        };

        if let Err(err) = self.device.wait_fence(fence, self.timeout_ns) {
            log::error!("Staging copy did not complete: {err}");
            if !release_after_failed_wait(self.device, self.context, fence, copy) {
                // The copy may still be writing into it
                std::mem::forget(destination);
            }
            return Err(err);
        }

        self.device.destroy_fence(fence);
        self.device.free_command_buffers(self.context, &[copy.command_buffer]);
        self.device.destroy_host_buffer(copy.staging);
        Ok(destination)
    }
}

/// Fall back to idling the whole device; leak the staging memory if even that fails
///
/// Returns whether the device reached idle.
fn release_after_failed_wait<D: TransferDevice>(
    device: &D,
    context: &D::RecordingContext,
    fence: D::Fence,
    copy: RecordedCopy<D>,
) -> bool {
    match device.wait_idle() {
        Ok(()) => {
            device.destroy_fence(fence);
            device.free_command_buffers(context, &[copy.command_buffer]);
            device.destroy_host_buffer(copy.staging);
            true
        }
        Err(err) => {
            log::error!("Device did not go idle ({err}); leaking staging buffer still referenced by the GPU");
            std::mem::forget(copy.staging);
            false
        }
    }
}

struct PendingUpload<D: TransferDevice> {
    fence: D::Fence,
    copy: RecordedCopy<D>,
}

/// Uploads that return immediately and park their staging buffers
///
/// Staging memory moves into this queue together with the copy's fence and
/// is released by [`retire`](Self::retire) once the fence is signalled, or
/// by [`flush`](Self::flush), which waits for all of them.
pub struct DeferredStaging<D: TransferDevice> {
    pending: Vec<PendingUpload<D>>,
    timeout_ns: u64,
}

impl<D: TransferDevice> DeferredStaging<D> {
    /// Create an empty queue
    pub const fn new(timeout_ns: u64) -> Self {
        Self {
            pending: Vec::new(),
            timeout_ns,
        }
    }

    /// Number of uploads whose staging memory is still held
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Whether every staging buffer has been released
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queue a buffer upload
    ///
    /// The copy ends with a memory barrier towards the stages `usage` implies,
    /// so later submissions on the same queue may read the returned buffer.
    pub fn upload_buffer(
        &mut self,
        device: &D,
        context: &D::RecordingContext,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> VkxResult<D::DeviceBuffer> {
        let (copy, destination) = record_buffer_copy(device, context, data, usage)?;
        self.park(device, context, copy)?;
        Ok(destination)
    }

    /// Queue an image upload
    pub fn upload_image(
        &mut self,
        device: &D,
        context: &D::RecordingContext,
        pixels: &[u8],
        desc: &ImageDesc,
        final_layout: ImageFinalLayout,
    ) -> VkxResult<D::DeviceImage> {
        let (copy, destination) = record_image_copy(device, context, pixels, desc, final_layout)?;
        self.park(device, context, copy)?;
        Ok(destination)
    }

    /// Release staging memory of every upload whose fence is signalled
    ///
    /// Returns the number of uploads retired.
    pub fn retire(&mut self, device: &D, context: &D::RecordingContext) -> VkxResult<usize> {
        let mut retired = 0;
        let mut index = 0;
        while index < self.pending.len() {
            if device.fence_signaled(self.pending[index].fence)? {
                let upload = self.pending.swap_remove(index);
                release(device, context, upload);
                retired += 1;
            } else {
                index += 1;
            }
        }
        if retired > 0 {
            log::debug!("Retired {retired} staging uploads, {} pending", self.pending.len());
        }
        Ok(retired)
    }

    /// Wait for every pending upload and release its staging memory
    pub fn flush(&mut self, device: &D, context: &D::RecordingContext) -> VkxResult<()> {
        while let Some(upload) = self.pending.pop() {
            if let Err(err) = device.wait_fence(upload.fence, self.timeout_ns) {
                // Keep it queued so the memory is never freed under the GPU
                self.pending.push(upload);
                return Err(err);
            }
            release(device, context, upload);
        }
        Ok(())
    }

    fn park(&mut self, device: &D, context: &D::RecordingContext, copy: RecordedCopy<D>) -> VkxResult<()> {
        match submit_with_fence(device, copy.command_buffer) {
            Ok(fence) => {
                self.pending.push(PendingUpload { fence, copy });
                Ok(())
            }
            Err(err) => {
                device.free_command_buffers(context, &[copy.command_buffer]);
                device.destroy_host_buffer(copy.staging);
                Err(err)
            }
        }
    }
}

fn release<D: TransferDevice>(device: &D, context: &D::RecordingContext, upload: PendingUpload<D>) {
    device.destroy_fence(upload.fence);
    device.free_command_buffers(context, &[upload.copy.command_buffer]);
    device.destroy_host_buffer(upload.copy.staging);
}

impl<D: TransferDevice> Drop for DeferredStaging<D> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            log::error!(
                "DeferredStaging dropped with {} uploads pending; leaking their staging buffers",
                self.pending.len()
            );
            for upload in self.pending.drain(..) {
                std::mem::forget(upload);
            }
        }
    }
}
