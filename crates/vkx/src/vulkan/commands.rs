//! Command pools and command buffer recording
//!
//! A [`RecordingContext`] owns one command pool and cannot leave the thread
//! that created it; every allocation names the context explicitly.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use ash::{vk, Device};

use crate::backend::BarrierSpec;
use crate::error::{VkxError, VkxResult};
use crate::vulkan::memory::color_subresource_range;

/// Command pool owned by the thread that created it
///
/// Must be dropped before the [`GraphicsDevice`](super::GraphicsDevice) it
/// was created from.
pub struct RecordingContext {
    device: Device,
    command_pool: vk::CommandPool,
    _not_send: PhantomData<*const ()>,
}

impl RecordingContext {
    /// Create a pool whose command buffers can be reset individually
    pub fn new(device: &super::GraphicsDevice) -> VkxResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.graphics_family());

        let raw = device.raw().clone();
        let command_pool = unsafe { raw.create_command_pool(&pool_create_info, None).map_err(VkxError::Api)? };
        log::debug!("Created command pool {command_pool:?}");

        Ok(Self {
            device: raw,
            command_pool,
            _not_send: PhantomData,
        })
    }

    /// Command pool handle
    pub const fn handle(&self) -> vk::CommandPool {
        self.command_pool
    }
}

impl Drop for RecordingContext {
    fn drop(&mut self) {
        unsafe {
            // Destroying the pool frees its command buffers, which must be idle
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

pub(crate) fn record_image_barrier(device: &Device, command_buffer: vk::CommandBuffer, image: vk::Image, barrier: BarrierSpec) {
    let image_barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(barrier.old_layout)
        .new_layout(barrier.new_layout)
        .src_access_mask(barrier.src_access)
        .dst_access_mask(barrier.dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_subresource_range())
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            barrier.src_stage,
            barrier.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[image_barrier],
        );
    }
}

/// Records into one command buffer between `begin` and `end`
pub struct CommandRecorder {
    command_buffer: vk::CommandBuffer,
    device: Device,
    recording: bool,
    in_render_pass: bool,
}

impl CommandRecorder {
    /// Begin a one-time-submit recording, implicitly resetting the buffer
    pub fn begin(device: &Device, command_buffer: vk::CommandBuffer) -> VkxResult<Self> {
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(VkxError::Api)?;
        }

        Ok(Self {
            command_buffer,
            device: device.clone(),
            recording: true,
            in_render_pass: false,
        })
    }

    /// Command buffer being recorded
    pub const fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Raw device, for commands the recorder does not wrap
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Whether a render pass is open
    pub const fn in_render_pass(&self) -> bool {
        self.in_render_pass
    }

    /// Begin a render pass; it ends when the returned guard is dropped
    pub fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) -> VkxResult<ActiveRenderPass<'_>> {
        if !self.recording {
            return Err(VkxError::invalid("Command buffer not recording"));
        }
        if self.in_render_pass {
            return Err(VkxError::invalid("Render pass already active"));
        }

        let render_pass_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(clear_values);

        unsafe {
            self.device
                .cmd_begin_render_pass(self.command_buffer, &render_pass_begin, vk::SubpassContents::INLINE);
        }
        self.in_render_pass = true;

        Ok(ActiveRenderPass { recorder: self })
    }

    /// Full-extent viewport and scissor
    pub fn set_viewport(&mut self, extent: vk::Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };
        unsafe {
            self.device.cmd_set_viewport(self.command_buffer, 0, &[viewport]);
            self.device.cmd_set_scissor(self.command_buffer, 0, &[scissor]);
        }
    }

    /// Clear a rectangle of color attachment 0; only valid inside a render pass
    pub fn clear_color_rect(&mut self, color: [f32; 4], rect: vk::Rect2D) -> VkxResult<()> {
        if !self.in_render_pass {
            return Err(VkxError::invalid("clear_color_rect outside a render pass"));
        }
        let attachment = vk::ClearAttachment {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            color_attachment: 0,
            clear_value: vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            },
        };
        let clear_rect = vk::ClearRect {
            rect,
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe {
            self.device
                .cmd_clear_attachments(self.command_buffer, &[attachment], &[clear_rect]);
        }
        Ok(())
    }

    /// Image layout barrier on the single color subresource
    pub fn image_barrier(&mut self, image: vk::Image, barrier: BarrierSpec) -> VkxResult<()> {
        if self.in_render_pass {
            return Err(VkxError::invalid("image barrier inside a render pass"));
        }
        record_image_barrier(&self.device, self.command_buffer, image, barrier);
        Ok(())
    }

    /// Blit `src_rect` of `src` onto `dst_rect` of `dst`
    ///
    /// `src` must be in `TRANSFER_SRC_OPTIMAL` and `dst` in
    /// `TRANSFER_DST_OPTIMAL`.
    pub fn blit(
        &mut self,
        src: vk::Image,
        src_rect: vk::Rect2D,
        dst: vk::Image,
        dst_rect: vk::Rect2D,
        filter: vk::Filter,
    ) -> VkxResult<()> {
        if self.in_render_pass {
            return Err(VkxError::invalid("blit inside a render pass"));
        }
        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let region = vk::ImageBlit {
            src_subresource: layers,
            src_offsets: rect_corners(src_rect),
            dst_subresource: layers,
            dst_offsets: rect_corners(dst_rect),
        };
        unsafe {
            self.device.cmd_blit_image(
                self.command_buffer,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                filter,
            );
        }
        Ok(())
    }

    /// Finish recording
    pub fn end(mut self) -> VkxResult<vk::CommandBuffer> {
        if self.in_render_pass {
            return Err(VkxError::invalid("Command buffer ended inside a render pass"));
        }
        unsafe {
            self.device
                .end_command_buffer(self.command_buffer)
                .map_err(VkxError::Api)?;
        }
        self.recording = false;
        Ok(self.command_buffer)
    }
}

fn rect_corners(rect: vk::Rect2D) -> [vk::Offset3D; 2] {
    [
        vk::Offset3D {
            x: rect.offset.x,
            y: rect.offset.y,
            z: 0,
        },
        vk::Offset3D {
            x: rect.offset.x + rect.extent.width as i32,
            y: rect.offset.y + rect.extent.height as i32,
            z: 1,
        },
    ]
}

/// Open render pass; ends it on drop
pub struct ActiveRenderPass<'a> {
    recorder: &'a mut CommandRecorder,
}

impl Deref for ActiveRenderPass<'_> {
    type Target = CommandRecorder;

    fn deref(&self) -> &CommandRecorder {
        self.recorder
    }
}

impl DerefMut for ActiveRenderPass<'_> {
    fn deref_mut(&mut self) -> &mut CommandRecorder {
        self.recorder
    }
}

impl Drop for ActiveRenderPass<'_> {
    fn drop(&mut self) {
        unsafe {
            self.recorder.device.cmd_end_render_pass(self.recorder.command_buffer);
        }
        self.recorder.in_render_pass = false;
    }
}
