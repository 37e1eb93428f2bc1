//! Image view and framebuffer for one swapchain image

use ash::{vk, Device};

use crate::error::{VkxError, VkxResult};
use crate::targets::TargetFactory;
use crate::vulkan::memory::color_subresource_range;
use crate::vulkan::render_pass::RenderPass;
use crate::vulkan::swapchain::Swapchain;

/// View and framebuffer over a swapchain image
pub struct ImageTarget {
    device: Device,
    image: vk::Image,
    view: vk::ImageView,
    framebuffer: vk::Framebuffer,
}

impl ImageTarget {
    /// Swapchain image the target renders into
    pub const fn image(&self) -> vk::Image {
        self.image
    }

    /// Color view of the image
    pub const fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Framebuffer compatible with the base render pass
    pub const fn framebuffer(&self) -> vk::Framebuffer {
        self.framebuffer
    }
}

impl Drop for ImageTarget {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_framebuffer(self.framebuffer, None);
            self.device.destroy_image_view(self.view, None);
        }
    }
}

/// Builds [`ImageTarget`]s for the images of a swapchain
pub struct ImageTargetFactory<'a> {
    device: &'a Device,
    swapchain: &'a Swapchain,
    render_pass: &'a RenderPass,
}

impl<'a> ImageTargetFactory<'a> {
    /// Factory for `swapchain`'s images and `render_pass`
    pub const fn new(device: &'a Device, swapchain: &'a Swapchain, render_pass: &'a RenderPass) -> Self {
        Self {
            device,
            swapchain,
            render_pass,
        }
    }
}

impl TargetFactory<ImageTarget> for ImageTargetFactory<'_> {
    fn create_target(&self, image_index: usize) -> VkxResult<ImageTarget> {
        let image = *self
            .swapchain
            .images()
            .get(image_index)
            .ok_or_else(|| VkxError::invalid(format!("swapchain has no image {image_index}")))?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.swapchain.format().format)
            .components(vk::ComponentMapping::default())
            .subresource_range(color_subresource_range());
        let view = unsafe { self.device.create_image_view(&view_info, None).map_err(VkxError::Api)? };

        let extent = self.swapchain.extent();
        let attachments = [view];
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(self.render_pass.handle())
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let framebuffer = match unsafe { self.device.create_framebuffer(&framebuffer_info, None) } {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                unsafe { self.device.destroy_image_view(view, None) };
                return Err(VkxError::Api(err));
            }
        };

        Ok(ImageTarget {
            device: self.device.clone(),
            image,
            view,
            framebuffer,
        })
    }

    fn destroy_target(&self, target: ImageTarget) {
        drop(target);
    }
}
