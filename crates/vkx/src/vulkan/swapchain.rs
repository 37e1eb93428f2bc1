//! Vulkan swapchain management
//!
//! Owns the presentable images only. Views and framebuffers over them live
//! in [`SwapchainTargets`](crate::targets::SwapchainTargets) and must be
//! released before [`Swapchain::recreate`] or drop.

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::vk;

use crate::backend::{AcquireOutcome, PresentOutcome, PresentationEngine};
use crate::config::PresentModePreference;
use crate::error::{VkxError, VkxResult};
use crate::vulkan::device::GraphicsDevice;
use crate::vulkan::instance::{Surface, VulkanInstance};

/// Prefer `B8G8R8A8_SRGB` with an sRGB color space, else the first format offered
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|sf| sf.format == vk::Format::B8G8R8A8_SRGB && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first())
        .copied()
}

/// The preferred mode if the surface offers it, FIFO otherwise
pub fn choose_present_mode(available: &[vk::PresentModeKHR], preference: PresentModePreference) -> vk::PresentModeKHR {
    let wanted = match preference {
        PresentModePreference::Fifo => return vk::PresentModeKHR::FIFO,
        PresentModePreference::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentModePreference::Immediate => vk::PresentModeKHR::IMMEDIATE,
    };
    if available.contains(&wanted) {
        wanted
    } else {
        log::info!("Present mode {wanted:?} unavailable, using FIFO");
        vk::PresentModeKHR::FIFO
    }
}

/// Sharing mode and queue families for swapchain images
///
/// Images rendered on one family and presented on another are shared
/// concurrently so no ownership transfer is needed.
pub fn image_sharing(graphics_family: u32, present_family: u32) -> (vk::SharingMode, Vec<u32>) {
    if graphics_family == present_family {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        log::debug!("Sharing swapchain images between queue families {graphics_family} and {present_family}");
        (vk::SharingMode::CONCURRENT, vec![graphics_family, present_family])
    }
}

/// Surface's current extent, or the window size clamped to the allowed range
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window_extent: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: window_extent
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: window_extent
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum when there is one
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        desired.min(caps.max_image_count)
    } else {
        desired
    }
}

/// Swapchain management wrapper with RAII cleanup
pub struct Swapchain {
    loader: SwapchainLoader,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    usage: vk::ImageUsageFlags,
    present_queue: vk::Queue,
}

impl Swapchain {
    /// Create a swapchain sized to `window_extent`
    pub fn new(
        instance: &VulkanInstance,
        device: &GraphicsDevice,
        surface: &Surface,
        window_extent: vk::Extent2D,
        preference: PresentModePreference,
    ) -> VkxResult<Self> {
        let loader = SwapchainLoader::new(instance.raw(), device.raw());
        let mut swapchain = Self {
            loader,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            usage: vk::ImageUsageFlags::empty(),
            present_queue: device.present_queue(),
        };
        swapchain.build(device, surface, window_extent, preference)?;
        Ok(swapchain)
    }

    /// Replace the swapchain, handing the old one to the driver as `old_swapchain`
    ///
    /// Every view or framebuffer over the old images must already be destroyed.
    pub fn recreate(
        &mut self,
        device: &GraphicsDevice,
        surface: &Surface,
        window_extent: vk::Extent2D,
        preference: PresentModePreference,
    ) -> VkxResult<()> {
        self.build(device, surface, window_extent, preference)
    }

    fn build(
        &mut self,
        device: &GraphicsDevice,
        surface: &Surface,
        window_extent: vk::Extent2D,
        preference: PresentModePreference,
    ) -> VkxResult<()> {
        let physical_device = device.physical().device;
        let caps = surface.capabilities(physical_device)?;
        let format = choose_surface_format(&surface.formats(physical_device)?)
            .ok_or_else(|| VkxError::InitializationFailed("Surface reports no formats".to_string()))?;
        let present_mode = choose_present_mode(&surface.present_modes(physical_device)?, preference);
        let extent = choose_extent(&caps, window_extent);
        let image_count = choose_image_count(&caps);

        let mut usage = vk::ImageUsageFlags::COLOR_ATTACHMENT;
        if caps.supported_usage_flags.contains(vk::ImageUsageFlags::TRANSFER_DST) {
            usage |= vk::ImageUsageFlags::TRANSFER_DST;
        } else {
            log::warn!("Swapchain images cannot be transfer destinations on this surface");
        }

        let (sharing_mode, queue_families) =
            image_sharing(device.physical().graphics_family, device.physical().present_family);

        let old_swapchain = self.swapchain;
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(usage)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&queue_families)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { self.loader.create_swapchain(&create_info, None).map_err(VkxError::Api)? };

        // The old swapchain is retired either way once it was passed in
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(old_swapchain, None) };
            self.swapchain = vk::SwapchainKHR::null();
            self.images.clear();
        }

        let images = match unsafe { self.loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(err) => {
                unsafe { self.loader.destroy_swapchain(swapchain, None) };
                return Err(VkxError::Api(err));
            }
        };

        log::info!(
            "Swapchain {}x{} with {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            images.len(),
            format.format,
            present_mode
        );

        self.swapchain = swapchain;
        self.images = images;
        self.format = format;
        self.extent = extent;
        self.present_mode = present_mode;
        self.usage = usage;
        Ok(())
    }

    /// Swapchain extent
    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Surface format
    pub const fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Present mode in use
    pub const fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Presentable images
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// Whether images can be blit/copy destinations
    pub const fn supports_transfer_dst(&self) -> bool {
        self.usage.contains(vk::ImageUsageFlags::TRANSFER_DST)
    }

    /// Swapchain handle
    pub const fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }
}

impl PresentationEngine<GraphicsDevice> for Swapchain {
    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn acquire_next_image(&self, signal: vk::Semaphore, timeout_ns: u64) -> VkxResult<AcquireOutcome> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, timeout_ns, signal, vk::Fence::null())
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired { image_index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Err(VkxError::FenceTimeout { timeout_ns }),
            Err(err) => Err(VkxError::Api(err)),
        }
    }

    fn present(&self, image_index: u32, wait: vk::Semaphore) -> VkxResult<PresentOutcome> {
        let wait_semaphores = [wait];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(self.present_queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(err) => Err(VkxError::Api(err)),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn test_srgb_format_preferred() {
        let formats = [format(vk::Format::R8G8B8A8_UNORM), format(vk::Format::B8G8R8A8_SRGB)];
        assert_eq!(choose_surface_format(&formats).unwrap().format, vk::Format::B8G8R8A8_SRGB);

        let fallback = [format(vk::Format::R8G8B8A8_UNORM)];
        assert_eq!(choose_surface_format(&fallback).unwrap().format, vk::Format::R8G8B8A8_UNORM);
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn test_image_sharing_by_queue_families() {
        assert_eq!(image_sharing(0, 0), (vk::SharingMode::EXCLUSIVE, Vec::new()));
        assert_eq!(image_sharing(0, 2), (vk::SharingMode::CONCURRENT, vec![0, 2]));
    }

    #[test]
    fn test_present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&available, PresentModePreference::Mailbox),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&available, PresentModePreference::Immediate),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&available, PresentModePreference::Fifo),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_extent_clamped_when_surface_undefined() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };
        let extent = choose_extent(
            &caps,
            vk::Extent2D {
                width: 4000,
                height: 600,
            },
        );
        assert_eq!((extent.width, extent.height), (1920, 600));
    }

    #[test]
    fn test_current_extent_wins() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        let extent = choose_extent(
            &caps,
            vk::Extent2D {
                width: 1280,
                height: 720,
            },
        );
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn test_image_count_bounds() {
        let unbounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&unbounded), 3);

        let capped = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 2,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capped), 2);
    }
}
