//! Physical device selection and the logical device
//!
//! [`GraphicsDevice`] owns the `ash::Device` and its queues and implements
//! the backend traits, so `FrameSync` and the staging helpers run on it
//! unchanged.

use std::collections::HashSet;
use std::ffi::CStr;

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::{vk, Device};

use crate::backend::{
    BufferBarrierSpec, CommandDevice, ImageDesc, LayoutTransition, Submission, SyncDevice, TransferDevice,
};
use crate::error::{VkxError, VkxResult};
use crate::features::{resolve_features, FeatureRequest};
use crate::vulkan::commands::{record_image_barrier, CommandRecorder, RecordingContext};
use crate::vulkan::instance::{Surface, VulkanInstance};
use crate::vulkan::memory::{Buffer, Image};

/// Physical device selection and capabilities
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported device features
    pub features: vk::PhysicalDeviceFeatures,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Index of the graphics queue family
    pub graphics_family: u32,
    /// Index of the presentation queue family
    pub present_family: u32,
}

impl PhysicalDeviceInfo {
    /// Select the first GPU that can render and present to `surface` and
    /// supports every required feature
    pub fn select_suitable_device(
        instance: &VulkanInstance,
        surface: &Surface,
        requests: &[FeatureRequest],
    ) -> VkxResult<(Self, vk::PhysicalDeviceFeatures)> {
        let devices = unsafe { instance.raw().enumerate_physical_devices().map_err(VkxError::Api)? };

        let mut last_error = None;
        for device in devices {
            let info = match Self::evaluate_device(instance, device, surface) {
                Ok(info) => info,
                Err(err) => {
                    log::debug!("Skipping physical device {device:?}: {err}");
                    last_error = Some(err);
                    continue;
                }
            };
            match resolve_features(&info.features, requests) {
                Ok(enabled) => {
                    log::info!("Selected GPU: {}", info.name());
                    return Ok((info, enabled));
                }
                Err(err) => {
                    log::info!("GPU {} lacks required features: {err}", info.name());
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| VkxError::InitializationFailed("No suitable GPU found".to_string())))
    }

    fn evaluate_device(instance: &VulkanInstance, device: vk::PhysicalDevice, surface: &Surface) -> VkxResult<Self> {
        let raw = instance.raw();
        let properties = unsafe { raw.get_physical_device_properties(device) };
        let features = unsafe { raw.get_physical_device_features(device) };
        let memory_properties = unsafe { raw.get_physical_device_memory_properties(device) };
        let queue_families = unsafe { raw.get_physical_device_queue_family_properties(device) };

        let mut graphics_family = None;
        let mut present_family = None;
        for (index, family) in queue_families.iter().enumerate() {
            let index = index as u32;
            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
                graphics_family = Some(index);
            }
            if present_family.is_none() && surface.supports_present(device, index)? {
                present_family = Some(index);
            }
            if graphics_family.is_some() && present_family.is_some() {
                break;
            }
        }

        let graphics_family = graphics_family
            .ok_or_else(|| VkxError::InitializationFailed("No graphics queue family found".to_string()))?;
        let present_family = present_family
            .ok_or_else(|| VkxError::InitializationFailed("No present queue family found".to_string()))?;

        let extensions = unsafe { raw.enumerate_device_extension_properties(device).map_err(VkxError::Api)? };
        let has_swapchain = extensions.iter().any(|available| {
            let name = unsafe { CStr::from_ptr(available.extension_name.as_ptr()) };
            name == SwapchainLoader::name()
        });
        if !has_swapchain {
            return Err(VkxError::InitializationFailed(
                "Required device extensions not supported".to_string(),
            ));
        }

        // A surface without formats or present modes cannot host a swapchain
        if surface.formats(device)?.is_empty() || surface.present_modes(device)?.is_empty() {
            return Err(VkxError::InitializationFailed("Surface has no formats or present modes".to_string()));
        }

        Ok(Self {
            device,
            properties,
            features,
            memory_properties,
            graphics_family,
            present_family,
        })
    }

    /// Device name reported by the driver
    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Logical device, its queues and the features enabled on it
pub struct GraphicsDevice {
    device: Device,
    physical: PhysicalDeviceInfo,
    enabled_features: vk::PhysicalDeviceFeatures,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
}

impl GraphicsDevice {
    /// Pick a GPU for `surface` and create the logical device
    pub fn new(instance: &VulkanInstance, surface: &Surface, requests: &[FeatureRequest]) -> VkxResult<Self> {
        let (physical, enabled_features) = PhysicalDeviceInfo::select_suitable_device(instance, surface, requests)?;

        let unique_families: HashSet<u32> = [physical.graphics_family, physical.present_family].into_iter().collect();
        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let required_extensions = [SwapchainLoader::name().as_ptr()];
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&required_extensions)
            .enabled_features(&enabled_features);

        let device = unsafe {
            instance
                .raw()
                .create_device(physical.device, &create_info, None)
                .map_err(VkxError::Api)?
        };

        let graphics_queue = unsafe { device.get_device_queue(physical.graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(physical.present_family, 0) };
        log::debug!(
            "Created logical device (graphics family {}, present family {})",
            physical.graphics_family,
            physical.present_family
        );

        Ok(Self {
            device,
            physical,
            enabled_features,
            graphics_queue,
            present_queue,
        })
    }

    /// Raw `ash` device
    pub const fn raw(&self) -> &Device {
        &self.device
    }

    /// Selected physical device
    pub const fn physical(&self) -> &PhysicalDeviceInfo {
        &self.physical
    }

    /// Features enabled at device creation
    pub const fn enabled_features(&self) -> &vk::PhysicalDeviceFeatures {
        &self.enabled_features
    }

    /// Graphics queue family index
    pub const fn graphics_family(&self) -> u32 {
        self.physical.graphics_family
    }

    /// Queue used for presentation
    pub const fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    /// Record, submit and wait for a single-use command buffer
    ///
    /// On a failed wait the device is idled before the command buffer is
    /// freed; if that also fails the command buffer is left allocated.
    pub fn execute_one_shot<F>(&self, context: &RecordingContext, timeout_ns: u64, record: F) -> VkxResult<()>
    where
        F: FnOnce(&mut CommandRecorder) -> VkxResult<()>,
    {
        let command_buffer = self.allocate_command_buffers(context, 1)?[0];

        let recorded = CommandRecorder::begin(&self.device, command_buffer).and_then(|mut recorder| {
            record(&mut recorder)?;
            recorder.end()
        });
        if let Err(err) = recorded {
            self.free_command_buffers(context, &[command_buffer]);
            return Err(err);
        }

        let fence = match self.create_fence(false) {
            Ok(fence) => fence,
            Err(err) => {
                self.free_command_buffers(context, &[command_buffer]);
                return Err(err);
            }
        };
        let command_buffers = [command_buffer];
        let submission = Submission {
            waits: &[],
            command_buffers: &command_buffers,
            signals: &[],
        };
        if let Err(err) = self.submit(&submission, Some(fence)) {
            self.destroy_fence(fence);
            self.free_command_buffers(context, &[command_buffer]);
            return Err(err);
        }

        let waited = self.wait_fence(fence, timeout_ns);
        if let Err(err) = &waited {
            log::error!("One-shot command buffer did not complete: {err}");
            if let Err(idle_err) = self.wait_idle() {
                log::error!("Device did not go idle ({idle_err}); leaving command buffer allocated");
                return waited;
            }
        }

        self.destroy_fence(fence);
        self.free_command_buffers(context, &[command_buffer]);
        waited
    }
}

impl Drop for GraphicsDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

impl SyncDevice for GraphicsDevice {
    type Semaphore = vk::Semaphore;
    type Fence = vk::Fence;
    type CommandBuffer = vk::CommandBuffer;

    fn create_semaphore(&self) -> VkxResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&create_info, None).map_err(VkxError::Api) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self, signaled: bool) -> VkxResult<vk::Fence> {
        let flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&create_info, None).map_err(VkxError::Api) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkxResult<()> {
        unsafe {
            self.device
                .wait_for_fences(&[fence], true, timeout_ns)
                .map_err(|result| match result {
                    vk::Result::TIMEOUT => VkxError::FenceTimeout { timeout_ns },
                    other => VkxError::Api(other),
                })
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkxResult<()> {
        unsafe { self.device.reset_fences(&[fence]).map_err(VkxError::Api) }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> VkxResult<bool> {
        unsafe { self.device.get_fence_status(fence).map_err(VkxError::Api) }
    }

    fn submit(
        &self,
        submission: &Submission<'_, vk::Semaphore, vk::CommandBuffer>,
        fence: Option<vk::Fence>,
    ) -> VkxResult<()> {
        let wait_semaphores: Vec<vk::Semaphore> = submission.waits.iter().map(|wait| wait.semaphore).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> = submission.waits.iter().map(|wait| wait.stage).collect();

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(submission.command_buffers)
            .signal_semaphores(submission.signals)
            .build();

        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], fence.unwrap_or_default())
                .map_err(VkxError::Api)
        }
    }

    fn wait_idle(&self) -> VkxResult<()> {
        unsafe { self.device.device_wait_idle().map_err(VkxError::Api) }
    }
}

impl CommandDevice for GraphicsDevice {
    type RecordingContext = RecordingContext;

    fn allocate_command_buffers(&self, context: &RecordingContext, count: u32) -> VkxResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(context.handle())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.device.allocate_command_buffers(&alloc_info).map_err(VkxError::Api) }
    }

    fn free_command_buffers(&self, context: &RecordingContext, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() {
            unsafe { self.device.free_command_buffers(context.handle(), buffers) };
        }
    }

    fn begin_one_shot(&self, command_buffer: vk::CommandBuffer) -> VkxResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(VkxError::Api)
        }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkxResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer).map_err(VkxError::Api) }
    }
}

impl TransferDevice for GraphicsDevice {
    type HostBuffer = Buffer;
    type DeviceBuffer = Buffer;
    type DeviceImage = Image;

    fn create_host_buffer(&self, data: &[u8]) -> VkxResult<Buffer> {
        Buffer::new_host_visible(
            self.device.clone(),
            &self.physical.memory_properties,
            data,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )
    }

    fn destroy_host_buffer(&self, buffer: Buffer) {
        drop(buffer);
    }

    fn create_device_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> VkxResult<Buffer> {
        Buffer::new(
            self.device.clone(),
            &self.physical.memory_properties,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
    }

    fn create_device_image(&self, desc: &ImageDesc) -> VkxResult<Image> {
        Image::new(self.device.clone(), &self.physical.memory_properties, desc)
    }

    fn cmd_copy_buffer(&self, command_buffer: vk::CommandBuffer, src: &Buffer, dst: &Buffer, size: u64) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            self.device
                .cmd_copy_buffer(command_buffer, src.handle(), dst.handle(), &[region]);
        }
    }

    fn cmd_buffer_barrier(&self, command_buffer: vk::CommandBuffer, buffer: &Buffer, barrier: BufferBarrierSpec) {
        let buffer_barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer.handle())
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();

        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                barrier.src_stage,
                barrier.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[buffer_barrier],
                &[],
            );
        }
    }

    fn cmd_copy_buffer_to_image(&self, command_buffer: vk::CommandBuffer, src: &Buffer, dst: &Image, desc: &ImageDesc) {
        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D::default())
            .image_extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .build();

        unsafe {
            self.device.cmd_copy_buffer_to_image(
                command_buffer,
                src.handle(),
                dst.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    fn cmd_transition_image(&self, command_buffer: vk::CommandBuffer, image: &Image, transition: LayoutTransition) {
        record_image_barrier(&self.device, command_buffer, image.handle(), transition.barrier());
    }
}
