//! Buffers and images backed by dedicated allocations

use ash::{vk, Device};

use crate::backend::ImageDesc;
use crate::error::{VkxError, VkxResult};

/// Pick the first memory type allowed by `type_bits` that has all `properties`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> VkxResult<u32> {
    memory_properties.memory_types[..memory_properties.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| {
            type_bits & (1 << index) != 0 && memory_type.property_flags.contains(properties)
        })
        .map(|(index, _)| index as u32)
        .ok_or(VkxError::NoSuitableMemoryType)
}

fn allocate(
    device: &Device,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> VkxResult<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(memory_properties, requirements.memory_type_bits, properties)?;
    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);
    unsafe { device.allocate_memory(&alloc_info, None).map_err(VkxError::Api) }
}

/// Buffer wrapper with memory management
pub struct Buffer {
    device: Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
}

impl Buffer {
    /// Create a buffer and bind fresh memory with `properties`
    pub fn new(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> VkxResult<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&buffer_info, None).map_err(VkxError::Api)? };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory = match allocate(&device, memory_properties, requirements, properties) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        if let Err(err) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(VkxError::Api(err));
        }

        Ok(Self {
            device,
            buffer,
            memory,
            size,
        })
    }

    /// Host-visible, coherent buffer holding a copy of `data`
    pub fn new_host_visible(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> VkxResult<Self> {
        let buffer = Self::new(
            device,
            memory_properties,
            data.len() as vk::DeviceSize,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        buffer.write_bytes(data)?;
        Ok(buffer)
    }

    /// Map, copy and unmap; the memory must be host visible
    pub fn write_bytes(&self, data: &[u8]) -> VkxResult<()> {
        if data.len() as vk::DeviceSize > self.size {
            return Err(VkxError::invalid(format!(
                "write of {} bytes into {}-byte buffer",
                data.len(),
                self.size
            )));
        }
        unsafe {
            let mapped = self
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .map_err(VkxError::Api)?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.cast::<u8>(), data.len());
            self.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Buffer handle
    pub const fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size in bytes
    pub const fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// 2D single-mip image with its own memory
pub struct Image {
    device: Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    desc: ImageDesc,
}

impl Image {
    /// Create a device-local image; `TRANSFER_DST` is always added to the usage
    pub fn new(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        desc: &ImageDesc,
    ) -> VkxResult<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage | vk::ImageUsageFlags::TRANSFER_DST)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let image = unsafe { device.create_image(&image_info, None).map_err(VkxError::Api)? };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory = match allocate(&device, memory_properties, requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_image(image, None) };
                return Err(err);
            }
        };

        if let Err(err) = unsafe { device.bind_image_memory(image, memory, 0) } {
            unsafe {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
            }
            return Err(VkxError::Api(err));
        }

        Ok(Self {
            device,
            image,
            memory,
            desc: *desc,
        })
    }

    /// Image handle
    pub const fn handle(&self) -> vk::Image {
        self.image
    }

    /// Description the image was created from
    pub const fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    /// Extent as a Vulkan 2D extent
    pub const fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.desc.width,
            height: self.desc.height,
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// Subresource range covering the single color mip and layer
pub const fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}
