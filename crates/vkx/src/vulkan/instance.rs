//! Vulkan instance, validation messenger and window surface

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr;
use ash::{vk, Entry, Instance};

use crate::error::{VkxError, VkxResult};
use crate::window::Window;

const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

fn c_string(value: &str) -> VkxResult<CString> {
    CString::new(value).map_err(|_| VkxError::InitializationFailed(format!("string contains NUL: {value:?}")))
}

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    entry: Entry,
    instance: Instance,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create an instance with the extensions the window needs
    ///
    /// With `enable_validation`, the Khronos validation layer is enabled and
    /// its messages are forwarded to `log`.
    pub fn new(window: &Window, app_name: &str, enable_validation: bool) -> VkxResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VkxError::InitializationFailed(format!("Failed to load Vulkan: {e:?}")))?;

        let app_name_cstr = c_string(app_name)?;
        let engine_name_cstr = c_string("vkx")?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let required_extensions = window.required_instance_extensions()?;
        let cstr_extensions = required_extensions
            .iter()
            .map(|ext| c_string(ext))
            .collect::<VkxResult<Vec<_>>>()?;
        let mut extensions: Vec<*const c_char> = cstr_extensions.iter().map(|ext| ext.as_ptr()).collect();

        let validation = enable_validation && Self::validation_layer_available(&entry);
        if enable_validation && !validation {
            log::warn!("{VALIDATION_LAYER} requested but not installed; continuing without validation");
        }

        let layer_names = if validation { vec![c_string(VALIDATION_LAYER)?] } else { Vec::new() };
        let layer_name_ptrs: Vec<*const c_char> = layer_names.iter().map(|name| name.as_ptr()).collect();
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_name_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None).map_err(VkxError::Api)? };

        let debug = if validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match Self::setup_debug_messenger(&debug_utils) {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(err) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(err);
                }
            }
        } else {
            None
        };

        log::debug!(
            "Created Vulkan instance with {} extensions, validation {}",
            extensions.len(),
            if validation { "on" } else { "off" }
        );
        Ok(Self { entry, instance, debug })
    }

    fn validation_layer_available(entry: &Entry) -> bool {
        let Ok(layers) = entry.enumerate_instance_layer_properties() else {
            return false;
        };
        layers.iter().any(|layer| {
            let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
            name.to_str() == Ok(VALIDATION_LAYER)
        })
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VkxResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(VkxError::Api)
        }
    }

    /// Vulkan entry point
    pub const fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Raw instance
    pub const fn raw(&self) -> &Instance {
        &self.instance
    }

    /// Whether the validation messenger is installed
    pub const fn validation_enabled(&self) -> bool {
        self.debug.is_some()
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {message_type:?} - {message}");
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {message_type:?} - {message}");
    } else {
        log::debug!("[Vulkan] {message_type:?} - {message}");
    }

    vk::FALSE
}

/// Window surface with RAII cleanup
///
/// Must be dropped before the [`VulkanInstance`] it was created from.
pub struct Surface {
    loader: khr::Surface,
    surface: vk::SurfaceKHR,
}

impl Surface {
    /// Create a surface for `window`
    pub fn new(instance: &VulkanInstance, window: &Window) -> VkxResult<Self> {
        let loader = khr::Surface::new(instance.entry(), instance.raw());
        let surface = window.create_surface(instance.raw().handle())?;
        Ok(Self { loader, surface })
    }

    /// Surface handle
    pub const fn handle(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Surface extension loader
    pub const fn loader(&self) -> &khr::Surface {
        &self.loader
    }

    /// Surface capabilities for a physical device
    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> VkxResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)
                .map_err(VkxError::Api)
        }
    }

    /// Surface formats for a physical device
    pub fn formats(&self, physical_device: vk::PhysicalDevice) -> VkxResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_formats(physical_device, self.surface)
                .map_err(VkxError::Api)
        }
    }

    /// Present modes for a physical device
    pub fn present_modes(&self, physical_device: vk::PhysicalDevice) -> VkxResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)
                .map_err(VkxError::Api)
        }
    }

    /// Whether a queue family can present to this surface
    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, queue_family_index: u32) -> VkxResult<bool> {
        unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, queue_family_index, self.surface)
                .map_err(VkxError::Api)
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.surface, None);
        }
    }
}
