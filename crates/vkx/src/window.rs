//! Window management using GLFW
//!
//! Creates a window without a client API, reports framebuffer resizes and
//! hands out the instance extensions and surface Vulkan needs.

use ash::vk;
use thiserror::Error;

use crate::config::WindowConfig;

/// Window management errors
#[derive(Error, Debug)]
pub enum WindowError {
    /// `glfwInit` failed
    #[error("GLFW initialization failed")]
    InitializationFailed,

    /// The window could not be created
    #[error("Window creation failed")]
    CreationFailed,

    /// GLFW reported an error after initialization
    #[error("GLFW error: {0}")]
    GlfwError(String),
}

/// Result type for window operations
pub type WindowResult<T> = Result<T, WindowError>;

/// What happened since the last [`Window::process_events`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowEvents {
    /// The framebuffer changed size
    pub resized: bool,
    /// The user asked to close the window (close button or Escape)
    pub close_requested: bool,
}

/// GLFW window wrapper
pub struct Window {
    glfw: glfw::Glfw,
    window: glfw::PWindow,
    events: glfw::GlfwReceiver<(f64, glfw::WindowEvent)>,
}

impl Window {
    /// Create a window titled `title` sized by `config`
    pub fn new(title: &str, config: &WindowConfig) -> WindowResult<Self> {
        let mut glfw = glfw::init(glfw::fail_on_errors).map_err(|_| WindowError::InitializationFailed)?;

        if !glfw.vulkan_supported() {
            return Err(WindowError::GlfwError("Vulkan loader not found".to_string()));
        }

        // No OpenGL context
        glfw.window_hint(glfw::WindowHint::ClientApi(glfw::ClientApiHint::NoApi));
        glfw.window_hint(glfw::WindowHint::Resizable(config.resizable));

        let (mut window, events) = glfw
            .create_window(config.width, config.height, title, glfw::WindowMode::Windowed)
            .ok_or(WindowError::CreationFailed)?;

        window.set_key_polling(true);
        window.set_close_polling(true);
        window.set_framebuffer_size_polling(true);

        log::debug!("Created {}x{} window '{title}'", config.width, config.height);
        Ok(Self { glfw, window, events })
    }

    /// Whether the window has been asked to close
    pub fn should_close(&self) -> bool {
        self.window.should_close()
    }

    /// Poll GLFW and fold the queued events into a summary
    pub fn process_events(&mut self) -> WindowEvents {
        self.glfw.poll_events();

        let mut summary = WindowEvents::default();
        for (_, event) in glfw::flush_messages(&self.events) {
            match event {
                glfw::WindowEvent::FramebufferSize(..) => summary.resized = true,
                glfw::WindowEvent::Close
                | glfw::WindowEvent::Key(glfw::Key::Escape, _, glfw::Action::Press, _) => {
                    summary.close_requested = true;
                }
                _ => {}
            }
        }
        if summary.close_requested {
            self.window.set_should_close(true);
        }
        summary
    }

    /// Block until at least one event arrives; used while minimised
    pub fn wait_events(&mut self) {
        self.glfw.wait_events();
    }

    /// Framebuffer size in pixels
    pub fn framebuffer_size(&self) -> (u32, u32) {
        let (width, height) = self.window.get_framebuffer_size();
        (width.max(0) as u32, height.max(0) as u32)
    }

    /// Whether the framebuffer has zero area (minimised)
    pub fn is_minimized(&self) -> bool {
        let (width, height) = self.framebuffer_size();
        width == 0 || height == 0
    }

    /// Seconds since GLFW was initialized
    pub fn time(&self) -> f64 {
        self.glfw.get_time()
    }

    /// Change the title bar text
    pub fn set_title(&mut self, title: &str) {
        self.window.set_title(title);
    }

    /// Instance extensions GLFW needs to create a surface
    pub fn required_instance_extensions(&self) -> WindowResult<Vec<String>> {
        self.glfw
            .get_required_instance_extensions()
            .ok_or_else(|| WindowError::GlfwError("Failed to get required extensions".to_string()))
    }

    /// Create a Vulkan surface for this window
    pub fn create_surface(&self, instance: vk::Instance) -> WindowResult<vk::SurfaceKHR> {
        let mut surface = vk::SurfaceKHR::null();
        let result = self.window.create_window_surface(instance, std::ptr::null(), &mut surface);

        if result == vk::Result::SUCCESS {
            Ok(surface)
        } else {
            Err(WindowError::GlfwError(format!("Failed to create Vulkan surface: {result:?}")))
        }
    }
}
