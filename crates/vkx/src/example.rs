//! Example runner
//!
//! [`ExampleBase`] owns everything an example shares: window, instance,
//! device, swapchain, a clear-and-present render pass, per-image targets,
//! frame synchronization and the recording context. An example implements
//! [`Example`] and is driven by [`run`], which acquires, records, submits
//! and presents each frame and rebuilds the swapchain whenever the window
//! or the presentation engine asks for it.

use ash::vk;
use bitflags::bitflags;

use crate::assets::AssetPaths;
use crate::backend::{PresentationEngine, SyncDevice};
use crate::config::ExampleConfig;
use crate::error::{VkxError, VkxResult};
use crate::logging;
use crate::staging::StagingTransfer;
use crate::sync::{FrameStatus, FrameSync, PassSubmit, PresentOutcome};
use crate::targets::SwapchainTargets;
use crate::vulkan::{
    CommandRecorder, GraphicsDevice, ImageTarget, ImageTargetFactory, RecordingContext, RenderPass, Surface,
    Swapchain, VulkanInstance,
};
use crate::window::Window;

bitflags! {
    /// Why the swapchain has to be rebuilt before the next frame
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RecreateReason: u8 {
        /// The framebuffer changed size
        const RESIZED = 1;
        /// Acquire or present reported `ERROR_OUT_OF_DATE_KHR`
        const OUT_OF_DATE = 1 << 1;
        /// Acquire or present reported `SUBOPTIMAL_KHR`
        const SUBOPTIMAL = 1 << 2;
    }
}

impl RecreateReason {
    /// Reason implied by a present result, empty when presentation was clean
    pub const fn from_present(outcome: PresentOutcome) -> Self {
        match outcome {
            PresentOutcome::Presented => Self::empty(),
            PresentOutcome::Suboptimal => Self::SUBOPTIMAL,
            PresentOutcome::OutOfDate => Self::OUT_OF_DATE,
        }
    }
}

/// Per-frame values handed to the example while recording
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    /// Frame slot in use; index per-slot resources with it
    pub slot: usize,
    /// Acquired swapchain image
    pub image_index: u32,
    /// Monotonic frame counter
    pub frame_number: u64,
    /// Generation of the swapchain targets the frame renders into
    pub generation: u64,
    /// Swapchain extent
    pub extent: vk::Extent2D,
    /// Swapchain image being rendered
    pub image: vk::Image,
    /// Seconds since the window was created
    pub elapsed: f64,
    /// Seconds since the previous frame
    pub delta: f32,
}

impl FrameContext {
    /// Width over height, 1.0 for a degenerate extent
    pub fn aspect_ratio(&self) -> f32 {
        if self.extent.height == 0 {
            1.0
        } else {
            self.extent.width as f32 / self.extent.height as f32
        }
    }

    /// The whole image as a rectangle
    pub const fn full_rect(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        }
    }
}

/// One example program, driven by [`run`]
pub trait Example: Sized {
    /// Name used for asset lookup (`shaders/<NAME>/...`)
    const NAME: &'static str;

    /// Create pipelines, upload data and allocate per-slot resources
    fn prepare(base: &mut ExampleBase) -> VkxResult<Self>;

    /// Advance animation state once per frame, before recording
    fn update(&mut self, _base: &ExampleBase, _delta_seconds: f32) -> VkxResult<()> {
        Ok(())
    }

    /// Clear color of the base render pass
    fn clear_color(&self, _frame: &FrameContext) -> [f32; 4] {
        [0.0, 0.0, 0.0, 1.0]
    }

    /// Record into the slot's primary command buffer inside the base render pass
    fn record(&mut self, base: &ExampleBase, frame: &FrameContext, recorder: &mut CommandRecorder) -> VkxResult<()>;

    /// Recorded command buffers submitted after the primary one, each waiting on the previous
    fn extra_passes(
        &mut self,
        _base: &ExampleBase,
        _frame: &FrameContext,
    ) -> VkxResult<Vec<PassSubmit<vk::CommandBuffer>>> {
        Ok(Vec::new())
    }

    /// Called after the swapchain and its targets were rebuilt
    fn on_resize(&mut self, _base: &ExampleBase) -> VkxResult<()> {
        Ok(())
    }

    /// Release resources that need the base; the device is idle
    fn destroy(self, _base: &ExampleBase) {}
}

/// Shared state of every example
///
/// Fields drop in declaration order, so objects created from the device
/// come before it and the surface before the instance.
pub struct ExampleBase {
    config: ExampleConfig,
    assets: AssetPaths,
    frame_sync: Option<FrameSync<GraphicsDevice>>,
    targets: SwapchainTargets<ImageTarget>,
    recording_context: RecordingContext,
    render_pass: RenderPass,
    swapchain: Swapchain,
    device: GraphicsDevice,
    surface: Surface,
    instance: VulkanInstance,
    window: Window,
    pending_recreate: RecreateReason,
    last_frame_time: f64,
}

impl ExampleBase {
    /// Open the window and build the Vulkan objects described by `config`
    pub fn new(config: ExampleConfig) -> VkxResult<Self> {
        config.validate()?;

        let window = Window::new(&config.name, &config.window)?;
        let instance = VulkanInstance::new(&window, &config.name, config.validation_enabled())?;
        let surface = Surface::new(&instance, &window)?;
        let device = GraphicsDevice::new(&instance, &surface, &config.features)?;

        let (width, height) = window.framebuffer_size();
        let swapchain = Swapchain::new(
            &instance,
            &device,
            &surface,
            vk::Extent2D { width, height },
            config.present_mode,
        )?;
        let render_pass = RenderPass::new_clear_pass(device.raw(), swapchain.format().format)?;
        let recording_context = RecordingContext::new(&device)?;

        let image_count = swapchain.image_count();
        let targets = SwapchainTargets::new(
            &ImageTargetFactory::new(device.raw(), &swapchain, &render_pass),
            image_count,
        )?;
        let frame_sync = FrameSync::new(&device, &recording_context, image_count, &config.frame)?;

        let assets = AssetPaths::new(&config.assets_root);
        let last_frame_time = window.time();
        log::info!(
            "Example base ready: {} frames in flight, {} swapchain images",
            config.frame.max_frames_in_flight,
            image_count
        );

        Ok(Self {
            config,
            assets,
            frame_sync: Some(frame_sync),
            targets,
            recording_context,
            render_pass,
            swapchain,
            device,
            surface,
            instance,
            window,
            pending_recreate: RecreateReason::empty(),
            last_frame_time,
        })
    }

    /// Configuration the base was built from
    pub const fn config(&self) -> &ExampleConfig {
        &self.config
    }

    /// Asset path resolver
    pub const fn assets(&self) -> &AssetPaths {
        &self.assets
    }

    /// Logical device
    pub const fn device(&self) -> &GraphicsDevice {
        &self.device
    }

    /// Vulkan instance
    pub const fn instance(&self) -> &VulkanInstance {
        &self.instance
    }

    /// Command pool of the main thread
    pub const fn recording_context(&self) -> &RecordingContext {
        &self.recording_context
    }

    /// Current swapchain
    pub const fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    /// Clear-and-present render pass used by the primary pass
    pub const fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }

    /// Window
    pub const fn window(&self) -> &Window {
        &self.window
    }

    /// Current swapchain extent
    pub const fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    /// Number of frame slots
    pub const fn frames_in_flight(&self) -> usize {
        self.config.frame.max_frames_in_flight
    }

    /// Target of the frame's swapchain image, checked against its generation
    pub fn target(&self, frame: &FrameContext) -> VkxResult<&ImageTarget> {
        self.targets.get(frame.image_index, frame.generation)
    }

    /// Blocking staging uploads on the main recording context
    pub fn staging(&self) -> StagingTransfer<'_, GraphicsDevice> {
        StagingTransfer::new(&self.device, &self.recording_context, self.config.frame.fence_timeout_ns)
    }

    /// Record and run a single-use command buffer, waiting for it to finish
    pub fn execute_one_shot<F>(&self, record: F) -> VkxResult<()>
    where
        F: FnOnce(&mut CommandRecorder) -> VkxResult<()>,
    {
        self.device
            .execute_one_shot(&self.recording_context, self.config.frame.fence_timeout_ns, record)
    }

    /// Ask for a swapchain rebuild before the next frame
    pub fn request_recreate(&mut self, reason: RecreateReason) {
        self.pending_recreate |= reason;
    }

    /// Pending rebuild reasons
    pub const fn pending_recreate(&self) -> RecreateReason {
        self.pending_recreate
    }

    /// Tear down targets, recreate the swapchain and rebuild everything per image
    ///
    /// Returns `false` without doing anything while the window is minimised.
    pub fn recreate_swapchain(&mut self) -> VkxResult<bool> {
        if self.window.is_minimized() {
            return Ok(false);
        }
        log::info!("Recreating swapchain ({:?})", self.pending_recreate);

        self.device.wait_idle()?;
        self.targets
            .release_all(&ImageTargetFactory::new(self.device.raw(), &self.swapchain, &self.render_pass));

        let old_format = self.swapchain.format().format;
        let (width, height) = self.window.framebuffer_size();
        self.swapchain.recreate(
            &self.device,
            &self.surface,
            vk::Extent2D { width, height },
            self.config.present_mode,
        )?;
        if self.swapchain.format().format != old_format {
            log::info!("Surface format changed to {:?}", self.swapchain.format().format);
            self.render_pass = RenderPass::new_clear_pass(self.device.raw(), self.swapchain.format().format)?;
        }

        let image_count = self.swapchain.image_count();
        self.targets.rebuild(
            &ImageTargetFactory::new(self.device.raw(), &self.swapchain, &self.render_pass),
            image_count,
        )?;
        let frame_sync = self.frame_sync.as_mut().ok_or_else(frame_sync_destroyed)?;
        frame_sync.on_swapchain_recreated(&self.device, image_count)?;

        self.pending_recreate = RecreateReason::empty();
        Ok(true)
    }

    fn draw_frame<E: Example>(&mut self, example: &mut E) -> VkxResult<()> {
        let now = self.window.time();
        let delta = (now - self.last_frame_time) as f32;
        self.last_frame_time = now;
        example.update(self, delta)?;

        let frame_sync = self.frame_sync.as_mut().ok_or_else(frame_sync_destroyed)?;
        let frame = match frame_sync.begin_frame(&self.device, &self.swapchain)? {
            FrameStatus::Ready(frame) => frame,
            FrameStatus::OutOfDate => {
                self.request_recreate(RecreateReason::OUT_OF_DATE);
                return Ok(());
            }
        };
        if frame.suboptimal() {
            self.request_recreate(RecreateReason::SUBOPTIMAL);
        }

        let generation = self.targets.generation();
        let target = self.targets.get(frame.image_index(), generation)?;
        let context = FrameContext {
            slot: frame.slot(),
            image_index: frame.image_index(),
            frame_number: frame.frame_number(),
            generation,
            extent: self.swapchain.extent(),
            image: target.image(),
            elapsed: now,
            delta,
        };

        let mut recorder = CommandRecorder::begin(self.device.raw(), frame.command_buffer())?;
        {
            let clear_values = [vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: example.clear_color(&context),
                },
            }];
            let mut pass = recorder.begin_render_pass(
                self.render_pass.handle(),
                target.framebuffer(),
                context.full_rect(),
                &clear_values,
            )?;
            pass.set_viewport(context.extent);
            example.record(self, &context, &mut pass)?;
        }
        recorder.end()?;

        let mut passes = vec![PassSubmit::color_output(frame.command_buffer())];
        passes.extend(example.extra_passes(self, &context)?);

        let frame_sync = self.frame_sync.as_mut().ok_or_else(frame_sync_destroyed)?;
        let submitted = frame_sync.submit(&self.device, frame, &passes)?;
        let outcome = frame_sync.present(&self.swapchain, submitted)?;
        self.request_recreate(RecreateReason::from_present(outcome));
        Ok(())
    }
}

fn frame_sync_destroyed() -> VkxError {
    VkxError::invalid("frame sync already destroyed")
}

impl Drop for ExampleBase {
    fn drop(&mut self) {
        if let Err(err) = self.device.wait_idle() {
            log::error!("Device did not go idle during shutdown: {err}");
        }
        self.targets
            .release_all(&ImageTargetFactory::new(self.device.raw(), &self.swapchain, &self.render_pass));
        if let Some(frame_sync) = self.frame_sync.take() {
            frame_sync.destroy(&self.device, &self.recording_context);
        }
    }
}

/// Run `E` until its window closes
pub fn run<E: Example>(config: ExampleConfig) -> VkxResult<()> {
    logging::init(&config.log_level);
    log::info!("Starting example {}", E::NAME);

    let mut base = ExampleBase::new(config)?;
    let mut example = E::prepare(&mut base)?;

    let result = main_loop(&mut base, &mut example);

    let idle = base.device.wait_idle();
    example.destroy(&base);
    log::info!("Example {} finished", E::NAME);
    result.and(idle)
}

fn main_loop<E: Example>(base: &mut ExampleBase, example: &mut E) -> VkxResult<()> {
    while !base.window.should_close() {
        let events = base.window.process_events();
        if events.resized {
            base.request_recreate(RecreateReason::RESIZED);
        }

        if base.window.is_minimized() {
            base.window.wait_events();
            continue;
        }

        if !base.pending_recreate.is_empty() {
            if !base.recreate_swapchain()? {
                continue;
            }
            example.on_resize(base)?;
        }

        base.draw_frame(example)?;
    }
    Ok(())
}
