//! Pulse demo
//!
//! Animates the clear color, draws a bar whose width follows the pulse, and
//! blits a badge image (uploaded once through a staging buffer) into the
//! corner of every frame from a second submission chained on the first.
//! Needs no shader assets.
//!
//! Usage: `pulse [config.toml|config.ron]`

use ash::vk;
use vkx::backend::{BarrierSpec, CommandDevice};
use vkx::prelude::*;
use vkx::vulkan::Image;

const BADGE_SIZE: u32 = 64;
const BADGE_MARGIN: u32 = 16;
const PULSE_HZ: f64 = 0.5;

/// Clear color at `seconds`: a slow blue-violet breathing cycle
fn pulse_color(seconds: f64) -> [f32; 4] {
    let phase = (seconds * PULSE_HZ * std::f64::consts::TAU).sin() * 0.5 + 0.5;
    let phase = phase as f32;
    [0.05 + 0.25 * phase, 0.05, 0.2 + 0.4 * phase, 1.0]
}

/// Fraction of the window width covered by the bar at `seconds`
fn bar_fraction(seconds: f64) -> f32 {
    let phase = (seconds * PULSE_HZ * std::f64::consts::TAU).sin() * 0.5 + 0.5;
    0.1 + 0.8 * phase as f32
}

/// RGBA8 checkerboard with a diagonal highlight, tightly packed
fn badge_pixels(size: u32) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let checker = ((x / 8) + (y / 8)) % 2 == 0;
            let texel = if x == y || x + y + 1 == size {
                [255, 255, 255, 255]
            } else if checker {
                [240, 180, 40, 255]
            } else {
                [30, 30, 30, 255]
            };
            pixels.extend_from_slice(&texel);
        }
    }
    pixels
}

/// Top-right destination of the badge, or `None` when the window is too small
fn badge_rect(extent: vk::Extent2D, size: u32, margin: u32) -> Option<vk::Rect2D> {
    if extent.width < size + 2 * margin || extent.height < size + 2 * margin {
        return None;
    }
    Some(vk::Rect2D {
        offset: vk::Offset2D {
            x: (extent.width - size - margin) as i32,
            y: margin as i32,
        },
        extent: vk::Extent2D {
            width: size,
            height: size,
        },
    })
}

const PRESENT_TO_TRANSFER: BarrierSpec = BarrierSpec {
    old_layout: vk::ImageLayout::PRESENT_SRC_KHR,
    new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
    dst_access: vk::AccessFlags::TRANSFER_WRITE,
    src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
    dst_stage: vk::PipelineStageFlags::TRANSFER,
};

const TRANSFER_TO_PRESENT: BarrierSpec = BarrierSpec {
    old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
    src_access: vk::AccessFlags::TRANSFER_WRITE,
    dst_access: vk::AccessFlags::empty(),
    src_stage: vk::PipelineStageFlags::TRANSFER,
    dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
};

struct Pulse {
    badge: Image,
    overlay_buffers: Vec<vk::CommandBuffer>,
    overlay_enabled: bool,
}

impl Example for Pulse {
    const NAME: &'static str = "pulse";

    fn prepare(base: &mut ExampleBase) -> VkxResult<Self> {
        let desc = ImageDesc {
            usage: vk::ImageUsageFlags::TRANSFER_SRC,
            ..ImageDesc::rgba8_sampled(BADGE_SIZE, BADGE_SIZE)
        };
        let badge = base
            .staging()
            .upload_image(&badge_pixels(BADGE_SIZE), &desc, ImageFinalLayout::TransferSrc)?;

        let overlay_buffers = base
            .device()
            .allocate_command_buffers(base.recording_context(), base.frames_in_flight() as u32)?;

        let overlay_enabled = base.swapchain().supports_transfer_dst();
        if !overlay_enabled {
            log::warn!("Swapchain images are not transfer destinations; badge overlay disabled");
        }

        log::info!("Pulse ready with {} overlay command buffers", overlay_buffers.len());
        Ok(Self {
            badge,
            overlay_buffers,
            overlay_enabled,
        })
    }

    fn clear_color(&self, frame: &FrameContext) -> [f32; 4] {
        pulse_color(frame.elapsed)
    }

    fn record(&mut self, _base: &ExampleBase, frame: &FrameContext, recorder: &mut CommandRecorder) -> VkxResult<()> {
        let fraction = bar_fraction(frame.elapsed);
        let bar_height = (frame.extent.height / 16).max(1);
        let bar = vk::Rect2D {
            offset: vk::Offset2D {
                x: 0,
                y: (frame.extent.height - bar_height) as i32,
            },
            extent: vk::Extent2D {
                width: ((frame.extent.width as f32 * fraction) as u32).max(1),
                height: bar_height,
            },
        };
        recorder.clear_color_rect([0.9, 0.9, 0.95, 1.0], bar)
    }

    fn extra_passes(&mut self, base: &ExampleBase, frame: &FrameContext) -> VkxResult<Vec<PassSubmit<vk::CommandBuffer>>> {
        if !self.overlay_enabled {
            return Ok(Vec::new());
        }
        let Some(destination) = badge_rect(frame.extent, BADGE_SIZE, BADGE_MARGIN) else {
            return Ok(Vec::new());
        };

        // The slot's fence was waited in begin_frame, so its overlay buffer is idle
        let command_buffer = self.overlay_buffers[frame.slot];
        let mut recorder = CommandRecorder::begin(base.device().raw(), command_buffer)?;
        recorder.image_barrier(frame.image, PRESENT_TO_TRANSFER)?;
        recorder.blit(
            self.badge.handle(),
            vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: self.badge.extent(),
            },
            frame.image,
            destination,
            vk::Filter::NEAREST,
        )?;
        recorder.image_barrier(frame.image, TRANSFER_TO_PRESENT)?;
        recorder.end()?;

        Ok(vec![PassSubmit::transfer(command_buffer)])
    }

    fn on_resize(&mut self, base: &ExampleBase) -> VkxResult<()> {
        self.overlay_enabled = base.swapchain().supports_transfer_dst();
        let extent = base.extent();
        log::info!("Pulse resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    fn destroy(self, base: &ExampleBase) {
        base.device()
            .free_command_buffers(base.recording_context(), &self.overlay_buffers);
    }
}

fn load_config() -> VkxResult<ExampleConfig> {
    match std::env::args().nth(1) {
        Some(path) => Ok(ExampleConfig::load_from_file(&path)?),
        None => Ok(ExampleConfig::new(Pulse::NAME).with_window_size(1024, 640)),
    }
}

fn main() {
    let result = load_config().and_then(vkx::example::run::<Pulse>);
    if let Err(err) = result {
        log::error!("pulse failed: {err}");
        eprintln!("pulse failed: {err}");
        std::process::exit(1);
    }
}
