//! Frames-in-flight synchronization
//!
//! Orders GPU work so that rendering into a swapchain image never starts
//! before the image is available, presentation never happens before
//! rendering finished, and a frame slot's command buffer is never reused
//! while the GPU may still be executing it.
//!
//! ```text
//! begin_frame:  wait slot fence ─▶ acquire(image_available)
//! submit:       pass 0 waits image_available ─▶ pass 1 waits pass 0 ─▶ ...
//!               last pass signals render_complete[image] + slot fence
//! present:      waits render_complete[image]
//! ```
//!
//! Acquire semaphores and fences live per frame slot; render-complete
//! semaphores live per swapchain image, since the presentation engine holds
//! on to them until the image comes back.

use std::fmt;

use ash::vk;

use crate::backend::{AcquireOutcome, CommandDevice, PresentationEngine, Submission, SyncDevice, WaitSemaphore};
use crate::config::FrameConfig;
use crate::error::{VkxError, VkxResult};

pub use crate::backend::PresentOutcome;

/// One submission in a frame's chain of passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassSubmit<C> {
    /// Recorded command buffer
    pub command_buffer: C,
    /// Stages that wait for the previous link of the chain (the acquired
    /// image for the first pass, the previous pass otherwise)
    pub wait_stage: vk::PipelineStageFlags,
}

impl<C> PassSubmit<C> {
    /// A pass whose color attachment writes wait for the previous link
    pub const fn color_output(command_buffer: C) -> Self {
        Self {
            command_buffer,
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        }
    }

    /// A pass whose transfer work waits for the previous link
    pub const fn transfer(command_buffer: C) -> Self {
        Self {
            command_buffer,
            wait_stage: vk::PipelineStageFlags::TRANSFER,
        }
    }
}

/// Outcome of [`FrameSync::begin_frame`]
#[must_use]
#[derive(Debug)]
pub enum FrameStatus<F> {
    /// A frame is ready to record into
    Ready(F),
    /// The swapchain no longer matches the surface and must be recreated
    OutOfDate,
}

/// A frame whose image has been acquired but whose work is not submitted yet
#[must_use = "an acquired frame must be submitted and presented"]
pub struct AcquiredFrame<D: SyncDevice> {
    slot: usize,
    image_index: u32,
    epoch: u64,
    frame_number: u64,
    suboptimal: bool,
    image_available: D::Semaphore,
    command_buffer: D::CommandBuffer,
}

impl<D: SyncDevice> AcquiredFrame<D> {
    /// Frame slot index (`0..max_frames_in_flight`)
    pub const fn slot(&self) -> usize {
        self.slot
    }

    /// Swapchain image index
    pub const fn image_index(&self) -> u32 {
        self.image_index
    }

    /// Monotonic frame counter
    pub const fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Whether acquire reported a suboptimal swapchain
    pub const fn suboptimal(&self) -> bool {
        self.suboptimal
    }

    /// The slot's primary command buffer, safe to re-record
    pub const fn command_buffer(&self) -> D::CommandBuffer {
        self.command_buffer
    }
}

/// A frame whose work has been submitted and which may now be presented
#[must_use = "a submitted frame must be presented"]
pub struct SubmittedFrame<D: SyncDevice> {
    slot: usize,
    image_index: u32,
    epoch: u64,
    render_complete: D::Semaphore,
}

impl<D: SyncDevice> SubmittedFrame<D> {
    /// Swapchain image index
    pub const fn image_index(&self) -> u32 {
        self.image_index
    }
}

impl<D: SyncDevice> fmt::Debug for AcquiredFrame<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquiredFrame")
            .field("slot", &self.slot)
            .field("image_index", &self.image_index)
            .field("epoch", &self.epoch)
            .field("frame_number", &self.frame_number)
            .field("suboptimal", &self.suboptimal)
            .finish_non_exhaustive()
    }
}

impl<D: SyncDevice> fmt::Debug for SubmittedFrame<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmittedFrame")
            .field("slot", &self.slot)
            .field("image_index", &self.image_index)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

/// Synchronization objects and primary command buffer of one frame slot
struct FrameSlot<D: SyncDevice> {
    image_available: D::Semaphore,
    in_flight: D::Fence,
    command_buffer: D::CommandBuffer,
    pass_semaphores: Vec<D::Semaphore>,
    submitted: bool,
    /// An image was acquired with `image_available` and not yet presented
    acquired: bool,
}

/// Frames-in-flight bookkeeping for the acquire → render → present cycle
pub struct FrameSync<D: SyncDevice> {
    slots: Vec<FrameSlot<D>>,
    render_complete: Vec<D::Semaphore>,
    images_in_flight: Vec<Option<usize>>,
    current_slot: usize,
    epoch: u64,
    frame_number: u64,
    fence_timeout_ns: u64,
    acquire_timeout_ns: u64,
}

impl<D: CommandDevice> FrameSync<D> {
    /// Create per-slot and per-image synchronization objects
    pub fn new(
        device: &D,
        context: &D::RecordingContext,
        image_count: usize,
        config: &FrameConfig,
    ) -> VkxResult<Self> {
        log::debug!(
            "Creating FrameSync with {} frames in flight for {} swapchain images",
            config.max_frames_in_flight,
            image_count
        );

        if config.max_frames_in_flight == 0 {
            return Err(VkxError::invalid("at least one frame in flight is required"));
        }

        let command_buffers = device.allocate_command_buffers(context, config.max_frames_in_flight as u32)?;
        let mut slots = Vec::with_capacity(command_buffers.len());
        for command_buffer in command_buffers {
            slots.push(FrameSlot {
                image_available: device.create_semaphore()?,
                in_flight: device.create_fence(true)?,
                command_buffer,
                pass_semaphores: Vec::new(),
                submitted: false,
                acquired: false,
            });
        }

        let render_complete = (0..image_count)
            .map(|_| device.create_semaphore())
            .collect::<VkxResult<Vec<_>>>()?;

        Ok(Self {
            slots,
            render_complete,
            images_in_flight: vec![None; image_count],
            current_slot: 0,
            epoch: 0,
            frame_number: 0,
            fence_timeout_ns: config.fence_timeout_ns,
            acquire_timeout_ns: config.acquire_timeout_ns,
        })
    }

    /// Number of frame slots
    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Slot the next `begin_frame` will use
    pub const fn current_slot(&self) -> usize {
        self.current_slot
    }

    /// Swapchain epoch; bumped by [`Self::on_swapchain_recreated`]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Wait for the current slot to be free and acquire the next image
    ///
    /// Fails with `InvalidOperation` while the slot's previous frame has not
    /// been presented; [`Self::on_swapchain_recreated`] clears that state.
    pub fn begin_frame<P>(&mut self, device: &D, presenter: &P) -> VkxResult<FrameStatus<AcquiredFrame<D>>>
    where
        P: PresentationEngine<D>,
    {
        let slot_index = self.current_slot;
        if self.slots[slot_index].acquired {
            return Err(VkxError::invalid(format!(
                "frame slot {slot_index} already holds an acquired image that was not presented"
            )));
        }
        self.wait_slot(device, slot_index)?;

        let slot = &self.slots[slot_index];
        let (image_index, suboptimal) = match presenter.acquire_next_image(slot.image_available, self.acquire_timeout_ns)? {
            AcquireOutcome::Acquired { image_index, suboptimal } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                log::warn!("Swapchain out of date during acquire");
                return Ok(FrameStatus::OutOfDate);
            }
        };
        self.slots[slot_index].acquired = true;

        let image = image_index as usize;
        if image >= self.images_in_flight.len() {
            return Err(VkxError::invalid(format!(
                "acquired image {image_index} but only {} images are tracked",
                self.images_in_flight.len()
            )));
        }

        // The image may still be the target of an older frame on another slot
        if let Some(owner) = self.images_in_flight[image] {
            if owner != slot_index {
                self.wait_slot(device, owner)?;
            }
        }
        self.images_in_flight[image] = Some(slot_index);

        let frame_number = self.frame_number;
        self.frame_number += 1;

        let slot = &self.slots[slot_index];
        Ok(FrameStatus::Ready(AcquiredFrame {
            slot: slot_index,
            image_index,
            epoch: self.epoch,
            frame_number,
            suboptimal,
            image_available: slot.image_available,
            command_buffer: slot.command_buffer,
        }))
    }

    /// Submit the frame's passes in order
    ///
    /// Pass 0 waits the acquired image at its `wait_stage`; every later pass
    /// waits on the semaphore signalled by the pass before it. The last pass
    /// signals the image's render-complete semaphore and the slot fence.
    ///
    /// If any pass fails to submit, the device is idled and the slot's
    /// semaphores and fence are replaced before the error is returned, so
    /// work queued by earlier passes never overlaps the slot's next frame.
    pub fn submit(
        &mut self,
        device: &D,
        frame: AcquiredFrame<D>,
        passes: &[PassSubmit<D::CommandBuffer>],
    ) -> VkxResult<SubmittedFrame<D>> {
        self.check_epoch(frame.epoch)?;
        if passes.is_empty() {
            return Err(VkxError::invalid("a frame needs at least one pass"));
        }
        if self.slots[frame.slot].submitted {
            return Err(VkxError::FrameInFlight { slot: frame.slot });
        }

        self.ensure_pass_semaphores(device, frame.slot, passes.len() - 1)?;

        let in_flight = self.slots[frame.slot].in_flight;
        let pass_semaphores = self.slots[frame.slot].pass_semaphores.clone();
        let render_complete = self.render_complete[frame.image_index as usize];
        let mut waiting_on = frame.image_available;
        let mut queued = 0;

        for (index, pass) in passes.iter().enumerate() {
            let is_last = index + 1 == passes.len();
            let signal = if is_last { render_complete } else { pass_semaphores[index] };

            let waits = [WaitSemaphore { semaphore: waiting_on, stage: pass.wait_stage }];
            let command_buffers = [pass.command_buffer];
            let signals = [signal];
            let submission = Submission {
                waits: &waits,
                command_buffers: &command_buffers,
                signals: &signals,
            };

            let result = if is_last {
                // Reset only now so an earlier failure leaves the fence signalled
                device
                    .reset_fence(in_flight)
                    .and_then(|()| device.submit(&submission, Some(in_flight)))
            } else {
                device.submit(&submission, None)
            };
            if let Err(err) = result {
                log::error!(
                    "Pass {index} of frame slot {} failed to submit with {queued} passes queued: {err}",
                    frame.slot
                );
                self.recover_slot(device, frame.slot, frame.image_index)?;
                return Err(err);
            }

            queued += 1;
            waiting_on = signal;
        }

        self.slots[frame.slot].submitted = true;

        Ok(SubmittedFrame {
            slot: frame.slot,
            image_index: frame.image_index,
            epoch: frame.epoch,
            render_complete,
        })
    }

    /// Present the frame and advance to the next slot
    pub fn present<P>(&mut self, presenter: &P, frame: SubmittedFrame<D>) -> VkxResult<PresentOutcome>
    where
        P: PresentationEngine<D>,
    {
        self.check_epoch(frame.epoch)?;
        debug_assert_eq!(frame.slot, self.current_slot);

        // The work is queued whatever the present result, so the slot advances either way
        self.slots[frame.slot].acquired = false;
        self.current_slot = (self.current_slot + 1) % self.slots.len();

        let outcome = presenter.present(frame.image_index, frame.render_complete)?;
        if outcome != PresentOutcome::Presented {
            log::warn!("Present returned {outcome:?}; swapchain needs recreation");
        }
        Ok(outcome)
    }

    /// Rebuild per-image state after the swapchain was recreated
    ///
    /// Idles the device, replaces acquire semaphores (an abandoned acquire
    /// leaves one signalled), sizes the render-complete semaphores to the new
    /// image count and invalidates frames from the previous epoch.
    pub fn on_swapchain_recreated(&mut self, device: &D, image_count: usize) -> VkxResult<()> {
        device.wait_idle()?;

        for slot in &mut self.slots {
            device.destroy_semaphore(slot.image_available);
            slot.image_available = device.create_semaphore()?;
            for semaphore in slot.pass_semaphores.drain(..) {
                device.destroy_semaphore(semaphore);
            }
            slot.submitted = false;
            slot.acquired = false;
        }

        for semaphore in self.render_complete.drain(..) {
            device.destroy_semaphore(semaphore);
        }
        for _ in 0..image_count {
            self.render_complete.push(device.create_semaphore()?);
        }

        self.images_in_flight = vec![None; image_count];
        self.current_slot = 0;
        self.epoch += 1;
        log::info!("Frame sync rebuilt for {image_count} swapchain images (epoch {})", self.epoch);
        Ok(())
    }

    /// Block until every slot's last submission completed
    pub fn wait_all(&mut self, device: &D) -> VkxResult<()> {
        for index in 0..self.slots.len() {
            self.wait_slot(device, index)?;
        }
        Ok(())
    }

    /// Destroy all synchronization objects and free the slot command buffers
    ///
    /// The device must be idle.
    pub fn destroy(self, device: &D, context: &D::RecordingContext) {
        let command_buffers: Vec<_> = self.slots.iter().map(|slot| slot.command_buffer).collect();
        device.free_command_buffers(context, &command_buffers);

        for slot in self.slots {
            device.destroy_semaphore(slot.image_available);
            device.destroy_fence(slot.in_flight);
            for semaphore in slot.pass_semaphores {
                device.destroy_semaphore(semaphore);
            }
        }
        for semaphore in self.render_complete {
            device.destroy_semaphore(semaphore);
        }
    }

    fn wait_slot(&mut self, device: &D, slot_index: usize) -> VkxResult<()> {
        let slot = &mut self.slots[slot_index];
        if !slot.submitted {
            return Ok(());
        }
        device.wait_fence(slot.in_flight, self.fence_timeout_ns)?;
        slot.submitted = false;
        Ok(())
    }

    fn ensure_pass_semaphores(&mut self, device: &D, slot_index: usize, count: usize) -> VkxResult<()> {
        let slot = &mut self.slots[slot_index];
        while slot.pass_semaphores.len() < count {
            slot.pass_semaphores.push(device.create_semaphore()?);
        }
        Ok(())
    }

    /// Make a slot reusable after a failed submission
    ///
    /// Earlier passes of the frame may still be executing with no fence
    /// tracking them, and its acquire and pass semaphores may be left
    /// signalled. If the device does not go idle the slot stays marked
    /// acquired, so `begin_frame` refuses it until the swapchain is rebuilt.
    fn recover_slot(&mut self, device: &D, slot_index: usize, image_index: u32) -> VkxResult<()> {
        device.wait_idle()?;

        let slot = &mut self.slots[slot_index];
        let image_available = device.create_semaphore()?;
        device.destroy_semaphore(std::mem::replace(&mut slot.image_available, image_available));
        for semaphore in slot.pass_semaphores.drain(..) {
            device.destroy_semaphore(semaphore);
        }
        let in_flight = device.create_fence(true)?;
        device.destroy_fence(std::mem::replace(&mut slot.in_flight, in_flight));
        slot.submitted = false;
        slot.acquired = false;

        // Nothing rendered into the image
        if let Some(owner) = self.images_in_flight.get_mut(image_index as usize) {
            *owner = None;
        }
        log::warn!("Frame slot {slot_index} recovered after failed submission");
        Ok(())
    }

    fn check_epoch(&self, frame_epoch: u64) -> VkxResult<()> {
        if frame_epoch == self.epoch {
            Ok(())
        } else {
            Err(VkxError::StaleFrame {
                frame_epoch,
                current_epoch: self.epoch,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Event, MockCommandBuffer, MockDevice, MockRecordingContext};

    fn config(frames: usize) -> FrameConfig {
        FrameConfig {
            max_frames_in_flight: frames,
            ..FrameConfig::default()
        }
    }

    fn setup(frames: usize, images: usize) -> (MockDevice, MockRecordingContext, FrameSync<MockDevice>) {
        let device = MockDevice::new(images);
        let context = MockRecordingContext::new();
        let sync = FrameSync::new(&device, &context, images, &config(frames)).unwrap();
        device.clear_events();
        (device, context, sync)
    }

    fn run_frame(device: &MockDevice, sync: &mut FrameSync<MockDevice>) -> PresentOutcome {
        let FrameStatus::Ready(frame) = sync.begin_frame(device, device).unwrap() else {
            panic!("unexpected out of date");
        };
        let pass = PassSubmit::color_output(frame.command_buffer());
        let submitted = sync.submit(device, frame, &[pass]).unwrap();
        sync.present(device, submitted).unwrap()
    }

    #[test]
    fn test_acquire_submit_present_order() {
        let (device, _context, mut sync) = setup(2, 3);

        assert_eq!(run_frame(&device, &mut sync), PresentOutcome::Presented);

        let events = device.events();
        let acquire = events.iter().position(|e| matches!(e, Event::Acquire { .. })).unwrap();
        let submit = events.iter().position(|e| matches!(e, Event::Submit { .. })).unwrap();
        let present = events.iter().position(|e| matches!(e, Event::Present { .. })).unwrap();
        assert!(acquire < submit && submit < present);

        // Present waits on exactly what the submission signalled
        let Event::Submit { signals, waits, .. } = &events[submit] else { unreachable!() };
        let Event::Present { wait, .. } = &events[present] else { unreachable!() };
        assert_eq!(signals.as_slice(), &[*wait]);

        let Event::Acquire { signal, .. } = &events[acquire] else { unreachable!() };
        assert_eq!(waits.as_slice(), &[(*signal, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)]);

        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn test_slot_fence_waited_before_command_buffer_reuse() {
        let (device, _context, mut sync) = setup(2, 3);

        for _ in 0..6 {
            run_frame(&device, &mut sync);
        }

        let events = device.events();
        let submits: Vec<_> = events
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match e {
                Event::Submit { command_buffers, fence, .. } => Some((i, command_buffers[0], fence.unwrap())),
                _ => None,
            })
            .collect();
        assert_eq!(submits.len(), 6);

        // Each resubmission of a command buffer is preceded by a wait on the fence of its previous submission
        for (n, &(index, command_buffer, _)) in submits.iter().enumerate() {
            if let Some(&(previous_index, _, previous_fence)) =
                submits[..n].iter().rev().find(|(_, cb, _)| *cb == command_buffer)
            {
                let waited = events[previous_index..index]
                    .iter()
                    .any(|e| *e == Event::WaitFence(previous_fence));
                assert!(waited, "submission {n} reused {command_buffer:?} without waiting");
            }
        }

        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn test_slots_rotate() {
        let (device, _context, mut sync) = setup(3, 3);
        assert_eq!(sync.frames_in_flight(), 3);

        let mut slots = Vec::new();
        for _ in 0..4 {
            slots.push(sync.current_slot());
            run_frame(&device, &mut sync);
        }
        assert_eq!(slots, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_double_submit_rejected() {
        let (device, _context, mut sync) = setup(1, 2);

        let FrameStatus::Ready(frame) = sync.begin_frame(&device, &device).unwrap() else { panic!() };
        let command_buffer = frame.command_buffer();
        let stolen = AcquiredFrame::<MockDevice> {
            slot: frame.slot,
            image_index: frame.image_index,
            epoch: frame.epoch,
            frame_number: frame.frame_number,
            suboptimal: false,
            image_available: frame.image_available,
            command_buffer,
        };
        let submitted = sync.submit(&device, frame, &[PassSubmit::color_output(command_buffer)]).unwrap();

        let err = sync.submit(&device, stolen, &[PassSubmit::color_output(command_buffer)]).unwrap_err();
        assert!(matches!(err, VkxError::FrameInFlight { slot: 0 }));

        sync.present(&device, submitted).unwrap();
    }

    #[test]
    fn test_chained_passes_wait_on_previous_signal() {
        let (device, context, mut sync) = setup(2, 2);
        let overlay = device.allocate_command_buffers(&context, 1).unwrap()[0];
        device.clear_events();

        let FrameStatus::Ready(frame) = sync.begin_frame(&device, &device).unwrap() else { panic!() };
        let passes = [
            PassSubmit::color_output(frame.command_buffer()),
            PassSubmit::transfer(overlay),
        ];
        let submitted = sync.submit(&device, frame, &passes).unwrap();
        sync.present(&device, submitted).unwrap();

        let submits: Vec<_> = device
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Submit { waits, signals, fence, .. } => Some((waits, signals, fence)),
                _ => None,
            })
            .collect();
        assert_eq!(submits.len(), 2);

        let (_, first_signals, first_fence) = &submits[0];
        let (second_waits, _, second_fence) = &submits[1];
        assert!(first_fence.is_none());
        assert!(second_fence.is_some());
        assert_eq!(second_waits.as_slice(), &[(first_signals[0], vk::PipelineStageFlags::TRANSFER)]);
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn test_out_of_date_acquire_reported() {
        let (device, _context, mut sync) = setup(2, 2);
        device.script_acquire(AcquireOutcome::OutOfDate);

        assert!(matches!(sync.begin_frame(&device, &device).unwrap(), FrameStatus::OutOfDate));
        // The failed acquire does not consume the slot
        assert_eq!(sync.current_slot(), 0);
        assert_eq!(run_frame(&device, &mut sync), PresentOutcome::Presented);
    }

    #[test]
    fn test_present_out_of_date_still_advances() {
        let (device, _context, mut sync) = setup(2, 2);
        device.script_present(PresentOutcome::OutOfDate);

        assert_eq!(run_frame(&device, &mut sync), PresentOutcome::OutOfDate);
        assert_eq!(sync.current_slot(), 1);
    }

    #[test]
    fn test_frames_from_old_epoch_rejected() {
        let (device, _context, mut sync) = setup(2, 2);

        let FrameStatus::Ready(frame) = sync.begin_frame(&device, &device).unwrap() else { panic!() };
        let command_buffer = frame.command_buffer();
        sync.on_swapchain_recreated(&device, 3).unwrap();

        let err = sync.submit(&device, frame, &[PassSubmit::color_output(command_buffer)]).unwrap_err();
        assert!(matches!(err, VkxError::StaleFrame { frame_epoch: 0, current_epoch: 1 }));

        // New epoch frames work, including on the new image index
        for _ in 0..3 {
            assert_eq!(run_frame(&device, &mut sync), PresentOutcome::Presented);
        }
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn test_recreation_rebuilds_per_image_semaphores() {
        let (device, _context, mut sync) = setup(2, 2);
        // 2 acquire + 2 render complete
        assert_eq!(device.live_semaphores(), 4);

        sync.on_swapchain_recreated(&device, 4).unwrap();
        assert_eq!(device.live_semaphores(), 6);
        assert_eq!(device.events().first(), Some(&Event::WaitIdle));
    }

    #[test]
    fn test_failed_submit_keeps_slot_usable() {
        let (device, _context, mut sync) = setup(1, 2);

        let FrameStatus::Ready(frame) = sync.begin_frame(&device, &device).unwrap() else { panic!() };
        let command_buffer = frame.command_buffer();
        device.fail_next_submit();
        assert!(sync.submit(&device, frame, &[PassSubmit::color_output(command_buffer)]).is_err());

        // The unconsumed acquire semaphore was replaced and the fence does not deadlock
        assert_eq!(run_frame(&device, &mut sync), PresentOutcome::Presented);
        assert_eq!(run_frame(&device, &mut sync), PresentOutcome::Presented);
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    fn submit_chain(
        device: &MockDevice,
        sync: &mut FrameSync<MockDevice>,
        extra: &[MockCommandBuffer],
    ) -> VkxResult<PresentOutcome> {
        let FrameStatus::Ready(frame) = sync.begin_frame(device, device)? else {
            panic!("unexpected out of date");
        };
        let mut passes = vec![PassSubmit::color_output(frame.command_buffer())];
        passes.extend(extra.iter().copied().map(PassSubmit::transfer));
        let submitted = sync.submit(device, frame, &passes)?;
        sync.present(device, submitted)
    }

    #[test]
    fn test_failed_last_pass_waits_for_queued_passes() {
        let (device, context, mut sync) = setup(1, 2);
        let overlay = device.allocate_command_buffers(&context, 1).unwrap()[0];
        device.clear_events();

        // Pass 0 is queued, the overlay pass fails
        device.fail_submit_after(1);
        assert!(submit_chain(&device, &mut sync, &[overlay]).is_err());

        let events = device.events();
        let queued = events.iter().position(|e| matches!(e, Event::Submit { .. })).unwrap();
        let idle = events.iter().position(|e| *e == Event::WaitIdle).unwrap();
        assert!(queued < idle);

        // The slot's primary command buffer is resubmitted only after its first submission finished
        assert_eq!(submit_chain(&device, &mut sync, &[overlay]).unwrap(), PresentOutcome::Presented);
        assert_eq!(submit_chain(&device, &mut sync, &[overlay]).unwrap(), PresentOutcome::Presented);
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn test_failed_middle_pass_recovers_slot() {
        let (device, context, mut sync) = setup(1, 3);
        let overlays = device.allocate_command_buffers(&context, 2).unwrap();

        device.fail_submit_after(1);
        assert!(submit_chain(&device, &mut sync, &overlays).is_err());

        for _ in 0..4 {
            assert_eq!(submit_chain(&device, &mut sync, &overlays).unwrap(), PresentOutcome::Presented);
        }
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn test_failed_recovery_blocks_slot_until_recreated() {
        let (device, _context, mut sync) = setup(1, 2);

        device.fail_next_submit();
        device.set_hang(true);
        assert!(submit_chain(&device, &mut sync, &[]).is_err());

        // The device never went idle, so the slot cannot be trusted
        let err = sync.begin_frame(&device, &device).unwrap_err();
        assert!(matches!(err, VkxError::InvalidOperation { .. }));

        device.set_hang(false);
        sync.on_swapchain_recreated(&device, 2).unwrap();
        assert_eq!(run_frame(&device, &mut sync), PresentOutcome::Presented);
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn test_second_begin_before_present_rejected() {
        let (device, _context, mut sync) = setup(1, 2);

        let FrameStatus::Ready(frame) = sync.begin_frame(&device, &device).unwrap() else { panic!() };
        let err = sync.begin_frame(&device, &device).unwrap_err();
        assert!(matches!(err, VkxError::InvalidOperation { .. }));

        let command_buffer = frame.command_buffer();
        let submitted = sync.submit(&device, frame, &[PassSubmit::color_output(command_buffer)]).unwrap();
        // Still pending until presented
        assert!(sync.begin_frame(&device, &device).is_err());
        sync.present(&device, submitted).unwrap();

        assert_eq!(run_frame(&device, &mut sync), PresentOutcome::Presented);
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn test_image_owned_by_other_slot_is_waited() {
        let (device, _context, mut sync) = setup(2, 2);

        // Slot 0 renders image 0
        run_frame(&device, &mut sync);
        // Slot 1 is handed image 0 again before slot 0 was waited
        device.script_acquire(AcquireOutcome::Acquired { image_index: 0, suboptimal: false });
        device.clear_events();

        let FrameStatus::Ready(frame) = sync.begin_frame(&device, &device).unwrap() else { panic!() };
        assert_eq!(frame.slot(), 1);
        assert!(device.events().iter().any(|e| matches!(e, Event::WaitFence(_))));

        let command_buffer = frame.command_buffer();
        let submitted = sync.submit(&device, frame, &[PassSubmit::color_output(command_buffer)]).unwrap();
        sync.present(&device, submitted).unwrap();
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn test_fence_timeout_propagates() {
        let (device, _context, mut sync) = setup(1, 2);
        run_frame(&device, &mut sync);

        device.set_hang(true);
        let err = sync.begin_frame(&device, &device).unwrap_err();
        assert!(matches!(err, VkxError::FenceTimeout { .. }));
    }

    #[test]
    fn test_destroy_releases_everything() {
        let (device, context, mut sync) = setup(2, 3);
        run_frame(&device, &mut sync);
        sync.wait_all(&device).unwrap();

        sync.destroy(&device, &context);
        assert_eq!(device.live_semaphores(), 0);
        assert_eq!(device.live_fences(), 0);
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn test_zero_frames_rejected() {
        let device = MockDevice::new(2);
        let context = MockRecordingContext::new();
        assert!(FrameSync::new(&device, &context, 2, &config(0)).is_err());
    }
}
