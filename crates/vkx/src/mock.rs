//! Recording device used by the protocol tests
//!
//! Simulates an in-order queue: a submission completes when a fence waited
//! on (or signalled by) it or any later submission completes. Every call is
//! appended to an event log, and usage that real Vulkan would reject or
//! that would race the GPU is recorded as a violation.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::marker::PhantomData;

use ash::vk;

use crate::backend::{
    AcquireOutcome, BufferBarrierSpec, CommandDevice, ImageDesc, LayoutTransition, PresentOutcome, PresentationEngine,
    Submission, SyncDevice, TransferDevice,
};
use crate::error::{VkxError, VkxResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MockSemaphore(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MockFence(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MockCommandBuffer(pub u64);

#[derive(Debug, PartialEq, Eq)]
pub struct MockHostBuffer {
    pub id: u64,
    pub size: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub struct MockDeviceBuffer {
    pub id: u64,
    pub size: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub struct MockDeviceImage {
    pub id: u64,
}

/// Thread-confined like the real command pool
pub struct MockRecordingContext {
    _not_send: PhantomData<*const ()>,
}

impl MockRecordingContext {
    pub fn new() -> Self {
        Self { _not_send: PhantomData }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    CreateSemaphore(MockSemaphore),
    DestroySemaphore(MockSemaphore),
    CreateFence { fence: MockFence, signaled: bool },
    DestroyFence(MockFence),
    WaitFence(MockFence),
    ResetFence(MockFence),
    Submit {
        waits: Vec<(MockSemaphore, vk::PipelineStageFlags)>,
        command_buffers: Vec<MockCommandBuffer>,
        signals: Vec<MockSemaphore>,
        fence: Option<MockFence>,
    },
    WaitIdle,
    AllocateCommandBuffer(MockCommandBuffer),
    FreeCommandBuffer(MockCommandBuffer),
    Begin(MockCommandBuffer),
    End(MockCommandBuffer),
    CreateHostBuffer { id: u64, size: u64 },
    DestroyHostBuffer(u64),
    CreateDeviceBuffer { id: u64, size: u64 },
    CreateDeviceImage(u64),
    CopyBuffer { src: u64, dst: u64, size: u64 },
    BufferBarrier { buffer: u64, barrier: BufferBarrierSpec },
    CopyBufferToImage { src: u64, dst: u64 },
    Transition { image: u64, transition: LayoutTransition },
    Acquire { image_index: u32, signal: MockSemaphore },
    Present { image_index: u32, wait: MockSemaphore },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    Pending,
    Signaled,
}

struct QueuedWork {
    command_buffers: Vec<MockCommandBuffer>,
    host_buffers: Vec<u64>,
    fence: Option<MockFence>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    events: Vec<Event>,
    violations: Vec<String>,
    fences: HashMap<MockFence, FenceState>,
    semaphores: HashSet<MockSemaphore>,
    signaled: HashSet<MockSemaphore>,
    queue: VecDeque<QueuedWork>,
    recorded_host_buffers: HashMap<MockCommandBuffer, Vec<u64>>,
    live_host_buffers: HashSet<u64>,
    hang: bool,
    /// Submissions left to accept before the next one fails
    fail_submit_in: Option<usize>,
    fail_next_begin: bool,
    fail_next_end: bool,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    next_image: u32,
}

impl State {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Complete queued work up to and including the submission that signals `fence`
    fn complete_through(&mut self, fence: MockFence) {
        let Some(position) = self.queue.iter().position(|work| work.fence == Some(fence)) else {
            return;
        };
        for work in self.queue.drain(..=position) {
            if let Some(done) = work.fence {
                self.fences.insert(done, FenceState::Signaled);
            }
        }
    }

    fn complete_all(&mut self) {
        for work in self.queue.drain(..) {
            if let Some(done) = work.fence {
                self.fences.insert(done, FenceState::Signaled);
            }
        }
    }
}

pub struct MockDevice {
    image_count: usize,
    state: RefCell<State>,
}

impl MockDevice {
    pub fn new(image_count: usize) -> Self {
        Self {
            image_count,
            state: RefCell::new(State::default()),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.borrow().violations.clone()
    }

    pub fn clear_events(&self) {
        self.state.borrow_mut().events.clear();
    }

    /// Make every subsequent fence wait time out
    pub fn set_hang(&self, hang: bool) {
        self.state.borrow_mut().hang = hang;
    }

    pub fn fail_next_submit(&self) {
        self.fail_submit_after(0);
    }

    /// Accept `accepted` more submissions, then fail the one after
    pub fn fail_submit_after(&self, accepted: usize) {
        self.state.borrow_mut().fail_submit_in = Some(accepted);
    }

    pub fn fail_next_begin(&self) {
        self.state.borrow_mut().fail_next_begin = true;
    }

    pub fn fail_next_end(&self) {
        self.state.borrow_mut().fail_next_end = true;
    }

    /// Let the GPU finish everything queued so far
    pub fn complete_all(&self) {
        self.state.borrow_mut().complete_all();
    }

    pub fn script_acquire(&self, outcome: AcquireOutcome) {
        self.state.borrow_mut().acquire_script.push_back(outcome);
    }

    pub fn script_present(&self, outcome: PresentOutcome) {
        self.state.borrow_mut().present_script.push_back(outcome);
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.borrow().semaphores.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state.borrow().fences.len()
    }

    pub fn live_host_buffers(&self) -> usize {
        self.state.borrow().live_host_buffers.len()
    }
}

impl SyncDevice for MockDevice {
    type Semaphore = MockSemaphore;
    type Fence = MockFence;
    type CommandBuffer = MockCommandBuffer;

    fn create_semaphore(&self) -> VkxResult<MockSemaphore> {
        let mut state = self.state.borrow_mut();
        let semaphore = MockSemaphore(state.id());
        state.semaphores.insert(semaphore);
        state.events.push(Event::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: MockSemaphore) {
        let mut state = self.state.borrow_mut();
        if !state.semaphores.remove(&semaphore) {
            state.violations.push(format!("destroyed unknown semaphore {semaphore:?}"));
        }
        state.signaled.remove(&semaphore);
        state.events.push(Event::DestroySemaphore(semaphore));
    }

    fn create_fence(&self, signaled: bool) -> VkxResult<MockFence> {
        let mut state = self.state.borrow_mut();
        let fence = MockFence(state.id());
        let initial = if signaled { FenceState::Signaled } else { FenceState::Unsignaled };
        state.fences.insert(fence, initial);
        state.events.push(Event::CreateFence { fence, signaled });
        Ok(fence)
    }

    fn destroy_fence(&self, fence: MockFence) {
        let mut state = self.state.borrow_mut();
        match state.fences.remove(&fence) {
            Some(FenceState::Pending) => state.violations.push(format!("destroyed pending fence {fence:?}")),
            None => state.violations.push(format!("destroyed unknown fence {fence:?}")),
            _ => {}
        }
        state.events.push(Event::DestroyFence(fence));
    }

    fn wait_fence(&self, fence: MockFence, timeout_ns: u64) -> VkxResult<()> {
        let mut state = self.state.borrow_mut();
        state.events.push(Event::WaitFence(fence));
        if state.hang {
            return Err(VkxError::FenceTimeout { timeout_ns });
        }
        match state.fences.get(&fence).copied() {
            Some(FenceState::Signaled) => Ok(()),
            Some(FenceState::Pending) => {
                state.complete_through(fence);
                Ok(())
            }
            // Nothing will ever signal it
            Some(FenceState::Unsignaled) => Err(VkxError::FenceTimeout { timeout_ns }),
            None => Err(VkxError::invalid("wait on unknown fence")),
        }
    }

    fn reset_fence(&self, fence: MockFence) -> VkxResult<()> {
        let mut state = self.state.borrow_mut();
        state.events.push(Event::ResetFence(fence));
        match state.fences.get(&fence).copied() {
            Some(FenceState::Pending) => {
                state.violations.push(format!("reset pending fence {fence:?}"));
                Err(VkxError::invalid("fence is still pending"))
            }
            Some(_) => {
                state.fences.insert(fence, FenceState::Unsignaled);
                Ok(())
            }
            None => Err(VkxError::invalid("reset of unknown fence")),
        }
    }

    fn fence_signaled(&self, fence: MockFence) -> VkxResult<bool> {
        let state = self.state.borrow();
        Ok(state.fences.get(&fence) == Some(&FenceState::Signaled))
    }

    fn submit(
        &self,
        submission: &Submission<'_, MockSemaphore, MockCommandBuffer>,
        fence: Option<MockFence>,
    ) -> VkxResult<()> {
        let mut state = self.state.borrow_mut();
        match state.fail_submit_in {
            Some(0) => {
                state.fail_submit_in = None;
                return Err(VkxError::Api(vk::Result::ERROR_DEVICE_LOST));
            }
            Some(remaining) => state.fail_submit_in = Some(remaining - 1),
            None => {}
        }

        if let Some(fence) = fence {
            if state.fences.get(&fence) != Some(&FenceState::Unsignaled) {
                state.violations.push(format!("submitted with fence {fence:?} that is not unsignalled"));
            }
            state.fences.insert(fence, FenceState::Pending);
        }

        for command_buffer in submission.command_buffers {
            let still_queued = state
                .queue
                .iter()
                .any(|work| work.command_buffers.contains(command_buffer));
            if still_queued {
                state
                    .violations
                    .push(format!("resubmitted {command_buffer:?} while its previous submission is in flight"));
            }
        }

        for wait in submission.waits {
            if !state.signaled.remove(&wait.semaphore) {
                state.violations.push(format!("waited on {:?} which nothing signals", wait.semaphore));
            }
        }
        for signal in submission.signals {
            if !state.signaled.insert(*signal) {
                state.violations.push(format!("signalled {signal:?} twice without a wait"));
            }
        }

        let host_buffers = submission
            .command_buffers
            .iter()
            .flat_map(|cb| state.recorded_host_buffers.get(cb).cloned().unwrap_or_default())
            .collect();

        state.queue.push_back(QueuedWork {
            command_buffers: submission.command_buffers.to_vec(),
            host_buffers,
            fence,
        });
        state.events.push(Event::Submit {
            waits: submission.waits.iter().map(|w| (w.semaphore, w.stage)).collect(),
            command_buffers: submission.command_buffers.to_vec(),
            signals: submission.signals.to_vec(),
            fence,
        });
        Ok(())
    }

    fn wait_idle(&self) -> VkxResult<()> {
        let mut state = self.state.borrow_mut();
        state.events.push(Event::WaitIdle);
        if state.hang {
            return Err(VkxError::Api(vk::Result::ERROR_DEVICE_LOST));
        }
        state.complete_all();
        // Acquire semaphores nobody waited on stay signalled, matching Vulkan
        Ok(())
    }
}

impl CommandDevice for MockDevice {
    type RecordingContext = MockRecordingContext;

    fn allocate_command_buffers(
        &self,
        _context: &MockRecordingContext,
        count: u32,
    ) -> VkxResult<Vec<MockCommandBuffer>> {
        let mut state = self.state.borrow_mut();
        let buffers: Vec<_> = (0..count).map(|_| MockCommandBuffer(state.id())).collect();
        for buffer in &buffers {
            state.events.push(Event::AllocateCommandBuffer(*buffer));
        }
        Ok(buffers)
    }

    fn free_command_buffers(&self, _context: &MockRecordingContext, buffers: &[MockCommandBuffer]) {
        let mut state = self.state.borrow_mut();
        for buffer in buffers {
            if state.queue.iter().any(|work| work.command_buffers.contains(buffer)) {
                state.violations.push(format!("freed {buffer:?} while it is in flight"));
            }
            state.recorded_host_buffers.remove(buffer);
            state.events.push(Event::FreeCommandBuffer(*buffer));
        }
    }

    fn begin_one_shot(&self, command_buffer: MockCommandBuffer) -> VkxResult<()> {
        let mut state = self.state.borrow_mut();
        if std::mem::take(&mut state.fail_next_begin) {
            return Err(VkxError::Api(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        state.recorded_host_buffers.remove(&command_buffer);
        state.events.push(Event::Begin(command_buffer));
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: MockCommandBuffer) -> VkxResult<()> {
        let mut state = self.state.borrow_mut();
        if std::mem::take(&mut state.fail_next_end) {
            return Err(VkxError::Api(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        state.events.push(Event::End(command_buffer));
        Ok(())
    }
}

impl TransferDevice for MockDevice {
    type HostBuffer = MockHostBuffer;
    type DeviceBuffer = MockDeviceBuffer;
    type DeviceImage = MockDeviceImage;

    fn create_host_buffer(&self, data: &[u8]) -> VkxResult<MockHostBuffer> {
        let mut state = self.state.borrow_mut();
        let id = state.id();
        let size = data.len() as u64;
        state.live_host_buffers.insert(id);
        state.events.push(Event::CreateHostBuffer { id, size });
        Ok(MockHostBuffer { id, size })
    }

    fn destroy_host_buffer(&self, buffer: MockHostBuffer) {
        let mut state = self.state.borrow_mut();
        if state.queue.iter().any(|work| work.host_buffers.contains(&buffer.id)) {
            state
                .violations
                .push(format!("destroyed staging buffer {} while a copy from it is in flight", buffer.id));
        }
        state.live_host_buffers.remove(&buffer.id);
        state.events.push(Event::DestroyHostBuffer(buffer.id));
    }

    fn create_device_buffer(&self, size: u64, _usage: vk::BufferUsageFlags) -> VkxResult<MockDeviceBuffer> {
        let mut state = self.state.borrow_mut();
        let id = state.id();
        state.events.push(Event::CreateDeviceBuffer { id, size });
        Ok(MockDeviceBuffer { id, size })
    }

    fn create_device_image(&self, _desc: &ImageDesc) -> VkxResult<MockDeviceImage> {
        let mut state = self.state.borrow_mut();
        let id = state.id();
        state.events.push(Event::CreateDeviceImage(id));
        Ok(MockDeviceImage { id })
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: MockCommandBuffer,
        src: &MockHostBuffer,
        dst: &MockDeviceBuffer,
        size: u64,
    ) {
        let mut state = self.state.borrow_mut();
        state.recorded_host_buffers.entry(command_buffer).or_default().push(src.id);
        state.events.push(Event::CopyBuffer { src: src.id, dst: dst.id, size });
    }

    fn cmd_buffer_barrier(
        &self,
        _command_buffer: MockCommandBuffer,
        buffer: &MockDeviceBuffer,
        barrier: BufferBarrierSpec,
    ) {
        self.state
            .borrow_mut()
            .events
            .push(Event::BufferBarrier { buffer: buffer.id, barrier });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: MockCommandBuffer,
        src: &MockHostBuffer,
        dst: &MockDeviceImage,
        _desc: &ImageDesc,
    ) {
        let mut state = self.state.borrow_mut();
        state.recorded_host_buffers.entry(command_buffer).or_default().push(src.id);
        state.events.push(Event::CopyBufferToImage { src: src.id, dst: dst.id });
    }

    fn cmd_transition_image(
        &self,
        _command_buffer: MockCommandBuffer,
        image: &MockDeviceImage,
        transition: LayoutTransition,
    ) {
        self.state
            .borrow_mut()
            .events
            .push(Event::Transition { image: image.id, transition });
    }
}

impl PresentationEngine<Self> for MockDevice {
    fn image_count(&self) -> usize {
        self.image_count
    }

    fn acquire_next_image(&self, signal: MockSemaphore, _timeout_ns: u64) -> VkxResult<AcquireOutcome> {
        let mut state = self.state.borrow_mut();
        let outcome = state.acquire_script.pop_front().unwrap_or_else(|| {
            let image_index = state.next_image;
            AcquireOutcome::Acquired { image_index, suboptimal: false }
        });

        if let AcquireOutcome::Acquired { image_index, .. } = outcome {
            state.next_image = (image_index + 1) % self.image_count as u32;
            if !state.signaled.insert(signal) {
                state.violations.push(format!("acquire reused still-signalled {signal:?}"));
            }
            state.events.push(Event::Acquire { image_index, signal });
        }
        Ok(outcome)
    }

    fn present(&self, image_index: u32, wait: MockSemaphore) -> VkxResult<PresentOutcome> {
        let mut state = self.state.borrow_mut();
        if !state.signaled.remove(&wait) {
            state.violations.push(format!("present waited on {wait:?} which nothing signals"));
        }
        state.events.push(Event::Present { image_index, wait });
        Ok(state.present_script.pop_front().unwrap_or(PresentOutcome::Presented))
    }
}
