// Frame loop - per-slot synchronization protocol
//
// Each of the N frame slots owns a fence, two semaphores and a command
// buffer (plus compute equivalents in particle mode). A slot moves through
//
//   Idle -> Acquiring -> Recording -> Submitted -> (fence wait) -> Idle
//
// and its resources are only touched again after its fence has been
// observed signaled. The Vulkan side lives behind FrameBackend so the
// protocol itself runs without a GPU.

use anyhow::Result;
use ash::vk;

use crate::backend::{AcquireOutcome, PresentOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Acquiring,
    Recording,
    Submitted,
}

/// What happened to one call of `FrameLoop::draw_frame`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Image presented; `recreated` when the swapchain was rebuilt afterwards
    Presented { recreated: bool },
    /// Acquire reported out-of-date; swapchain rebuilt, nothing submitted
    Skipped,
}

/// Semaphores the graphics submission can wait on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitSemaphore {
    ComputeFinished,
    ImageAvailable,
}

pub type GraphicsWait = (WaitSemaphore, vk::PipelineStageFlags);

/// Ordered wait list for the graphics submission.
///
/// Vertex input reads the particle buffer the compute pass just wrote;
/// color output needs the acquired image.
pub fn graphics_waits(with_compute: bool) -> Vec<GraphicsWait> {
    let mut waits = Vec::with_capacity(2);
    if with_compute {
        waits.push((
            WaitSemaphore::ComputeFinished,
            vk::PipelineStageFlags::VERTEX_INPUT,
        ));
    }
    waits.push((
        WaitSemaphore::ImageAvailable,
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
    ));
    waits
}

/// GPU-facing half of the frame protocol, one method per step
pub trait FrameBackend {
    fn uses_compute(&self) -> bool;

    fn wait_compute_fence(&mut self, slot: usize) -> Result<()>;
    fn wait_graphics_fence(&mut self, slot: usize) -> Result<()>;

    /// Acquire signals the slot's image-available semaphore on success
    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome>;

    fn reset_compute_fence(&mut self, slot: usize) -> Result<()>;
    fn reset_graphics_fence(&mut self, slot: usize) -> Result<()>;

    fn update_uniforms(&mut self, slot: usize) -> Result<()>;

    fn record_compute(&mut self, slot: usize) -> Result<()>;
    /// Waits on nothing, signals compute-finished and the compute fence
    fn submit_compute(&mut self, slot: usize) -> Result<()>;

    fn record_graphics(&mut self, slot: usize, image_index: u32) -> Result<()>;
    /// Signals render-finished and the graphics fence
    fn submit_graphics(&mut self, slot: usize, waits: &[GraphicsWait]) -> Result<()>;

    /// Waits on render-finished
    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;

    fn recreate_swapchain(&mut self) -> Result<()>;
}

pub struct FrameLoop {
    states: Vec<SlotState>,
    current: usize,
    resized: bool,
}

impl FrameLoop {
    pub fn new(frames_in_flight: usize) -> Result<Self> {
        anyhow::ensure!(frames_in_flight >= 1, "At least one frame in flight is required");

        Ok(Self {
            states: vec![SlotState::Idle; frames_in_flight],
            current: 0,
            resized: false,
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.states.len()
    }

    pub fn current_frame(&self) -> usize {
        self.current
    }

    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.states.get(slot).copied()
    }

    /// Window reported a new size; recreate after the next present
    pub fn notify_resized(&mut self) {
        self.resized = true;
    }

    fn transition(&mut self, slot: usize, to: SlotState) {
        let from = std::mem::replace(&mut self.states[slot], to);
        if from != to {
            log::trace!("Frame slot {}: {:?} -> {:?}", slot, from, to);
        }
    }

    pub fn draw_frame(&mut self, backend: &mut impl FrameBackend) -> Result<FrameStatus> {
        let slot = self.current;
        let with_compute = backend.uses_compute();

        // Step 1: Wait until the GPU is done with this slot
        if with_compute {
            backend.wait_compute_fence(slot)?;
        }
        backend.wait_graphics_fence(slot)?;
        self.transition(slot, SlotState::Idle);

        // Step 2: Acquire next swapchain image
        self.transition(slot, SlotState::Acquiring);
        let (image_index, acquire_suboptimal) = match backend.acquire_image(slot)? {
            AcquireOutcome::Ready(index) => (index, false),
            AcquireOutcome::Suboptimal(index) => (index, true),
            AcquireOutcome::OutOfDate => {
                // Fences stay signaled so the retry doesn't deadlock
                log::debug!("Swapchain out of date on acquire, recreating");
                backend.recreate_swapchain()?;
                self.resized = false;
                self.transition(slot, SlotState::Idle);
                return Ok(FrameStatus::Skipped);
            }
        };

        self.transition(slot, SlotState::Recording);

        // Step 3: Particle update runs ahead of graphics on the same slot
        if with_compute {
            backend.reset_compute_fence(slot)?;
            backend.update_uniforms(slot)?;
            backend.record_compute(slot)?;
            backend.submit_compute(slot)?;
        }

        // Step 4: Fence reset only after an image is definitely coming
        backend.reset_graphics_fence(slot)?;
        if !with_compute {
            backend.update_uniforms(slot)?;
        }

        // Step 5: Record + submit graphics
        backend.record_graphics(slot, image_index)?;
        backend.submit_graphics(slot, &graphics_waits(with_compute))?;
        self.transition(slot, SlotState::Submitted);

        // Step 6: Present, then rebuild if the surface changed
        let presented = backend.present(slot, image_index)?;
        let recreate = acquire_suboptimal || presented.needs_recreate() || self.resized;
        if recreate {
            log::debug!(
                "Recreating swapchain after present ({:?}, resized: {})",
                presented,
                self.resized
            );
            self.resized = false;
            backend.recreate_swapchain()?;
        }

        self.current = (slot + 1) % self.states.len();

        Ok(FrameStatus::Presented {
            recreated: recreate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        WaitCompute(usize),
        WaitGraphics(usize),
        Acquire(usize),
        ResetCompute(usize),
        ResetGraphics(usize),
        Uniforms(usize),
        RecordCompute(usize),
        SubmitCompute(usize),
        RecordGraphics(usize, u32),
        SubmitGraphics(usize, Vec<GraphicsWait>),
        Present(usize, u32),
        Recreate,
    }

    /// Records every call and simulates fence state per slot
    struct MockBackend {
        compute: bool,
        calls: Vec<Call>,
        acquires: VecDeque<AcquireOutcome>,
        presents: VecDeque<PresentOutcome>,
        graphics_pending: Vec<bool>,
        graphics_signaled: Vec<bool>,
        compute_pending: Vec<bool>,
        next_image: u32,
    }

    impl MockBackend {
        fn new(frames: usize, compute: bool) -> Self {
            Self {
                compute,
                calls: Vec::new(),
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                graphics_pending: vec![false; frames],
                graphics_signaled: vec![true; frames],
                compute_pending: vec![false; frames],
                next_image: 0,
            }
        }

        fn position(&self, call: &Call) -> Option<usize> {
            self.calls.iter().position(|c| c == call)
        }

        fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|c| pred(c)).count()
        }
    }

    impl FrameBackend for MockBackend {
        fn uses_compute(&self) -> bool {
            self.compute
        }

        fn wait_compute_fence(&mut self, slot: usize) -> Result<()> {
            self.compute_pending[slot] = false;
            self.calls.push(Call::WaitCompute(slot));
            Ok(())
        }

        fn wait_graphics_fence(&mut self, slot: usize) -> Result<()> {
            // A wait on an unsignaled, never-submitted fence would hang forever
            assert!(
                self.graphics_pending[slot] || self.graphics_signaled[slot],
                "waited on a fence that can never signal"
            );
            self.graphics_pending[slot] = false;
            self.graphics_signaled[slot] = true;
            self.calls.push(Call::WaitGraphics(slot));
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
            self.calls.push(Call::Acquire(slot));
            let outcome = self.acquires.pop_front().unwrap_or_else(|| {
                let index = self.next_image;
                self.next_image = (self.next_image + 1) % 3;
                AcquireOutcome::Ready(index)
            });
            Ok(outcome)
        }

        fn reset_compute_fence(&mut self, slot: usize) -> Result<()> {
            assert!(!self.compute_pending[slot], "compute fence reset while in flight");
            self.calls.push(Call::ResetCompute(slot));
            Ok(())
        }

        fn reset_graphics_fence(&mut self, slot: usize) -> Result<()> {
            assert!(!self.graphics_pending[slot], "graphics fence reset while in flight");
            self.graphics_signaled[slot] = false;
            self.calls.push(Call::ResetGraphics(slot));
            Ok(())
        }

        fn update_uniforms(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Uniforms(slot));
            Ok(())
        }

        fn record_compute(&mut self, slot: usize) -> Result<()> {
            assert!(!self.compute_pending[slot], "compute buffer recorded while in flight");
            self.calls.push(Call::RecordCompute(slot));
            Ok(())
        }

        fn submit_compute(&mut self, slot: usize) -> Result<()> {
            self.compute_pending[slot] = true;
            self.calls.push(Call::SubmitCompute(slot));
            Ok(())
        }

        fn record_graphics(&mut self, slot: usize, image_index: u32) -> Result<()> {
            assert!(!self.graphics_pending[slot], "graphics buffer recorded while in flight");
            self.calls.push(Call::RecordGraphics(slot, image_index));
            Ok(())
        }

        fn submit_graphics(&mut self, slot: usize, waits: &[GraphicsWait]) -> Result<()> {
            self.graphics_pending[slot] = true;
            self.calls.push(Call::SubmitGraphics(slot, waits.to_vec()));
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
            self.calls.push(Call::Present(slot, image_index));
            Ok(self.presents.pop_front().unwrap_or(PresentOutcome::Optimal))
        }

        fn recreate_swapchain(&mut self) -> Result<()> {
            self.calls.push(Call::Recreate);
            Ok(())
        }
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        assert!(FrameLoop::new(0).is_err());
    }

    #[test]
    fn frame_index_rotates_through_slots() {
        let mut frames = FrameLoop::new(3).unwrap();
        let mut backend = MockBackend::new(3, false);

        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(frames.current_frame());
            frames.draw_frame(&mut backend).unwrap();
        }

        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn slot_is_reused_only_after_its_fence_is_observed() {
        let mut frames = FrameLoop::new(2).unwrap();
        let mut backend = MockBackend::new(2, false);

        for _ in 0..3 {
            frames.draw_frame(&mut backend).unwrap();
        }

        // Frame 3 reuses slot 0: its fence wait must sit between the first
        // submission and the second recording of that slot
        let first_submit = backend
            .position(&Call::SubmitGraphics(0, graphics_waits(false)))
            .unwrap();
        let waits: Vec<usize> = backend
            .calls
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == Call::WaitGraphics(0))
            .map(|(i, _)| i)
            .collect();
        let records: Vec<usize> = backend
            .calls
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, Call::RecordGraphics(0, _)))
            .map(|(i, _)| i)
            .collect();

        assert_eq!(waits.len(), 2);
        assert_eq!(records.len(), 2);
        assert!(first_submit < waits[1] && waits[1] < records[1]);
    }

    #[test]
    fn model_frame_follows_protocol_order() {
        let mut frames = FrameLoop::new(2).unwrap();
        let mut backend = MockBackend::new(2, false);

        let status = frames.draw_frame(&mut backend).unwrap();

        assert_eq!(status, FrameStatus::Presented { recreated: false });
        assert_eq!(
            backend.calls,
            vec![
                Call::WaitGraphics(0),
                Call::Acquire(0),
                Call::ResetGraphics(0),
                Call::Uniforms(0),
                Call::RecordGraphics(0, 0),
                Call::SubmitGraphics(
                    0,
                    vec![(
                        WaitSemaphore::ImageAvailable,
                        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    )]
                ),
                Call::Present(0, 0),
            ]
        );
        assert_eq!(frames.slot_state(0), Some(SlotState::Submitted));
        assert_eq!(frames.slot_state(1), Some(SlotState::Idle));
    }

    #[test]
    fn compute_is_submitted_before_graphics_and_waited_at_vertex_input() {
        let mut frames = FrameLoop::new(2).unwrap();
        let mut backend = MockBackend::new(2, true);

        frames.draw_frame(&mut backend).unwrap();

        assert_eq!(
            backend.calls,
            vec![
                Call::WaitCompute(0),
                Call::WaitGraphics(0),
                Call::Acquire(0),
                Call::ResetCompute(0),
                Call::Uniforms(0),
                Call::RecordCompute(0),
                Call::SubmitCompute(0),
                Call::ResetGraphics(0),
                Call::RecordGraphics(0, 0),
                Call::SubmitGraphics(
                    0,
                    vec![
                        (
                            WaitSemaphore::ComputeFinished,
                            vk::PipelineStageFlags::VERTEX_INPUT
                        ),
                        (
                            WaitSemaphore::ImageAvailable,
                            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                        ),
                    ]
                ),
                Call::Present(0, 0),
            ]
        );
    }

    #[test]
    fn out_of_date_acquire_skips_frame_without_touching_fences() {
        let mut frames = FrameLoop::new(2).unwrap();
        let mut backend = MockBackend::new(2, false);
        backend.acquires.push_back(AcquireOutcome::OutOfDate);

        let status = frames.draw_frame(&mut backend).unwrap();

        assert_eq!(status, FrameStatus::Skipped);
        assert_eq!(frames.current_frame(), 0);
        assert_eq!(frames.slot_state(0), Some(SlotState::Idle));
        assert_eq!(backend.count(|c| matches!(c, Call::ResetGraphics(_))), 0);
        assert_eq!(backend.count(|c| matches!(c, Call::SubmitGraphics(..))), 0);
        assert_eq!(backend.count(|c| *c == Call::Recreate), 1);

        // The retry on the same slot must not hang on its fence
        let status = frames.draw_frame(&mut backend).unwrap();
        assert_eq!(status, FrameStatus::Presented { recreated: false });
        assert_eq!(frames.current_frame(), 1);
    }

    #[test]
    fn out_of_date_acquire_in_particle_mode_submits_no_compute() {
        let mut frames = FrameLoop::new(2).unwrap();
        let mut backend = MockBackend::new(2, true);
        backend.acquires.push_back(AcquireOutcome::OutOfDate);

        frames.draw_frame(&mut backend).unwrap();

        assert_eq!(backend.count(|c| matches!(c, Call::ResetCompute(_))), 0);
        assert_eq!(backend.count(|c| matches!(c, Call::SubmitCompute(_))), 0);
    }

    #[test]
    fn suboptimal_acquire_presents_then_recreates() {
        let mut frames = FrameLoop::new(2).unwrap();
        let mut backend = MockBackend::new(2, false);
        backend.acquires.push_back(AcquireOutcome::Suboptimal(1));

        let status = frames.draw_frame(&mut backend).unwrap();

        assert_eq!(status, FrameStatus::Presented { recreated: true });
        let present = backend.position(&Call::Present(0, 1)).unwrap();
        let recreate = backend.position(&Call::Recreate).unwrap();
        assert!(present < recreate);
        assert_eq!(frames.current_frame(), 1);
    }

    #[test]
    fn suboptimal_present_recreates_and_still_advances() {
        let mut frames = FrameLoop::new(2).unwrap();
        let mut backend = MockBackend::new(2, false);
        backend.presents.push_back(PresentOutcome::Suboptimal);

        let status = frames.draw_frame(&mut backend).unwrap();

        assert_eq!(status, FrameStatus::Presented { recreated: true });
        assert_eq!(backend.calls.last(), Some(&Call::Recreate));
        assert_eq!(frames.current_frame(), 1);
    }

    #[test]
    fn out_of_date_present_recreates() {
        let mut frames = FrameLoop::new(2).unwrap();
        let mut backend = MockBackend::new(2, false);
        backend.presents.push_back(PresentOutcome::OutOfDate);

        frames.draw_frame(&mut backend).unwrap();

        assert_eq!(backend.count(|c| *c == Call::Recreate), 1);
        assert_eq!(frames.current_frame(), 1);
    }

    #[test]
    fn resize_flag_forces_one_recreation() {
        let mut frames = FrameLoop::new(2).unwrap();
        let mut backend = MockBackend::new(2, false);

        frames.notify_resized();
        let first = frames.draw_frame(&mut backend).unwrap();
        let second = frames.draw_frame(&mut backend).unwrap();

        assert_eq!(first, FrameStatus::Presented { recreated: true });
        assert_eq!(second, FrameStatus::Presented { recreated: false });
        assert_eq!(backend.count(|c| *c == Call::Recreate), 1);
    }

    #[test]
    fn single_frame_in_flight_waits_every_frame() {
        let mut frames = FrameLoop::new(1).unwrap();
        let mut backend = MockBackend::new(1, true);

        for _ in 0..3 {
            frames.draw_frame(&mut backend).unwrap();
        }

        assert_eq!(frames.current_frame(), 0);
        assert_eq!(backend.count(|c| *c == Call::WaitGraphics(0)), 3);
        assert_eq!(backend.count(|c| *c == Call::WaitCompute(0)), 3);
    }

    #[test]
    fn wait_plan_orders_compute_first() {
        assert_eq!(
            graphics_waits(true),
            vec![
                (
                    WaitSemaphore::ComputeFinished,
                    vk::PipelineStageFlags::VERTEX_INPUT
                ),
                (
                    WaitSemaphore::ImageAvailable,
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                ),
            ]
        );
        assert_eq!(graphics_waits(false).len(), 1);
    }

    #[test]
    fn slots_stay_submitted_until_reused() {
        let mut frames = FrameLoop::new(2).unwrap();
        let mut backend = MockBackend::new(2, true);

        frames.draw_frame(&mut backend).unwrap();
        assert_eq!(frames.slot_state(0), Some(SlotState::Submitted));
        assert_eq!(frames.slot_state(1), Some(SlotState::Idle));

        frames.draw_frame(&mut backend).unwrap();
        assert_eq!(frames.slot_state(0), Some(SlotState::Submitted));
        assert_eq!(frames.slot_state(1), Some(SlotState::Submitted));

        // Reusing slot 0 after a skipped frame drops it back to idle
        backend.acquires.push_back(AcquireOutcome::OutOfDate);
        assert_eq!(frames.draw_frame(&mut backend).unwrap(), FrameStatus::Skipped);
        assert_eq!(frames.slot_state(0), Some(SlotState::Idle));
        assert_eq!(frames.slot_state(1), Some(SlotState::Submitted));
        assert_eq!(frames.current_frame(), 0);

        assert_eq!(frames.slot_state(2), None);
    }
}
