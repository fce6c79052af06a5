// Frame loop - per-frame synchronization protocol
//
// Each iteration uses slot `frame mod N`:
//   wait fence -> acquire -> reset fence -> record -> submit -> present -> advance
//
// The fence is only reset once an image was acquired. An out-of-date acquire
// abandons the iteration with the fence still signaled, so the retry does not
// block on a fence nothing will ever signal.
//
// Everything GPU-specific sits behind `FrameBackend`, so the ordering can be
// driven by a scripted backend in tests.

use ash::vk;

use crate::backend::swapchain::{Acquired, Presented};
use crate::backend::sync::FrameCounter;
use crate::error::Result;
use crate::window::WindowSystem;

/// Plain description of one swapchain generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSummary {
    pub extent: vk::Extent2D,
    pub image_count: usize,
    pub format: vk::Format,
}

/// GPU operations the frame loop sequences.
pub trait FrameBackend {
    /// Block until the slot's previous submission has retired.
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;
    fn acquire_image(&mut self, slot: usize) -> Result<Acquired>;
    /// Unsignal the slot fence. Only called after a successful acquire.
    fn reset_slot(&mut self, slot: usize) -> Result<()>;
    fn record(&mut self, slot: usize, image_index: u32) -> Result<()>;
    /// Submit the slot's command buffer; signals the slot fence on completion.
    fn submit(&mut self, slot: usize) -> Result<()>;
    fn present(&mut self, slot: usize, image_index: u32) -> Result<Presented>;
    fn wait_idle(&mut self) -> Result<()>;
    /// Destroy render targets, then views and chain. Slots are left alone.
    fn destroy_chain(&mut self);
    /// Build a chain and its targets for `drawable`.
    fn build_chain(&mut self, drawable: vk::Extent2D) -> Result<ChainSummary>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// An image was presented; `recreated` if the chain was rebuilt afterwards.
    Presented { recreated: bool },
    /// The chain was stale at acquire: nothing was drawn, the chain was rebuilt.
    Skipped,
    /// The window closed while waiting for a usable size.
    Closed,
}

pub struct FrameLoop {
    counter: FrameCounter,
    chain: ChainSummary,
    generation: u64,
}

impl FrameLoop {
    pub fn new(frames_in_flight: usize, chain: ChainSummary) -> Self {
        Self {
            counter: FrameCounter::new(frames_in_flight),
            chain,
            generation: 0,
        }
    }

    pub fn frame(&self) -> u64 {
        self.counter.frame()
    }

    pub fn chain(&self) -> ChainSummary {
        self.chain
    }

    /// Number of times the chain has been rebuilt
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn draw_frame<B, W>(&mut self, backend: &mut B, window: &mut W) -> Result<FrameOutcome>
    where
        B: FrameBackend + ?Sized,
        W: WindowSystem + ?Sized,
    {
        let slot = self.counter.slot();
        backend.wait_for_slot(slot)?;

        let (image_index, acquire_suboptimal) = match backend.acquire_image(slot)? {
            Acquired::Image { index, suboptimal } => (index, suboptimal),
            Acquired::OutOfDate => {
                log::debug!("Swapchain out of date at acquire (frame {})", self.frame());
                return Ok(if self.recreate_swapchain(backend, window)? {
                    FrameOutcome::Skipped
                } else {
                    FrameOutcome::Closed
                });
            }
        };

        backend.reset_slot(slot)?;
        backend.record(slot, image_index)?;
        backend.submit(slot)?;
        let presented = backend.present(slot, image_index)?;
        log::trace!("Frame {} presented image {} from slot {}", self.frame(), image_index, slot);
        self.counter.advance();

        let resized = window.take_resized();
        if acquire_suboptimal || presented == Presented::Stale || resized {
            log::debug!(
                "Recreating after present (suboptimal: {}, stale: {}, resized: {})",
                acquire_suboptimal,
                presented == Presented::Stale,
                resized
            );
            if !self.recreate_swapchain(backend, window)? {
                return Ok(FrameOutcome::Closed);
            }
            return Ok(FrameOutcome::Presented { recreated: true });
        }

        Ok(FrameOutcome::Presented { recreated: false })
    }

    /// Rebuild the chain for the current drawable size.
    ///
    /// Returns `false` if the window closed while minimized; nothing was
    /// destroyed in that case.
    pub fn recreate_swapchain<B, W>(&mut self, backend: &mut B, window: &mut W) -> Result<bool>
    where
        B: FrameBackend + ?Sized,
        W: WindowSystem + ?Sized,
    {
        let Some(drawable) = window.wait_for_drawable_size() else {
            log::info!("Window closed while minimized, abandoning swapchain recreation");
            return Ok(false);
        };

        backend.wait_idle()?;
        backend.destroy_chain();
        self.chain = backend.build_chain(drawable)?;
        self.generation += 1;

        // Covered by this rebuild
        window.take_resized();

        log::info!(
            "Swapchain recreated (generation {}): {}x{}, {} images",
            self.generation,
            self.chain.extent.width,
            self.chain.extent.height,
            self.chain.image_count
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Wait(usize),
        /// Wait had to block until the GPU retired this frame's submission
        Retired { slot: usize, frame: u64 },
        Acquire(usize),
        Reset(usize),
        Record(usize, u32),
        Submit(usize),
        Present(usize, u32),
        WaitIdle,
        DestroyChain,
        BuildChain(u32, u32),
    }

    #[derive(Clone, Copy)]
    struct Fence {
        signaled: bool,
        /// Submission that will signal this fence
        pending: Option<u64>,
    }

    struct MockBackend {
        events: Vec<Event>,
        fences: Vec<Fence>,
        acquires: VecDeque<Acquired>,
        presents: VecDeque<Presented>,
        submissions: u64,
        next_image: u32,
        chain: Option<ChainSummary>,
        live_views: usize,
        live_framebuffers: usize,
        builds: usize,
        destroys: usize,
        max_in_flight: usize,
    }

    const IMAGES: usize = 3;

    impl MockBackend {
        fn new(slots: usize) -> Self {
            Self {
                events: Vec::new(),
                fences: vec![
                    Fence {
                        signaled: true,
                        pending: None,
                    };
                    slots
                ],
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                submissions: 0,
                next_image: 0,
                chain: None,
                live_views: 0,
                live_framebuffers: 0,
                builds: 0,
                destroys: 0,
                max_in_flight: 0,
            }
        }

        fn in_flight(&self) -> usize {
            self.fences.iter().filter(|f| f.pending.is_some()).count()
        }

        fn position(&self, event: Event) -> Option<usize> {
            self.events.iter().position(|&e| e == event)
        }
    }

    impl FrameBackend for MockBackend {
        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            self.events.push(Event::Wait(slot));
            let fence = &mut self.fences[slot];
            if !fence.signaled {
                let frame = fence
                    .pending
                    .expect("waiting on an unsignaled fence with no submission would hang");
                fence.signaled = true;
                fence.pending = None;
                self.events.push(Event::Retired { slot, frame });
            }
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> Result<Acquired> {
            self.events.push(Event::Acquire(slot));
            assert!(self.chain.is_some(), "acquire without a chain");
            Ok(self.acquires.pop_front().unwrap_or_else(|| {
                let index = self.next_image;
                self.next_image = (self.next_image + 1) % IMAGES as u32;
                Acquired::Image { index, suboptimal: false }
            }))
        }

        fn reset_slot(&mut self, slot: usize) -> Result<()> {
            self.events.push(Event::Reset(slot));
            let fence = &mut self.fences[slot];
            assert!(fence.signaled && fence.pending.is_none(), "reset of an in-use fence");
            fence.signaled = false;
            Ok(())
        }

        fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
            self.events.push(Event::Record(slot, image_index));
            let chain = self.chain.expect("record without a chain");
            assert!((image_index as usize) < chain.image_count);
            assert_eq!(self.live_framebuffers, chain.image_count);
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> Result<()> {
            self.events.push(Event::Submit(slot));
            self.fences[slot].pending = Some(self.submissions);
            self.submissions += 1;
            self.max_in_flight = self.max_in_flight.max(self.in_flight());
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> Result<Presented> {
            self.events.push(Event::Present(slot, image_index));
            Ok(self.presents.pop_front().unwrap_or(Presented::Optimal))
        }

        fn wait_idle(&mut self) -> Result<()> {
            self.events.push(Event::WaitIdle);
            for fence in &mut self.fences {
                if fence.pending.take().is_some() {
                    fence.signaled = true;
                }
            }
            Ok(())
        }

        fn destroy_chain(&mut self) {
            self.events.push(Event::DestroyChain);
            if self.chain.take().is_some() {
                self.live_framebuffers -= IMAGES;
                self.live_views -= IMAGES;
                self.destroys += 1;
            }
        }

        fn build_chain(&mut self, drawable: vk::Extent2D) -> Result<ChainSummary> {
            self.events.push(Event::BuildChain(drawable.width, drawable.height));
            assert!(self.chain.is_none(), "previous generation still alive");
            let chain = ChainSummary {
                extent: drawable,
                image_count: IMAGES,
                format: vk::Format::B8G8R8A8_SRGB,
            };
            self.live_views += IMAGES;
            self.live_framebuffers += IMAGES;
            self.builds += 1;
            self.next_image = 0;
            self.chain = Some(chain);
            Ok(chain)
        }
    }

    struct TestWindow {
        sizes: VecDeque<(u32, u32)>,
        resized: bool,
        closed: bool,
        close_on_wait: bool,
        waits: usize,
    }

    impl TestWindow {
        fn sized(width: u32, height: u32) -> Self {
            Self {
                sizes: VecDeque::from([(width, height)]),
                resized: false,
                closed: false,
                close_on_wait: false,
                waits: 0,
            }
        }
    }

    impl WindowSystem for TestWindow {
        fn drawable_size(&self) -> vk::Extent2D {
            let (width, height) = self.sizes.front().copied().unwrap_or((0, 0));
            vk::Extent2D { width, height }
        }
        fn pump_events(&mut self) {}
        fn wait_events(&mut self) {
            self.waits += 1;
            if self.close_on_wait {
                self.closed = true;
            }
            if self.sizes.len() > 1 {
                self.sizes.pop_front();
            }
        }
        fn should_close(&self) -> bool {
            self.closed
        }
        fn take_resized(&mut self) -> bool {
            std::mem::take(&mut self.resized)
        }
    }

    fn setup(slots: usize, width: u32, height: u32) -> (MockBackend, TestWindow, FrameLoop) {
        let mut backend = MockBackend::new(slots);
        let chain = backend.build_chain(vk::Extent2D { width, height }).unwrap();
        backend.events.clear();
        (backend, TestWindow::sized(width, height), FrameLoop::new(slots, chain))
    }

    #[test]
    fn iteration_follows_protocol_order() {
        let (mut backend, mut window, mut frames) = setup(2, 800, 600);

        let outcome = frames.draw_frame(&mut backend, &mut window).unwrap();

        assert_eq!(outcome, FrameOutcome::Presented { recreated: false });
        assert_eq!(
            backend.events,
            vec![
                Event::Wait(0),
                Event::Acquire(0),
                Event::Reset(0),
                Event::Record(0, 0),
                Event::Submit(0),
                Event::Present(0, 0),
            ]
        );
        assert_eq!(frames.frame(), 1);
    }

    #[test]
    fn wait_fence_precedes_record_for_every_slot() {
        let (mut backend, mut window, mut frames) = setup(3, 800, 600);
        for _ in 0..10 {
            frames.draw_frame(&mut backend, &mut window).unwrap();
        }

        let mut waited = [false; 3];
        for event in &backend.events {
            match *event {
                Event::Wait(slot) => waited[slot] = true,
                Event::Record(slot, _) => {
                    assert!(waited[slot], "slot {} recorded without waiting", slot);
                    waited[slot] = false;
                }
                _ => {}
            }
        }
        assert_eq!(backend.max_in_flight, 3);
    }

    #[test]
    fn third_frame_blocks_on_first_frames_fence() {
        let (mut backend, mut window, mut frames) = setup(2, 800, 600);

        frames.draw_frame(&mut backend, &mut window).unwrap();
        frames.draw_frame(&mut backend, &mut window).unwrap();
        assert_eq!(backend.submissions, 2);
        assert_eq!(backend.in_flight(), 2);

        backend.events.clear();
        frames.draw_frame(&mut backend, &mut window).unwrap();

        assert_eq!(backend.events[0], Event::Wait(0));
        assert_eq!(backend.events[1], Event::Retired { slot: 0, frame: 0 });
        assert!(backend.position(Event::Record(0, 2)).unwrap() > 1);
        // Frame 1 is still in flight on slot 1
        assert_eq!(backend.fences[1].pending, Some(1));
        assert!(backend.max_in_flight <= 2);
    }

    #[test]
    fn stale_acquire_skips_frame_and_rebuilds_chain() {
        let (mut backend, mut window, mut frames) = setup(2, 800, 600);
        frames.draw_frame(&mut backend, &mut window).unwrap();
        frames.draw_frame(&mut backend, &mut window).unwrap();
        let frame_before = frames.frame();

        backend.events.clear();
        backend.acquires.push_back(Acquired::OutOfDate);
        let outcome = frames.draw_frame(&mut backend, &mut window).unwrap();

        assert_eq!(outcome, FrameOutcome::Skipped);
        assert_eq!(frames.frame(), frame_before);
        assert_eq!(frames.generation(), 1);
        assert!(!backend.events.iter().any(|e| matches!(
            e,
            Event::Reset(_) | Event::Record(..) | Event::Submit(_) | Event::Present(..)
        )));
        let idle = backend.position(Event::WaitIdle).unwrap();
        let destroy = backend.position(Event::DestroyChain).unwrap();
        let build = backend.position(Event::BuildChain(800, 600)).unwrap();
        assert!(idle < destroy && destroy < build);

        // Next iteration reuses the same slot without hanging on its fence
        backend.events.clear();
        let outcome = frames.draw_frame(&mut backend, &mut window).unwrap();
        assert_eq!(outcome, FrameOutcome::Presented { recreated: false });
        assert_eq!(
            backend.events,
            vec![
                Event::Wait(0),
                Event::Acquire(0),
                Event::Reset(0),
                Event::Record(0, 0),
                Event::Submit(0),
                Event::Present(0, 0),
            ]
        );
        assert_eq!(frames.frame(), frame_before + 1);
    }

    #[test]
    fn fence_is_not_reset_when_acquire_fails() {
        let (mut backend, mut window, mut frames) = setup(1, 640, 480);
        backend.acquires.push_back(Acquired::OutOfDate);
        backend.acquires.push_back(Acquired::OutOfDate);

        frames.draw_frame(&mut backend, &mut window).unwrap();
        frames.draw_frame(&mut backend, &mut window).unwrap();

        assert!(backend.fences[0].signaled);
        assert!(backend.position(Event::Reset(0)).is_none());
        // The mock panics on a wait that could never return
        frames.draw_frame(&mut backend, &mut window).unwrap();
        assert_eq!(frames.frame(), 1);
    }

    #[test]
    fn minimized_window_blocks_recreation_until_restored() {
        let (mut backend, mut window, mut frames) = setup(2, 1024, 768);
        window.sizes = VecDeque::from([(0, 0), (800, 600)]);
        window.resized = true;

        let outcome = frames.draw_frame(&mut backend, &mut window).unwrap();

        assert_eq!(outcome, FrameOutcome::Presented { recreated: true });
        assert_eq!(window.waits, 1);
        assert_eq!(
            frames.chain().extent,
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
        assert!(backend.position(Event::BuildChain(800, 600)).is_some());
        assert!(!window.take_resized());
    }

    #[test]
    fn closing_while_minimized_abandons_recreation() {
        let (mut backend, mut window, mut frames) = setup(2, 800, 600);
        window.sizes = VecDeque::from([(0, 0)]);
        window.close_on_wait = true;
        backend.acquires.push_back(Acquired::OutOfDate);

        let outcome = frames.draw_frame(&mut backend, &mut window).unwrap();

        assert_eq!(outcome, FrameOutcome::Closed);
        assert_eq!(frames.generation(), 0);
        assert!(backend.position(Event::DestroyChain).is_none());
        assert_eq!(backend.live_views, IMAGES);
    }

    #[test]
    fn stale_or_suboptimal_present_triggers_recreation() {
        let (mut backend, mut window, mut frames) = setup(2, 800, 600);
        backend.presents.push_back(Presented::Stale);
        assert_eq!(
            frames.draw_frame(&mut backend, &mut window).unwrap(),
            FrameOutcome::Presented { recreated: true }
        );

        backend.acquires.push_back(Acquired::Image {
            index: 1,
            suboptimal: true,
        });
        assert_eq!(
            frames.draw_frame(&mut backend, &mut window).unwrap(),
            FrameOutcome::Presented { recreated: true }
        );
        assert_eq!(frames.generation(), 2);
        assert_eq!(frames.frame(), 2);
    }

    #[test]
    fn each_recreation_replaces_exactly_one_generation() {
        let (mut backend, mut window, mut frames) = setup(2, 800, 600);

        for round in 1..=5u32 {
            window.sizes = VecDeque::from([(800 + round, 600)]);
            assert!(frames.recreate_swapchain(&mut backend, &mut window).unwrap());
            frames.draw_frame(&mut backend, &mut window).unwrap();

            assert_eq!(frames.generation(), round as u64);
            assert_eq!(backend.builds, round as usize + 1);
            assert_eq!(backend.destroys, round as usize);
            assert_eq!(backend.live_views, IMAGES);
            assert_eq!(backend.live_framebuffers, IMAGES);
        }
    }

    #[test]
    fn recreating_at_same_size_reproduces_chain() {
        let (mut backend, mut window, mut frames) = setup(2, 800, 600);
        let before = frames.chain();

        frames.recreate_swapchain(&mut backend, &mut window).unwrap();

        assert_eq!(frames.chain(), before);
        assert_eq!(frames.generation(), 1);
    }
}
