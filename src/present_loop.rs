// Presentation loop
//
//   Idle -> Acquiring -> Drawing -> Submitting -> Presenting -> Idle
//
// SurfaceInvalidated/Timeout from any phase (or a resize notification)
// move to Invalidated: drain, recreate, back to Idle. A zero-sized surface
// stays Invalidated and frames are skipped until it grows again. Any other
// error, or a close request, ends in Terminated after an ordered teardown.

use crate::backend::{PresentStatus, RenderBackend};
use crate::bridge::DrawableCanvas;
use crate::error::FrameError;
use crate::surface::Extent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Acquiring,
    Drawing,
    Submitting,
    Presenting,
    Invalidated,
    Terminated,
}

/// What a single `step` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Presented,
    /// Nothing drawn: the surface is zero-sized.
    Skipped,
    /// The frame was dropped and targets were rebuilt.
    Recreated,
    Terminated,
}

#[derive(Debug, Clone, Default)]
pub struct LoopStats {
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub invalidations: u64,
    pub recreations: u64,
}

pub struct PresentationLoop<B: RenderBackend> {
    backend: Option<B>,
    state: LoopState,
    extent: Extent,
    close_requested: bool,
    stats: LoopStats,
}

impl<B: RenderBackend> PresentationLoop<B> {
    pub fn new(backend: B) -> Self {
        let extent = backend.extent();
        // A backend that came up without targets starts out needing recreation.
        let state = if extent.is_empty() {
            LoopState::Invalidated
        } else {
            LoopState::Idle
        };
        Self {
            backend: Some(backend),
            state,
            extent,
            close_requested: false,
            stats: LoopStats::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    /// `None` once the loop has terminated.
    pub fn backend(&self) -> Option<&B> {
        self.backend.as_ref()
    }

    /// The window's framebuffer size changed. Takes effect before the next frame.
    pub fn notify_resized(&mut self, extent: Extent) {
        if self.state == LoopState::Terminated {
            return;
        }
        self.extent = extent;
        self.invalidate();
    }

    /// Ask for a clean shutdown at the next frame boundary.
    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    fn invalidate(&mut self) {
        if self.state != LoopState::Invalidated {
            self.stats.invalidations += 1;
            self.state = LoopState::Invalidated;
        }
    }

    /// Run one iteration: recover if needed, then draw and present one frame.
    ///
    /// Errors returned here are fatal and the loop is already Terminated when
    /// they come back.
    pub fn step<F>(&mut self, draw: F) -> Result<StepOutcome, FrameError>
    where
        F: FnOnce(&mut DrawableCanvas<'_>),
    {
        if self.state == LoopState::Terminated {
            return Ok(StepOutcome::Terminated);
        }
        if self.close_requested {
            self.shutdown();
            return Ok(StepOutcome::Terminated);
        }

        if self.state == LoopState::Invalidated && !self.recover()? {
            self.stats.frames_skipped += 1;
            return Ok(StepOutcome::Skipped);
        }

        match self.run_frame(draw) {
            Ok(status) => {
                self.stats.frames_presented += 1;
                self.state = LoopState::Idle;
                if status == PresentStatus::Suboptimal {
                    log::debug!("Presented suboptimally, rebuilding before next frame");
                    self.invalidate();
                }
                Ok(StepOutcome::Presented)
            }
            Err(e) if e.is_recoverable() => {
                log::debug!("Frame dropped in {:?}: {}", self.state, e);
                self.invalidate();
                if self.recover()? {
                    Ok(StepOutcome::Recreated)
                } else {
                    self.stats.frames_skipped += 1;
                    Ok(StepOutcome::Skipped)
                }
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn run_frame<F>(&mut self, draw: F) -> Result<PresentStatus, FrameError>
    where
        F: FnOnce(&mut DrawableCanvas<'_>),
    {
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| FrameError::api("frame", "loop has terminated"))?;

        self.state = LoopState::Acquiring;
        backend.acquire_target()?;

        self.state = LoopState::Drawing;
        {
            let mut canvas = backend.canvas()?;
            draw(&mut canvas);
        }

        self.state = LoopState::Submitting;
        backend.submit()?;

        self.state = LoopState::Presenting;
        backend.present_or_swap()
    }

    /// Drain and rebuild. `Ok(false)` while the surface is zero-sized.
    fn recover(&mut self) -> Result<bool, FrameError> {
        if self.extent.is_empty() {
            return Ok(false);
        }
        let Some(backend) = self.backend.as_mut() else {
            return Ok(false);
        };

        let rebuilt = backend.drain().and_then(|()| backend.recreate(self.extent));
        match rebuilt {
            Ok(()) => {
                self.extent = backend.extent();
                self.stats.recreations += 1;
                self.state = LoopState::Idle;
                log::info!("Targets recreated at {}", self.extent);
                Ok(true)
            }
            // The surface itself reports zero size; wait for a resize.
            Err(FrameError::SurfaceInvalidated) => Ok(false),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, err: FrameError) -> FrameError {
        log::error!("Fatal frame error ({}): {}", err.category(), err);
        if let Some(mut backend) = self.backend.take() {
            if err.is_device_lost() {
                backend.abandon();
            } else {
                if let Err(e) = backend.drain() {
                    log::warn!("Drain during failure teardown failed: {}", e);
                }
                backend.teardown();
            }
        }
        self.state = LoopState::Terminated;
        err
    }

    /// Drain outstanding work, release targets and sync primitives, then the
    /// device context. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            log::info!(
                "Shutting down presentation loop: {} presented, {} skipped, {} invalidations, {} recreations",
                self.stats.frames_presented,
                self.stats.frames_skipped,
                self.stats.invalidations,
                self.stats.recreations
            );
            if let Err(e) = backend.drain() {
                log::warn!("Drain before shutdown failed: {}", e);
            }
            backend.teardown();
            drop(backend);
        }
        self.state = LoopState::Terminated;
    }
}

impl<B: RenderBackend> Drop for PresentationLoop<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tiny_skia::{Color, Paint, Rect, Transform};

    use crate::backend::sim::SimDevice;
    use crate::backend::{BackendSettings, ExplicitPresentBackend, RasterBackend};

    fn explicit(
        device: &Arc<SimDevice>,
        frames_in_flight: usize,
        swapchain_images: u32,
    ) -> PresentationLoop<ExplicitPresentBackend<SimDevice>> {
        let settings = BackendSettings {
            frames_in_flight,
            swapchain_images,
            fence_timeout: Duration::from_millis(300),
            ..BackendSettings::default()
        };
        PresentationLoop::new(ExplicitPresentBackend::new(device.clone(), &settings).unwrap())
    }

    fn fill(canvas: &mut DrawableCanvas<'_>) {
        canvas.clear(Color::from_rgba8(30, 30, 30, 255));
    }

    fn blocked_acquires(lp: &PresentationLoop<ExplicitPresentBackend<SimDevice>>) -> u64 {
        lp.backend()
            .and_then(|b| b.synchronizer())
            .map(|s| s.stats().blocked_acquires)
            .unwrap()
    }

    #[test]
    fn cpu_frame_lands_in_host_memory() {
        let backend = RasterBackend::new(Extent::new(800, 600)).unwrap();
        let mut lp = PresentationLoop::new(backend);

        let outcome = lp
            .step(|canvas| {
                canvas.clear(Color::WHITE);
                let mut paint = Paint::default();
                paint.set_color_rgba8(0, 128, 0, 255);
                let rect = Rect::from_xywh(50.0, 50.0, 300.0, 200.0).unwrap();
                canvas
                    .pixmap()
                    .fill_rect(rect, &paint, Transform::identity(), None);
            })
            .unwrap();
        assert_eq!(outcome, StepOutcome::Presented);
        assert_eq!(lp.state(), LoopState::Idle);

        let snapshot = lp.backend().and_then(|b| b.snapshot()).unwrap();
        assert_eq!(snapshot.pixel(60, 60), Some([0, 128, 0, 255]));
        assert_eq!(snapshot.pixel(10, 10), Some([255, 255, 255, 255]));
    }

    #[test]
    fn backpressure_blocks_from_the_third_frame() {
        let device = Arc::new(SimDevice::with_gpu_delay(Duration::from_millis(40)));
        let mut lp = explicit(&device, 2, 2);

        let mut blocked_before = 0;
        for frame in 1..=10 {
            assert_eq!(lp.step(fill).unwrap(), StepOutcome::Presented);
            let blocked = blocked_acquires(&lp);
            assert_eq!(
                blocked > blocked_before,
                frame >= 3,
                "frame {frame} blocking mismatch"
            );
            blocked_before = blocked;
            let in_flight = lp.backend().unwrap().synchronizer().unwrap().in_flight();
            assert!(in_flight <= 2);
        }
        assert!(device.max_outstanding() <= 2);
        assert_eq!(device.presents(), 10);
    }

    #[test]
    fn outstanding_submissions_never_exceed_frames_in_flight() {
        let configs = [(2, 2), (2, 3), (3, 3), (3, 2), (4, 3)];
        for (frames_in_flight, images) in configs {
            for delay_ms in [1, 4, 9] {
                let device = Arc::new(SimDevice::with_gpu_delay(Duration::from_millis(delay_ms)));
                let mut lp = explicit(&device, frames_in_flight, images);

                for _ in 0..24 {
                    assert_eq!(lp.step(fill).unwrap(), StepOutcome::Presented);
                    let sync = lp.backend().unwrap().synchronizer().unwrap();
                    assert!(sync.in_flight() <= frames_in_flight);
                }
                assert!(
                    device.max_outstanding() <= frames_in_flight,
                    "N={frames_in_flight} images={images} delay={delay_ms}ms: {} outstanding",
                    device.max_outstanding()
                );
            }
        }
    }

    #[test]
    fn invalidated_acquire_recreates_and_continues() {
        let device = Arc::new(SimDevice::new());
        device.fail_acquire_at(3, FrameError::SurfaceInvalidated);
        let mut lp = explicit(&device, 2, 2);

        assert_eq!(lp.step(fill).unwrap(), StepOutcome::Presented);
        assert_eq!(lp.step(fill).unwrap(), StepOutcome::Presented);
        assert_eq!(lp.step(fill).unwrap(), StepOutcome::Recreated);
        assert_eq!(lp.state(), LoopState::Idle);

        for _ in 0..3 {
            assert_eq!(lp.step(fill).unwrap(), StepOutcome::Presented);
        }
        let chain = lp.backend().unwrap().swapchain().unwrap();
        assert_eq!(chain.generation(), 2);
        assert_eq!(lp.stats().recreations, 1);
        assert_eq!(lp.stats().frames_presented, 5);
        // Recreation drained the device first.
        assert!(device.wait_idle_calls() >= 1);
    }

    #[test]
    fn acquire_timeout_takes_the_recreate_path() {
        let device = Arc::new(SimDevice::new());
        device.fail_acquire_at(1, FrameError::Timeout);
        let mut lp = explicit(&device, 2, 2);

        assert_eq!(lp.step(fill).unwrap(), StepOutcome::Recreated);
        assert_eq!(lp.step(fill).unwrap(), StepOutcome::Presented);
    }

    #[test]
    fn suboptimal_present_rebuilds_before_the_next_frame() {
        struct Suboptimal(RasterBackend, usize);
        impl RenderBackend for Suboptimal {
            fn kind(&self) -> crate::backend::BackendKind {
                self.0.kind()
            }
            fn extent(&self) -> Extent {
                self.0.extent()
            }
            fn acquire_target(&mut self) -> Result<(), FrameError> {
                self.0.acquire_target()
            }
            fn canvas(&mut self) -> Result<DrawableCanvas<'_>, FrameError> {
                self.0.canvas()
            }
            fn submit(&mut self) -> Result<(), FrameError> {
                self.0.submit()
            }
            fn present_or_swap(&mut self) -> Result<PresentStatus, FrameError> {
                Ok(PresentStatus::Suboptimal)
            }
            fn recreate(&mut self, extent: Extent) -> Result<(), FrameError> {
                self.1 += 1;
                self.0.recreate(extent)
            }
            fn drain(&mut self) -> Result<(), FrameError> {
                Ok(())
            }
            fn teardown(&mut self) {}
        }

        let mut lp = PresentationLoop::new(Suboptimal(
            RasterBackend::new(Extent::new(8, 8)).unwrap(),
            0,
        ));
        assert_eq!(lp.step(fill).unwrap(), StepOutcome::Presented);
        assert_eq!(lp.state(), LoopState::Invalidated);
        assert_eq!(lp.step(fill).unwrap(), StepOutcome::Presented);
        assert_eq!(lp.backend().unwrap().1, 1);
    }

    #[test]
    fn zero_sized_window_skips_until_restored() {
        let device = Arc::new(SimDevice::new());
        let mut lp = explicit(&device, 2, 2);
        assert_eq!(lp.step(fill).unwrap(), StepOutcome::Presented);

        lp.notify_resized(Extent::new(0, 0));
        assert_eq!(lp.step(fill).unwrap(), StepOutcome::Skipped);
        assert_eq!(lp.step(fill).unwrap(), StepOutcome::Skipped);
        assert_eq!(lp.state(), LoopState::Invalidated);

        device.set_current_extent(Some(Extent::new(1024, 768)));
        lp.notify_resized(Extent::new(1024, 768));
        assert_eq!(lp.step(fill).unwrap(), StepOutcome::Presented);
        assert_eq!(lp.backend().unwrap().extent(), Extent::new(1024, 768));
        assert_eq!(lp.stats().frames_skipped, 2);
    }

    #[test]
    fn resize_recreates_with_same_count_and_format() {
        let device = Arc::new(SimDevice::new());
        let mut lp = explicit(&device, 2, 3);
        lp.step(fill).unwrap();
        let before = {
            let chain = lp.backend().unwrap().swapchain().unwrap();
            (chain.image_count(), chain.format())
        };

        for _ in 0..2 {
            lp.notify_resized(Extent::new(800, 600));
            assert_eq!(lp.step(fill).unwrap(), StepOutcome::Presented);
        }

        let chain = lp.backend().unwrap().swapchain().unwrap();
        assert_eq!((chain.image_count(), chain.format()), before);
        assert_eq!(chain.generation(), 3);
    }

    #[test]
    fn hung_fence_terminates_without_touching_the_device() {
        let device = Arc::new(SimDevice::new());
        device.hang_after(1);
        let mut lp = explicit(&device, 1, 2);

        assert_eq!(lp.step(fill).unwrap(), StepOutcome::Presented);
        assert_eq!(lp.step(fill).unwrap(), StepOutcome::Presented);

        let err = lp.step(fill).unwrap_err();
        assert!(err.is_device_lost());
        assert_eq!(err.exit_code(), 10);
        assert_eq!(lp.state(), LoopState::Terminated);
        assert!(lp.backend().is_none());

        assert!(device.is_lost());
        assert_eq!(device.waits_after_lost(), 0);
        assert_eq!(device.wait_idle_calls(), 0);
        assert_eq!(device.live_swapchains(), 0);
        assert_eq!(device.live_sync_objects(), 0);

        assert_eq!(lp.step(fill).unwrap(), StepOutcome::Terminated);
    }

    #[test]
    fn fatal_present_error_tears_down_in_order() {
        let device = Arc::new(SimDevice::new());
        device.fail_present_at(2, FrameError::api("queue present", "ERROR_OUT_OF_HOST_MEMORY"));
        let mut lp = explicit(&device, 2, 2);

        lp.step(fill).unwrap();
        let err = lp.step(fill).unwrap_err();
        assert_eq!(err.exit_code(), 9);
        assert_eq!(lp.state(), LoopState::Terminated);
        assert_eq!(device.live_swapchains(), 0);
        assert_eq!(device.live_sync_objects(), 0);
        assert_eq!(Arc::strong_count(&device), 1);
    }

    #[test]
    fn close_request_drains_then_releases_everything() {
        let device = Arc::new(SimDevice::with_gpu_delay(Duration::from_millis(10)));
        let mut lp = explicit(&device, 2, 2);
        lp.step(fill).unwrap();
        lp.step(fill).unwrap();

        lp.request_close();
        assert_eq!(lp.step(fill).unwrap(), StepOutcome::Terminated);
        assert_eq!(lp.state(), LoopState::Terminated);
        assert_eq!(device.wait_idle_calls(), 1);
        assert_eq!(device.live_swapchains(), 0);
        assert_eq!(device.live_sync_objects(), 0);
        assert_eq!(Arc::strong_count(&device), 1);
        assert_eq!(device.submissions(), 2);
    }

    #[test]
    fn unsupported_format_is_fatal() {
        let mut caps = SimDevice::default_capabilities();
        caps.formats = vec![crate::backend::hal::SurfaceFormat {
            format: crate::surface::PixelFormat::Unsupported(1000),
            color_space: 0,
        }];
        let device = Arc::new(SimDevice::with_capabilities(caps, Duration::ZERO));
        let mut lp = explicit(&device, 2, 2);

        let err = lp.step(fill).unwrap_err();
        assert!(matches!(err, FrameError::Bridge(_)));
        assert_eq!(lp.state(), LoopState::Terminated);
        assert_eq!(device.submissions(), 0);
    }
}
