// Explicit-present backend
//
// Drives a PresentDevice through the frames-in-flight protocol:
//
//   acquire_target:  wait slot fence -> acquire image (signals slot semaphore)
//                    -> wait for any other slot still writing that image
//   canvas:          wrap the image's target
//   submit:          reset fence -> upload (waits acquire semaphore, signals
//                    submit semaphore + fence)
//   present_or_swap: present (waits submit semaphore) -> next slot

use std::sync::Arc;
use std::time::Duration;

use super::hal::{PresentDevice, PresentStatus, Submission};
use super::swapchain::SwapchainManager;
use super::sync::{FrameSynchronizer, SlotOf};
use super::{BackendKind, BackendSettings, RenderBackend};
use crate::bridge::{self, DrawableCanvas};
use crate::error::FrameError;
use crate::surface::{Backing, ColorType, Extent, Origin};

struct FrameInFlight<D: PresentDevice> {
    slot: SlotOf<D>,
    image_index: u32,
    suboptimal: bool,
}

pub struct ExplicitPresentBackend<D: PresentDevice> {
    // Field order is drop order: slots, then the chain, then the device.
    sync: Option<FrameSynchronizer<D>>,
    swapchain: Option<SwapchainManager<D>>,
    frame: Option<FrameInFlight<D>>,
    acquire_timeout: Duration,
    device: Arc<D>,
}

impl<D: PresentDevice> ExplicitPresentBackend<D> {
    /// Build the chain and frame slots on `device`.
    ///
    /// A zero-sized window is not an error here: the chain is left unbuilt and
    /// the first acquire reports the surface as invalidated.
    pub fn new(device: Arc<D>, settings: &BackendSettings) -> Result<Self, FrameError> {
        let mut swapchain = SwapchainManager::new(
            device.clone(),
            settings.swapchain_images,
            settings.present_mode,
        )?;
        match swapchain.recreate(settings.extent) {
            Ok(()) => {}
            Err(FrameError::SurfaceInvalidated) => {
                log::info!("Surface is zero-sized, deferring swapchain creation");
            }
            Err(e) => return Err(e),
        }

        let sync = FrameSynchronizer::new(
            device.clone(),
            settings.frames_in_flight,
            settings.fence_timeout,
        )?;

        Ok(Self {
            sync: Some(sync),
            swapchain: Some(swapchain),
            frame: None,
            acquire_timeout: settings.acquire_timeout,
            device,
        })
    }

    pub fn swapchain(&self) -> Option<&SwapchainManager<D>> {
        self.swapchain.as_ref()
    }

    #[cfg(test)]
    pub fn synchronizer(&self) -> Option<&FrameSynchronizer<D>> {
        self.sync.as_ref()
    }

    fn parts(&mut self) -> Result<(&mut FrameSynchronizer<D>, &mut SwapchainManager<D>), FrameError> {
        match (self.sync.as_mut(), self.swapchain.as_mut()) {
            (Some(sync), Some(swapchain)) => Ok((sync, swapchain)),
            _ => Err(FrameError::api("frame", "backend has been torn down")),
        }
    }
}

impl<D: PresentDevice> RenderBackend for ExplicitPresentBackend<D> {
    fn kind(&self) -> BackendKind {
        BackendKind::ExplicitPresentGpu
    }

    fn extent(&self) -> Extent {
        self.swapchain
            .as_ref()
            .map(SwapchainManager::extent)
            .unwrap_or_default()
    }

    fn acquire_target(&mut self) -> Result<(), FrameError> {
        let timeout = self.acquire_timeout;
        let (sync, swapchain) = self.parts()?;

        let slot = sync.acquire_slot()?;
        let acquired = swapchain.acquire_next(timeout, slot.acquire_signal)?;
        sync.claim_image(slot.index, acquired.index)?;

        log::trace!("Slot {} acquired image {}", slot.index, acquired.index);
        self.frame = Some(FrameInFlight {
            slot,
            image_index: acquired.index,
            suboptimal: acquired.suboptimal,
        });
        Ok(())
    }

    fn canvas(&mut self) -> Result<DrawableCanvas<'_>, FrameError> {
        let image_index = self
            .frame
            .as_ref()
            .map(|f| f.image_index)
            .ok_or_else(|| FrameError::api("canvas", "no image acquired"))?;
        let target = self
            .swapchain
            .as_mut()
            .and_then(|s| s.target_mut(image_index))
            .ok_or(FrameError::SurfaceInvalidated)?;

        // An undrawable format still goes through wrap so it is reported as
        // UnsupportedSurfaceFormat.
        let color_type = ColorType::for_format(target.format()).unwrap_or(ColorType::Rgba8888);
        Ok(bridge::wrap(
            BackendKind::ExplicitPresentGpu,
            target,
            Origin::TopLeft,
            color_type,
        )?)
    }

    fn submit(&mut self) -> Result<(), FrameError> {
        let (slot, image_index) = self
            .frame
            .as_ref()
            .map(|f| (f.slot, f.image_index))
            .ok_or_else(|| FrameError::api("submit", "no image acquired"))?;
        let device = self.device.clone();
        let (sync, swapchain) = self.parts()?;

        let target = swapchain
            .target(image_index)
            .ok_or(FrameError::SurfaceInvalidated)?;
        let Backing::Image { handle } = target.backing() else {
            return Err(FrameError::api("submit", "target is not a swapchain image"));
        };
        let pixels = bridge::upload_bytes(target)?;

        sync.reset(slot.index)?;
        device.submit_async(Submission {
            slot: slot.index,
            image: handle,
            extent: target.extent(),
            pixels: &pixels,
            wait_on: slot.acquire_signal,
            signal: slot.submit_signal,
            fence: slot.submission_fence,
        })?;
        sync.mark_submitted(slot.index);
        Ok(())
    }

    fn present_or_swap(&mut self) -> Result<PresentStatus, FrameError> {
        let frame = self
            .frame
            .take()
            .ok_or_else(|| FrameError::api("present", "no image acquired"))?;
        let (sync, swapchain) = self.parts()?;

        let result = swapchain.present(frame.image_index, frame.slot.submit_signal);
        // The slot's work is queued either way; the ring moves on.
        sync.advance();

        match result? {
            PresentStatus::Optimal if frame.suboptimal => Ok(PresentStatus::Suboptimal),
            status => Ok(status),
        }
    }

    fn recreate(&mut self, extent: Extent) -> Result<(), FrameError> {
        self.frame = None;
        let (sync, swapchain) = self.parts()?;
        sync.forget_images();
        swapchain.recreate(extent)
    }

    fn drain(&mut self) -> Result<(), FrameError> {
        if let Some(sync) = self.sync.as_mut() {
            sync.drain()?;
        }
        self.device.submit_and_wait_idle()
    }

    fn teardown(&mut self) {
        self.frame = None;
        if let Some(sync) = self.sync.as_ref() {
            let stats = sync.stats();
            log::info!(
                "Frame slots: {} acquires, {} blocked, at most {} in flight",
                stats.acquires,
                stats.blocked_acquires,
                stats.max_in_flight
            );
        }
        if self.sync.is_some() || self.swapchain.is_some() {
            log::info!("Destroying frame slots and swapchain");
        }
        self.sync = None;
        self.swapchain = None;
    }

    fn abandon(&mut self) {
        log::warn!("Abandoning device without waiting for outstanding work");
        self.device.mark_lost();
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimDevice;
    use crate::surface::PixelFormat;

    fn settings(frames_in_flight: usize, swapchain_images: u32) -> BackendSettings {
        BackendSettings {
            frames_in_flight,
            swapchain_images,
            fence_timeout: Duration::from_millis(250),
            ..BackendSettings::default()
        }
    }

    fn frame(backend: &mut ExplicitPresentBackend<SimDevice>) -> Result<PresentStatus, FrameError> {
        backend.acquire_target()?;
        backend.canvas()?.clear(tiny_skia::Color::from_rgba8(255, 0, 0, 255));
        backend.submit()?;
        backend.present_or_swap()
    }

    #[test]
    fn uploads_in_the_swapchain_channel_order() {
        let device = Arc::new(SimDevice::new());
        let mut backend = ExplicitPresentBackend::new(device.clone(), &settings(2, 2)).unwrap();
        assert_eq!(
            backend.swapchain().unwrap().format().unwrap().format,
            PixelFormat::Bgra8Unorm
        );

        frame(&mut backend).unwrap();
        assert_eq!(&device.last_upload()[..4], &[0, 0, 255, 255]);
        assert_eq!(device.presents(), 1);
    }

    #[test]
    fn ring_advances_after_each_present() {
        let device = Arc::new(SimDevice::new());
        let mut backend = ExplicitPresentBackend::new(device, &settings(3, 3)).unwrap();
        for expected in [1, 2, 0, 1] {
            frame(&mut backend).unwrap();
            assert_eq!(backend.synchronizer().unwrap().current_index(), expected);
        }
    }

    #[test]
    fn failed_present_still_advances() {
        let device = Arc::new(SimDevice::new());
        device.fail_present_at(1, FrameError::SurfaceInvalidated);
        let mut backend = ExplicitPresentBackend::new(device, &settings(2, 2)).unwrap();

        assert_eq!(frame(&mut backend), Err(FrameError::SurfaceInvalidated));
        assert_eq!(backend.synchronizer().unwrap().current_index(), 1);
    }

    #[test]
    fn unsupported_format_is_reported_by_canvas() {
        let mut caps = SimDevice::default_capabilities();
        caps.formats = vec![crate::backend::hal::SurfaceFormat {
            format: PixelFormat::Unsupported(1000),
            color_space: 0,
        }];
        let device = Arc::new(SimDevice::with_capabilities(caps, Duration::ZERO));
        let mut backend = ExplicitPresentBackend::new(device, &settings(2, 2)).unwrap();

        backend.acquire_target().unwrap();
        let err = backend.canvas().err().unwrap();
        assert!(matches!(err, FrameError::Bridge(_)));
    }

    #[test]
    fn zero_sized_surface_defers_the_chain() {
        let device = Arc::new(SimDevice::new());
        device.set_current_extent(Some(Extent::new(0, 0)));
        let mut backend = ExplicitPresentBackend::new(device.clone(), &settings(2, 2)).unwrap();
        assert_eq!(backend.acquire_target(), Err(FrameError::SurfaceInvalidated));

        device.set_current_extent(None);
        backend.drain().unwrap();
        backend.recreate(Extent::new(640, 480)).unwrap();
        assert_eq!(backend.extent(), Extent::new(640, 480));
        frame(&mut backend).unwrap();
    }

    #[test]
    fn teardown_releases_chain_and_slots_before_device() {
        let device = Arc::new(SimDevice::new());
        let mut backend = ExplicitPresentBackend::new(device.clone(), &settings(2, 2)).unwrap();
        frame(&mut backend).unwrap();
        backend.drain().unwrap();
        backend.teardown();

        assert_eq!(device.live_swapchains(), 0);
        assert_eq!(device.live_sync_objects(), 0);
        assert_eq!(Arc::strong_count(&device), 2);
    }
}
