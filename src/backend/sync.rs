// Frame synchronization
//
// A ring of N frame slots. Each slot owns an acquire semaphore, a submit
// semaphore and a submission fence; fences start signaled so the first lap
// never blocks. The control thread only ever waits on the fence of the slot
// it is about to reuse, which caps GPU work in flight at N.

use std::sync::Arc;
use std::time::Duration;

use super::hal::PresentDevice;
use crate::error::FrameError;

/// Sync primitives of one frame in flight.
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot<S, F> {
    pub index: usize,
    pub acquire_signal: S,
    pub submit_signal: S,
    pub submission_fence: F,
}

pub type SlotOf<D> = FrameSlot<<D as PresentDevice>::Semaphore, <D as PresentDevice>::Fence>;

#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub acquires: u64,
    /// Acquires that found the slot's fence unsignaled and had to wait.
    pub blocked_acquires: u64,
    pub max_in_flight: usize,
}

pub struct FrameSynchronizer<D: PresentDevice> {
    slots: Vec<SlotOf<D>>,
    /// Submitted and not yet observed complete.
    pending: Vec<bool>,
    /// Which slot last wrote each swapchain image.
    image_owners: Vec<Option<usize>>,
    current: usize,
    fence_timeout: Duration,
    stats: SyncStats,
    device: Arc<D>,
}

impl<D: PresentDevice> FrameSynchronizer<D> {
    pub fn new(
        device: Arc<D>,
        frames_in_flight: usize,
        fence_timeout: Duration,
    ) -> Result<Self, FrameError> {
        if frames_in_flight == 0 {
            return Err(FrameError::api(
                "frame synchronizer",
                "at least one frame in flight is required",
            ));
        }

        let mut sync = Self {
            slots: Vec::with_capacity(frames_in_flight),
            pending: vec![false; frames_in_flight],
            image_owners: Vec::new(),
            current: 0,
            fence_timeout,
            stats: SyncStats::default(),
            device,
        };

        // Partially built rings are cleaned up by Drop.
        for index in 0..frames_in_flight {
            let acquire_signal = sync.device.create_semaphore()?;
            let submit_signal = match sync.device.create_semaphore() {
                Ok(s) => s,
                Err(e) => {
                    sync.device.destroy_semaphore(acquire_signal);
                    return Err(e);
                }
            };
            let submission_fence = match sync.device.create_fence(true) {
                Ok(f) => f,
                Err(e) => {
                    sync.device.destroy_semaphore(acquire_signal);
                    sync.device.destroy_semaphore(submit_signal);
                    return Err(e);
                }
            };
            sync.slots.push(FrameSlot {
                index,
                acquire_signal,
                submit_signal,
                submission_fence,
            });
        }

        log::info!("Created {} frame slots", frames_in_flight);
        Ok(sync)
    }

    #[cfg(test)]
    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// Slots submitted whose completion has not been observed.
    pub fn in_flight(&self) -> usize {
        self.pending.iter().filter(|&&p| p).count()
    }

    /// Wait for the current slot's previous submission, then hand it out.
    ///
    /// Blocks only when the slot's fence is still unsignaled. A fence that
    /// stays unsignaled past the timeout is reported as device loss.
    pub fn acquire_slot(&mut self) -> Result<SlotOf<D>, FrameError> {
        let index = self.current;
        let blocked = self.wait_slot(index)?;

        self.stats.acquires += 1;
        if blocked {
            self.stats.blocked_acquires += 1;
        }
        Ok(self.slots[index])
    }

    /// Returns whether the wait actually blocked.
    fn wait_slot(&mut self, index: usize) -> Result<bool, FrameError> {
        let fence = self.slots[index].submission_fence;
        if self.device.fence_signaled(fence)? {
            self.pending[index] = false;
            return Ok(false);
        }

        if !self.device.wait_for_fence(fence, self.fence_timeout)? {
            return Err(FrameError::DeviceLost(format!(
                "frame slot {index} fence still unsignaled after {:?}",
                self.fence_timeout
            )));
        }
        self.pending[index] = false;
        Ok(true)
    }

    /// Record that `slot` is about to write `image`. If a different slot
    /// still has work queued against that image, wait for it first.
    pub fn claim_image(&mut self, slot: usize, image: u32) -> Result<(), FrameError> {
        let image = image as usize;
        if image >= self.image_owners.len() {
            self.image_owners.resize(image + 1, None);
        }

        if let Some(owner) = self.image_owners[image] {
            if owner != slot && self.pending[owner] {
                log::trace!("Image {} still owned by slot {}, waiting", image, owner);
                self.wait_slot(owner)?;
            }
        }
        self.image_owners[image] = Some(slot);
        Ok(())
    }

    /// Unsignal the slot's fence right before its submission.
    pub fn reset(&mut self, slot: usize) -> Result<(), FrameError> {
        self.device.reset_fence(self.slots[slot].submission_fence)
    }

    pub fn mark_submitted(&mut self, slot: usize) {
        self.pending[slot] = true;
        self.stats.max_in_flight = self.stats.max_in_flight.max(self.in_flight());
    }

    /// Move to the next slot. Called once per frame after present.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Wait until every submitted slot has completed.
    pub fn drain(&mut self) -> Result<(), FrameError> {
        for index in 0..self.slots.len() {
            if self.pending[index] {
                self.wait_slot(index)?;
            }
        }
        Ok(())
    }

    /// Image indices are meaningless once the swapchain is rebuilt.
    pub fn forget_images(&mut self) {
        self.image_owners.clear();
    }
}

impl<D: PresentDevice> Drop for FrameSynchronizer<D> {
    fn drop(&mut self) {
        for slot in self.slots.drain(..) {
            self.device.destroy_semaphore(slot.acquire_signal);
            self.device.destroy_semaphore(slot.submit_signal);
            self.device.destroy_fence(slot.submission_fence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimDevice;
    use std::time::Instant;

    fn synchronizer(device: &Arc<SimDevice>, frames: usize) -> FrameSynchronizer<SimDevice> {
        FrameSynchronizer::new(device.clone(), frames, Duration::from_millis(200)).unwrap()
    }

    #[test]
    fn rejects_zero_frames_in_flight() {
        let device = Arc::new(SimDevice::new());
        assert!(FrameSynchronizer::new(device, 0, Duration::from_millis(10)).is_err());
    }

    #[test]
    fn first_lap_never_blocks() {
        let device = Arc::new(SimDevice::new());
        let mut sync = synchronizer(&device, 3);
        for _ in 0..3 {
            let slot = sync.acquire_slot().unwrap();
            assert_eq!(sync.stats().blocked_acquires, 0);
            sync.reset(slot.index).unwrap();
            sync.advance();
        }
        assert_eq!(sync.stats().blocked_acquires, 0);
    }

    #[test]
    fn reusing_a_busy_slot_waits_for_its_fence() {
        let device = Arc::new(SimDevice::with_gpu_delay(Duration::from_millis(30)));
        let mut sync = synchronizer(&device, 1);

        let slot = sync.acquire_slot().unwrap();
        sync.reset(slot.index).unwrap();
        device.simulate_submission(slot.submission_fence);
        sync.mark_submitted(slot.index);
        sync.advance();
        assert_eq!(sync.in_flight(), 1);

        let start = Instant::now();
        sync.acquire_slot().unwrap();
        assert_eq!(sync.stats().blocked_acquires, 1);
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(sync.in_flight(), 0);
    }

    #[test]
    fn hung_fence_is_device_lost() {
        let device = Arc::new(SimDevice::new());
        device.hang_after(0);
        let mut sync = FrameSynchronizer::new(device.clone(), 1, Duration::from_millis(20)).unwrap();

        let slot = sync.acquire_slot().unwrap();
        sync.reset(slot.index).unwrap();
        device.simulate_submission(slot.submission_fence);
        sync.mark_submitted(slot.index);
        sync.advance();

        let err = sync.acquire_slot().unwrap_err();
        assert!(err.is_device_lost());
    }

    #[test]
    fn claiming_an_image_waits_for_its_previous_writer() {
        let device = Arc::new(SimDevice::with_gpu_delay(Duration::from_millis(30)));
        let mut sync = synchronizer(&device, 2);

        let first = sync.acquire_slot().unwrap();
        sync.claim_image(first.index, 0).unwrap();
        sync.reset(first.index).unwrap();
        device.simulate_submission(first.submission_fence);
        sync.mark_submitted(first.index);
        sync.advance();

        // Slot 1 gets image 0 back before slot 0's work finished.
        let second = sync.acquire_slot().unwrap();
        assert_eq!(sync.stats().blocked_acquires, 0);
        sync.claim_image(second.index, 0).unwrap();
        assert_eq!(sync.in_flight(), 0);
    }

    #[test]
    fn drain_leaves_nothing_in_flight() {
        let device = Arc::new(SimDevice::with_gpu_delay(Duration::from_millis(5)));
        let mut sync = synchronizer(&device, 2);
        for _ in 0..2 {
            let slot = sync.acquire_slot().unwrap();
            sync.reset(slot.index).unwrap();
            device.simulate_submission(slot.submission_fence);
            sync.mark_submitted(slot.index);
            sync.advance();
        }
        assert_eq!(sync.in_flight(), 2);
        sync.drain().unwrap();
        assert_eq!(sync.in_flight(), 0);
        assert_eq!(sync.stats().max_in_flight, 2);
    }

    #[test]
    fn drop_releases_every_primitive() {
        let device = Arc::new(SimDevice::new());
        drop(synchronizer(&device, 3));
        assert_eq!(device.live_sync_objects(), 0);
    }
}
