// Simulated presentation device for tests
//
// Fences complete on a timer: each submission finishes `gpu_delay` after the
// previous one (or after submit, if the queue was empty). Acquire/present
// failures and hung submissions can be scripted.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::hal::{
    AcquiredImage, PresentDevice, PresentMode, PresentStatus, Submission, SurfaceCapabilities,
    SurfaceFormat, SwapchainConfig,
};
use crate::error::FrameError;
use crate::surface::{Extent, PixelFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimFence(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimSemaphore(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimSwapchain(u64);

#[derive(Debug, Clone, Copy)]
enum FenceState {
    Signaled,
    Unsignaled,
    PendingUntil(Instant),
    Hung,
}

#[derive(Default)]
struct SimState {
    fences: HashMap<usize, FenceState>,
    semaphores: usize,
    next_handle: usize,
    swapchains: HashMap<u64, u32>,
    next_swapchain: u64,
    next_image: u32,
    gpu_free_at: Option<Instant>,
    completions: Vec<Instant>,
    max_outstanding: usize,
    submissions: usize,
    hang_after: Option<usize>,
    acquires: usize,
    acquire_failures: HashMap<usize, FrameError>,
    presents: usize,
    present_failures: HashMap<usize, FrameError>,
    wait_idle_calls: usize,
    waits_after_lost: usize,
    lost: bool,
    last_upload: Vec<u8>,
    current_extent: Option<Option<Extent>>,
}

pub struct SimDevice {
    gpu_delay: Duration,
    caps: SurfaceCapabilities,
    state: Mutex<SimState>,
}

impl SimDevice {
    pub fn new() -> Self {
        Self::with_gpu_delay(Duration::ZERO)
    }

    pub fn with_gpu_delay(gpu_delay: Duration) -> Self {
        Self::with_capabilities(Self::default_capabilities(), gpu_delay)
    }

    pub fn with_capabilities(caps: SurfaceCapabilities, gpu_delay: Duration) -> Self {
        Self {
            gpu_delay,
            caps,
            state: Mutex::new(SimState::default()),
        }
    }

    /// 800x600 surface, 1..=3 images, BGRA preferred by the "driver".
    pub fn default_capabilities() -> SurfaceCapabilities {
        SurfaceCapabilities {
            min_image_count: 1,
            max_image_count: 3,
            current_extent: Some(Extent::new(800, 600)),
            min_extent: Extent::new(1, 1),
            max_extent: Extent::new(4096, 4096),
            formats: vec![
                SurfaceFormat {
                    format: PixelFormat::Bgra8Unorm,
                    color_space: 0,
                },
                SurfaceFormat {
                    format: PixelFormat::Bgra8Srgb,
                    color_space: 0,
                },
            ],
            present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox],
        }
    }

    /// Submissions after the first `n` never complete.
    pub fn hang_after(&self, n: usize) {
        self.state.lock().hang_after = Some(n);
    }

    /// Fail the `n`-th acquire (1-based) with `error`.
    pub fn fail_acquire_at(&self, n: usize, error: FrameError) {
        self.state.lock().acquire_failures.insert(n, error);
    }

    pub fn fail_present_at(&self, n: usize, error: FrameError) {
        self.state.lock().present_failures.insert(n, error);
    }

    pub fn set_current_extent(&self, extent: Option<Extent>) {
        self.state.lock().current_extent = Some(extent);
    }

    /// Queue a submission against `fence` without any pixel payload.
    pub fn simulate_submission(&self, fence: SimFence) {
        self.enqueue(fence);
    }

    pub fn live_sync_objects(&self) -> usize {
        let state = self.state.lock();
        state.fences.len() + state.semaphores
    }

    pub fn live_swapchains(&self) -> usize {
        self.state.lock().swapchains.len()
    }

    pub fn submissions(&self) -> usize {
        self.state.lock().submissions
    }

    pub fn presents(&self) -> usize {
        self.state.lock().presents
    }

    /// Most submissions ever observed incomplete at the same time.
    pub fn max_outstanding(&self) -> usize {
        self.state.lock().max_outstanding
    }

    pub fn wait_idle_calls(&self) -> usize {
        self.state.lock().wait_idle_calls
    }

    pub fn waits_after_lost(&self) -> usize {
        self.state.lock().waits_after_lost
    }

    pub fn is_lost(&self) -> bool {
        self.state.lock().lost
    }

    pub fn last_upload(&self) -> Vec<u8> {
        self.state.lock().last_upload.clone()
    }

    fn enqueue(&self, fence: SimFence) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.submissions += 1;

        let hung = state.hang_after.is_some_and(|n| state.submissions > n);
        if hung {
            state.fences.insert(fence.0, FenceState::Hung);
            return;
        }

        let start = state.gpu_free_at.map_or(now, |free| free.max(now));
        let done = start + self.gpu_delay;
        state.gpu_free_at = Some(done);
        state.fences.insert(fence.0, FenceState::PendingUntil(done));

        state.completions.retain(|&c| c > now);
        state.completions.push(done);
        state.max_outstanding = state.max_outstanding.max(state.completions.len());
    }

    fn handle(state: &mut SimState) -> usize {
        state.next_handle += 1;
        state.next_handle
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl PresentDevice for SimDevice {
    type Semaphore = SimSemaphore;
    type Fence = SimFence;
    type Swapchain = SimSwapchain;

    fn create_semaphore(&self) -> Result<SimSemaphore, FrameError> {
        let mut state = self.state.lock();
        state.semaphores += 1;
        Ok(SimSemaphore(Self::handle(&mut state)))
    }

    fn destroy_semaphore(&self, _semaphore: SimSemaphore) {
        let mut state = self.state.lock();
        state.semaphores = state.semaphores.saturating_sub(1);
    }

    fn create_fence(&self, signaled: bool) -> Result<SimFence, FrameError> {
        let mut state = self.state.lock();
        let id = Self::handle(&mut state);
        let initial = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        state.fences.insert(id, initial);
        Ok(SimFence(id))
    }

    fn destroy_fence(&self, fence: SimFence) {
        self.state.lock().fences.remove(&fence.0);
    }

    fn fence_signaled(&self, fence: SimFence) -> Result<bool, FrameError> {
        let mut state = self.state.lock();
        match state.fences.get(&fence.0).copied() {
            Some(FenceState::Signaled) => Ok(true),
            Some(FenceState::PendingUntil(t)) if t <= Instant::now() => {
                state.fences.insert(fence.0, FenceState::Signaled);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(FrameError::api("fence status", "unknown fence")),
        }
    }

    fn wait_for_fence(&self, fence: SimFence, timeout: Duration) -> Result<bool, FrameError> {
        let fence_state = {
            let mut state = self.state.lock();
            if state.lost {
                state.waits_after_lost += 1;
            }
            state.fences.get(&fence.0).copied()
        };

        let now = Instant::now();
        let signaled = match fence_state {
            Some(FenceState::Signaled) => true,
            Some(FenceState::PendingUntil(t)) if t <= now + timeout => {
                std::thread::sleep(t.saturating_duration_since(now));
                true
            }
            Some(_) => {
                std::thread::sleep(timeout);
                false
            }
            None => return Err(FrameError::api("wait for fence", "unknown fence")),
        };

        if signaled {
            self.state.lock().fences.insert(fence.0, FenceState::Signaled);
        }
        Ok(signaled)
    }

    fn reset_fence(&self, fence: SimFence) -> Result<(), FrameError> {
        self.state.lock().fences.insert(fence.0, FenceState::Unsignaled);
        Ok(())
    }

    fn surface_capabilities(&self) -> Result<SurfaceCapabilities, FrameError> {
        let mut caps = self.caps.clone();
        if let Some(extent) = self.state.lock().current_extent {
            caps.current_extent = extent;
        }
        Ok(caps)
    }

    fn create_swapchain(
        &self,
        config: &SwapchainConfig,
        _old: Option<SimSwapchain>,
    ) -> Result<(SimSwapchain, Vec<u64>), FrameError> {
        let mut state = self.state.lock();
        state.next_swapchain += 1;
        let id = state.next_swapchain;
        state.swapchains.insert(id, config.image_count);
        state.next_image = 0;

        let images = (0..config.image_count as u64).map(|i| id * 100 + i).collect();
        Ok((SimSwapchain(id), images))
    }

    fn destroy_swapchain(&self, swapchain: SimSwapchain) {
        self.state.lock().swapchains.remove(&swapchain.0);
    }

    fn acquire_next_image(
        &self,
        swapchain: SimSwapchain,
        _timeout: Duration,
        _signal: SimSemaphore,
    ) -> Result<AcquiredImage, FrameError> {
        let mut state = self.state.lock();
        state.acquires += 1;
        let n = state.acquires;
        if let Some(err) = state.acquire_failures.remove(&n) {
            return Err(err);
        }

        let count = *state
            .swapchains
            .get(&swapchain.0)
            .ok_or_else(|| FrameError::api("acquire next image", "retired swapchain"))?;
        let index = state.next_image % count;
        state.next_image += 1;
        Ok(AcquiredImage {
            index,
            suboptimal: false,
        })
    }

    fn present(
        &self,
        swapchain: SimSwapchain,
        _image_index: u32,
        _wait_on: SimSemaphore,
    ) -> Result<PresentStatus, FrameError> {
        let mut state = self.state.lock();
        state.presents += 1;
        let n = state.presents;
        if let Some(err) = state.present_failures.remove(&n) {
            return Err(err);
        }
        if !state.swapchains.contains_key(&swapchain.0) {
            return Err(FrameError::SurfaceInvalidated);
        }
        Ok(PresentStatus::Optimal)
    }

    fn submit_async(&self, work: Submission<'_, Self>) -> Result<(), FrameError> {
        self.state.lock().last_upload = work.pixels.to_vec();
        self.enqueue(work.fence);
        Ok(())
    }

    fn submit_and_wait_idle(&self) -> Result<(), FrameError> {
        let free_at = {
            let mut state = self.state.lock();
            state.wait_idle_calls += 1;
            if state.lost {
                state.waits_after_lost += 1;
            }
            state.gpu_free_at
        };
        if let Some(t) = free_at {
            std::thread::sleep(t.saturating_duration_since(Instant::now()));
        }

        let mut state = self.state.lock();
        for fence in state.fences.values_mut() {
            if let FenceState::PendingUntil(_) = fence {
                *fence = FenceState::Signaled;
            }
        }
        state.completions.clear();
        Ok(())
    }

    fn mark_lost(&self) {
        self.state.lock().lost = true;
    }
}
