// Presentation device abstraction
//
// The explicit-present backend needs a small set of device operations:
// sync objects, surface queries, swapchain lifecycle, async submission,
// and present. VulkanDevice implements them for real hardware; tests use
// a simulated device.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::FrameError;
use crate::surface::{Extent, PixelFormat};

/// Presentation pacing. FIFO is the only mode every surface must support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentMode {
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
}

impl FromStr for PresentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "immediate" => Ok(Self::Immediate),
            "mailbox" => Ok(Self::Mailbox),
            "fifo" => Ok(Self::Fifo),
            "fifo_relaxed" => Ok(Self::FifoRelaxed),
            other => Err(format!("unknown present mode '{other}'")),
        }
    }
}

impl fmt::Display for PresentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Immediate => "immediate",
            Self::Mailbox => "mailbox",
            Self::Fifo => "fifo",
            Self::FifoRelaxed => "fifo_relaxed",
        })
    }
}

/// Result of a successful present or swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    /// Presented, but the chain no longer matches the surface exactly.
    Suboptimal,
}

/// A surface format together with the backend's raw color space value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceFormat {
    pub format: PixelFormat,
    pub color_space: i32,
}

#[derive(Debug, Clone)]
pub struct SurfaceCapabilities {
    pub min_image_count: u32,
    /// 0 means no upper limit.
    pub max_image_count: u32,
    /// `None` when the surface lets the swapchain pick its size.
    pub current_extent: Option<Extent>,
    pub min_extent: Extent,
    pub max_extent: Extent,
    pub formats: Vec<SurfaceFormat>,
    pub present_modes: Vec<PresentMode>,
}

#[derive(Debug, Clone, Copy)]
pub struct SwapchainConfig {
    pub image_count: u32,
    pub format: SurfaceFormat,
    pub extent: Extent,
    pub present_mode: PresentMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    pub suboptimal: bool,
}

/// One frame's worth of GPU work: copy `pixels` into `image`, waiting on
/// `wait_on` and signaling `signal` + `fence` on completion.
pub struct Submission<'a, D: PresentDevice + ?Sized> {
    pub slot: usize,
    pub image: u64,
    pub extent: Extent,
    pub pixels: &'a [u8],
    pub wait_on: D::Semaphore,
    pub signal: D::Semaphore,
    pub fence: D::Fence,
}

pub trait PresentDevice {
    type Semaphore: Copy + fmt::Debug;
    type Fence: Copy + fmt::Debug;
    type Swapchain: Copy + fmt::Debug;

    fn create_semaphore(&self) -> Result<Self::Semaphore, FrameError>;
    fn destroy_semaphore(&self, semaphore: Self::Semaphore);

    fn create_fence(&self, signaled: bool) -> Result<Self::Fence, FrameError>;
    fn destroy_fence(&self, fence: Self::Fence);

    /// Non-blocking status query.
    fn fence_signaled(&self, fence: Self::Fence) -> Result<bool, FrameError>;

    /// Block up to `timeout`. `Ok(false)` means the wait timed out.
    fn wait_for_fence(&self, fence: Self::Fence, timeout: Duration) -> Result<bool, FrameError>;

    fn reset_fence(&self, fence: Self::Fence) -> Result<(), FrameError>;

    fn surface_capabilities(&self) -> Result<SurfaceCapabilities, FrameError>;

    /// Create a chain, retiring `old` if given. Returns the chain and raw
    /// handles of its images in index order.
    fn create_swapchain(
        &self,
        config: &SwapchainConfig,
        old: Option<Self::Swapchain>,
    ) -> Result<(Self::Swapchain, Vec<u64>), FrameError>;

    fn destroy_swapchain(&self, swapchain: Self::Swapchain);

    fn acquire_next_image(
        &self,
        swapchain: Self::Swapchain,
        timeout: Duration,
        signal: Self::Semaphore,
    ) -> Result<AcquiredImage, FrameError>;

    fn present(
        &self,
        swapchain: Self::Swapchain,
        image_index: u32,
        wait_on: Self::Semaphore,
    ) -> Result<PresentStatus, FrameError>;

    /// Queue work without waiting for it.
    fn submit_async(&self, work: Submission<'_, Self>) -> Result<(), FrameError>;

    /// Block until the device has no outstanding work.
    fn submit_and_wait_idle(&self) -> Result<(), FrameError>;

    /// Record that the device stopped responding. Later idle waits become
    /// no-ops.
    fn mark_lost(&self);
}
