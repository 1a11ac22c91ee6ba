// Error taxonomy
//
// InitError  - fatal, returned before the presentation loop ever starts
// FrameError - per-frame; SurfaceInvalidated/Timeout are recovered inside
//              the loop, everything else ends in teardown
// BridgeError - canvas wrapping refused a format/origin combination

use ash::vk;
use thiserror::Error;

use crate::surface::{ColorType, Origin, PixelFormat};

/// Fatal initialization failures. The process never reaches the presentation
/// loop after one of these.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("window creation failed: {0}")]
    Window(String),

    #[error("window surface creation failed: {0}")]
    Surface(String),

    #[error("graphics context creation failed: {0}")]
    Context(String),

    #[error("device creation failed: {0}")]
    Device(String),

    #[error("no suitable physical device: {0}")]
    NoSuitableDevice(String),

    #[error("no queue family supports both graphics and presentation to the window surface")]
    NoSuitableQueueFamily,
}

impl InitError {
    /// Short category printed with the fatal diagnostic.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Window(_) => "window",
            Self::Surface(_) => "surface",
            Self::Context(_) => "context",
            Self::Device(_) => "device",
            Self::NoSuitableDevice(_) => "device-selection",
            Self::NoSuitableQueueFamily => "queue-family",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Window(_) => 3,
            Self::Surface(_) => 4,
            Self::Context(_) => 5,
            Self::Device(_) => 6,
            Self::NoSuitableDevice(_) => 7,
            Self::NoSuitableQueueFamily => 8,
        }
    }

    pub(crate) fn device(op: &str, err: impl std::fmt::Display) -> Self {
        Self::Device(format!("{op}: {err}"))
    }
}

/// Errors produced while driving a single frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The presentation target no longer matches the chain (resize, surface lost).
    #[error("surface invalidated")]
    SurfaceInvalidated,

    /// `acquire_next` did not produce an image within its timeout.
    #[error("timed out acquiring the next image")]
    Timeout,

    /// A submission fence stayed unsignaled past its bounded wait.
    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// Any other API failure during a frame. Never retried.
    #[error("{op} failed: {reason}")]
    Api { op: &'static str, reason: String },
}

impl FrameError {
    /// Transient errors handled through the Invalidated recreation path.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SurfaceInvalidated | Self::Timeout)
    }

    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost(_))
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::SurfaceInvalidated => "surface-invalidated",
            Self::Timeout => "timeout",
            Self::DeviceLost(_) => "device-lost",
            Self::Bridge(_) => "bridge",
            Self::Api { .. } => "frame",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::DeviceLost(_) => 10,
            _ => 9,
        }
    }

    pub(crate) fn api(op: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Api { op, reason: reason.to_string() }
    }

    /// Map a raw Vulkan result from a per-frame call.
    pub(crate) fn from_vk(op: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR => {
                Self::SurfaceInvalidated
            }
            vk::Result::TIMEOUT | vk::Result::NOT_READY => Self::Timeout,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost(format!("{op} reported device loss")),
            other => Self::api(op, other),
        }
    }
}

/// Anything that ends the process with a non-zero status.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Init(#[from] InitError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("writing output failed: {0}")]
    Output(String),
}

impl AppError {
    pub fn category(&self) -> &'static str {
        match self {
            Self::Init(e) => e.category(),
            Self::Frame(e) => e.category(),
            Self::Output(_) => "output",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Init(e) => e.exit_code(),
            Self::Frame(e) => e.exit_code(),
            Self::Output(_) => 11,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("unsupported surface format: {format:?} ({origin:?} origin) cannot be drawn as {color_type:?}")]
    UnsupportedSurfaceFormat {
        format: PixelFormat,
        origin: Origin,
        color_type: ColorType,
    },
}
