// Backend module - the three presentation models behind one interface
//
// Cpu                -> raster.rs   (tiny-skia pixmap, no presentation)
// ImmediateGpu       -> gl.rs       (GL context, buffer swap)
// ExplicitPresentGpu -> explicit.rs (swapchain + frame slots), driven by a
//                       PresentDevice (device.rs/vulkan.rs for real hardware)

pub mod device;
pub mod explicit;
pub mod gl;
pub mod hal;
pub mod raster;
pub mod swapchain;
pub mod sync;
pub mod vulkan;
pub mod window_surface;

#[cfg(test)]
pub mod sim;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window, WindowAttributes};

use crate::bridge::DrawableCanvas;
use crate::error::{FrameError, InitError};
use crate::snapshot::Snapshot;
use crate::surface::Extent;

pub use device::VulkanDevice;
pub use explicit::ExplicitPresentBackend;
pub use gl::GlBackend;
pub use hal::{PresentMode, PresentStatus};
pub use raster::RasterBackend;

/// Which presentation model a device context talks to. Fixed for the
/// lifetime of the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum BackendKind {
    #[serde(alias = "cpu", alias = "raster")]
    Cpu,
    #[serde(alias = "gl", alias = "opengl")]
    ImmediateGpu,
    #[serde(alias = "vulkan", alias = "vk")]
    ExplicitPresentGpu,
}

#[derive(Debug, Error)]
#[error("unknown backend '{0}' (expected cpu, gl or vulkan)")]
pub struct ParseBackendError(String);

impl FromStr for BackendKind {
    type Err = ParseBackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" | "raster" => Ok(Self::Cpu),
            "gl" | "opengl" => Ok(Self::ImmediateGpu),
            "vulkan" | "vk" => Ok(Self::ExplicitPresentGpu),
            _ => Err(ParseBackendError(s.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cpu => "cpu",
            Self::ImmediateGpu => "gl",
            Self::ExplicitPresentGpu => "vulkan",
        })
    }
}

/// Backend-agnostic settings resolved from the config file and CLI.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub app_name: String,
    pub extent: Extent,
    pub present_mode: PresentMode,
    pub frames_in_flight: usize,
    pub swapchain_images: u32,
    pub acquire_timeout: Duration,
    pub fence_timeout: Duration,
    pub enable_validation: bool,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            app_name: "canvas-bridge".to_string(),
            extent: Extent::new(800, 600),
            present_mode: PresentMode::Fifo,
            frames_in_flight: 2,
            swapchain_images: 2,
            acquire_timeout: Duration::from_secs(1),
            fence_timeout: Duration::from_secs(5),
            enable_validation: false,
        }
    }
}

/// The capability interface every presentation model implements. The
/// presentation loop is written once against it.
///
/// Per frame the loop calls, in order: `acquire_target`, `canvas` (once),
/// `submit`, `present_or_swap`. `drain` + `recreate` run between frames only.
pub trait RenderBackend {
    fn kind(&self) -> BackendKind;

    /// Extent of the current target(s).
    fn extent(&self) -> Extent;

    /// Make the next Surface Target available for drawing.
    fn acquire_target(&mut self) -> Result<(), FrameError>;

    /// Wrap the acquired target for the drawing library.
    fn canvas(&mut self) -> Result<DrawableCanvas<'_>, FrameError>;

    /// Flush the frame's drawing into backend-native submission.
    fn submit(&mut self) -> Result<(), FrameError>;

    fn present_or_swap(&mut self) -> Result<PresentStatus, FrameError>;

    /// Rebuild target(s) for `extent`. Only called after `drain`.
    fn recreate(&mut self, extent: Extent) -> Result<(), FrameError>;

    /// Block until no submitted work is outstanding.
    fn drain(&mut self) -> Result<(), FrameError>;

    /// Release targets and synchronization primitives. The device context
    /// itself goes when the backend is dropped.
    fn teardown(&mut self);

    /// Teardown after the device stopped responding: no waits, no submissions.
    fn abandon(&mut self) {
        self.teardown();
    }

    /// Read-only view of the last completed frame, where the backend keeps
    /// one in host memory.
    fn snapshot(&self) -> Option<Snapshot<'_>> {
        None
    }
}

impl<B: RenderBackend + ?Sized> RenderBackend for Box<B> {
    fn kind(&self) -> BackendKind {
        (**self).kind()
    }

    fn extent(&self) -> Extent {
        (**self).extent()
    }

    fn acquire_target(&mut self) -> Result<(), FrameError> {
        (**self).acquire_target()
    }

    fn canvas(&mut self) -> Result<DrawableCanvas<'_>, FrameError> {
        (**self).canvas()
    }

    fn submit(&mut self) -> Result<(), FrameError> {
        (**self).submit()
    }

    fn present_or_swap(&mut self) -> Result<PresentStatus, FrameError> {
        (**self).present_or_swap()
    }

    fn recreate(&mut self, extent: Extent) -> Result<(), FrameError> {
        (**self).recreate(extent)
    }

    fn drain(&mut self) -> Result<(), FrameError> {
        (**self).drain()
    }

    fn teardown(&mut self) {
        (**self).teardown()
    }

    fn abandon(&mut self) {
        (**self).abandon()
    }

    fn snapshot(&self) -> Option<Snapshot<'_>> {
        (**self).snapshot()
    }
}

/// What the windowing collaborator hands to `initialize`.
pub enum WindowingHandle<'a> {
    /// No window; only the CPU backend can run like this.
    Headless,
    EventLoop {
        event_loop: &'a ActiveEventLoop,
        attributes: WindowAttributes,
    },
}

pub struct Initialized {
    /// Window created for the backend, if it needed one.
    pub window: Option<Arc<Window>>,
    pub backend: Box<dyn RenderBackend>,
}

/// Create the device context for `kind` and wrap it in its backend.
///
/// Either returns a fully usable backend or a fatal error; nothing partially
/// initialized escapes.
pub fn initialize(
    kind: BackendKind,
    handle: WindowingHandle<'_>,
    settings: &BackendSettings,
) -> Result<Initialized, InitError> {
    log::info!("Initializing {} backend", kind);

    match (kind, handle) {
        (BackendKind::Cpu, _) => Ok(Initialized {
            window: None,
            backend: Box::new(RasterBackend::new(settings.extent)?),
        }),
        (
            BackendKind::ImmediateGpu,
            WindowingHandle::EventLoop {
                event_loop,
                attributes,
            },
        ) => {
            let (window, backend) = GlBackend::create(event_loop, attributes, settings)?;
            Ok(Initialized {
                window: Some(window),
                backend: Box::new(backend),
            })
        }
        (
            BackendKind::ExplicitPresentGpu,
            WindowingHandle::EventLoop {
                event_loop,
                attributes,
            },
        ) => {
            let window = event_loop
                .create_window(attributes)
                .map(Arc::new)
                .map_err(|e| InitError::Window(e.to_string()))?;

            let device = VulkanDevice::new(&settings.app_name, settings.enable_validation, &window)?;
            let mut settings = settings.clone();
            settings.extent = window.inner_size().into();

            let backend = ExplicitPresentBackend::new(device, &settings)
                .map_err(|e| InitError::Surface(format!("swapchain setup: {e}")))?;
            Ok(Initialized {
                window: Some(window),
                backend: Box::new(backend),
            })
        }
        (kind, WindowingHandle::Headless) => Err(InitError::Window(format!(
            "the {kind} backend presents to a window and cannot run headless"
        ))),
    }
}
