// CPU raster backend
//
// One tiny-skia pixmap is both the drawing surface and the output. There is
// nothing to submit or present; a frame is complete when drawing returns.

use super::hal::PresentStatus;
use super::{BackendKind, RenderBackend};
use crate::bridge::{self, DrawableCanvas};
use crate::error::{FrameError, InitError};
use crate::snapshot::Snapshot;
use crate::surface::{ColorType, Extent, Origin, SurfaceTarget};

pub struct RasterBackend {
    target: SurfaceTarget,
}

impl RasterBackend {
    pub fn new(extent: Extent) -> Result<Self, InitError> {
        let target = SurfaceTarget::raster(extent)
            .ok_or_else(|| InitError::Context(format!("cannot allocate a {extent} raster buffer")))?;
        log::info!("Raster target: {}", extent);
        Ok(Self { target })
    }
}

impl RenderBackend for RasterBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn extent(&self) -> Extent {
        self.target.extent()
    }

    fn acquire_target(&mut self) -> Result<(), FrameError> {
        Ok(())
    }

    fn canvas(&mut self) -> Result<DrawableCanvas<'_>, FrameError> {
        Ok(bridge::wrap(
            BackendKind::Cpu,
            &mut self.target,
            Origin::TopLeft,
            ColorType::Rgba8888,
        )?)
    }

    fn submit(&mut self) -> Result<(), FrameError> {
        Ok(())
    }

    fn present_or_swap(&mut self) -> Result<PresentStatus, FrameError> {
        Ok(PresentStatus::Optimal)
    }

    fn recreate(&mut self, extent: Extent) -> Result<(), FrameError> {
        if extent == self.target.extent() {
            return Ok(());
        }
        self.target = SurfaceTarget::raster(extent).ok_or(FrameError::SurfaceInvalidated)?;
        log::debug!("Raster target reallocated at {}", extent);
        Ok(())
    }

    fn drain(&mut self) -> Result<(), FrameError> {
        Ok(())
    }

    fn teardown(&mut self) {}

    fn snapshot(&self) -> Option<Snapshot<'_>> {
        Some(Snapshot::new(self.target.pixels()))
    }
}
