// Render target bridge
//
// Turns a SurfaceTarget into a DrawableCanvas for the drawing library, and
// turns a finished GPU-backed target back into upload bytes in the target's
// native channel order and row order.
//
// Wrapping is non-owning: the canvas borrows the target for one frame and
// never touches GPU memory.

use std::borrow::Cow;

use tiny_skia::{Color, PixmapMut};

use crate::backend::BackendKind;
use crate::error::BridgeError;
use crate::surface::{Backing, ColorType, Origin, SurfaceTarget};

/// Transient drawing handle bound to exactly one target for one frame.
pub struct DrawableCanvas<'frame> {
    pixmap: PixmapMut<'frame>,
}

impl<'frame> DrawableCanvas<'frame> {
    pub fn width(&self) -> u32 {
        self.pixmap.width()
    }

    pub fn height(&self) -> u32 {
        self.pixmap.height()
    }

    /// The surface handed to the drawing library.
    pub fn pixmap(&mut self) -> &mut PixmapMut<'frame> {
        &mut self.pixmap
    }

    pub fn clear(&mut self, color: Color) {
        self.pixmap.fill(color);
    }
}

/// Wrap `target` into a canvas.
///
/// `origin` must equal the target's native origin and `color_type` must match
/// its pixel format; both are stated by the caller, never inferred.
pub fn wrap<'frame>(
    kind: BackendKind,
    target: &'frame mut SurfaceTarget,
    origin: Origin,
    color_type: ColorType,
) -> Result<DrawableCanvas<'frame>, BridgeError> {
    let format = target.format();
    let unsupported = BridgeError::UnsupportedSurfaceFormat {
        format,
        origin,
        color_type,
    };

    let backing_ok = matches!(
        (kind, target.backing()),
        (BackendKind::Cpu, Backing::Raster)
            | (BackendKind::ImmediateGpu, Backing::Framebuffer { .. })
            | (BackendKind::ExplicitPresentGpu, Backing::Image { .. })
    );
    if !backing_ok || origin != target.origin() || !color_type.matches(format) {
        return Err(unsupported);
    }

    Ok(DrawableCanvas {
        pixmap: target.pixels_mut().as_mut(),
    })
}

/// Bytes to upload into the GPU object behind `target`.
///
/// The canvas always records premultiplied RGBA with row 0 at the top; this
/// reorders channels for BGRA targets and flips rows for bottom-left targets.
pub fn upload_bytes(target: &SurfaceTarget) -> Result<Cow<'_, [u8]>, BridgeError> {
    let format = target.format();
    let origin = target.origin();
    let color_type =
        ColorType::for_format(format).ok_or(BridgeError::UnsupportedSurfaceFormat {
            format,
            origin,
            color_type: ColorType::Rgba8888,
        })?;

    let data = target.pixels().data();
    if color_type == ColorType::Rgba8888 && origin == Origin::TopLeft {
        return Ok(Cow::Borrowed(data));
    }

    let row_len = target.extent().width as usize * 4;
    let mut out = Vec::with_capacity(data.len());
    let rows: Box<dyn Iterator<Item = &[u8]>> = match origin {
        Origin::TopLeft => Box::new(data.chunks_exact(row_len)),
        Origin::BottomLeft => Box::new(data.chunks_exact(row_len).rev()),
    };
    for row in rows {
        match color_type {
            ColorType::Rgba8888 => out.extend_from_slice(row),
            ColorType::Bgra8888 => {
                for px in row.chunks_exact(4) {
                    out.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
                }
            }
        }
    }
    Ok(Cow::Owned(out))
}
