// Surface targets
//
// A SurfaceTarget describes one drawable region: a CPU raster buffer, the GL
// default framebuffer, or one swapchain image. GPU-backed targets carry a
// CPU staging pixmap the canvas records into; the GPU memory itself is never
// owned here.

use std::fmt;

use tiny_skia::Pixmap;

/// Size of a target in physical pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Minimized windows report a zero-sized framebuffer.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<winit::dpi::PhysicalSize<u32>> for Extent {
    fn from(size: winit::dpi::PhysicalSize<u32>) -> Self {
        Self::new(size.width, size.height)
    }
}

/// Pixel layout of a target's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba8Srgb,
    Bgra8Srgb,
    /// A format reported by the backend that the canvas cannot draw into.
    /// Carries the backend's raw enum value for diagnostics.
    Unsupported(i32),
}

impl PixelFormat {
    pub fn is_bgra(&self) -> bool {
        matches!(self, Self::Bgra8Unorm | Self::Bgra8Srgb)
    }

    pub fn is_rgba(&self) -> bool {
        matches!(self, Self::Rgba8Unorm | Self::Rgba8Srgb)
    }
}

/// Where row 0 of the target's memory sits on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    TopLeft,
    BottomLeft,
}

/// Channel order the canvas is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorType {
    Rgba8888,
    Bgra8888,
}

impl ColorType {
    /// The color type whose channel order matches `format`, if any.
    pub fn for_format(format: PixelFormat) -> Option<Self> {
        if format.is_rgba() {
            Some(Self::Rgba8888)
        } else if format.is_bgra() {
            Some(Self::Bgra8888)
        } else {
            None
        }
    }

    pub fn matches(&self, format: PixelFormat) -> bool {
        Self::for_format(format) == Some(*self)
    }
}

/// Backend-specific handle to the memory behind a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// The pixmap itself is the target memory.
    Raster,
    /// GL framebuffer object name; 0 is the window's default framebuffer.
    Framebuffer { id: u32 },
    /// Raw presentation-engine image handle. Owned by the swapchain.
    Image { handle: u64 },
}

pub struct SurfaceTarget {
    extent: Extent,
    format: PixelFormat,
    origin: Origin,
    backing: Backing,
    pixels: Pixmap,
}

impl SurfaceTarget {
    /// CPU raster buffer. tiny-skia stores premultiplied RGBA, row 0 at the top.
    pub fn raster(extent: Extent) -> Option<Self> {
        Self::with_backing(extent, PixelFormat::Rgba8Unorm, Origin::TopLeft, Backing::Raster)
    }

    /// A GL framebuffer. GL addresses rows bottom-up.
    pub fn framebuffer(id: u32, extent: Extent, format: PixelFormat) -> Option<Self> {
        Self::with_backing(extent, format, Origin::BottomLeft, Backing::Framebuffer { id })
    }

    /// One presentation-engine image.
    pub fn image(handle: u64, extent: Extent, format: PixelFormat) -> Option<Self> {
        Self::with_backing(extent, format, Origin::TopLeft, Backing::Image { handle })
    }

    fn with_backing(
        extent: Extent,
        format: PixelFormat,
        origin: Origin,
        backing: Backing,
    ) -> Option<Self> {
        let pixels = Pixmap::new(extent.width, extent.height)?;
        Some(Self {
            extent,
            format,
            origin,
            backing,
            pixels,
        })
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Native origin of the backing memory.
    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn backing(&self) -> Backing {
        self.backing
    }

    /// Read-only view of the pixels (the raster memory, or the staging
    /// recording for GPU targets).
    pub fn pixels(&self) -> &Pixmap {
        &self.pixels
    }

    pub(crate) fn pixels_mut(&mut self) -> &mut Pixmap {
        &mut self.pixels
    }
}

impl fmt::Debug for SurfaceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceTarget")
            .field("extent", &self.extent)
            .field("format", &self.format)
            .field("origin", &self.origin)
            .field("backing", &self.backing)
            .finish()
    }
}
