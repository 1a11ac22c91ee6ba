// Swapchain - Window presentation
//
// Owns the chain of presentable images and one SurfaceTarget per image.
// Format, image count, present mode and extent are negotiated against the
// surface's capabilities every time the chain is (re)built.

use std::sync::Arc;
use std::time::Duration;

use super::hal::{
    AcquiredImage, PresentDevice, PresentMode, PresentStatus, SurfaceCapabilities, SurfaceFormat,
    SwapchainConfig,
};
use crate::error::FrameError;
use crate::surface::{Extent, PixelFormat, SurfaceTarget};

/// Formats the canvas can draw into, best first.
const FORMAT_PREFERENCE: [PixelFormat; 4] = [
    PixelFormat::Rgba8Unorm,
    PixelFormat::Bgra8Unorm,
    PixelFormat::Rgba8Srgb,
    PixelFormat::Bgra8Srgb,
];

/// Most preferred drawable format, or the surface's first format if it offers
/// none the canvas can draw (the bridge then reports it as unsupported).
pub fn choose_surface_format(formats: &[SurfaceFormat]) -> Option<SurfaceFormat> {
    FORMAT_PREFERENCE
        .iter()
        .find_map(|wanted| formats.iter().find(|f| f.format == *wanted))
        .or_else(|| formats.first())
        .copied()
}

/// Honors the configured mode when the surface supports it; FIFO otherwise.
pub fn choose_present_mode(available: &[PresentMode], preferred: PresentMode) -> PresentMode {
    if available.contains(&preferred) {
        preferred
    } else {
        PresentMode::Fifo
    }
}

/// At least one more than the surface minimum, capped by its maximum.
pub fn choose_image_count(caps: &SurfaceCapabilities, desired: u32) -> u32 {
    let count = desired.max(caps.min_image_count + 1);
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

pub fn choose_extent(caps: &SurfaceCapabilities, requested: Extent) -> Extent {
    match caps.current_extent {
        Some(extent) => extent,
        None => Extent::new(
            requested
                .width
                .clamp(caps.min_extent.width, caps.max_extent.width),
            requested
                .height
                .clamp(caps.min_extent.height, caps.max_extent.height),
        ),
    }
}

pub struct SwapchainManager<D: PresentDevice> {
    raw: Option<D::Swapchain>,
    targets: Vec<SurfaceTarget>,
    format: Option<SurfaceFormat>,
    extent: Extent,
    desired_image_count: u32,
    preferred_present_mode: PresentMode,
    generation: u64,
    device: Arc<D>,
}

impl<D: PresentDevice> SwapchainManager<D> {
    /// A manager with no chain yet. `recreate` builds the first one.
    pub fn new(
        device: Arc<D>,
        desired_image_count: u32,
        preferred_present_mode: PresentMode,
    ) -> Result<Self, FrameError> {
        if desired_image_count < 2 {
            return Err(FrameError::api(
                "swapchain",
                format!("at least 2 images required, got {desired_image_count}"),
            ));
        }
        Ok(Self {
            raw: None,
            targets: Vec::new(),
            format: None,
            extent: Extent::default(),
            desired_image_count,
            preferred_present_mode,
            generation: 0,
            device,
        })
    }

    pub fn create(
        device: Arc<D>,
        desired_image_count: u32,
        preferred_present_mode: PresentMode,
        extent: Extent,
    ) -> Result<Self, FrameError> {
        let mut manager = Self::new(device, desired_image_count, preferred_present_mode)?;
        manager.recreate(extent)?;
        Ok(manager)
    }

    /// Rebuild the chain for `requested`. The caller must have drained all
    /// work that references the old images.
    ///
    /// A zero-sized surface yields `SurfaceInvalidated` and leaves no chain.
    pub fn recreate(&mut self, requested: Extent) -> Result<(), FrameError> {
        let caps = self.device.surface_capabilities()?;
        let extent = choose_extent(&caps, requested);
        if extent.is_empty() {
            self.destroy();
            return Err(FrameError::SurfaceInvalidated);
        }

        let format = choose_surface_format(&caps.formats)
            .ok_or_else(|| FrameError::api("swapchain create", "surface reports no formats"))?;
        let present_mode = choose_present_mode(&caps.present_modes, self.preferred_present_mode);
        if present_mode != self.preferred_present_mode {
            log::warn!(
                "Present mode {} unsupported by surface, using {}",
                self.preferred_present_mode,
                present_mode
            );
        }
        let config = SwapchainConfig {
            image_count: choose_image_count(&caps, self.desired_image_count),
            format,
            extent,
            present_mode,
        };

        // Targets reference the old images; drop them before the chain goes.
        self.targets.clear();
        let old = self.raw.take();
        let created = self.device.create_swapchain(&config, old);
        if let Some(old) = old {
            self.device.destroy_swapchain(old);
        }
        let (raw, images) = created?;
        self.raw = Some(raw);

        let targets: Option<Vec<SurfaceTarget>> = images
            .iter()
            .map(|&handle| SurfaceTarget::image(handle, extent, format.format))
            .collect();
        self.targets = targets.ok_or_else(|| {
            FrameError::api("swapchain create", format!("cannot allocate {extent} targets"))
        })?;

        self.format = Some(format);
        self.extent = extent;
        self.generation += 1;

        log::info!(
            "Swapchain #{}: {} images, {:?}, {}, {}",
            self.generation,
            self.targets.len(),
            format.format,
            extent,
            present_mode
        );
        Ok(())
    }

    pub fn acquire_next(
        &mut self,
        timeout: Duration,
        signal: D::Semaphore,
    ) -> Result<AcquiredImage, FrameError> {
        let raw = self.raw.ok_or(FrameError::SurfaceInvalidated)?;
        let acquired = self.device.acquire_next_image(raw, timeout, signal)?;
        if acquired.index as usize >= self.targets.len() {
            return Err(FrameError::api(
                "acquire next image",
                format!("index {} out of range", acquired.index),
            ));
        }
        Ok(acquired)
    }

    pub fn present(
        &self,
        image_index: u32,
        wait_on: D::Semaphore,
    ) -> Result<PresentStatus, FrameError> {
        let raw = self.raw.ok_or(FrameError::SurfaceInvalidated)?;
        self.device.present(raw, image_index, wait_on)
    }

    pub fn target(&self, image_index: u32) -> Option<&SurfaceTarget> {
        self.targets.get(image_index as usize)
    }

    pub fn target_mut(&mut self, image_index: u32) -> Option<&mut SurfaceTarget> {
        self.targets.get_mut(image_index as usize)
    }

    pub fn image_count(&self) -> usize {
        self.targets.len()
    }

    pub fn format(&self) -> Option<SurfaceFormat> {
        self.format
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Bumped on every successful (re)build.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub fn is_ready(&self) -> bool {
        self.raw.is_some()
    }

    pub fn destroy(&mut self) {
        self.targets.clear();
        if let Some(raw) = self.raw.take() {
            self.device.destroy_swapchain(raw);
        }
    }
}

impl<D: PresentDevice> Drop for SwapchainManager<D> {
    fn drop(&mut self) {
        self.destroy();
    }
}
