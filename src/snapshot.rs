// Read-only view of a finished raster frame, plus PNG export.

use std::path::Path;

use anyhow::{Context, Result};
use tiny_skia::Pixmap;

pub struct Snapshot<'a> {
    pixmap: &'a Pixmap,
}

impl<'a> Snapshot<'a> {
    pub fn new(pixmap: &'a Pixmap) -> Self {
        Self { pixmap }
    }

    pub fn width(&self) -> u32 {
        self.pixmap.width()
    }

    pub fn height(&self) -> u32 {
        self.pixmap.height()
    }

    /// Premultiplied RGBA, row 0 at the top.
    pub fn data(&self) -> &'a [u8] {
        self.pixmap.data()
    }

    /// Straight-alpha RGBA of one pixel, `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        // tiny-skia only checks the flat index, so a column past the edge
        // would read into the next row.
        if x >= self.width() || y >= self.height() {
            return None;
        }
        let c = self.pixmap.pixel(x, y)?.demultiply();
        Some([c.red(), c.green(), c.blue(), c.alpha()])
    }

    pub fn to_rgba_image(&self) -> Option<image::RgbaImage> {
        let mut bytes = Vec::with_capacity(self.data().len());
        for px in self.pixmap.pixels() {
            let c = px.demultiply();
            bytes.extend_from_slice(&[c.red(), c.green(), c.blue(), c.alpha()]);
        }
        image::RgbaImage::from_raw(self.width(), self.height(), bytes)
    }
}

pub fn write_png(snapshot: &Snapshot<'_>, path: &Path) -> Result<()> {
    let image = snapshot
        .to_rgba_image()
        .context("Snapshot dimensions do not match its pixel data")?;
    image
        .save_with_format(path, image::ImageFormat::Png)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    log::info!("Wrote {}x{} frame to {}", snapshot.width(), snapshot.height(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiny_skia::Color;

    #[test]
    fn pixels_are_demultiplied() {
        let mut pixmap = Pixmap::new(2, 2).unwrap();
        pixmap.fill(Color::from_rgba8(200, 100, 0, 128));
        let snapshot = Snapshot::new(&pixmap);
        let [r, g, b, a] = snapshot.pixel(1, 1).unwrap();
        assert_eq!(a, 128);
        assert!(r.abs_diff(200) <= 2 && g.abs_diff(100) <= 2 && b == 0);
        assert!(snapshot.pixel(2, 0).is_none());
    }

    #[test]
    fn reads_past_the_right_edge_do_not_wrap() {
        let mut pixmap = Pixmap::new(2, 2).unwrap();
        pixmap.fill(Color::BLACK);
        // Pixel (0, 1): what a wrapped read of (2, 0) would land on.
        pixmap.pixels_mut()[2] = tiny_skia::PremultipliedColorU8::from_rgba(255, 0, 0, 255).unwrap();
        let snapshot = Snapshot::new(&pixmap);

        assert_eq!(snapshot.pixel(0, 1), Some([255, 0, 0, 255]));
        assert_eq!(snapshot.pixel(2, 0), None);
        assert_eq!(snapshot.pixel(3, 0), None);
        assert_eq!(snapshot.pixel(0, 2), None);
        assert_eq!(snapshot.pixel(u32::MAX, 0), None);
    }

    #[test]
    fn writes_a_readable_png() {
        let mut pixmap = Pixmap::new(3, 2).unwrap();
        pixmap.fill(Color::from_rgba8(10, 20, 30, 255));
        let path = std::env::temp_dir().join(format!("canvas-bridge-snapshot-{}.png", std::process::id()));

        write_png(&Snapshot::new(&pixmap), &path).unwrap();
        let decoded = image::open(&path).unwrap().to_rgba8();
        std::fs::remove_file(&path).ok();

        assert_eq!(decoded.dimensions(), (3, 2));
        assert_eq!(decoded.get_pixel(2, 1).0, [10, 20, 30, 255]);
    }
}
