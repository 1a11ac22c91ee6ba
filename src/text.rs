// Text onto a canvas pixmap
//
// Glyph outlines come from ab_glyph; their coverage is blended source-over
// into the premultiplied pixels, so text composes with whatever tiny-skia
// drew before it.

use std::sync::OnceLock;

use ab_glyph::{point, Font, FontRef, PxScale, Rect, ScaleFont};
use tiny_skia::{ColorU8, PixmapMut, PremultipliedColorU8};

static FONT_DATA: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

/// The font bundled with the binary. `None` only if the bundled file is corrupt.
pub fn embedded_font() -> Option<&'static FontRef<'static>> {
    static FONT: OnceLock<Option<FontRef<'static>>> = OnceLock::new();
    FONT.get_or_init(|| match FontRef::try_from_slice(FONT_DATA) {
        Ok(font) => Some(font),
        Err(e) => {
            log::warn!("Bundled font unusable, text disabled: {}", e);
            None
        }
    })
    .as_ref()
}

/// Draw `text` with its baseline starting at (`x`, `baseline`).
///
/// Returns the pixel bounds of the ink, or `None` if nothing was drawn.
pub fn draw_text<F: Font>(
    pixmap: &mut PixmapMut<'_>,
    font: &F,
    text: &str,
    x: f32,
    baseline: f32,
    size: f32,
    color: ColorU8,
) -> Option<Rect> {
    let scaled = font.as_scaled(PxScale::from(size));
    let mut caret = point(x, baseline);
    let mut previous = None;
    let mut ink: Option<Rect> = None;

    for ch in text.chars() {
        let id = scaled.glyph_id(ch);
        if let Some(prev) = previous {
            caret.x += scaled.kern(prev, id);
        }
        let glyph = id.with_scale_and_position(scaled.scale(), caret);
        caret.x += scaled.h_advance(id);
        previous = Some(id);

        // Whitespace has no outline.
        let Some(outlined) = font.outline_glyph(glyph) else {
            continue;
        };
        let bounds = outlined.px_bounds();
        let (left, top) = (bounds.min.x as i32, bounds.min.y as i32);
        outlined.draw(|gx, gy, coverage| {
            blend(pixmap, left + gx as i32, top + gy as i32, color, coverage);
        });

        ink = Some(match ink {
            Some(r) => Rect {
                min: point(r.min.x.min(bounds.min.x), r.min.y.min(bounds.min.y)),
                max: point(r.max.x.max(bounds.max.x), r.max.y.max(bounds.max.y)),
            },
            None => bounds,
        });
    }
    ink
}

fn blend(pixmap: &mut PixmapMut<'_>, x: i32, y: i32, color: ColorU8, coverage: f32) {
    let (width, height) = (pixmap.width() as i32, pixmap.height() as i32);
    if x < 0 || y < 0 || x >= width || y >= height {
        return;
    }
    let coverage = coverage.clamp(0.0, 1.0);
    if coverage == 0.0 {
        return;
    }

    let index = (y * width + x) as usize;
    let pixels = pixmap.pixels_mut();
    let dst = pixels[index];

    let src_alpha = color.alpha() as f32 / 255.0 * coverage;
    let keep = 1.0 - src_alpha;
    let a = (255.0 * src_alpha + dst.alpha() as f32 * keep).round() as u8;
    // Premultiplied channels may never exceed alpha.
    let channel = |src: u8, dst: u8| ((src as f32 * src_alpha + dst as f32 * keep).round() as u8).min(a);

    if let Some(out) = PremultipliedColorU8::from_rgba(
        channel(color.red(), dst.red()),
        channel(color.green(), dst.green()),
        channel(color.blue(), dst.blue()),
        a,
    ) {
        pixels[index] = out;
    }
}
