// Demo scene drawn every frame: clear, a filled rectangle with a greeting on
// it, an anti-aliased triangle scaled to the canvas.

use glam::Vec2;
use tiny_skia::{Color, ColorU8, FillRule, Paint, PathBuilder, Rect, Transform};

use crate::bridge::DrawableCanvas;
use crate::text;

pub const RECT_COLOR: [u8; 4] = [0, 0, 255, 255];
pub const TRIANGLE_COLOR: [u8; 4] = [255, 0, 0, 255];
pub const TEXT_COLOR: [u8; 4] = [255, 255, 255, 255];

pub const GREETING: &str = "Hello Skia!";
/// Left end of the greeting's baseline, inside the rectangle.
const GREETING_AT: Vec2 = Vec2::new(100.0, 100.0);
const GREETING_SIZE: f32 = 24.0;

/// Triangle corners as fractions of the canvas size.
const TRIANGLE: [Vec2; 3] = [
    Vec2::new(0.5, 1.0 / 6.0),
    Vec2::new(0.25, 5.0 / 6.0),
    Vec2::new(0.75, 5.0 / 6.0),
];

pub fn draw_demo(canvas: &mut DrawableCanvas<'_>, clear: Color) {
    canvas.clear(clear);
    let size = Vec2::new(canvas.width() as f32, canvas.height() as f32);
    let pixmap = canvas.pixmap();

    let mut paint = Paint::default();
    paint.anti_alias = true;

    let [r, g, b, a] = RECT_COLOR;
    paint.set_color_rgba8(r, g, b, a);
    if let Some(rect) = Rect::from_xywh(50.0, 50.0, 300.0, 200.0) {
        pixmap.fill_rect(rect, &paint, Transform::identity(), None);
    }

    if let Some(font) = text::embedded_font() {
        let [r, g, b, a] = TEXT_COLOR;
        text::draw_text(
            pixmap,
            font,
            GREETING,
            GREETING_AT.x,
            GREETING_AT.y,
            GREETING_SIZE,
            ColorU8::from_rgba(r, g, b, a),
        );
    }

    let [apex, left, right] = TRIANGLE.map(|p| p * size);
    let mut path = PathBuilder::new();
    path.move_to(apex.x, apex.y);
    path.line_to(left.x, left.y);
    path.line_to(right.x, right.y);
    path.close();

    if let Some(path) = path.finish() {
        let [r, g, b, a] = TRIANGLE_COLOR;
        paint.set_color_rgba8(r, g, b, a);
        pixmap.fill_path(&path, &paint, FillRule::Winding, Transform::identity(), None);
    }
}
