//! Drawing detections onto frames.
//!
use anyhow::Result;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_text_mut;
use rusttype::{Font, Scale};
use simple_error::simple_error;

use crate::nn::BoundingBox;

const LABEL_SCALE: f32 = 14.0;

/// Label font compiled into the binary.
pub fn bundled_font() -> Result<Font<'static>> {
    let font_data: &'static [u8] = include_bytes!("../resources/DejaVuSansMono.ttf");
    Font::try_from_bytes(font_data).ok_or_else(|| simple_error!("invalid bundled font").into())
}

/// Rectangle in frame pixels. May reach beyond the frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

/// Map a box from detector input pixels to frame pixels.
///
/// Every coordinate is scaled linearly along its axis and truncated.
pub fn scale_to_frame(bbox: &BoundingBox, input: (u32, u32), frame: (u32, u32)) -> PixelRect {
    let (input_width, input_height) = (input.0 as f32, input.1 as f32);
    let (frame_width, frame_height) = (frame.0 as f32, frame.1 as f32);

    PixelRect {
        x: (bbox.x / input_width * frame_width) as i32,
        y: (bbox.y / input_height * frame_height) as i32,
        w: (bbox.width / input_width * frame_width) as i32,
        h: (bbox.height / input_height * frame_height) as i32,
    }
}

/// Draw the outline of `rect`.
///
/// The horizontal edges lie on rows `y` and `y + h` and span the columns
/// `x..x + w`, the vertical edges lie on columns `x` and `x + w` and span the
/// rows `y..y + h`. Pixels outside of the image are skipped.
pub fn draw_rectangle(image: &mut RgbImage, rect: PixelRect, color: Rgb<u8>) {
    let (width, height) = (image.width() as i32, image.height() as i32);
    let mut put = |x: i32, y: i32| {
        if (0..width).contains(&x) && (0..height).contains(&y) {
            image.put_pixel(x as u32, y as u32, color);
        }
    };

    for i in rect.x..rect.x.saturating_add(rect.w) {
        put(i, rect.y);
        put(i, rect.y.saturating_add(rect.h));
    }
    for j in rect.y..rect.y.saturating_add(rect.h) {
        put(rect.x, j);
        put(rect.x.saturating_add(rect.w), j);
    }
}

/// Write `"{label} {value}"` above the rectangle, or inside it at the top
/// edge of the frame.
pub fn draw_label(
    image: &mut RgbImage,
    rect: PixelRect,
    text: &str,
    font: &Font<'_>,
    color: Rgb<u8>,
) {
    let y = if rect.y >= LABEL_SCALE as i32 {
        rect.y - LABEL_SCALE as i32
    } else {
        rect.y.max(0) + 1
    };
    let scale = Scale::uniform(LABEL_SCALE);
    draw_text_mut(image, color, rect.x.max(0), y, scale, font, text);
}

/// Draw all non-empty boxes of a detection onto `image`.
///
/// Returns the rectangles that were drawn, paired with their boxes.
pub fn annotate<'a>(
    image: &mut RgbImage,
    boxes: &'a [BoundingBox],
    input: (u32, u32),
    color: Rgb<u8>,
    font: Option<&Font<'_>>,
) -> Vec<(&'a BoundingBox, PixelRect)> {
    let frame = image.dimensions();
    let mut drawn = Vec::with_capacity(boxes.len());

    for bbox in boxes.iter().filter(|bbox| bbox.value != 0.0) {
        let rect = scale_to_frame(bbox, input, frame);
        draw_rectangle(image, rect, color);
        if let Some(font) = font {
            let text = format!("{} {:.2}", bbox.label, bbox.value);
            draw_label(image, rect, &text, font, color);
        }
        drawn.push((bbox, rect));
    }

    drawn
}
