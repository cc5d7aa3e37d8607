//! Detector input prepared from a camera frame.
//!
use anyhow::{bail, Result};
use image::{imageops, RgbImage};

/// Bring `src` to exactly `width` x `height`.
///
/// The source is first cropped around its center to the aspect ratio of the
/// target, then interpolated. Images that already have the target size are
/// copied untouched. An empty source yields a black image.
pub fn crop_and_interpolate(src: &RgbImage, width: u32, height: u32) -> RgbImage {
    let (src_width, src_height) = src.dimensions();
    if (src_width, src_height) == (width, height) {
        return src.clone();
    }
    if src_width == 0 || src_height == 0 || width == 0 || height == 0 {
        return RgbImage::new(width, height);
    }

    // Compare src_w / src_h against width / height without dividing
    let src_ratio = src_width as u64 * height as u64;
    let dst_ratio = width as u64 * src_height as u64;
    let (crop_width, crop_height) = if src_ratio > dst_ratio {
        // Source is wider, cut the sides
        let crop_width = (src_height as u64 * width as u64 / height as u64) as u32;
        (crop_width.max(1), src_height)
    } else {
        // Source is taller, cut top and bottom
        let crop_height = (src_width as u64 * height as u64 / width as u64) as u32;
        (src_width, crop_height.max(1))
    };
    let x = (src_width - crop_width) / 2;
    let y = (src_height - crop_height) / 2;

    let cropped = imageops::crop_imm(src, x, y, crop_width, crop_height).to_image();
    imageops::resize(&cropped, width, height, imageops::FilterType::Triangle)
}

/// A frame scaled to the input size of a detector.
pub struct Signal {
    image: RgbImage,
}

impl Signal {
    /// Prepare `frame` for a detector taking `width` x `height` images.
    pub fn from_frame(frame: &RgbImage, width: u32, height: u32) -> Self {
        Self {
            image: crop_and_interpolate(frame, width, height),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Number of pixels.
    pub fn total_length(&self) -> usize {
        self.image.width() as usize * self.image.height() as usize
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Write `length` pixels starting at pixel `offset` into `out`, one
    /// packed `0xRRGGBB` value per pixel.
    pub fn get_data(&self, offset: usize, length: usize, out: &mut [f32]) -> Result<()> {
        let end = offset.saturating_add(length);
        if end > self.total_length() {
            bail!(
                "requested pixels {offset}..{end} of a signal with {} pixels",
                self.total_length()
            );
        }
        if out.len() < length {
            bail!("output holds {} values, {length} requested", out.len());
        }

        let pixels = self.image.as_raw()[offset * 3..end * 3].chunks_exact(3);
        for (value, rgb) in out.iter_mut().zip(pixels) {
            *value = ((rgb[0] as u32) << 16 | (rgb[1] as u32) << 8 | rgb[2] as u32) as f32;
        }

        Ok(())
    }
}
