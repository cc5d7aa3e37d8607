//! Conversion between camera frames, RGB images and JPEG.
//!
//! The `image` crate codecs are used unless the `turbojpeg` feature selects
//! libjpeg-turbo.
use anyhow::{anyhow, bail, Result};
use image::RgbImage;

use crate::camera::{CameraFrame, PixelFormat};

/// Convert a frame into an RGB888 image.
pub fn decode_rgb888(frame: &CameraFrame) -> Result<RgbImage> {
    if frame.width == 0 || frame.height == 0 {
        bail!("frame of {}x{} is empty", frame.width, frame.height);
    }

    let image = match frame.format {
        PixelFormat::Jpeg => {
            let image = decompress(&frame.data)?;
            if image.dimensions() != (frame.width, frame.height) {
                log::debug!(
                    "Decoded {:?} from a frame announced as {}x{}",
                    image.dimensions(),
                    frame.width,
                    frame.height
                );
            }
            image
        }
        PixelFormat::Rgb888 => RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
            .ok_or_else(|| {
                anyhow!(
                    "RGB888 buffer of {} bytes does not fit {}x{}",
                    frame.data.len(),
                    frame.width,
                    frame.height
                )
            })?,
    };

    if image.width() == 0 || image.height() == 0 {
        bail!("decoded image of {:?} is empty", image.dimensions());
    }
    Ok(image)
}

/// Compress an RGB image to JPEG with the given quality (clamped to 1..=100).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    compress(image, quality.clamp(1, 100))
}

#[cfg(not(feature = "turbojpeg"))]
fn decompress(data: &[u8]) -> Result<RgbImage> {
    Ok(image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)?.to_rgb8())
}

#[cfg(not(feature = "turbojpeg"))]
fn compress(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    use image::codecs::jpeg::JpegEncoder;

    let mut buf = Vec::new();
    let (width, height) = image.dimensions();
    JpegEncoder::new_with_quality(&mut buf, quality).encode(
        image.as_raw(),
        width,
        height,
        image::ColorType::Rgb8,
    )?;

    Ok(buf)
}

#[cfg(feature = "turbojpeg")]
fn decompress(data: &[u8]) -> Result<RgbImage> {
    Ok(turbojpeg::decompress_image(data)?)
}

#[cfg(feature = "turbojpeg")]
fn compress(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let buf = turbojpeg::compress_image(image, quality as i32, turbojpeg::Subsamp::Sub2x2)?;
    Ok(buf.to_vec())
}
