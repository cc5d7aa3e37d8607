//! Stream configuration.
//!
use std::time::Duration;

use anyhow::{bail, Result};
use image::Rgb;

/// Settings of the capture/detect/annotate/stream loop.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Quality of the re-encoded JPEG, 1..=100.
    pub jpeg_quality: u8,
    /// Outline color of bounding boxes.
    pub box_color: Rgb<u8>,
    /// Advertised via the `X-Framerate` header.
    pub frame_rate_hint: u32,
    /// Number of frames averaged for the logged frame rate.
    pub average_window: usize,
    /// Consecutive capture failures after which a stream is closed.
    pub max_capture_failures: u32,
    /// Pause after a failed capture.
    pub capture_retry: Duration,
    /// Log the raw features handed to the detector.
    pub debug_nn: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            box_color: Rgb([0xFF, 0x00, 0x00]),
            frame_rate_hint: 60,
            average_window: 20,
            max_capture_failures: 10,
            capture_retry: Duration::from_millis(100),
            debug_nn: false,
        }
    }
}

/// Parse a `0xRRGGBB`, `#RRGGBB` or `RRGGBB` color.
pub fn parse_color(s: &str) -> Result<Rgb<u8>> {
    let hex = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .or_else(|| s.strip_prefix('#'))
        .unwrap_or(s);

    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("invalid color {s:?}, expected RRGGBB");
    }

    let color = u32::from_str_radix(hex, 16)?;
    Ok(Rgb([
        ((color >> 16) & 0xFF) as u8,
        ((color >> 8) & 0xFF) as u8,
        (color & 0xFF) as u8,
    ]))
}

/// Parse a `WIDTHxHEIGHT` resolution.
pub fn parse_resolution(s: &str) -> Result<(u32, u32)> {
    match s.split_once(['x', 'X']) {
        Some((width, height)) => {
            let resolution = (width.trim().parse()?, height.trim().parse()?);
            if resolution.0 == 0 || resolution.1 == 0 {
                bail!("resolution {s:?} has an empty side");
            }
            Ok(resolution)
        }
        None => bail!("invalid resolution {s:?}, expected WIDTHxHEIGHT"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_color_prefixes() -> Result<()> {
        assert_eq!(parse_color("FF0000")?, Rgb([255, 0, 0]));
        assert_eq!(parse_color("#00ff00")?, Rgb([0, 255, 0]));
        assert_eq!(parse_color("0x0000FF")?, Rgb([0, 0, 255]));
        assert_eq!(parse_color("0X123456")?, Rgb([0x12, 0x34, 0x56]));
        Ok(())
    }

    #[test]
    fn test_parse_color_rejects_garbage() {
        assert!(parse_color("red").is_err());
        assert!(parse_color("#FFF").is_err());
        assert!(parse_color("0x+FFFFF").is_err());
    }

    #[test]
    fn test_parse_resolution() -> Result<()> {
        assert_eq!(parse_resolution("320x240")?, (320, 240));
        assert_eq!(parse_resolution("1280X720")?, (1280, 720));
        assert!(parse_resolution("320").is_err());
        assert!(parse_resolution("0x240").is_err());
        Ok(())
    }

    #[test]
    fn test_defaults_match_stream_settings() {
        let config = StreamConfig::default();
        assert_eq!(config.jpeg_quality, 80);
        assert_eq!(config.box_color, Rgb([255, 0, 0]));
        assert_eq!(config.frame_rate_hint, 60);
        assert_eq!(config.average_window, 20);
    }
}
