//! Per-frame processing: decode, detect, annotate and re-encode.
//!
use std::sync::Arc;

use anyhow::{Context, Result};
use rusttype::Font;

use crate::{
    annotate::{annotate, PixelRect},
    camera::{CameraFrame, PixelFormat},
    codec::{decode_rgb888, encode_jpeg},
    config::StreamConfig,
    nn::{BoundingBox, Detector, Timing},
    signal::Signal,
};

/// Number of packed features logged in `debug_nn` mode.
const DEBUG_FEATURES: usize = 8;

/// A frame ready for streaming.
#[derive(Debug)]
pub struct ProcessedFrame {
    pub jpeg: Vec<u8>,
    /// Drawn detections in frame pixels.
    pub detections: Vec<(BoundingBox, PixelRect)>,
    pub timing: Option<Timing>,
    /// False if the frame is streamed as captured.
    pub annotated: bool,
}

/// Turns captured frames into annotated JPEGs.
pub struct FramePipeline {
    detector: Arc<dyn Detector>,
    config: StreamConfig,
    font: Option<Font<'static>>,
}

impl FramePipeline {
    pub fn new(detector: Arc<dyn Detector>, config: StreamConfig) -> Self {
        Self {
            detector,
            config,
            font: None,
        }
    }

    /// Label boxes with their class and confidence using `font`.
    pub fn with_font(mut self, font: Font<'static>) -> Self {
        self.font = Some(font);
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Run detection on `frame` and draw the results onto it.
    ///
    /// If the frame cannot be decoded or re-encoded, it is passed on as
    /// captured. An error is only returned if not even that is possible.
    pub fn process(&self, frame: &CameraFrame) -> Result<ProcessedFrame> {
        match self.annotate_frame(frame) {
            Ok(processed) => Ok(processed),
            Err(e) => {
                log::warn!("Annotation failed, streaming frame as captured: {e:#}");
                Ok(ProcessedFrame {
                    jpeg: self.captured_jpeg(frame)?,
                    detections: Vec::new(),
                    timing: None,
                    annotated: false,
                })
            }
        }
    }

    fn annotate_frame(&self, frame: &CameraFrame) -> Result<ProcessedFrame> {
        let mut image = decode_rgb888(frame).context("conversion to RGB888 failed")?;

        let input_size = self.detector.input_size();
        let signal = Signal::from_frame(&image, input_size.0, input_size.1);
        if self.config.debug_nn {
            self.log_features(&signal);
        }

        let (boxes, timing) = match self.detector.detect(&signal) {
            Ok(inference) => {
                log::info!(
                    "Predictions (preprocess: {} ms, inference: {} ms, postprocess: {} ms)",
                    inference.timing.preprocess.as_millis(),
                    inference.timing.inference.as_millis(),
                    inference.timing.postprocess.as_millis()
                );
                (inference.boxes, Some(inference.timing))
            }
            Err(e) => {
                log::error!("Failed to run detector: {e:#}");
                (Vec::new(), None)
            }
        };

        let drawn = annotate(
            &mut image,
            &boxes,
            input_size,
            self.config.box_color,
            self.font.as_ref(),
        );
        for (bbox, rect) in drawn.iter() {
            log::info!(
                "{} ({:.6}) [x: {}, y: {}, w: {}, h: {}]",
                bbox.label,
                bbox.value,
                rect.x,
                rect.y,
                rect.w,
                rect.h
            );
        }
        let detections = drawn
            .into_iter()
            .map(|(bbox, rect)| (bbox.clone(), rect))
            .collect();

        let jpeg =
            encode_jpeg(&image, self.config.jpeg_quality).context("JPEG compression failed")?;

        Ok(ProcessedFrame {
            jpeg,
            detections,
            timing,
            annotated: true,
        })
    }

    /// The frame as captured, compressed if it is not a JPEG already.
    fn captured_jpeg(&self, frame: &CameraFrame) -> Result<Vec<u8>> {
        match frame.format {
            PixelFormat::Jpeg => Ok(frame.data.clone()),
            PixelFormat::Rgb888 => {
                let image = decode_rgb888(frame)?;
                encode_jpeg(&image, self.config.jpeg_quality).context("JPEG compression failed")
            }
        }
    }

    fn log_features(&self, signal: &Signal) {
        match feature_summary(signal) {
            Ok(summary) => log::debug!("Features ({} total): {}", signal.total_length(), summary),
            Err(e) => log::debug!("Failed to read features: {e}"),
        }
    }
}

/// The first packed features of `signal` as hex values.
fn feature_summary(signal: &Signal) -> Result<String> {
    let length = DEBUG_FEATURES.min(signal.total_length());
    let mut features = vec![0.0; length];
    signal.get_data(0, length, &mut features)?;

    Ok(features
        .iter()
        .map(|f| format!("0x{:06x}", *f as u32))
        .collect::<Vec<_>>()
        .join(", "))
}

#[cfg(test)]
pub(crate) mod test {
    use std::time::SystemTime;

    use anyhow::bail;
    use image::{Rgb, RgbImage};

    use super::*;
    use crate::{annotate::bundled_font, camera::test::solid_jpeg, nn::Inference};

    /// Detector reporting the same boxes for every frame.
    pub(crate) struct FixedDetector {
        pub(crate) input: (u32, u32),
        pub(crate) boxes: Vec<BoundingBox>,
    }

    impl Detector for FixedDetector {
        fn input_size(&self) -> (u32, u32) {
            self.input
        }

        fn detect(&self, signal: &Signal) -> Result<Inference> {
            assert_eq!((signal.width(), signal.height()), self.input);
            Ok(Inference {
                boxes: self.boxes.clone(),
                timing: Timing::default(),
            })
        }
    }

    struct FailingDetector;

    impl Detector for FailingDetector {
        fn input_size(&self) -> (u32, u32) {
            (16, 16)
        }

        fn detect(&self, _signal: &Signal) -> Result<Inference> {
            bail!("model exploded")
        }
    }

    pub(crate) fn face(x: f32, y: f32, width: f32, height: f32) -> BoundingBox {
        BoundingBox {
            label: "face".into(),
            value: 0.93,
            x,
            y,
            width,
            height,
        }
    }

    fn jpeg_frame(width: u32, height: u32) -> CameraFrame {
        CameraFrame::from_jpeg(solid_jpeg(width, height, Rgb([0, 0, 0])), SystemTime::now())
            .expect("test frame")
    }

    #[test]
    fn test_boxes_are_drawn_in_frame_pixels() -> Result<()> {
        let detector = FixedDetector {
            input: (16, 12),
            boxes: vec![face(2.0, 3.0, 4.0, 3.0)],
        };
        let config = StreamConfig {
            jpeg_quality: 100,
            ..StreamConfig::default()
        };
        let pipeline = FramePipeline::new(Arc::new(detector), config);

        let processed = pipeline.process(&jpeg_frame(32, 24))?;

        assert!(processed.annotated);
        assert_eq!(
            processed.detections[0].1,
            PixelRect { x: 4, y: 6, w: 8, h: 6 }
        );

        let image = image::load_from_memory(&processed.jpeg)?.to_rgb8();
        assert_eq!(image.dimensions(), (32, 24));
        // Middle of the top edge is red, the box center stays dark
        let edge = image.get_pixel(8, 6);
        assert!(edge[0] as i32 - edge[1] as i32 > 40, "{edge:?}");
        let center = image.get_pixel(8, 9);
        assert!(center[0] < 60, "{center:?}");
        Ok(())
    }

    #[test]
    fn test_detector_failure_streams_unannotated() -> Result<()> {
        let pipeline = FramePipeline::new(Arc::new(FailingDetector), StreamConfig::default());

        let processed = pipeline.process(&jpeg_frame(32, 32))?;

        assert!(processed.annotated);
        assert!(processed.detections.is_empty());
        assert!(processed.timing.is_none());
        Ok(())
    }

    #[test]
    fn test_undecodable_jpeg_is_passed_on() -> Result<()> {
        let pipeline = FramePipeline::new(Arc::new(FailingDetector), StreamConfig::default());
        let frame = CameraFrame {
            data: vec![0xFF, 0xD8, 0xFF, 0x00],
            width: 8,
            height: 8,
            format: PixelFormat::Jpeg,
            timestamp: SystemTime::now(),
        };

        let processed = pipeline.process(&frame)?;

        assert!(!processed.annotated);
        assert_eq!(processed.jpeg, frame.data);
        Ok(())
    }

    #[test]
    fn test_feature_summary() {
        let mut image = RgbImage::new(3, 1);
        image.put_pixel(0, 0, Rgb([0x12, 0x34, 0x56]));
        image.put_pixel(2, 0, Rgb([0xFF, 0xFF, 0xFF]));
        let signal = Signal::from_frame(&image, 3, 1);

        assert_eq!(
            feature_summary(&signal).ok(),
            Some("0x123456, 0x000000, 0xffffff".to_owned())
        );
    }

    #[test]
    fn test_debug_nn_and_labels_keep_annotating() -> Result<()> {
        let detector = FixedDetector {
            input: (32, 32),
            boxes: vec![face(4.0, 16.0, 20.0, 10.0)],
        };
        let config = StreamConfig {
            debug_nn: true,
            jpeg_quality: 100,
            ..StreamConfig::default()
        };
        let pipeline =
            FramePipeline::new(Arc::new(detector), config).with_font(bundled_font()?);

        let processed = pipeline.process(&jpeg_frame(64, 64))?;

        assert!(processed.annotated);
        assert_eq!(
            processed.detections[0].1,
            PixelRect { x: 8, y: 32, w: 40, h: 20 }
        );
        // The label sits above the box
        let image = image::load_from_memory(&processed.jpeg)?.to_rgb8();
        let label_pixels = image
            .enumerate_pixels()
            .filter(|(_, y, p)| *y < 31 && p[0] as i32 - p[1] as i32 > 60)
            .count();
        assert!(label_pixels > 5);
        Ok(())
    }

    #[test]
    fn test_empty_frame_is_an_error() {
        let detector = FixedDetector {
            input: (4, 4),
            boxes: vec![],
        };
        let pipeline = FramePipeline::new(Arc::new(detector), StreamConfig::default());
        let frame = CameraFrame {
            data: Vec::new(),
            width: 0,
            height: 0,
            format: PixelFormat::Rgb888,
            timestamp: SystemTime::now(),
        };

        assert!(pipeline.process(&frame).is_err());
    }

    #[test]
    fn test_rgb888_frames_are_encoded() -> Result<()> {
        let detector = FixedDetector {
            input: (4, 4),
            boxes: vec![],
        };
        let pipeline = FramePipeline::new(Arc::new(detector), StreamConfig::default());
        let image = RgbImage::from_pixel(4, 4, Rgb([10, 20, 30]));
        let frame = CameraFrame::from_rgb888(image.into_raw(), 4, 4, SystemTime::now())?;

        let processed = pipeline.process(&frame)?;

        assert_eq!(&processed.jpeg[..2], &[0xFF, 0xD8]);
        Ok(())
    }
}
