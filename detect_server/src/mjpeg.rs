//! MJPEG streaming over `multipart/x-mixed-replace`.
//!
//! Every frame is sent as one part of a never-ending multipart response. The
//! browser replaces the previous image with each new part.
use std::{
    sync::Arc,
    thread,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::anyhow;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    camera::{CameraFrame, SharedCamera},
    meter::{FrameTimer, METER},
    pipeline::FramePipeline,
};

macro_rules! part_boundary {
    () => {
        "123456789000000000000987654321"
    };
}

/// Separator between the parts of the stream.
pub const PART_BOUNDARY: &str = part_boundary!();

/// Content type of the stream response.
pub const STREAM_CONTENT_TYPE: &str =
    concat!("multipart/x-mixed-replace;boundary=", part_boundary!());

/// Parts buffered per client.
const STREAM_BUFFER: usize = 2;

pub type PartStream = ReceiverStream<Result<Bytes, std::io::Error>>;

/// Frame a JPEG as a stream part, preceded by the boundary.
pub fn as_mjpeg_part(jpeg: &[u8], timestamp: SystemTime) -> Bytes {
    let header = format!(
        "\r\n--{PART_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Timestamp: {}\r\n\r\n",
        jpeg.len(),
        format_timestamp(timestamp)
    );

    let mut part = Vec::with_capacity(header.len() + jpeg.len());
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    Bytes::from(part)
}

/// `<seconds>.<microseconds>` since the UNIX epoch. Times before the epoch
/// are written as `0.000000`.
pub fn format_timestamp(timestamp: SystemTime) -> String {
    let since_epoch = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
    format!(
        "{}.{:06}",
        since_epoch.as_secs(),
        since_epoch.subsec_micros()
    )
}

/// Start capturing, annotating and framing images for one client.
///
/// The work runs on a blocking thread and stops once the returned stream is
/// dropped, processing fails, or the camera fails too often in a row.
pub fn spawn_mjpeg_stream(camera: SharedCamera, pipeline: Arc<FramePipeline>) -> PartStream {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::task::spawn_blocking(move || run_stream(camera, pipeline, tx));
    ReceiverStream::new(rx)
}

fn run_stream(
    camera: SharedCamera,
    pipeline: Arc<FramePipeline>,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    let config = pipeline.config().clone();
    let mut timer = FrameTimer::new(config.average_window);
    let mut capture_failures = 0;

    loop {
        let frame = match capture(&camera) {
            Ok(frame) => frame,
            Err(e) => {
                capture_failures += 1;
                log::error!(
                    "Camera capture failed ({}/{}): {:#}",
                    capture_failures,
                    config.max_capture_failures,
                    e
                );
                if capture_failures >= config.max_capture_failures {
                    break;
                }
                thread::sleep(config.capture_retry);
                continue;
            }
        };
        capture_failures = 0;
        METER.tick_captured();

        let processed = match pipeline.process(&frame) {
            Ok(processed) => processed,
            Err(e) => {
                log::error!("Frame processing failed: {e:#}");
                break;
            }
        };

        let part = as_mjpeg_part(&processed.jpeg, frame.timestamp);
        if tx.blocking_send(Ok(part)).is_err() {
            log::info!("Stream closed by client");
            break;
        }
        METER.tick_streamed();

        let stats = timer.tick();
        log::info!(
            "MJPG: {}B {}ms ({:.1}fps), AVG: {}ms ({:.1}fps)",
            processed.jpeg.len(),
            stats.frame_time.as_millis(),
            stats.fps(),
            stats.average_frame_time.as_millis(),
            stats.average_fps()
        );
    }

    log::info!("Stream ended");
}

fn capture(camera: &SharedCamera) -> anyhow::Result<CameraFrame> {
    camera
        .lock()
        .map_err(|_| anyhow!("camera lock poisoned"))?
        .capture()
}

#[cfg(test)]
mod test {
    use std::{
        collections::VecDeque,
        time::{Duration, SystemTime},
    };

    use anyhow::{bail, Result};
    use futures::StreamExt;
    use image::Rgb;

    use super::*;
    use crate::{
        camera::{self, test::solid_jpeg, Camera, SensorInfo},
        config::StreamConfig,
        pipeline::test::{face, FixedDetector},
    };

    /// Hands out scripted frames, then fails.
    struct ScriptedCamera {
        frames: VecDeque<Option<CameraFrame>>,
    }

    impl Camera for ScriptedCamera {
        fn capture(&mut self) -> Result<CameraFrame> {
            match self.frames.pop_front() {
                Some(Some(frame)) => Ok(frame),
                _ => bail!("no frame"),
            }
        }

        fn sensor(&self) -> Option<SensorInfo> {
            None
        }
    }

    fn frame(secs: u64) -> CameraFrame {
        CameraFrame::from_jpeg(
            solid_jpeg(16, 16, Rgb([0, 0, 0])),
            UNIX_EPOCH + Duration::from_secs(secs),
        )
        .expect("test frame")
    }

    fn pipeline(max_capture_failures: u32) -> Arc<FramePipeline> {
        let detector = FixedDetector {
            input: (8, 8),
            boxes: vec![face(1.0, 1.0, 4.0, 4.0)],
        };
        let config = StreamConfig {
            max_capture_failures,
            capture_retry: Duration::from_millis(1),
            ..StreamConfig::default()
        };
        Arc::new(FramePipeline::new(Arc::new(detector), config))
    }

    #[test]
    fn test_part_layout() {
        let part = as_mjpeg_part(b"JPEG", UNIX_EPOCH + Duration::from_micros(12_000_345));
        assert_eq!(
            &part[..],
            &b"\r\n--123456789000000000000987654321\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\nX-Timestamp: 12.000345\r\n\r\nJPEG"[..]
        );
    }

    #[test]
    fn test_content_type_names_boundary() {
        assert_eq!(
            STREAM_CONTENT_TYPE,
            format!("multipart/x-mixed-replace;boundary={PART_BOUNDARY}")
        );
    }

    #[test]
    fn test_timestamp_before_epoch() {
        assert_eq!(
            format_timestamp(UNIX_EPOCH - Duration::from_secs(1)),
            "0.000000"
        );
        assert_eq!(format_timestamp(SystemTime::UNIX_EPOCH), "0.000000");
    }

    #[tokio::test]
    async fn test_stream_survives_single_capture_failures() {
        let camera = camera::shared(ScriptedCamera {
            frames: VecDeque::from(vec![Some(frame(1)), None, Some(frame(2))]),
        });

        let parts: Vec<Bytes> = spawn_mjpeg_stream(camera, pipeline(2))
            .map(|part| part.expect("part"))
            .collect()
            .await;

        // Two frames, then the camera fails twice in a row and the stream ends
        assert_eq!(parts.len(), 2);
        for (part, secs) in parts.iter().zip([1, 2]) {
            let header = String::from_utf8_lossy(&part[..128]);
            assert!(header.starts_with("\r\n--123456789000000000000987654321\r\n"));
            assert!(header.contains(&format!("X-Timestamp: {secs}.000000\r\n")));
        }
    }

    #[tokio::test]
    async fn test_dropped_stream_stops_capturing() {
        let frames = (0..100).map(|secs| Some(frame(secs))).collect();
        let camera = camera::shared(ScriptedCamera { frames });

        let mut stream = spawn_mjpeg_stream(camera.clone(), pipeline(1));
        assert!(stream.next().await.is_some());
        drop(stream);

        // The producer notices the closed channel at its next send
        let mut released = false;
        for _ in 0..200 {
            if Arc::strong_count(&camera) == 1 {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released);
    }
}
