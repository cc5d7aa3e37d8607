//! Camera sources.
//!
//! A camera is a black box which hands out one frame per [`Camera::capture`]
//! call. A frame is released by dropping it.
use std::{
    fs,
    io::Cursor,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant, SystemTime},
};

use anyhow::{bail, Context, Result};
use image::{io::Reader as ImageReader, ImageFormat};

/// Pixel layout of a captured frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PixelFormat {
    Jpeg,
    /// Packed 8-bit RGB, row-major without padding.
    Rgb888,
}

/// Description of the sensor behind a camera.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SensorInfo {
    pub model: String,
}

/// A captured frame.
#[derive(Clone, Debug)]
pub struct CameraFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub timestamp: SystemTime,
}

impl CameraFrame {
    /// Wrap a JPEG image, reading its dimensions from the header.
    pub fn from_jpeg(data: Vec<u8>, timestamp: SystemTime) -> Result<Self> {
        let (width, height) = ImageReader::with_format(Cursor::new(&data[..]), ImageFormat::Jpeg)
            .into_dimensions()
            .context("frame is not a JPEG image")?;
        if width == 0 || height == 0 {
            bail!("JPEG frame of {width}x{height} is empty");
        }

        Ok(Self {
            data,
            width,
            height,
            format: PixelFormat::Jpeg,
            timestamp,
        })
    }

    /// Wrap a packed RGB888 buffer.
    pub fn from_rgb888(
        data: Vec<u8>,
        width: u32,
        height: u32,
        timestamp: SystemTime,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("RGB888 frame of {width}x{height} is empty");
        }
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            bail!(
                "RGB888 frame of {width}x{height} needs {expected} bytes, got {}",
                data.len()
            );
        }

        Ok(Self {
            data,
            width,
            height,
            format: PixelFormat::Rgb888,
            timestamp,
        })
    }
}

/// Frame source.
pub trait Camera: Send {
    /// Block until the next frame is available.
    fn capture(&mut self) -> Result<CameraFrame>;

    /// Sensor attached to this camera, `None` if there is none.
    fn sensor(&self) -> Option<SensorInfo>;
}

/// Camera shared between stream handlers. Lock it for a single capture only.
pub type SharedCamera = Arc<Mutex<Box<dyn Camera>>>;

/// Wrap a camera for use by several streams.
pub fn shared(camera: impl Camera + 'static) -> SharedCamera {
    Arc::new(Mutex::new(Box::new(camera)))
}

/// Replays the JPEG files of a directory in a loop.
pub struct DirCamera {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
    interval: Duration,
    last_capture: Option<Instant>,
}

impl DirCamera {
    /// Collect all `*.jpg` and `*.jpeg` files in `dir`, sorted by name.
    pub fn new(dir: impl AsRef<Path>, interval: Duration) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("failed to read {dir:?}"))? {
            let path = entry?.path();
            let is_jpeg = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
                .unwrap_or(false);
            if is_jpeg && path.is_file() {
                files.push(path);
            }
        }

        if files.is_empty() {
            bail!("no JPEG files found in {dir:?}");
        }
        files.sort();
        log::info!("Replaying {} frames from {:?}", files.len(), &dir);

        Ok(Self {
            dir,
            files,
            next: 0,
            interval,
            last_capture: None,
        })
    }

    /// Number of frames in one replay cycle.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Camera for DirCamera {
    fn capture(&mut self) -> Result<CameraFrame> {
        if let Some(last_capture) = self.last_capture {
            let elapsed = last_capture.elapsed();
            if elapsed < self.interval {
                thread::sleep(self.interval - elapsed);
            }
        }
        self.last_capture = Some(Instant::now());

        let path = &self.files[self.next];
        self.next = (self.next + 1) % self.files.len();

        let data = fs::read(path).with_context(|| format!("failed to read frame {path:?}"))?;
        CameraFrame::from_jpeg(data, SystemTime::now())
    }

    fn sensor(&self) -> Option<SensorInfo> {
        Some(SensorInfo {
            model: format!("jpeg-replay:{}", self.dir.display()),
        })
    }
}

#[cfg(feature = "v4l")]
pub use v4l::V4lCamera;

#[cfg(feature = "v4l")]
mod v4l {
    use std::time::SystemTime;

    use anyhow::Result;
    use rscam::{Camera as RsCamera, Config};
    use simple_error::simple_error;

    use super::{Camera, CameraFrame, SensorInfo};

    /// MJPG capture from a Linux video device.
    pub struct V4lCamera {
        device: String,
        cam: RsCamera,
    }

    impl V4lCamera {
        /// Open `device` and start capturing. Unset resolution and frame
        /// rate default to the highest the device supports.
        pub fn new(
            device: &str,
            resolution: Option<(u32, u32)>,
            frame_rate: Option<(u32, u32)>,
        ) -> Result<Self> {
            let mut cam = RsCamera::new(device)?;
            let format = b"MJPG";
            log_supported_formats(&cam);

            let resolution = match resolution {
                Some(resolution) => resolution,
                None => get_max_resolution(&cam, format)?,
            };
            let frame_rate = match frame_rate {
                Some(frame_rate) => frame_rate,
                None => get_max_frame_rate(&cam, format, resolution)?,
            };

            log::info!(
                "Using camera {} at {}x{}, interval {}/{}s",
                device,
                resolution.0,
                resolution.1,
                frame_rate.0,
                frame_rate.1
            );

            cam.start(&Config {
                interval: frame_rate,
                resolution,
                format,
                ..Default::default()
            })?;

            Ok(Self {
                device: device.to_owned(),
                cam,
            })
        }
    }

    impl Camera for V4lCamera {
        fn capture(&mut self) -> Result<CameraFrame> {
            let frame = self.cam.capture()?;
            let (width, height) = frame.resolution;
            Ok(CameraFrame {
                data: frame[..].to_vec(),
                width,
                height,
                format: super::PixelFormat::Jpeg,
                timestamp: SystemTime::now(),
            })
        }

        fn sensor(&self) -> Option<SensorInfo> {
            Some(SensorInfo {
                model: format!("v4l:{}", self.device),
            })
        }
    }

    /// Get the maximum supported resolution for the given format.
    fn get_max_resolution(cam: &RsCamera, format: &[u8]) -> Result<(u32, u32)> {
        let resolution_info = cam.resolutions(format)?;
        log::debug!("Found resolutions: {:?}", &resolution_info);
        match resolution_info {
            rscam::ResolutionInfo::Discretes(resolutions) => resolutions
                .iter()
                .max_by_key(|res| res.0 * res.1)
                .copied(),
            rscam::ResolutionInfo::Stepwise { max, .. } => Some(max),
        }
        .ok_or_else(|| simple_error!("No resolution found").into())
    }

    /// Get the maximum supported frame rate for the given format and resolution.
    fn get_max_frame_rate(
        cam: &RsCamera,
        format: &[u8],
        resolution: (u32, u32),
    ) -> Result<(u32, u32)> {
        let interval_info = cam.intervals(format, resolution)?;
        log::debug!("Found frame intervals: {:?}", &interval_info);
        match interval_info {
            // Intervals are (numerator, denominator) in seconds, the shortest one wins
            rscam::IntervalInfo::Discretes(intervals) => intervals
                .iter()
                .min_by(|a, b| {
                    let a = a.0 as f64 / a.1 as f64;
                    let b = b.0 as f64 / b.1 as f64;
                    a.total_cmp(&b)
                })
                .copied(),
            rscam::IntervalInfo::Stepwise { min, .. } => Some(min),
        }
        .ok_or_else(|| simple_error!("No frame rate found").into())
    }

    fn log_supported_formats(cam: &RsCamera) {
        let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
        log::debug!("Supported formats: {:?}", formats);
    }
}
