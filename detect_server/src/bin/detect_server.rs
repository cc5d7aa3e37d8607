use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use detect_server::{
    annotate::bundled_font,
    camera::{self, DirCamera, SharedCamera},
    config::{parse_color, StreamConfig},
    data_socket::spawn_socket_camera,
    endpoints::AppState,
    meter::spawn_meter_logger,
    nn::{UltrafaceModel, UltrafaceVariant},
    pipeline::FramePipeline,
    server::{bind_listeners, serve},
};
use env_logger::TimestampPrecision;
use image::Rgb;
use rusttype::Font;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Stream a camera with face detections drawn on every frame")]
struct Args {
    /// Address to bind the HTTP servers to
    #[clap(long, default_value = "0.0.0.0")]
    address: IpAddr,

    /// Port of the index page, the stream is served on the next port
    #[clap(long, default_value_t = 80)]
    port: u16,

    /// Replay the JPEG files of this directory
    #[clap(long)]
    frames_dir: Option<PathBuf>,

    /// Pause between replayed frames
    #[clap(long, default_value_t = 50)]
    frame_interval_ms: u64,

    /// Listen on this address for frames pushed by a cam_sender
    #[clap(long)]
    socket_address: Option<String>,

    /// Channel accepted on the data socket
    #[clap(long, default_value = "cam")]
    channel: String,

    /// Video device to capture from
    #[cfg(feature = "v4l")]
    #[clap(long, default_value = "/dev/video0")]
    device: String,

    /// Capture resolution, like 640x480
    #[cfg(feature = "v4l")]
    #[clap(long, value_parser = detect_server::config::parse_resolution)]
    resolution: Option<(u32, u32)>,

    /// Use this ONNX model instead of downloading it
    #[clap(long)]
    model_path: Option<PathBuf>,

    /// Ultraface input size, 320 or 640
    #[clap(long, default_value = "320")]
    variant: UltrafaceVariant,

    /// Minimum confidence of reported faces
    #[clap(long, default_value_t = 0.5)]
    min_confidence: f32,

    /// Maximum overlap of two reported faces
    #[clap(long, default_value_t = 0.5)]
    max_iou: f32,

    /// Quality of the streamed JPEGs
    #[clap(long, default_value_t = 80, value_parser = clap::value_parser!(u8).range(1..=100))]
    jpeg_quality: u8,

    /// Outline color of bounding boxes, like FF0000
    #[clap(long, default_value = "FF0000", value_parser = parse_color)]
    box_color: Rgb<u8>,

    /// Label bounding boxes with their class and confidence
    #[clap(long)]
    labels: bool,

    /// TrueType font for the labels instead of the bundled one, implies --labels
    #[clap(long)]
    font: Option<PathBuf>,

    /// Log the features handed to the model
    #[clap(long)]
    debug_nn: bool,

    /// Consecutive capture failures after which a stream is closed
    #[clap(long, default_value_t = 10)]
    max_capture_failures: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let (index_listener, stream_listener) = bind_listeners(args.address, args.port)?;
    let stream_port = stream_listener.local_addr()?.port();

    let camera = open_camera(&args).await?;

    let model = UltrafaceModel::new(
        args.variant,
        args.model_path.clone(),
        args.max_iou,
        args.min_confidence,
    )
    .await
    .context("failed to initialize model")?
    .with_debug(args.debug_nn);

    let config = StreamConfig {
        jpeg_quality: args.jpeg_quality,
        box_color: args.box_color,
        max_capture_failures: args.max_capture_failures,
        debug_nn: args.debug_nn,
        ..StreamConfig::default()
    };
    let mut pipeline = FramePipeline::new(Arc::new(model), config);
    if let Some(path) = &args.font {
        pipeline = pipeline.with_font(load_font(path)?);
    } else if args.labels {
        pipeline = pipeline.with_font(bundled_font()?);
    }

    let state = Arc::new(AppState {
        camera,
        pipeline: Arc::new(pipeline),
        stream_port,
    });

    spawn_meter_logger();

    serve(index_listener, stream_listener, state).await
}

async fn open_camera(args: &Args) -> Result<SharedCamera> {
    if let Some(dir) = &args.frames_dir {
        let camera = DirCamera::new(dir, Duration::from_millis(args.frame_interval_ms))?;
        return Ok(camera::shared(camera));
    }

    if let Some(addr) = &args.socket_address {
        let (camera, _addr, _handle) =
            spawn_socket_camera(addr, &args.channel, Duration::from_secs(5)).await?;
        return Ok(camera::shared(camera));
    }

    #[cfg(feature = "v4l")]
    {
        let camera = camera::V4lCamera::new(&args.device, args.resolution, None)?;
        Ok(camera::shared(camera))
    }

    #[cfg(not(feature = "v4l"))]
    bail!("no camera source, pass --frames-dir or --socket-address")
}

fn load_font(path: &Path) -> Result<Font<'static>> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read font {}", path.display()))?;
    match Font::try_from_vec(data) {
        Some(font) => Ok(font),
        None => bail!("invalid font file {}", path.display()),
    }
}
