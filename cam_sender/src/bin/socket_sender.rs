use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use cam_sender::sender::send_frames;
use clap::Parser;
use detect_server::camera::{Camera, DirCamera};
use env_logger::TimestampPrecision;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address of the detect server data socket to connect to
    #[clap(long, default_value = "127.0.0.1:3001")]
    address: String,

    /// Channel name that this sender publishes to
    #[clap(long, default_value = "cam")]
    channel: String,

    /// Send the JPEG files of this directory instead of a video device
    #[clap(long)]
    frames_dir: Option<PathBuf>,

    /// Pause between frames sent from a directory
    #[clap(long, default_value_t = 50)]
    frame_interval_ms: u64,

    /// Video device to capture from
    #[cfg(feature = "v4l")]
    #[clap(long, default_value = "/dev/video0")]
    device: String,

    /// Stop after this many frames
    #[clap(long)]
    limit: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    log::info!("Launching socket sender for channel {}", &args.channel);

    let camera = open_camera(&args)?;

    let stream = TcpStream::connect(&args.address)
        .await
        .with_context(|| format!("failed to connect to {}", &args.address))?;
    log::info!("Connected to {}", &args.address);

    // Wrap stream in transport handler with length-delimited codec
    let mut transport = Framed::new(stream, LengthDelimitedCodec::new());
    let sent = send_frames(&mut transport, camera, &args.channel, args.limit).await?;
    log::info!("Sent {} frames, exiting", sent);

    Ok(())
}

fn open_camera(args: &Args) -> Result<Box<dyn Camera>> {
    if let Some(dir) = &args.frames_dir {
        let camera = DirCamera::new(dir, Duration::from_millis(args.frame_interval_ms))?;
        return Ok(Box::new(camera));
    }

    #[cfg(feature = "v4l")]
    {
        let camera = detect_server::camera::V4lCamera::new(&args.device, None, None)?;
        Ok(Box::new(camera))
    }

    #[cfg(not(feature = "v4l"))]
    anyhow::bail!("no camera source, pass --frames-dir or build with the v4l feature")
}
