//! Sender side of the data socket protocol.
//!
use anyhow::Result;
use bytes::Bytes;
use common::protocol::{FrameMsg, ProtoMsg};
use detect_server::{
    camera::{Camera, PixelFormat},
    codec::{decode_rgb888, encode_jpeg},
    config::StreamConfig,
    data_socket::timestamp_us,
};
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Announce `channel`, then send frames captured from `camera`.
///
/// Captures run on a blocking thread. A failed capture is retried after
/// [`StreamConfig::capture_retry`]. Stops after `limit` frames if given.
/// Returns the number of frames sent.
pub async fn send_frames<T>(
    transport: &mut Framed<T, LengthDelimitedCodec>,
    mut camera: Box<dyn Camera>,
    channel: &str,
    limit: Option<usize>,
) -> Result<usize>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let connect_req = ProtoMsg::ConnectReq(channel.to_owned()).serialize()?;
    transport.send(Bytes::from(connect_req)).await?;

    let config = StreamConfig::default();
    let mut sent = 0;

    while limit.map_or(true, |limit| sent < limit) {
        let (returned, captured) = tokio::task::spawn_blocking(move || {
            let captured = camera.capture();
            (camera, captured)
        })
        .await?;
        camera = returned;

        let frame = match captured {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Unable to capture frame, trying again: {e:#}");
                tokio::time::sleep(config.capture_retry).await;
                continue;
            }
        };

        let timestamp_us = timestamp_us(frame.timestamp);
        let data = match frame.format {
            PixelFormat::Jpeg => frame.data,
            PixelFormat::Rgb888 => encode_jpeg(&decode_rgb888(&frame)?, config.jpeg_quality)?,
        };

        let msg = ProtoMsg::FrameMsg(FrameMsg::new(channel.to_owned(), timestamp_us, data));
        transport.send(Bytes::from(msg.serialize()?)).await?;

        sent += 1;
        if sent % 100 == 0 {
            log::info!("Sent {} frames", sent);
        }
    }

    Ok(sent)
}

#[cfg(test)]
mod test {
    use std::{
        fs,
        path::PathBuf,
        time::{Duration, SystemTime, UNIX_EPOCH},
    };

    use detect_server::camera::{CameraFrame, DirCamera, SensorInfo};
    use futures::StreamExt;
    use image::{Rgb, RgbImage};

    use super::*;

    fn frames_dir(name: &str, count: u32) -> Result<PathBuf> {
        let dir = std::env::temp_dir().join(format!("cam_sender-{}-{name}", std::process::id()));
        fs::create_dir_all(&dir)?;
        for i in 0..count {
            RgbImage::from_pixel(16, 8, Rgb([40, 80, 120])).save(dir.join(format!("{i}.jpg")))?;
        }
        Ok(dir)
    }

    async fn receive(
        transport: &mut Framed<tokio::io::DuplexStream, LengthDelimitedCodec>,
    ) -> Result<ProtoMsg> {
        let data = transport.next().await.expect("message")?;
        Ok(ProtoMsg::deserialize(&data)?)
    }

    struct RawCamera;

    impl Camera for RawCamera {
        fn capture(&mut self) -> Result<CameraFrame> {
            let image = RgbImage::from_pixel(4, 4, Rgb([200, 10, 10]));
            CameraFrame::from_rgb888(
                image.into_raw(),
                4,
                4,
                UNIX_EPOCH + Duration::from_micros(77),
            )
        }

        fn sensor(&self) -> Option<SensorInfo> {
            None
        }
    }

    /// Fails a number of times before handing out raw frames.
    struct FlakyCamera {
        failures: usize,
    }

    impl Camera for FlakyCamera {
        fn capture(&mut self) -> Result<CameraFrame> {
            if self.failures > 0 {
                self.failures -= 1;
                anyhow::bail!("sensor not ready");
            }
            RawCamera.capture()
        }

        fn sensor(&self) -> Option<SensorInfo> {
            None
        }
    }

    #[tokio::test]
    async fn test_send_dir_frames() -> Result<()> {
        let dir = frames_dir("dir", 2)?;
        let camera = DirCamera::new(&dir, Duration::ZERO)?;

        let (client, server) = tokio::io::duplex(1 << 20);
        let mut client = Framed::new(client, LengthDelimitedCodec::new());
        let mut server = Framed::new(server, LengthDelimitedCodec::new());

        let before = timestamp_us(SystemTime::now());
        let sent = send_frames(&mut client, Box::new(camera), "porch", Some(3)).await?;
        assert_eq!(sent, 3);

        assert_eq!(
            receive(&mut server).await?,
            ProtoMsg::ConnectReq("porch".into())
        );
        for _ in 0..3 {
            match receive(&mut server).await? {
                ProtoMsg::FrameMsg(msg) => {
                    assert_eq!(msg.channel, "porch");
                    assert!(msg.timestamp_us >= before);
                    assert_eq!(&msg.data[..2], &[0xFF, 0xD8]);
                }
                other => panic!("unexpected message {other:?}"),
            }
        }

        fs::remove_dir_all(dir)?;
        Ok(())
    }

    #[tokio::test]
    async fn test_raw_frames_are_compressed() -> Result<()> {
        let (client, server) = tokio::io::duplex(1 << 20);
        let mut client = Framed::new(client, LengthDelimitedCodec::new());
        let mut server = Framed::new(server, LengthDelimitedCodec::new());

        send_frames(&mut client, Box::new(RawCamera), "raw", Some(1)).await?;

        receive(&mut server).await?;
        match receive(&mut server).await? {
            ProtoMsg::FrameMsg(msg) => {
                assert_eq!(msg.timestamp_us, 77);
                let frame = CameraFrame::from_jpeg(msg.data, SystemTime::now())?;
                assert_eq!((frame.width, frame.height), (4, 4));
            }
            other => panic!("unexpected message {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_capture_failures_are_retried_after_a_pause() -> Result<()> {
        let (client, server) = tokio::io::duplex(1 << 20);
        let mut client = Framed::new(client, LengthDelimitedCodec::new());
        let mut server = Framed::new(server, LengthDelimitedCodec::new());

        let start = std::time::Instant::now();
        let camera = Box::new(FlakyCamera { failures: 2 });
        let sent = send_frames(&mut client, camera, "flaky", Some(1)).await?;

        assert_eq!(sent, 1);
        assert!(start.elapsed() >= StreamConfig::default().capture_retry * 2);
        receive(&mut server).await?;
        assert!(matches!(receive(&mut server).await?, ProtoMsg::FrameMsg(_)));
        Ok(())
    }
}
