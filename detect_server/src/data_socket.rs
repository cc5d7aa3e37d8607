//! Data socket module to receive camera frames via network.
//!
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context, Result};
use common::protocol::ProtoMsg;
use futures::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::Handle,
    sync::watch,
    task::JoinHandle,
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::camera::{Camera, CameraFrame, SensorInfo};

/// Addresses of the senders currently publishing to the channel.
type Senders = Arc<Mutex<Vec<SocketAddr>>>;

/// Camera fed by remote senders over TCP.
///
/// Only the most recent frame is kept. A capture waits for a frame newer than
/// the previously captured one.
pub struct SocketCamera {
    frames_rx: watch::Receiver<Option<CameraFrame>>,
    runtime: Handle,
    channel: String,
    senders: Senders,
    timeout: Duration,
}

impl SocketCamera {
    /// Number of connected senders.
    pub fn senders(&self) -> usize {
        self.senders.lock().map(|senders| senders.len()).unwrap_or(0)
    }
}

impl Camera for SocketCamera {
    fn capture(&mut self) -> Result<CameraFrame> {
        let timeout = self.timeout;
        let frames_rx = &mut self.frames_rx;
        self.runtime.block_on(async {
            match tokio::time::timeout(timeout, frames_rx.changed()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => bail!("data socket closed"),
                Err(_) => bail!("no frame received within {:?}", timeout),
            }
        })?;

        self.frames_rx
            .borrow_and_update()
            .clone()
            .context("no frame received yet")
    }

    fn sensor(&self) -> Option<SensorInfo> {
        let senders = self.senders.lock().ok()?;
        senders.last().map(|addr| SensorInfo {
            model: format!("socket:{}@{}", self.channel, addr),
        })
    }
}

/// Listen on `addr` for senders publishing to `channel`.
///
/// Must be called from within a tokio runtime. The returned camera blocks in
/// [`Camera::capture`], so capture from a blocking thread.
///
/// Returns the camera, the bound address and the handle of the accept loop.
pub async fn spawn_socket_camera(
    addr: &str,
    channel: &str,
    timeout: Duration,
) -> Result<(SocketCamera, SocketAddr, JoinHandle<Result<()>>)> {
    let socket: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(socket).await?;
    let local_addr = listener.local_addr()?;
    log::info!("Waiting for frames of channel {} on {}", channel, local_addr);

    let (frames_tx, frames_rx) = watch::channel(None);
    let frames_tx = Arc::new(frames_tx);
    let senders: Senders = Arc::new(Mutex::new(Vec::new()));

    let handle: JoinHandle<Result<()>> = {
        let channel = channel.to_owned();
        let senders = senders.clone();
        tokio::spawn(async move {
            loop {
                let (socket, _peer_addr) = listener.accept().await?;
                let frames_tx = frames_tx.clone();
                let channel = channel.clone();
                let senders = senders.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_incoming(socket, &channel, &frames_tx, &senders).await
                    {
                        log::warn!("Data socket connection failed: {e:#}");
                    }
                });
            }
        })
    };

    Ok((
        SocketCamera {
            frames_rx,
            runtime: Handle::current(),
            channel: channel.to_owned(),
            senders,
            timeout,
        },
        local_addr,
        handle,
    ))
}

async fn handle_incoming(
    stream: TcpStream,
    channel: &str,
    frames_tx: &watch::Sender<Option<CameraFrame>>,
    senders: &Senders,
) -> Result<()> {
    let addr = stream.peer_addr()?;
    log::info!("{}: New TCP connection", &addr);

    let mut transport = Framed::new(stream, LengthDelimitedCodec::new());

    match transport.next().await {
        Some(Ok(data)) => match ProtoMsg::deserialize(&data) {
            Ok(ProtoMsg::ConnectReq(requested)) if requested == channel => (),
            Ok(ProtoMsg::ConnectReq(requested)) => {
                bail!("{addr}: sender publishes to {requested:?}, expected {channel:?}")
            }
            _ => bail!("{addr}: expected a connect request"),
        },
        _ => bail!("{addr}: connection closed before connect request"),
    }

    if let Ok(mut senders) = senders.lock() {
        senders.push(addr);
    }

    let result = forward_frames(&mut transport, frames_tx).await;
    log::info!("{}: Sender disconnected", &addr);

    if let Ok(mut senders) = senders.lock() {
        senders.retain(|sender| *sender != addr);
    }

    result
}

async fn forward_frames(
    transport: &mut Framed<TcpStream, LengthDelimitedCodec>,
    frames_tx: &watch::Sender<Option<CameraFrame>>,
) -> Result<()> {
    while let Some(data) = transport.next().await {
        let msg = match ProtoMsg::deserialize(&data?) {
            Ok(ProtoMsg::FrameMsg(msg)) => msg,
            Ok(ProtoMsg::ConnectReq(_)) => {
                log::warn!("Ignoring repeated connect request");
                continue;
            }
            Err(e) => {
                log::warn!("Dropping undecodable message: {e}");
                continue;
            }
        };

        let timestamp = UNIX_EPOCH + Duration::from_micros(msg.timestamp_us);
        let frame = match CameraFrame::from_jpeg(msg.data, timestamp) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping frame of channel {}: {e:#}", &msg.channel);
                continue;
            }
        };

        if frames_tx.is_closed() {
            bail!("camera dropped");
        }
        // Replaces a frame nobody captured yet
        frames_tx.send_replace(Some(frame));
    }

    Ok(())
}

/// Microseconds since the UNIX epoch.
pub fn timestamp_us(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(UNIX_EPOCH)
        .map(|since_epoch| since_epoch.as_micros() as u64)
        .unwrap_or(0)
}
