//! The two HTTP servers: the index page on one port and the stream on the next.
//!
use std::{
    net::{IpAddr, SocketAddr, TcpListener},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{routing::get, Extension, Router};

use crate::endpoints::{healthcheck, index, stream, AppState};

/// Bind the index server to `port` and the stream server to `port + 1`.
///
/// Port 0 binds two arbitrary free ports.
pub fn bind_listeners(ip: IpAddr, port: u16) -> Result<(TcpListener, TcpListener)> {
    let stream_port = match port {
        0 => 0,
        port => port.checked_add(1).context("no port left for the stream server")?,
    };

    let index = TcpListener::bind(SocketAddr::new(ip, port))
        .with_context(|| format!("failed to bind index server to {ip}:{port}"))?;
    let stream = TcpListener::bind(SocketAddr::new(ip, stream_port))
        .with_context(|| format!("failed to bind stream server to {ip}:{stream_port}"))?;

    Ok((index, stream))
}

pub fn index_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .layer(Extension(state))
}

pub fn stream_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/stream", get(stream))
        .route("/healthcheck", get(healthcheck))
        .layer(Extension(state))
}

/// Serve both routers until one of the servers fails.
pub async fn serve(index: TcpListener, stream: TcpListener, state: Arc<AppState>) -> Result<()> {
    log::info!("Starting index server on {}", index.local_addr()?);
    log::info!("Starting stream server on {}", stream.local_addr()?);

    let index_server =
        axum::Server::from_tcp(index)?.serve(index_router(state.clone()).into_make_service());
    let stream_server =
        axum::Server::from_tcp(stream)?.serve(stream_router(state).into_make_service());

    tokio::try_join!(index_server, stream_server)?;

    Ok(())
}
