//! Endpoints of HTTP server.
//!
use std::sync::Arc;

use axum::{
    body::StreamBody,
    http::{header, HeaderName, StatusCode},
    response::{Html, IntoResponse, Response},
    Extension,
};

use crate::{
    camera::SharedCamera,
    mjpeg::{spawn_mjpeg_stream, STREAM_CONTENT_TYPE},
    pipeline::FramePipeline,
};

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width,initial-scale=1">
    <title>detectcam</title>
    <style>
        body { background: #181818; color: #efefef; font-family: sans-serif; margin: 0; }
        main { display: flex; flex-direction: column; align-items: center; padding: 1em; }
        img { max-width: 100%; border: 1px solid #444; }
    </style>
</head>
<body>
<main>
    <h3>Live Detections</h3>
    <img id="stream" alt="stream">
</main>
<script>
    document.getElementById("stream").src =
        `${location.protocol}//${location.hostname}:{{STREAM_PORT}}/stream`;
</script>
</body>
</html>
"#;

/// State shared by all handlers.
pub struct AppState {
    pub camera: SharedCamera,
    pub pipeline: Arc<FramePipeline>,
    /// Port of the server hosting `/stream`.
    pub stream_port: u16,
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

/// Page showing the stream.
pub async fn index(Extension(state): Extension<Arc<AppState>>) -> Response {
    let camera = state.camera.clone();
    // Capturing holds the camera lock, wait for it off the async workers
    let sensor = tokio::task::spawn_blocking(move || camera.lock().ok().and_then(|c| c.sensor()))
        .await
        .ok()
        .flatten();

    match sensor {
        Some(sensor) => {
            log::debug!("Serving index for sensor {}", sensor.model);
            Html(INDEX_HTML.replace("{{STREAM_PORT}}", &state.stream_port.to_string()))
                .into_response()
        }
        None => {
            log::error!("Camera sensor not found");
            (StatusCode::INTERNAL_SERVER_ERROR, "Camera sensor not found").into_response()
        }
    }
}

/// Endpoint of the annotated MJPEG stream.
pub async fn stream(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    log::info!("Stream requested");

    let parts = spawn_mjpeg_stream(state.camera.clone(), state.pipeline.clone());

    // Set body and headers for multipart streaming
    let body = StreamBody::new(parts);
    let headers = [
        (header::CONTENT_TYPE, STREAM_CONTENT_TYPE.to_owned()),
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*".to_owned()),
        (
            HeaderName::from_static("x-framerate"),
            state.pipeline.config().frame_rate_hint.to_string(),
        ),
    ];

    (headers, body)
}
