//! Stream a camera to the browser with object detections drawn on every frame.
//!
//! Frames are captured from a [`camera::Camera`], run through a
//! [`nn::Detector`], annotated with their bounding boxes and served as an
//! MJPEG stream over HTTP.
pub mod annotate;
pub mod camera;
pub mod codec;
pub mod config;
pub mod data_socket;
pub mod endpoints;
pub mod meter;
pub mod mjpeg;
pub mod nn;
pub mod pipeline;
pub mod server;
pub mod signal;
pub mod utils;
