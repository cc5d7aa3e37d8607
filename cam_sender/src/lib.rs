//! Push camera frames to a detect_server data socket.
pub mod sender;
