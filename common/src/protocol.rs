//! Protocol spoken on the camera data socket.
//!
//! Every message is bincode-encoded and travels inside a length-delimited
//! frame. A sender opens with [`ProtoMsg::ConnectReq`] naming the channel it
//! publishes to and then sends one [`ProtoMsg::FrameMsg`] per captured image.
use serde::{Deserialize, Serialize};

/// Definition of protocol messages.
#[derive(Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ProtoMsg {
    ConnectReq(String),
    FrameMsg(FrameMsg),
}

/// A single JPEG-compressed camera frame.
#[derive(Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FrameMsg {
    pub channel: String,
    /// Capture time in microseconds since the UNIX epoch.
    pub timestamp_us: u64,
    pub data: Vec<u8>,
}

impl FrameMsg {
    pub fn new(channel: String, timestamp_us: u64, data: Vec<u8>) -> Self {
        Self {
            channel,
            timestamp_us,
            data,
        }
    }
}

impl ProtoMsg {
    pub fn serialize(&self) -> Result<Vec<u8>, Box<bincode::ErrorKind>> {
        bincode::serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, Box<bincode::ErrorKind>> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod test {

    use super::*;
    use crate::Error;

    #[test]
    fn test_frame_msg_survives_bincode() -> Result<(), Error> {
        let msg = ProtoMsg::FrameMsg(FrameMsg::new(
            "garden".into(),
            1_700_000_000_123_456,
            vec![0xFF, 0xD8, 0xFF],
        ));

        let serialized = msg.serialize()?;
        let deserialized = ProtoMsg::deserialize(&serialized)?;

        assert_eq!(msg, deserialized);

        Ok(())
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(ProtoMsg::deserialize(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]).is_err());
    }
}
