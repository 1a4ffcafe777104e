//! Control stream messages

use crate::mux::{Frame, FrameType, MuxError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Messages exchanged on the control stream of a relay channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Liveness check
    Ping { nonce: u64 },
    /// Reply to a ping carrying the same nonce
    Pong { nonce: u64 },
    /// The sender is closing the channel
    GoAway { reason: String },
}

impl ControlMessage {
    pub fn to_frame(&self) -> Result<Frame, MuxError> {
        let payload = bincode::serialize(self)?;
        Ok(Frame::control(Bytes::from(payload)))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, MuxError> {
        if frame.frame_type != FrameType::Control {
            return Err(MuxError::InvalidFrame(format!(
                "expected control frame, got {:?}",
                frame.frame_type
            )));
        }
        Ok(bincode::deserialize(&frame.payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_frame_on_stream_zero() {
        let msg = ControlMessage::GoAway {
            reason: "shutting down".to_string(),
        };
        let frame = msg.to_frame().unwrap();
        assert_eq!(frame.stream_id, crate::CONTROL_STREAM_ID);
        assert_eq!(ControlMessage::from_frame(&frame).unwrap(), msg);
    }

    #[test]
    fn test_data_frame_is_not_control() {
        let frame = Frame::data(3, Bytes::from_static(b"x"));
        assert!(ControlMessage::from_frame(&frame).is_err());
    }
}
