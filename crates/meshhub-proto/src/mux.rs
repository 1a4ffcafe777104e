//! Multiplexing primitives for relay channels

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stream identifier
pub type StreamId = u32;

/// Frame types for multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    Control = 0,
    Data = 1,
    Close = 2,
    WindowUpdate = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Control),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            3 => Ok(FrameType::WindowUpdate),
            _ => Err(MuxError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const FIN: u8 = 0b0000_0001;
    pub const ACK: u8 = 0b0000_0010;
    pub const RST: u8 = 0b0000_0100;
    pub const SYN: u8 = 0b0000_1000;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.0 |= Self::ACK;
        self
    }

    pub fn with_rst(mut self) -> Self {
        self.0 |= Self::RST;
        self
    }

    pub fn with_syn(mut self) -> Self {
        self.0 |= Self::SYN;
        self
    }

    pub fn has_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn has_ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn has_rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn has_syn(&self) -> bool {
        self.0 & Self::SYN != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

impl Default for FrameFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: stream_id (4) + frame_type (1) + flags (1) + length (4) = 10 bytes
    pub const HEADER_SIZE: usize = 10;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn control(payload: Bytes) -> Self {
        Self::new(crate::CONTROL_STREAM_ID, FrameType::Control, payload)
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    /// Empty data frame that opens a new stream
    pub fn open(stream_id: StreamId) -> Self {
        Self::data(stream_id, Bytes::new()).with_flags(FrameFlags::new().with_syn())
    }

    /// Empty data frame that half-closes the sender's direction
    pub fn fin(stream_id: StreamId) -> Self {
        Self::data(stream_id, Bytes::new()).with_flags(FrameFlags::new().with_fin())
    }

    /// Abortive close of both directions
    pub fn reset(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
            .with_flags(FrameFlags::new().with_rst())
    }

    pub fn window_update(stream_id: StreamId, credit: u32) -> Self {
        Self::new(
            stream_id,
            FrameType::WindowUpdate,
            Bytes::copy_from_slice(&credit.to_be_bytes()),
        )
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Credit carried by a WindowUpdate frame
    pub fn window_credit(&self) -> Result<u32, MuxError> {
        if self.frame_type != FrameType::WindowUpdate || self.payload.len() != 4 {
            return Err(MuxError::InvalidFrame(format!(
                "{:?} frame on stream {} carries no window credit",
                self.frame_type, self.stream_id
            )));
        }
        let mut payload = self.payload.clone();
        Ok(payload.get_u32())
    }

    /// Encode frame into the destination buffer
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), MuxError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(MuxError::FrameTooLarge(payload_len));
        }

        dst.reserve(Self::HEADER_SIZE + payload_len);
        dst.put_u32(self.stream_id);
        dst.put_u8(self.frame_type as u8);
        dst.put_u8(self.flags.as_u8());
        dst.put_u32(payload_len as u32);
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, MuxError> {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one complete frame from bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, MuxError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(MuxError::IncompleteFrame);
        }

        let stream_id = buf.get_u32();
        let frame_type = FrameType::try_from(buf.get_u8())?;
        let flags = FrameFlags::from_u8(buf.get_u8());
        let length = buf.get_u32() as usize;

        if length > crate::MAX_FRAME_SIZE as usize {
            return Err(MuxError::FrameTooLarge(length));
        }
        if buf.len() < length {
            return Err(MuxError::IncompleteFrame);
        }

        Ok(Self {
            stream_id,
            frame_type,
            flags,
            payload: buf.split_to(length),
        })
    }
}

/// Multiplexing errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Incomplete frame")]
    IncompleteFrame,

    #[error("Control message error: {0}")]
    ControlMessage(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
