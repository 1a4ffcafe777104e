//! Codec for framing relay traffic on a byte stream

use crate::mux::{Frame, FrameFlags, FrameType, MuxError};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame codec
///
/// Format: `[stream_id: u32][type: u8][flags: u8][length: u32][payload]`, big-endian.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: crate::MAX_FRAME_SIZE as usize,
        }
    }

    /// Codec that rejects frames larger than `max_frame_size`
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(crate::MAX_FRAME_SIZE as usize),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, MuxError> {
        if src.len() < Frame::HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[6..10]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_frame_size {
            return Err(MuxError::FrameTooLarge(length));
        }

        if src.len() < Frame::HEADER_SIZE + length {
            src.reserve(Frame::HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        let stream_id = src.get_u32();
        let frame_type = FrameType::try_from(src.get_u8())?;
        let flags = FrameFlags::from_u8(src.get_u8());
        src.advance(4);
        let payload = src.split_to(length).freeze();

        Ok(Some(Frame {
            stream_id,
            frame_type,
            flags,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), MuxError> {
        if frame.payload.len() > self.max_frame_size {
            return Err(MuxError::FrameTooLarge(frame.payload.len()));
        }
        frame.encode_into(dst)
    }
}
