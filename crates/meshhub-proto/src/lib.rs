//! Mesh Hub Protocol Definitions
//!
//! This crate defines the relay framing used inside endpoint tunnels, the
//! control messages exchanged on the control stream, and the JSON models of
//! the hub's HTTP surface.

pub mod codec;
pub mod messages;
pub mod models;
pub mod mux;

pub use codec::FrameCodec;
pub use messages::ControlMessage;
pub use models::*;
pub use mux::{Frame, FrameFlags, FrameType, MuxError, StreamId};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame payload size (1MB)
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Reserved stream ID for control messages
pub const CONTROL_STREAM_ID: u32 = 0;
