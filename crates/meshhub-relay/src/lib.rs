//! Relay channels
//!
//! A [`RelayChannel`] wraps one physical duplex tunnel (the upgraded CONNECT
//! an endpoint keeps open to the hub) and multiplexes any number of
//! independent [`RelayStream`]s over it. Each stream has its own
//! credit-based flow control, so a stalled stream never blocks its siblings.
//! When the physical tunnel ends, every open stream fails with
//! [`RelayError::PeerGone`].

pub mod channel;
pub mod http;
pub mod stream;

pub use channel::{ChannelStats, RelayChannel, Role};
pub use stream::RelayStream;

use meshhub_proto::MuxError;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Relay errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("Peer gone: {0}")]
    PeerGone(String),

    #[error("Stream reset by peer")]
    StreamReset,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("HTTP exchange failed: {0}")]
    Http(String),
}

impl From<MuxError> for RelayError {
    fn from(err: MuxError) -> Self {
        RelayError::ProtocolError(err.to_string())
    }
}

impl From<RelayError> for std::io::Error {
    fn from(err: RelayError) -> Self {
        let kind = match &err {
            RelayError::PeerGone(_) => std::io::ErrorKind::ConnectionAborted,
            RelayError::StreamReset => std::io::ErrorKind::ConnectionReset,
            RelayError::ProtocolError(_) => std::io::ErrorKind::InvalidData,
            RelayError::Http(_) => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// Relay channel configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Receive window granted to the peer for each new stream
    pub initial_window: u32,
    /// Maximum payload of a single data frame
    pub max_data_frame: usize,
    /// Concurrent streams allowed per channel (both directions)
    pub max_streams: usize,
    /// Incoming streams queued before `accept_stream` picks them up
    pub accept_backlog: usize,
    /// How often a ping is sent on the control stream
    pub keepalive_interval: Duration,
    /// Channel is considered dead when nothing was received for this long
    pub keepalive_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            initial_window: 256 * 1024,
            max_data_frame: 16 * 1024,
            max_streams: 4096,
            accept_backlog: 256,
            keepalive_interval: Duration::from_secs(15),
            keepalive_timeout: Duration::from_secs(45),
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
