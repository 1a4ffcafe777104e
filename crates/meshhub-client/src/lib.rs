//! Endpoint-side session with a mesh hub
//!
//! An endpoint dials the hub, registers over `CONNECT /api/endpoints/{id}`
//! and keeps that connection as its relay channel. Heartbeats and service
//! publications are sent as requests on fresh logical streams; requests
//! the hub relays to the endpoint arrive as streams accepted by
//! [`EndpointSession::serve`].

pub mod session;

pub use session::{ClientError, EndpointSession, PING_PATH};

pub use meshhub_proto::{ServiceSpec, StatusReport};
pub use meshhub_relay::{RelayChannel, RelayConfig};
