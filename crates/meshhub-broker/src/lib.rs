//! Zero-trust mesh hub
//!
//! Endpoints dial the hub and keep one registration tunnel open
//! (`CONNECT /api/endpoints/{id}`), which becomes a multiplexed relay
//! channel. Heartbeats and service publications travel over that channel;
//! other parties discover endpoints and services over plain HTTP and reach
//! them either through one-shot forwards or spliced service tunnels.

pub mod body;
pub mod broker;
pub mod config;
pub mod context;
pub mod error;
mod forward;
mod handlers;
mod maintenance;
pub mod routes;
pub mod server;

pub use body::HubBody;
pub use broker::TunnelBroker;
pub use config::{HubConfig, TlsConfig};
pub use context::{BoundEndpoint, CallerSocket, ConnectionContext};
pub use error::HubError;
pub use handlers::DEFAULT_LIST_LIMIT;
pub use routes::HubRoute;
pub use server::HubServer;
