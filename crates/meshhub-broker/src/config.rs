//! Hub configuration

use crate::error::HubError;
use meshhub_relay::RelayConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// PEM files for terminating TLS on the hub listener
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// CA bundle for verifying client certificates. Clients without a
    /// certificate are still accepted; a verified one is recorded on the
    /// endpoint it registers.
    pub client_ca_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Identifier reported in status and ping results
    pub hub_id: String,
    pub listen: SocketAddr,
    /// Externally reachable names of this hub (`host:port`)
    pub names: Vec<String>,
    /// Registered endpoints allowed at once
    pub max_endpoints: usize,
    /// Concurrent service tunnels allowed at once
    pub max_sessions: usize,
    pub tls: Option<TlsConfig>,
    pub relay: RelayConfig,
    /// Period of the hub-initiated ping through every tunnel
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    /// How long an endpoint may take to accept a service tunnel
    pub connect_timeout: Duration,
    /// An endpoint is online while its last heartbeat is this recent
    pub online_window: Duration,
    /// Disconnected endpoints silent for this long are evicted
    pub stale_after: Duration,
    pub eviction_interval: Duration,
    /// Entries kept for `GET /api/log`
    pub log_capacity: usize,
    /// Largest request body read by the hub itself
    pub max_body_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            hub_id: format!("hub-{}", uuid::Uuid::new_v4()),
            listen: SocketAddr::from(([0, 0, 0, 0], 8888)),
            names: Vec::new(),
            max_endpoints: 1000,
            max_sessions: 10000,
            tls: None,
            relay: RelayConfig::default(),
            ping_interval: Duration::from_secs(15),
            ping_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            online_window: Duration::from_secs(30),
            stale_after: Duration::from_secs(120),
            eviction_interval: Duration::from_secs(60),
            log_capacity: 1000,
            max_body_size: 1024 * 1024,
        }
    }
}

impl HubConfig {
    pub const MIN_ENDPOINTS: usize = 2;
    pub const MIN_SESSIONS: usize = 10;

    pub fn validate(&self) -> Result<(), HubError> {
        if self.max_endpoints < Self::MIN_ENDPOINTS {
            return Err(HubError::Config(format!(
                "max endpoints must be at least {}",
                Self::MIN_ENDPOINTS
            )));
        }
        if self.max_sessions < Self::MIN_SESSIONS {
            return Err(HubError::Config(format!(
                "max sessions must be at least {}",
                Self::MIN_SESSIONS
            )));
        }
        if self.ping_interval.is_zero() || self.eviction_interval.is_zero() {
            return Err(HubError::Config(
                "maintenance intervals must be non-zero".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(HubError::Config("connect timeout must be non-zero".to_string()));
        }
        if self.relay.keepalive_timeout <= self.relay.keepalive_interval {
            return Err(HubError::Config(
                "relay keepalive timeout must exceed the keepalive interval".to_string(),
            ));
        }
        Ok(())
    }
}
