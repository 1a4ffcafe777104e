//! JSON models of the hub HTTP surface

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A service an endpoint advertises
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Service name, unique per protocol on one endpoint
    pub name: String,
    /// Transport protocol (`tcp`, `udp`, ...)
    pub protocol: String,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol: protocol.into(),
        }
    }
}

/// Heartbeat body sent by an endpoint (`POST /api/status`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

/// Endpoint information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Opaque certificate captured from the connection origin
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    /// Remote address of the endpoint tunnel
    pub address: String,
    pub port: u16,
    /// Hub-side address the endpoint connected to
    pub via: String,
    /// Unix milliseconds of the last heartbeat since (re)join
    pub heartbeat_at: Option<i64>,
    /// Last measured round trip in milliseconds
    pub ping: Option<u64>,
    pub online: bool,
}

/// An endpoint providing a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRef {
    pub id: String,
    pub name: String,
}

/// Aggregated view of one service across endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub protocol: String,
    pub name: String,
    pub endpoints: Vec<ProviderRef>,
}

/// Counts of endpoints and forwarding sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubLoad {
    pub endpoints: usize,
    pub sessions: usize,
}

/// Hub status (`GET /api/status`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubStatus {
    pub id: String,
    pub since: DateTime<Utc>,
    pub ports: Vec<String>,
    pub capacity: HubLoad,
    pub load: HubLoad,
    pub version: String,
}

/// Outcome of one on-demand ping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResult {
    pub hub: String,
    /// Unix milliseconds when the ping was sent
    pub start: i64,
    /// Unix milliseconds when the reply (or failure) arrived
    pub end: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Traffic counters of one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub id: String,
    /// Bytes sent from the hub to the endpoint
    pub sent: u64,
    /// Bytes received by the hub from the endpoint
    pub received: u64,
}

/// Severity of a hub log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Hub log entry (`GET /api/log`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub level: LogLevel,
    pub message: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
