//! Endpoint registry
//!
//! Maps endpoint ids to their records. Each record sits behind its own lock
//! inside a sharded map, so operations on different endpoints never contend
//! and operations on the same endpoint are serialized. Readers get
//! [`EndpointSnapshot`]s and never hold a lock across an await point.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use meshhub_proto::{EndpointSummary, ServiceSpec, StatusReport};
use meshhub_relay::RelayChannel;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Endpoint not found: {0}")]
    NotFound(String),

    #[error("No agent session established yet for endpoint {0}")]
    NoSession(String),

    #[error("Endpoint {0} has no live tunnel")]
    NoChannel(String),

    #[error("Endpoint limit of {0} reached")]
    CapacityReached(usize),
}

/// Network origin of an endpoint tunnel, captured when it is accepted
#[derive(Debug, Clone)]
pub struct Origin {
    pub remote_addr: SocketAddr,
    /// Hub-side address the tunnel arrived on
    pub local_addr: SocketAddr,
    /// Opaque peer certificate supplied by an outer TLS layer
    pub certificate: Option<String>,
}

/// Result of binding a tunnel to an endpoint id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindOutcome {
    /// A new record was created for the id
    pub created: bool,
    /// Id of the channel that was replaced and closed, if any
    pub superseded: Option<String>,
}

/// Services added and removed by a publish
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDiff {
    pub added: Vec<ServiceSpec>,
    pub removed: Vec<ServiceSpec>,
}

impl ServiceDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Endpoint listing filters
#[derive(Debug, Clone, Default)]
pub struct EndpointQuery {
    /// Exact id; combined with `name` as "either matches"
    pub id: Option<String>,
    /// Exact name
    pub name: Option<String>,
    /// Substring of the name or of any label
    pub keyword: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Point-in-time copy of an endpoint record
#[derive(Debug, Clone)]
pub struct EndpointSnapshot {
    pub id: String,
    pub name: String,
    pub labels: Vec<String>,
    pub certificate: Option<String>,
    pub remote_addr: SocketAddr,
    pub hub_bind_addr: SocketAddr,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub services: Vec<ServiceSpec>,
    pub ping: Option<Duration>,
    pub joined_at: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub channel_id: Option<String>,
}

impl EndpointSnapshot {
    pub fn has_channel(&self) -> bool {
        self.channel_id.is_some()
    }

    /// Live tunnel and a heartbeat within `window`
    pub fn is_online(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.has_channel()
            && self
                .heartbeat_at
                .is_some_and(|at| within(now, at, window))
    }

    pub fn summary(&self, now: DateTime<Utc>, online_window: Duration) -> EndpointSummary {
        EndpointSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            labels: self.labels.clone(),
            certificate: self.certificate.clone(),
            address: self.remote_addr.ip().to_string(),
            port: self.remote_addr.port(),
            via: self.hub_bind_addr.to_string(),
            heartbeat_at: self.heartbeat_at.map(|at| at.timestamp_millis()),
            ping: self.ping.map(|p| p.as_millis() as u64),
            online: self.is_online(now, online_window),
        }
    }

    fn matches(&self, query: &EndpointQuery) -> bool {
        if query.id.is_some() || query.name.is_some() {
            let by_id = query.id.as_deref() == Some(self.id.as_str());
            let by_name = query.name.as_deref() == Some(self.name.as_str());
            if !by_id && !by_name {
                return false;
            }
        }
        match &query.keyword {
            Some(keyword) => {
                self.name.contains(keyword.as_str())
                    || self.labels.iter().any(|l| l.contains(keyword.as_str()))
            }
            None => true,
        }
    }
}

struct EndpointRecord {
    /// Creation order, used for stable listing
    seq: u64,
    id: String,
    name: String,
    labels: Vec<String>,
    certificate: Option<String>,
    remote_addr: SocketAddr,
    hub_bind_addr: SocketAddr,
    heartbeat_at: Option<DateTime<Utc>>,
    services: Vec<ServiceSpec>,
    ping: Option<Duration>,
    joined_at: DateTime<Utc>,
    bytes_sent: u64,
    bytes_received: u64,
    channel: Option<RelayChannel>,
    /// Set when the record was removed from the map by eviction
    evicted: bool,
}

impl EndpointRecord {
    fn new(seq: u64, id: &str, origin: &Origin) -> Self {
        Self {
            seq,
            id: id.to_string(),
            name: String::new(),
            labels: Vec::new(),
            certificate: origin.certificate.clone(),
            remote_addr: origin.remote_addr,
            hub_bind_addr: origin.local_addr,
            heartbeat_at: None,
            services: Vec::new(),
            ping: None,
            joined_at: Utc::now(),
            bytes_sent: 0,
            bytes_received: 0,
            channel: None,
            evicted: false,
        }
    }

    fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            labels: self.labels.clone(),
            certificate: self.certificate.clone(),
            remote_addr: self.remote_addr,
            hub_bind_addr: self.hub_bind_addr,
            heartbeat_at: self.heartbeat_at,
            services: self.services.clone(),
            ping: self.ping,
            joined_at: self.joined_at,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            channel_id: self.channel.as_ref().map(|c| c.id().to_string()),
        }
    }
}

type RecordRef = Arc<Mutex<EndpointRecord>>;

/// `at` is no more than `window` before `now` (timestamps ahead of `now` count as recent)
fn within(now: DateTime<Utc>, at: DateTime<Utc>, window: Duration) -> bool {
    now.signed_duration_since(at)
        .to_std()
        .map_or(true, |elapsed| elapsed <= window)
}

fn lock(record: &RecordRef) -> MutexGuard<'_, EndpointRecord> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of endpoints known to the hub
pub struct EndpointRegistry {
    endpoints: DashMap<String, RecordRef>,
    next_seq: AtomicU64,
    max_endpoints: usize,
    // Serializes record creation so the limit holds under concurrent joins
    admission: Mutex<()>,
}

impl EndpointRegistry {
    /// Create a new empty endpoint registry
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Registry holding at most `max_endpoints` records
    pub fn with_limit(max_endpoints: usize) -> Self {
        debug!("Creating new endpoint registry (limit {})", max_endpoints);
        Self {
            endpoints: DashMap::new(),
            next_seq: AtomicU64::new(0),
            max_endpoints,
            admission: Mutex::new(()),
        }
    }

    pub fn max_endpoints(&self) -> usize {
        self.max_endpoints
    }

    /// Whether `id` could be bound now without exceeding the limit
    pub fn has_room_for(&self, id: &str) -> bool {
        self.contains(id) || self.len() < self.max_endpoints
    }

    // The map guard is released before the record lock is taken
    fn record(&self, id: &str) -> Option<RecordRef> {
        self.endpoints.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn entry(&self, id: &str, origin: &Origin) -> Result<(RecordRef, bool), RegistryError> {
        if let Some(existing) = self.record(id) {
            return Ok((existing, false));
        }

        let _admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = self.record(id) {
            return Ok((existing, false));
        }
        if self.endpoints.len() >= self.max_endpoints {
            return Err(RegistryError::CapacityReached(self.max_endpoints));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(Mutex::new(EndpointRecord::new(seq, id, origin)));
        self.endpoints.insert(id.to_string(), Arc::clone(&record));
        Ok((record, true))
    }

    /// Existing record for `id`, or a new one seeded from `origin`.
    ///
    /// Fails with [`RegistryError::CapacityReached`] when a new record would
    /// exceed the limit.
    pub fn get_or_create(&self, id: &str, origin: &Origin) -> Result<EndpointSnapshot, RegistryError> {
        let (record, created) = self.entry(id, origin)?;
        if created {
            info!(endpoint_id = %id, remote_addr = %origin.remote_addr, "Created endpoint record");
        }
        let snapshot = lock(&record).snapshot();
        Ok(snapshot)
    }

    /// Bind a freshly accepted tunnel to `id`.
    ///
    /// Origin fields are overwritten and the heartbeat is reset. Any channel
    /// previously bound to the id is replaced and closed, so exactly one live
    /// channel exists per id afterwards. A new id is refused once the
    /// registry is full.
    pub fn bind_channel(
        &self,
        id: &str,
        origin: &Origin,
        name: Option<&str>,
        channel: RelayChannel,
    ) -> Result<BindOutcome, RegistryError> {
        let new_channel_id = channel.id().to_string();

        loop {
            let (record, created) = self.entry(id, origin)?;
            let mut rec = lock(&record);
            if rec.evicted {
                // Lost a race with eviction; retry against a fresh record
                continue;
            }

            rec.remote_addr = origin.remote_addr;
            rec.hub_bind_addr = origin.local_addr;
            rec.certificate = origin.certificate.clone();
            if let Some(name) = name.filter(|n| !n.is_empty()) {
                rec.name = name.to_string();
            }
            rec.heartbeat_at = None;
            rec.ping = None;
            rec.joined_at = Utc::now();
            let old = rec.channel.replace(channel.clone());
            drop(rec);

            let superseded = match old {
                Some(old) if old.id() != new_channel_id => {
                    info!(
                        endpoint_id = %id,
                        old_channel = %old.id(),
                        new_channel = %new_channel_id,
                        "Endpoint reconnected, closing previous tunnel"
                    );
                    old.close("superseded by a newer tunnel");
                    Some(old.id().to_string())
                }
                _ => None,
            };

            if superseded.is_none() {
                info!(
                    endpoint_id = %id,
                    channel_id = %new_channel_id,
                    remote_addr = %origin.remote_addr,
                    "Endpoint joined"
                );
            }

            return Ok(BindOutcome {
                created,
                superseded,
            });
        }
    }

    /// Clear the channel of `id` if it is still `channel_id`.
    ///
    /// Returns false when the record was already rebound to a newer channel.
    pub fn release_channel(&self, id: &str, channel_id: &str) -> bool {
        let Some(record) = self.record(id) else {
            return false;
        };
        let mut rec = lock(&record);
        if rec.channel.as_ref().map(|c| c.id()) == Some(channel_id) {
            rec.channel = None;
            info!(endpoint_id = %id, %channel_id, "Endpoint left");
            true
        } else {
            false
        }
    }

    /// Record a heartbeat; the returned timestamp is strictly increasing per record
    pub fn heartbeat(&self, id: &str, report: StatusReport) -> Result<DateTime<Utc>, RegistryError> {
        let record = self
            .record(id)
            .ok_or_else(|| RegistryError::NoSession(id.to_string()))?;
        let mut rec = lock(&record);

        let now = Utc::now();
        let at = match rec.heartbeat_at {
            Some(prev) if now <= prev => prev + ChronoDuration::milliseconds(1),
            _ => now,
        };
        rec.heartbeat_at = Some(at);
        if rec.name != report.name {
            debug!(endpoint_id = %id, old = %rec.name, new = %report.name, "Endpoint renamed");
        }
        rec.name = report.name;
        rec.labels = report.labels;
        Ok(at)
    }

    /// Replace the service list of `id` wholesale
    pub fn publish_services(
        &self,
        id: &str,
        services: Vec<ServiceSpec>,
    ) -> Result<ServiceDiff, RegistryError> {
        let record = self
            .record(id)
            .ok_or_else(|| RegistryError::NoSession(id.to_string()))?;

        let mut unique: Vec<ServiceSpec> = Vec::with_capacity(services.len());
        for service in services {
            if !unique.contains(&service) {
                unique.push(service);
            }
        }

        let mut rec = lock(&record);
        let diff = ServiceDiff {
            added: unique
                .iter()
                .filter(|s| !rec.services.contains(s))
                .cloned()
                .collect(),
            removed: rec
                .services
                .iter()
                .filter(|s| !unique.contains(s))
                .cloned()
                .collect(),
        };
        rec.services = unique;
        drop(rec);

        for service in &diff.added {
            info!(endpoint_id = %id, protocol = %service.protocol, service = %service.name, "Service added");
        }
        for service in &diff.removed {
            info!(endpoint_id = %id, protocol = %service.protocol, service = %service.name, "Service removed");
        }
        Ok(diff)
    }

    pub fn get(&self, id: &str) -> Option<EndpointSnapshot> {
        self.record(id).map(|record| {
            let rec = lock(&record);
            rec.snapshot()
        })
    }

    /// All records in creation order
    pub fn list_all(&self) -> Vec<EndpointSnapshot> {
        let records: Vec<RecordRef> = self
            .endpoints
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut snapshots: Vec<(u64, EndpointSnapshot)> = records
            .iter()
            .map(|record| {
                let rec = lock(record);
                (rec.seq, rec.snapshot())
            })
            .collect();
        snapshots.sort_by_key(|(seq, _)| *seq);
        snapshots.into_iter().map(|(_, s)| s).collect()
    }

    /// Filtered and paged listing
    pub fn list(&self, query: &EndpointQuery) -> Vec<EndpointSnapshot> {
        let matching = self.list_all().into_iter().filter(|s| s.matches(query));
        match query.limit {
            Some(limit) => matching.skip(query.offset).take(limit).collect(),
            None => matching.skip(query.offset).collect(),
        }
    }

    /// Live channel of `id`
    pub fn channel(&self, id: &str) -> Result<RelayChannel, RegistryError> {
        let record = self
            .record(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let rec = lock(&record);
        rec.channel
            .as_ref()
            .filter(|c| !c.is_closed())
            .cloned()
            .ok_or_else(|| RegistryError::NoChannel(id.to_string()))
    }

    /// All live channels, for maintenance sweeps
    pub fn live_channels(&self) -> Vec<(String, RelayChannel)> {
        self.list_all()
            .into_iter()
            .filter_map(|s| self.channel(&s.id).ok().map(|c| (s.id, c)))
            .collect()
    }

    pub fn services(&self, id: &str) -> Option<Vec<ServiceSpec>> {
        self.record(id).map(|record| {
            let rec = lock(&record);
            rec.services.clone()
        })
    }

    pub fn record_ping(&self, id: &str, rtt: Option<Duration>) {
        if let Some(record) = self.record(id) {
            lock(&record).ping = rtt;
        }
    }

    pub fn record_traffic(&self, id: &str, sent: u64, received: u64) {
        if let Some(record) = self.record(id) {
            let mut rec = lock(&record);
            rec.bytes_sent += sent;
            rec.bytes_received += received;
        }
    }

    /// Remove records without a live channel whose last sign of life
    /// (heartbeat, or join when never heartbeated) is older than `ttl`
    pub fn evict_stale(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<String> {
        let mut evicted = Vec::new();

        self.endpoints.retain(|id, record| {
            let mut rec = lock(record);
            let connected = rec.channel.as_ref().is_some_and(|c| !c.is_closed());
            let last_seen = rec.heartbeat_at.unwrap_or(rec.joined_at);
            if connected || within(now, last_seen, ttl) {
                return true;
            }
            rec.evicted = true;
            rec.channel = None;
            evicted.push(id.clone());
            false
        });

        for id in &evicted {
            info!(endpoint_id = %id, "Evicted stale endpoint");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.endpoints.contains_key(id)
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshhub_relay::{RelayConfig, Role};

    fn origin(port: u16) -> Origin {
        Origin {
            remote_addr: SocketAddr::from(([10, 0, 0, 7], port)),
            local_addr: SocketAddr::from(([127, 0, 0, 1], 8888)),
            certificate: None,
        }
    }

    /// Hub-side channel plus the endpoint side that keeps it open
    fn channel() -> (RelayChannel, RelayChannel) {
        let (a, b) = tokio::io::duplex(16 * 1024);
        (
            RelayChannel::new(a, Role::Server, RelayConfig::default()),
            RelayChannel::new(b, Role::Client, RelayConfig::default()),
        )
    }

    fn status(name: &str) -> StatusReport {
        StatusReport {
            name: name.to_string(),
            labels: vec![],
        }
    }

    #[test]
    fn test_get_or_create_seeds_from_origin() {
        let registry = EndpointRegistry::new();
        let created = registry.get_or_create("e1", &origin(40000)).unwrap();
        assert_eq!(created.id, "e1");
        assert_eq!(created.name, "");
        assert!(created.heartbeat_at.is_none());
        assert!(created.services.is_empty());
        assert_eq!(created.remote_addr.port(), 40000);

        // Second call returns the same record untouched
        let again = registry.get_or_create("e1", &origin(50000)).unwrap();
        assert_eq!(again.remote_addr.port(), 40000);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_old_channel() {
        let registry = EndpointRegistry::new();
        let (first, _first_peer) = channel();
        let (second, _second_peer) = channel();

        let outcome = registry.bind_channel("e1", &origin(40000), Some("box1"), first.clone()).unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.superseded, None);

        let outcome = registry.bind_channel("e1", &origin(40001), None, second.clone()).unwrap();
        assert!(!outcome.created);
        assert_eq!(outcome.superseded.as_deref(), Some(first.id()));

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.channel("e1").unwrap().id(), second.id());

        let snapshot = registry.get("e1").unwrap();
        assert_eq!(snapshot.remote_addr.port(), 40001);
        assert_eq!(snapshot.name, "box1");
    }

    #[tokio::test]
    async fn test_release_ignores_superseded_channel() {
        let registry = EndpointRegistry::new();
        let (first, _p1) = channel();
        let (second, _p2) = channel();
        registry.bind_channel("e1", &origin(1), None, first.clone()).unwrap();
        registry.bind_channel("e1", &origin(2), None, second.clone()).unwrap();

        // The old tunnel's teardown must not detach the new one
        assert!(!registry.release_channel("e1", first.id()));
        assert!(registry.channel("e1").is_ok());

        assert!(registry.release_channel("e1", second.id()));
        assert_eq!(
            registry.channel("e1").unwrap_err(),
            RegistryError::NoChannel("e1".to_string())
        );
        // Record retained after the channel is gone
        assert!(registry.get("e1").is_some());
    }

    #[test]
    fn test_heartbeat_updates_name_and_strictly_increases() {
        let registry = EndpointRegistry::new();
        assert_eq!(
            registry.heartbeat("e1", status("box1")).unwrap_err(),
            RegistryError::NoSession("e1".to_string())
        );

        registry.get_or_create("e1", &origin(1)).unwrap();
        let first = registry.heartbeat("e1", status("box1")).unwrap();
        let second = registry.heartbeat("e1", status("box2")).unwrap();
        let third = registry.heartbeat("e1", status("box2")).unwrap();
        assert!(second > first);
        assert!(third > second);

        let snapshot = registry.get("e1").unwrap();
        assert_eq!(snapshot.name, "box2");
        assert_eq!(snapshot.heartbeat_at, Some(third));
    }

    #[test]
    fn test_publish_replaces_wholesale() {
        let registry = EndpointRegistry::new();
        registry.get_or_create("e1", &origin(1)).unwrap();

        let diff = registry
            .publish_services(
                "e1",
                vec![ServiceSpec::new("ssh", "tcp"), ServiceSpec::new("ssh", "tcp")],
            )
            .unwrap();
        assert_eq!(diff.added, vec![ServiceSpec::new("ssh", "tcp")]);
        assert_eq!(registry.services("e1").unwrap().len(), 1);

        let diff = registry
            .publish_services("e1", vec![ServiceSpec::new("web", "tcp")])
            .unwrap();
        assert_eq!(diff.added, vec![ServiceSpec::new("web", "tcp")]);
        assert_eq!(diff.removed, vec![ServiceSpec::new("ssh", "tcp")]);

        let diff = registry.publish_services("e1", vec![]).unwrap();
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(registry.services("e1").unwrap(), vec![]);

        // Idempotent
        assert!(registry.publish_services("e1", vec![]).unwrap().is_empty());
    }

    #[test]
    fn test_list_filters_and_paging() {
        let registry = EndpointRegistry::new();
        for (id, name) in [("e1", "alpha"), ("e2", "beta"), ("e3", "alphabet")] {
            registry.get_or_create(id, &origin(1)).unwrap();
            registry
                .heartbeat(
                    id,
                    StatusReport {
                        name: name.to_string(),
                        labels: vec![format!("zone-{}", id)],
                    },
                )
                .unwrap();
        }

        let all = registry.list(&EndpointQuery::default());
        let ids: Vec<_> = all.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2", "e3"]);

        let by_keyword = registry.list(&EndpointQuery {
            keyword: Some("alpha".to_string()),
            ..Default::default()
        });
        assert_eq!(by_keyword.len(), 2);

        let by_label = registry.list(&EndpointQuery {
            keyword: Some("zone-e2".to_string()),
            ..Default::default()
        });
        assert_eq!(by_label[0].id, "e2");

        let by_id_or_name = registry.list(&EndpointQuery {
            id: Some("e1".to_string()),
            name: Some("beta".to_string()),
            ..Default::default()
        });
        assert_eq!(by_id_or_name.len(), 2);

        let paged = registry.list(&EndpointQuery {
            offset: 1,
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].id, "e2");
    }

    #[tokio::test]
    async fn test_online_requires_channel_and_recent_heartbeat() {
        let registry = EndpointRegistry::new();
        let (hub_side, _peer) = channel();
        registry.bind_channel("e1", &origin(1), None, hub_side).unwrap();

        let now = Utc::now();
        let window = Duration::from_secs(30);
        assert!(!registry.get("e1").unwrap().is_online(now, window));

        registry.heartbeat("e1", status("box1")).unwrap();
        let snapshot = registry.get("e1").unwrap();
        assert!(snapshot.is_online(Utc::now(), window));
        assert!(!snapshot.is_online(Utc::now() + ChronoDuration::seconds(31), window));

        let summary = snapshot.summary(Utc::now(), window);
        assert_eq!(summary.address, "10.0.0.7");
        assert_eq!(summary.via, "127.0.0.1:8888");
        assert!(summary.online);
    }

    #[tokio::test]
    async fn test_evict_stale_keeps_connected_endpoints() {
        let registry = EndpointRegistry::new();
        let (hub_side, _peer) = channel();
        registry.bind_channel("live", &origin(1), None, hub_side).unwrap();
        registry.get_or_create("gone", &origin(2)).unwrap();

        let later = Utc::now() + ChronoDuration::seconds(600);
        let evicted = registry.evict_stale(later, Duration::from_secs(120));
        assert_eq!(evicted, vec!["gone".to_string()]);
        assert!(registry.get("live").is_some());
        assert!(registry.get("gone").is_none());

        // Nothing is evicted inside the ttl
        registry.get_or_create("fresh", &origin(3)).unwrap();
        assert!(registry
            .evict_stale(Utc::now(), Duration::from_secs(120))
            .is_empty());
    }

    #[tokio::test]
    async fn test_traffic_and_ping_recorded() {
        let registry = EndpointRegistry::new();
        registry.get_or_create("e1", &origin(1)).unwrap();
        registry.record_traffic("e1", 100, 40);
        registry.record_traffic("e1", 1, 2);
        registry.record_ping("e1", Some(Duration::from_millis(12)));

        let snapshot = registry.get("e1").unwrap();
        assert_eq!(snapshot.bytes_sent, 101);
        assert_eq!(snapshot.bytes_received, 42);
        assert_eq!(snapshot.ping, Some(Duration::from_millis(12)));
    }

    #[tokio::test]
    async fn test_concurrent_binds_for_distinct_ids() {
        let registry = Arc::new(EndpointRegistry::new());
        let mut peers = Vec::new();
        let mut handles = Vec::new();
        for i in 0..16 {
            let (hub_side, peer) = channel();
            peers.push(peer);
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.bind_channel(&format!("e{}", i), &origin(i), None, hub_side)
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().created);
        }
        assert_eq!(registry.len(), 16);
        assert_eq!(registry.live_channels().len(), 16);
    }

    #[tokio::test]
    async fn test_limit_holds_under_concurrent_joins() {
        let registry = Arc::new(EndpointRegistry::with_limit(3));
        let mut peers = Vec::new();
        let mut handles = Vec::new();
        for i in 0..12 {
            let (hub_side, peer) = channel();
            peers.push(peer);
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.bind_channel(&format!("e{}", i), &origin(i), None, hub_side)
            }));
        }

        let mut refused = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(outcome) => assert!(outcome.created),
                Err(e) => {
                    assert_eq!(e, RegistryError::CapacityReached(3));
                    refused += 1;
                }
            }
        }
        assert_eq!(refused, 9);
        assert_eq!(registry.len(), 3);

        // Known ids may always rebind
        let known = registry.list_all()[0].id.clone();
        let (hub_side, _peer) = channel();
        assert!(registry.has_room_for(&known));
        assert!(!registry.has_room_for("e-new"));
        assert!(registry.bind_channel(&known, &origin(99), None, hub_side).is_ok());
        assert_eq!(
            registry.get_or_create("e-new", &origin(1)).unwrap_err(),
            RegistryError::CapacityReached(3)
        );
    }
}
