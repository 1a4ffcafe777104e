//! Periodic hub maintenance: tunnel pings and stale endpoint eviction

use crate::broker::TunnelBroker;
use chrono::Utc;
use futures::future::join_all;
use meshhub_control::TaskTracker;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

pub(crate) fn spawn_maintenance(broker: &Arc<TunnelBroker>, tasks: &TaskTracker) {
    tasks.register("pinger", tokio::spawn(pinger(broker.clone())));
    tasks.register("evictor", tokio::spawn(evictor(broker.clone())));
}

async fn pinger(broker: Arc<TunnelBroker>) {
    let mut ticker = interval(broker.config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        broker.ping_all().await;
    }
}

async fn evictor(broker: Arc<TunnelBroker>) {
    let mut ticker = interval(broker.config.eviction_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        broker.evict_stale();
    }
}

impl TunnelBroker {
    /// Ping every live tunnel concurrently; a tunnel that fails is closed
    pub async fn ping_all(&self) {
        let channels = self.registry.live_channels();
        debug!("Pinging {} endpoint tunnels", channels.len());

        let pings = channels.into_iter().map(|(id, channel)| async move {
            match self.ping_channel(&channel).await {
                Ok(rtt) => self.registry.record_ping(&id, Some(rtt)),
                Err(e) => {
                    self.registry.record_ping(&id, None);
                    self.log
                        .warn(format!("Ping to endpoint {} failed: {}", id, e));
                    channel.close("ping failed");
                }
            }
        });
        join_all(pings).await;
    }

    /// Remove disconnected endpoints that have been silent too long
    pub fn evict_stale(&self) -> Vec<String> {
        let evicted = self
            .registry
            .evict_stale(Utc::now(), self.config.stale_after);
        for id in &evicted {
            self.log.info(format!("Endpoint {} evicted after inactivity", id));
        }
        evicted
    }
}
