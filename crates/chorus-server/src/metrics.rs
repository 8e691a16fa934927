//! Metrics collection and export for Chorus.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format. Hub-wide counters are sampled from the
//! coordinator's snapshot rather than recorded on the hot path.

use anyhow::{Context, Result};
use chorus_core::{HubHandle, HubStats};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "chorus_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "chorus_connections_active";
    pub const INTENTS_TOTAL: &str = "chorus_intents_total";
    pub const EVENTS_TOTAL: &str = "chorus_events_total";
    pub const ERRORS_TOTAL: &str = "chorus_errors_total";
    pub const SESSIONS_ACTIVE: &str = "chorus_sessions_active";
    pub const USERS_ONLINE: &str = "chorus_users_online";
    pub const CHANNELS_ACTIVE: &str = "chorus_channels_active";
    pub const CALLS_ACTIVE: &str = "chorus_calls_active";
    pub const SESSIONS_DEGRADED: &str = "chorus_sessions_degraded";
    pub const EVENTS_DROPPED: &str = "chorus_events_dropped_total";
    pub const SATURATION_CLOSES: &str = "chorus_saturation_closes_total";
    pub const MESSAGES_TOTAL: &str = "chorus_messages_total";
    pub const PERSIST_DROPPED: &str = "chorus_persist_dropped_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::INTENTS_TOTAL, "Inbound intents by type");
    metrics::describe_counter!(names::EVENTS_TOTAL, "Outbound events written by type");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Live sessions in the hub");
    metrics::describe_gauge!(names::USERS_ONLINE, "Users with at least one session");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Channels with at least one member");
    metrics::describe_gauge!(names::CALLS_ACTIVE, "Calls that have not ended");
    metrics::describe_gauge!(
        names::SESSIONS_DEGRADED,
        "Sessions whose outbound queue dropped events"
    );
    metrics::describe_counter!(
        names::EVENTS_DROPPED,
        "Droppable events discarded by full queues"
    );
    metrics::describe_counter!(
        names::SATURATION_CLOSES,
        "Sessions closed because their queue saturated"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Chat messages accepted");
    metrics::describe_counter!(
        names::PERSIST_DROPPED,
        "Messages not handed to persistence because its backlog was full"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

pub fn record_intent(kind: &'static str) {
    counter!(names::INTENTS_TOTAL, "type" => kind).increment(1);
}

pub fn record_event(name: &'static str) {
    counter!(names::EVENTS_TOTAL, "type" => name).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Publish hub counters.
#[allow(clippy::cast_precision_loss)]
pub fn record_hub_stats(stats: &HubStats) {
    gauge!(names::SESSIONS_ACTIVE).set(stats.sessions as f64);
    gauge!(names::USERS_ONLINE).set(stats.users as f64);
    gauge!(names::CHANNELS_ACTIVE).set(stats.channels as f64);
    gauge!(names::CALLS_ACTIVE).set(stats.calls as f64);
    gauge!(names::SESSIONS_DEGRADED).set(stats.degraded_sessions as f64);
    counter!(names::EVENTS_DROPPED).absolute(stats.dropped);
    counter!(names::SATURATION_CLOSES).absolute(stats.saturation_closes);
    counter!(names::MESSAGES_TOTAL).absolute(stats.messages);
    counter!(names::PERSIST_DROPPED).absolute(stats.persist_dropped);
}

/// Sample the hub snapshot every `period` until the hub stops.
pub fn spawn_hub_sampler(hub: HubHandle, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while hub.is_running() {
            ticker.tick().await;
            record_hub_stats(&hub.snapshot().stats);
        }
        debug!("Hub sampler stopped");
    })
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::{Hub, HubConfig, InMemoryDirectory, NullMessageStore};
    use std::sync::Arc;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; recording is a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_hub_stats(&HubStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_stops_with_hub() {
        let hub = Hub::spawn(
            HubConfig::default(),
            Arc::new(InMemoryDirectory::new(true)),
            Arc::new(NullMessageStore),
        );
        let sampler = spawn_hub_sampler(hub.clone(), Duration::from_millis(100));

        hub.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), sampler)
            .await
            .unwrap()
            .unwrap();
    }
}
