//! Metrics collection and export for Chorus.
//!
//! The hub records through the `metrics` facade; this module describes those
//! metrics, adds socket-level ones and exports everything in Prometheus format.

use anyhow::{Context, Result};
use chorus_core::metrics::names as hub;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Socket-level metric names.
pub mod names {
    pub const SOCKETS_TOTAL: &str = "chorus_sockets_total";
    pub const SOCKETS_OPEN: &str = "chorus_sockets_open";
    pub const REJECTIONS_TOTAL: &str = "chorus_rejections_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(names::SOCKETS_TOTAL, "Total number of upgraded sockets");
    metrics::describe_gauge!(names::SOCKETS_OPEN, "Current number of open sockets");
    metrics::describe_counter!(
        names::REJECTIONS_TOTAL,
        "Upgrade requests rejected before admission"
    );

    metrics::describe_counter!(hub::CONNECTIONS_TOTAL, "Total number of registered connections");
    metrics::describe_gauge!(hub::CONNECTIONS_ACTIVE, "Current number of registered connections");
    metrics::describe_gauge!(hub::ROOMS_ACTIVE, "Current number of non-empty rooms");
    metrics::describe_counter!(hub::MESSAGES_TOTAL, "Total number of payloads through the pumps");
    metrics::describe_counter!(hub::MESSAGES_BYTES, "Total bytes through the pumps");
    metrics::describe_counter!(hub::BROADCASTS_TOTAL, "Total number of envelopes fanned out");
    metrics::describe_counter!(hub::EVICTIONS_TOTAL, "Connections evicted for a full delivery queue");
    metrics::describe_counter!(hub::HEARTBEAT_TIMEOUTS_TOTAL, "Connections dropped for missing heartbeats");
    metrics::describe_counter!(hub::DEGRADED_PAYLOADS_TOTAL, "Undecodable payloads delivered as text");
    metrics::describe_counter!(hub::PRESENCE_ERRORS_TOTAL, "Failed presence cache operations");
    metrics::describe_counter!(hub::PERSIST_TOTAL, "Persistence jobs by outcome");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record an upgrade request rejected before admission.
pub fn record_rejection(reason: &'static str) {
    counter!(names::REJECTIONS_TOTAL, "reason" => reason).increment(1);
}

/// Metrics guard that tracks an open socket until dropped.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a socket.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::SOCKETS_TOTAL).increment(1);
        gauge!(names::SOCKETS_OPEN).increment(1.0);
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
        gauge!(names::SOCKETS_OPEN).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; recording is a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_rejection("test");
    }
}
