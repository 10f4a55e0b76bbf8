//! Metric names and recording helpers.
//!
//! Recording goes through the `metrics` facade and is a no-op until the
//! server installs an exporter.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "chorus_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "chorus_connections_active";
    pub const ROOMS_ACTIVE: &str = "chorus_rooms_active";
    pub const MESSAGES_TOTAL: &str = "chorus_messages_total";
    pub const MESSAGES_BYTES: &str = "chorus_messages_bytes";
    pub const BROADCASTS_TOTAL: &str = "chorus_broadcasts_total";
    pub const EVICTIONS_TOTAL: &str = "chorus_evictions_total";
    pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "chorus_heartbeat_timeouts_total";
    pub const DEGRADED_PAYLOADS_TOTAL: &str = "chorus_degraded_payloads_total";
    pub const PRESENCE_ERRORS_TOTAL: &str = "chorus_presence_errors_total";
    pub const PERSIST_TOTAL: &str = "chorus_persist_total";
}

/// Publish hub occupancy.
pub fn set_occupancy(rooms: usize, connections: usize) {
    gauge!(names::ROOMS_ACTIVE).set(rooms as f64);
    gauge!(names::CONNECTIONS_ACTIVE).set(connections as f64);
}

/// Record a payload crossing a pump.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a presence backend failure.
pub fn record_presence_error(operation: &'static str) {
    counter!(names::PRESENCE_ERRORS_TOTAL, "operation" => operation).increment(1);
}
