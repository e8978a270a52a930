//! Metric name constants, shared so every crate records under the same name.

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Currently registered connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Lifetime of a registered connection (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Upgrades refused (counter, labels: reason).
pub const WS_REJECTIONS_TOTAL: &str = "ws_rejections_total";
/// Envelopes published to the broker (counter, labels: kind).
pub const FANOUT_PUBLISHED_TOTAL: &str = "fanout_published_total";
/// Envelopes dropped because this instance published them (counter).
pub const FANOUT_SELF_DROPPED_TOTAL: &str = "fanout_self_dropped_total";
/// Calls created (counter).
pub const CALLS_INITIATED_TOTAL: &str = "calls_initiated_total";
/// Call initiations refused because a participant was busy (counter).
pub const CALLS_CONFLICTS_TOTAL: &str = "calls_conflicts_total";
/// Connections closed by the liveness monitor (counter).
pub const LIVENESS_EVICTIONS_TOTAL: &str = "liveness_evictions_total";
