//! Server configuration, derived from [`ParleySettings`].

use std::time::Duration;

use parley_settings::ParleySettings;

use crate::websocket::manager::ConnectionLimits;

/// Runtime knobs for the gateway. Plain values, no globals.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port (`0` picks an ephemeral port).
    pub port: u16,
    /// WebSocket upgrade path.
    pub ws_path: String,
    /// Per-connection outbound queue depth.
    pub send_queue_size: usize,
    /// Largest accepted inbound frame, in bytes.
    pub max_message_size: usize,
    /// Connection caps.
    pub limits: ConnectionLimits,
    /// Liveness sweep period.
    pub heartbeat_interval: Duration,
    /// A connection silent for longer than this is evicted.
    pub idle_timeout: Duration,
    /// How long a call may ring before it is timed out.
    pub ring_timeout: Duration,
    /// How often unanswered calls are checked.
    pub ring_sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ParleySettings::default())
    }
}

impl From<&ParleySettings> for ServerConfig {
    fn from(s: &ParleySettings) -> Self {
        Self {
            host: s.server.host.clone(),
            port: s.server.port,
            ws_path: s.server.ws_path.clone(),
            send_queue_size: s.server.send_queue_size,
            max_message_size: s.server.max_message_size,
            limits: ConnectionLimits {
                max_devices_per_user: s.limits.max_devices_per_user,
                max_total_connections: s.limits.max_total_connections,
            },
            heartbeat_interval: Duration::from_secs(s.heartbeat.interval_secs),
            idle_timeout: Duration::from_secs(s.heartbeat.idle_timeout_secs),
            ring_timeout: Duration::from_secs(s.calls.ring_timeout_secs),
            ring_sweep_interval: Duration::from_secs(s.calls.sweep_interval_secs),
        }
    }
}
