//! Settings types with compiled defaults.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParleySettings {
    /// Network listener.
    pub server: ServerSettings,
    /// Connection caps.
    pub limits: LimitSettings,
    /// Ping/pong liveness sweep.
    pub heartbeat: HeartbeatSettings,
    /// Cross-process presence.
    pub presence: PresenceSettings,
    /// Cross-process fanout broker.
    pub fanout: FanoutSettings,
    /// Call signaling.
    pub calls: CallSettings,
    /// Token verification.
    pub auth: AuthSettings,
    /// SQLite store.
    pub database: DatabaseSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl ParleySettings {
    /// Reject values the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_devices_per_user == 0 {
            return Err(SettingsError::InvalidValue(
                "limits.maxDevicesPerUser must be at least 1".into(),
            ));
        }
        if self.limits.max_total_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "limits.maxTotalConnections must be at least 1".into(),
            ));
        }
        if self.heartbeat.interval_secs == 0
            || self.heartbeat.idle_timeout_secs < self.heartbeat.interval_secs
        {
            return Err(SettingsError::InvalidValue(
                "heartbeat.idleTimeoutSecs must be >= heartbeat.intervalSecs > 0".into(),
            ));
        }
        if !self.server.ws_path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "server.wsPath must start with '/': {}",
                self.server.ws_path
            )));
        }
        if self.auth.jwt_secret.is_empty() {
            return Err(SettingsError::InvalidValue("auth.jwtSecret is empty".into()));
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (0 auto-assigns).
    pub port: u16,
    /// Path of the WebSocket upgrade endpoint.
    pub ws_path: String,
    /// Outbound frames buffered per socket before sends start failing.
    pub send_queue_size: usize,
    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            ws_path: "/ws".to_string(),
            send_queue_size: 256,
            max_message_size: 1024 * 1024,
        }
    }
}

/// Connection caps. Both are adjustable at runtime through the connection manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitSettings {
    /// Live devices allowed per user.
    pub max_devices_per_user: usize,
    /// Live sockets allowed per process.
    pub max_total_connections: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_devices_per_user: 5,
            max_total_connections: 10_000,
        }
    }
}

/// Liveness sweep settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Seconds between sweeps (each sweep pings every socket).
    pub interval_secs: u64,
    /// A socket with no pong for this long is evicted.
    pub idle_timeout_secs: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            idle_timeout_secs: 90,
        }
    }
}

/// Shared presence settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceSettings {
    /// TTL of a user's presence set in the broker. Refreshed by heartbeats.
    pub ttl_secs: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self { ttl_secs: 60 }
    }
}

/// Which broker carries cross-process fanout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanoutBackend {
    /// In-process hub. Correct for a single node.
    #[default]
    Memory,
    /// Redis pub/sub.
    Redis,
    /// No broker; every fanout operation is a no-op.
    Disabled,
}

/// Fanout broker settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FanoutSettings {
    /// Broker backend.
    pub backend: FanoutBackend,
    /// Redis connection URL (used when `backend` is `redis`).
    pub redis_url: String,
    /// Prefix for every channel and key.
    pub channel_prefix: String,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            backend: FanoutBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            channel_prefix: "parley".to_string(),
        }
    }
}

/// Call signaling settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallSettings {
    /// Unanswered calls older than this are marked missed.
    pub ring_timeout_secs: u64,
    /// How often the ring-timeout sweeper runs.
    pub sweep_interval_secs: u64,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 60,
            sweep_interval_secs: 5,
        }
    }
}

/// Token verification settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HS256 shared secret.
    pub jwt_secret: String,
    /// Required `iss` claim, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: "change-me".to_string(),
            issuer: None,
        }
    }
}

/// SQLite settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// Database file path. Relative paths resolve against `~/.parley`.
    pub path: String,
    /// Connection pool size.
    pub pool_size: u32,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "parley.db".to_string(),
            pool_size: 8,
            busy_timeout_ms: 30_000,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`RUST_LOG` overrides).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ParleySettings::default().validate().unwrap();
    }

    #[test]
    fn zero_device_limit_rejected() {
        let mut s = ParleySettings::default();
        s.limits.max_devices_per_user = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn timeout_shorter_than_interval_rejected() {
        let mut s = ParleySettings::default();
        s.heartbeat.interval_secs = 30;
        s.heartbeat.idle_timeout_secs = 10;
        assert!(s.validate().is_err());
    }

    #[test]
    fn ws_path_must_be_absolute() {
        let mut s = ParleySettings::default();
        s.server.ws_path = "ws".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn camel_case_wire_format() {
        let v = serde_json::to_value(ParleySettings::default()).unwrap();
        assert_eq!(v["limits"]["maxDevicesPerUser"], 5);
        assert_eq!(v["fanout"]["backend"], "memory");
        assert_eq!(v["heartbeat"]["idleTimeoutSecs"], 90);
        assert!(v["auth"].get("issuer").is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: ParleySettings =
            serde_json::from_str(r#"{"fanout":{"backend":"redis"}}"#).unwrap();
        assert_eq!(s.fanout.backend, FanoutBackend::Redis);
        assert_eq!(s.fanout.channel_prefix, "parley");
        assert_eq!(s.server.port, 8090);
    }
}
