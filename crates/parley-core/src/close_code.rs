//! WebSocket close codes used by the gateway.

/// Normal closure; also used when a device's socket is replaced by a newer one.
pub const NORMAL: u16 = 1000;
/// Server shutting down, or connection evicted for missing heartbeats.
pub const GOING_AWAY: u16 = 1001;
/// Token missing, invalid, or expired.
pub const AUTH_FAILED: u16 = 4001;
/// The user already has the maximum number of devices connected.
pub const DEVICE_LIMIT: u16 = 4003;
/// The process is at its global connection cap.
pub const GLOBAL_LIMIT: u16 = 4004;
