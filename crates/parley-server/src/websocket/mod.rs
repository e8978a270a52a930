//! WebSocket connections: per-device state, the registry, liveness, and the
//! per-socket session loop.

pub mod connection;
pub mod liveness;
pub mod manager;
pub mod session;
