//! # parley-server
//!
//! The realtime edge of Parley.
//!
//! - [`auth`]: token and device extraction for WebSocket upgrades and API calls
//! - [`websocket`]: per-device connection registry, liveness sweeps, session loop
//! - [`fanout`]: broker-backed cross-process delivery with instance-id dedup
//!   and refcounted subscriptions
//! - [`router`]: the one entry point business code uses to push events
//! - [`server`]: axum routes, application context, graceful shutdown
//! - [`scheduler`]: periodic timeout of unanswered calls

#![deny(unsafe_code)]

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod fanout;
pub mod health;
pub mod metrics;
pub mod push;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod websocket;

#[cfg(test)]
mod test_support;

pub use auth::{AuthFailure, Authenticator, ConnectionInfo, JwtVerifier, UpgradeRequest};
pub use config::ServerConfig;
pub use context::AppContext;
pub use fanout::{FanoutAdapter, InstanceId};
pub use router::MessageRouter;
pub use server::ParleyServer;
pub use websocket::manager::{ConnectionLimits, ConnectionManager, LimitExceeded};
