//! # parley-calls
//!
//! One-to-one call signaling for the Parley realtime core.
//!
//! - **State machine**: [`status::transition`] is the single table of legal
//!   `(status, action)` pairs; everything else is rejected
//! - **Store**: `rusqlite` over an `r2d2` pool. Every mutation runs in a
//!   `BEGIN IMMEDIATE` transaction, which serializes writers and closes the
//!   double-dial race
//! - **Service**: [`CallService`] validates participants, persists the
//!   transition, and pushes the resulting event after commit through an
//!   [`EventSink`](parley_core::EventSink)
//! - **Directory**: [`SqliteDirectory`] answers conversation-membership and
//!   device online/offline calls from the same database
//!
//! The service owns no timers. Unanswered calls are expired by whoever calls
//! [`CallService::expire_unanswered`] or [`CallService::mark_timeout`].

#![deny(unsafe_code)]

pub mod clock;
pub mod directory;
pub mod errors;
pub mod service;
pub mod sqlite;
pub mod status;
pub mod types;

pub use clock::{Clock, SystemClock};
pub use directory::SqliteDirectory;
pub use errors::{CallError, StoreError};
pub use service::CallService;
pub use sqlite::connection::{ConnectionConfig, new_file, new_in_memory};
pub use sqlite::migrations::run_migrations;
pub use sqlite::store::CallStore;
pub use status::{CallAction, CallStatus, EndReason, Role, transition};
pub use types::{Call, SignalPayload};
