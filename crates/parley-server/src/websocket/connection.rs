//! One registered device socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use parley_core::{Claims, ConnectionId, DeviceId, ServerEvent, UserId};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A frame queued for the socket writer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized JSON text frame.
    Text(Arc<String>),
    /// Protocol-level ping.
    Ping,
    /// Close the socket with a code and reason, then stop writing.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
}

/// A connected device.
///
/// The socket itself lives in the session task; this handle only holds the
/// outbound queue, so the registry never touches socket I/O.
pub struct Connection {
    /// Unique per socket, so a replaced device can be told apart from its successor.
    pub id: ConnectionId,
    /// Device this socket belongs to.
    pub device_id: DeviceId,
    /// Authenticated owner.
    pub user_id: UserId,
    /// Verified token claims.
    pub claims: Claims,
    /// Epoch millis at registration.
    pub connected_at: i64,
    last_pong: Mutex<Instant>,
    tx: mpsc::Sender<Outbound>,
    open: AtomicBool,
    closed: CancellationToken,
    close_reason: Mutex<Option<(u16, String)>>,
    dropped_messages: AtomicU64,
}

impl Connection {
    /// Create an open connection that writes into `tx`.
    pub fn new(user_id: UserId, device_id: DeviceId, claims: Claims, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: ConnectionId::new(),
            device_id,
            user_id,
            claims,
            connected_at: parley_core::now_millis(),
            last_pong: Mutex::new(Instant::now()),
            tx,
            open: AtomicBool::new(true),
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Whether the connection still accepts frames.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Enqueue a text frame without waiting.
    ///
    /// Returns `false` if the connection is closed or its queue is full.
    pub fn send_text(&self, text: Arc<String>) -> bool {
        self.enqueue(Outbound::Text(text))
    }

    /// Serialize and enqueue an event.
    pub fn send_event(&self, event: &ServerEvent) -> bool {
        match event.to_json() {
            Ok(json) => self.send_text(Arc::new(json)),
            Err(e) => {
                warn!(event_type = %event.event_type, error = %e, "failed to serialize event");
                false
            }
        }
    }

    /// Enqueue a protocol ping.
    pub fn ping(&self) -> bool {
        self.enqueue(Outbound::Ping)
    }

    /// Stop accepting frames, queue a close frame, and wake the session.
    /// Only the first call has any effect.
    pub fn close(&self, code: u16, reason: &str) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        *self.close_reason.lock() = Some((code, reason.to_string()));
        let _ = self.tx.try_send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        self.closed.cancel();
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Code and reason of the first [`close`](Self::close), if any.
    pub fn close_reason(&self) -> Option<(u16, String)> {
        self.close_reason.lock().clone()
    }

    /// Record liveness (pong, ping or heartbeat received).
    pub fn mark_alive(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    /// Time since the last liveness signal (or since connecting).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Frames dropped because the queue was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    fn enqueue(&self, frame: Outbound) -> bool {
        if !self.open.load(Ordering::Acquire) {
            return false;
        }
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}
