//! Ring-timeout sweeper.
//!
//! The call service holds no timers. This task periodically asks it to time
//! out every call that has been ringing longer than the ring timeout.

use std::time::Duration;

use parley_calls::CallService;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodically expires unanswered calls.
pub struct RingTimeoutSweeper {
    calls: CallService,
    ring_timeout: Duration,
    interval: Duration,
}

impl RingTimeoutSweeper {
    /// Time out calls ringing longer than `ring_timeout`, checking every `interval`.
    pub fn new(calls: CallService, ring_timeout: Duration, interval: Duration) -> Self {
        Self {
            calls,
            ring_timeout,
            interval,
        }
    }

    /// Expire overdue calls now. Returns how many were timed out.
    pub async fn sweep(&self) -> usize {
        match self.calls.expire_unanswered(self.ring_timeout).await {
            Ok(expired) => {
                for call in &expired {
                    info!(call_id = %call.id, caller = %call.caller_id, callee = %call.callee_id, "call timed out");
                }
                expired.len()
            }
            Err(error) => {
                warn!(%error, "ring timeout sweep failed");
                0
            }
        }
    }

    /// Sweep every interval until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let _ = ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.sweep().await;
                }
                () = cancel.cancelled() => {
                    debug!("ring timeout sweeper stopped");
                    return;
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) on the runtime.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
