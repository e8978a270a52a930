//! Periodic liveness sweeps.
//!
//! Each tick, connections that have been silent longer than the idle
//! timeout are closed with 1001; everyone else gets a protocol ping. A pong,
//! a `ping` frame or a `heartbeat` frame counts as a sign of life. Closing
//! wakes the connection's session, which then runs the same close path as a
//! client-initiated disconnect.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parley_core::close_code;
use parley_core::metric::LIVENESS_EVICTIONS_TOTAL;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::manager::ConnectionManager;

/// Result of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections closed for inactivity.
    pub evicted: usize,
    /// Connections pinged.
    pub pinged: usize,
}

/// Pings live connections and evicts idle ones.
pub struct LivenessMonitor {
    connections: Arc<ConnectionManager>,
    interval: Duration,
    idle_timeout: Duration,
}

impl LivenessMonitor {
    /// Create a monitor over `connections`.
    pub fn new(connections: Arc<ConnectionManager>, interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            connections,
            interval,
            idle_timeout,
        }
    }

    /// Run one sweep now.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for conn in self.connections.get_all() {
            let idle = conn.last_pong_elapsed();
            if idle > self.idle_timeout {
                info!(
                    user_id = %conn.user_id,
                    device_id = %conn.device_id,
                    idle_secs = idle.as_secs(),
                    "evicting idle connection"
                );
                conn.close(close_code::GOING_AWAY, "heartbeat timeout");
                counter!(LIVENESS_EVICTIONS_TOTAL).increment(1);
                report.evicted += 1;
            } else if conn.ping() {
                report.pinged += 1;
            }
        }
        if report.evicted > 0 || report.pinged > 0 {
            debug!(evicted = report.evicted, pinged = report.pinged, "liveness sweep");
        }
        report
    }

    /// Sweep every interval until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        let _ = ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.sweep();
                }
                () = cancel.cancelled() => {
                    debug!("liveness monitor stopped");
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
