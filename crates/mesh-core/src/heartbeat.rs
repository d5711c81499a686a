use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::pool::ConnectionPool;

/// Periodic driver for liveness checks. Every tick it pushes a
/// `CheckHeartbeat` command to each pooled connection; the workers are
/// the only place timeouts are actually observed, so no peer state is
/// ever read from this task.
pub struct HeartbeatMonitor {
    task: JoinHandle<()>,
}

impl HeartbeatMonitor {
    pub fn spawn(pool: Arc<ConnectionPool>, interval: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for peer in pool.all() {
                    peer.check_heartbeat();
                }
            }
        });
        debug!(interval_ms = interval.as_millis() as u64, "Heartbeat monitor started");
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
