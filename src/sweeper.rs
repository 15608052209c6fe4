//! Background eviction of stale usage entries.
//!
//! The sweep is a tidying pass, not a correctness mechanism: an entry that
//! has expired but not yet been swept is still treated as expired by the
//! freshness check on next access. Sweeping only bounds memory growth from
//! one-shot or abandoned identities.

use crate::quota::FixedWindowQuota;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Handle owning a running sweeper task. The timer stops when the handle is
/// shut down or dropped, so the task's lifecycle is as explicit as the
/// store's.
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn the periodic sweep over `gate`'s storage.
///
/// The staleness horizon is the longest window across all configured
/// policies; sweeping on any single class's window would evict another
/// class's still-live entries early.
pub fn spawn(gate: Arc<FixedWindowQuota>, interval: Duration) -> SweeperHandle {
    let horizon = gate.policies().sweep_horizon();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = gate.storage().evict_stale(horizon);
            if evicted > 0 {
                debug!(evicted, tracked = gate.storage().len(), "swept stale quota entries");
            }
        }
    });
    SweeperHandle { task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PolicySet, QuotaPolicy, UploadGate};

    #[tokio::test]
    async fn evicts_entries_past_the_longest_window_only() {
        let policies = PolicySet::new(
            QuotaPolicy::new(5, 1000, Duration::from_millis(30)),
            QuotaPolicy::new(5, 1000, Duration::from_millis(150)),
        )
        .unwrap();
        let gate = Arc::new(FixedWindowQuota::new(policies));
        gate.check_and_consume("ip:1.2.3.4", 100, false).await;

        let sweeper = spawn(gate.clone(), Duration::from_millis(10));

        // stale for the guest window, but still inside the longest window
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(gate.storage().len(), 1);

        // past the longest window: gone
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(gate.storage().is_empty());

        sweeper.shutdown();
    }

    #[tokio::test]
    async fn shutdown_stops_the_timer() {
        let gate = Arc::new(FixedWindowQuota::new(PolicySet::default()));
        let sweeper = spawn(gate, Duration::from_millis(10));
        sweeper.shutdown();
        // nothing to assert beyond not hanging; the task is aborted
    }
}
