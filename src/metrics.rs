// metrics.rs - Explicit metrics registry
//
// Counters are threaded through construction (service, broadcaster, engine)
// instead of living in a global singleton, so tests and embedders can hold
// isolated registries.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared atomic counters for one replication deployment.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub ops_pushed: AtomicU64,
    pub ops_pulled: AtomicU64,
    pub conflicts_detected: AtomicU64,
    pub pushes_deduplicated: AtomicU64,
    pub events_broadcast: AtomicU64,
    pub events_dropped: AtomicU64,
    pub subscribers_evicted: AtomicU64,
    pub sync_cycles: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ops_pushed: self.ops_pushed.load(Ordering::Relaxed),
            ops_pulled: self.ops_pulled.load(Ordering::Relaxed),
            conflicts_detected: self.conflicts_detected.load(Ordering::Relaxed),
            pushes_deduplicated: self.pushes_deduplicated.load(Ordering::Relaxed),
            events_broadcast: self.events_broadcast.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            subscribers_evicted: self.subscribers_evicted.load(Ordering::Relaxed),
            sync_cycles: self.sync_cycles.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters, serializable for /v1/stats.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub ops_pushed: u64,
    pub ops_pulled: u64,
    pub conflicts_detected: u64,
    pub pushes_deduplicated: u64,
    pub events_broadcast: u64,
    pub events_dropped: u64,
    pub subscribers_evicted: u64,
    pub sync_cycles: u64,
}

/// Bumps a counter by one.
pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Bumps a counter by `n`.
pub(crate) fn incr_by(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let metrics = SyncMetrics::new();
        incr(&metrics.ops_pushed);
        incr_by(&metrics.ops_pulled, 3);
        let snap = metrics.snapshot();
        assert_eq!(snap.ops_pushed, 1);
        assert_eq!(snap.ops_pulled, 3);
        assert_eq!(snap.conflicts_detected, 0);
    }
}
