//! Plain atomic counters for the three coordination engines.
//!
//! No exposition format is implemented here (that stays a Non-goal) —
//! this mirrors how `kimberlite-vsr::instrumentation` separates raw
//! counter storage from its OTel/Prometheus export layer, scaled down to
//! the handful of counters this crate's engines actually produce.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared counter block. Cheap to clone (an `Arc` of atomics); hand one
/// clone to each engine instance that should report into the same
/// totals, or give each engine its own for isolated counts.
#[derive(Debug, Clone, Default)]
pub struct CoordMetrics {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    requests_hedged: AtomicU64,
    requests_retried: AtomicU64,
    versions_allocated: AtomicU64,
    tag_throttle_releases: AtomicU64,
}

impl CoordMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A second request was sent to race the first (`spec.md` §4.4).
    pub fn record_hedge_sent(&self) {
        self.inner.requests_hedged.fetch_add(1, Ordering::Relaxed);
    }

    /// A load-balanced call retried against a different alternative after
    /// a retriable failure.
    pub fn record_retry(&self) {
        self.inner.requests_retried.fetch_add(1, Ordering::Relaxed);
    }

    /// `VersionCoordinator::get_commit_version` minted a fresh version
    /// (as opposed to replaying a cached one).
    pub fn record_version_allocated(&self) {
        self.inner.versions_allocated.fetch_add(1, Ordering::Relaxed);
    }

    /// `TagThrottler::release_transactions` admitted a request.
    pub fn record_tag_throttle_release(&self) {
        self.inner
            .tag_throttle_releases
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_hedged(&self) -> u64 {
        self.inner.requests_hedged.load(Ordering::Relaxed)
    }

    pub fn requests_retried(&self) -> u64 {
        self.inner.requests_retried.load(Ordering::Relaxed)
    }

    pub fn versions_allocated(&self) -> u64 {
        self.inner.versions_allocated.load(Ordering::Relaxed)
    }

    pub fn tag_throttle_releases(&self) -> u64 {
        self.inner.tag_throttle_releases.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let metrics = CoordMetrics::new();
        assert_eq!(metrics.requests_hedged(), 0);
        metrics.record_hedge_sent();
        metrics.record_hedge_sent();
        assert_eq!(metrics.requests_hedged(), 2);
    }

    #[test]
    fn clones_share_the_same_counters() {
        let metrics = CoordMetrics::new();
        let shared = metrics.clone();
        shared.record_version_allocated();
        assert_eq!(metrics.versions_allocated(), 1);
    }
}
