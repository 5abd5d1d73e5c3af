//! The network clock: the one piece of ambient state every component in
//! this crate receives explicitly rather than reaching for a global.
//!
//! `spec.md` §9 calls out `g_network` as global mutable state in the
//! source and says to model it as an explicitly-passed context object
//! instead of a singleton. [`NetworkClock`] is that object.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;

/// Monotonic-within-a-process-run wall clock plus the two suspension
/// primitives every component needs: a plain delay and a jittered delay
/// (used for the non-fresh all-alternatives-failed backoff in
/// [`crate::load_balancer`]).
#[async_trait]
pub trait NetworkClock: Send + Sync {
    /// Seconds since an unspecified epoch, monotonic for the life of the
    /// clock. Only deltas between calls are meaningful.
    fn now(&self) -> f64;

    /// Suspend the calling task for `secs` seconds.
    async fn delay(&self, secs: f64);

    /// Suspend for a uniformly jittered duration in `[secs * 0.5, secs]`,
    /// matching the debounce-style jitter used by FDB's `delayJittered`.
    async fn delay_jittered(&self, secs: f64) {
        let jittered = if secs <= 0.0 {
            0.0
        } else {
            let mut rng = rand::thread_rng();
            rng.gen_range((secs * 0.5)..=secs)
        };
        self.delay(jittered).await;
    }
}

/// Production clock backed by the system clock and the tokio timer wheel.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl NetworkClock for TokioClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the unix epoch")
            .as_secs_f64()
    }

    async fn delay(&self, secs: f64) {
        if secs > 0.0 {
            tokio::time::sleep(std::time::Duration::from_secs_f64(secs)).await;
        } else {
            tokio::task::yield_now().await;
        }
    }
}

/// A virtual clock for deterministic tests. `now()` is driven explicitly
/// by [`ManualClock::advance`] rather than the wall clock; `delay` polls
/// until the target time has been reached, so tests combine this with
/// `tokio::time::pause()` or an explicit `advance` call from the driving
/// task.
#[derive(Debug, Clone)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            micros: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Move the clock forward by `secs` seconds.
    pub fn advance(&self, secs: f64) {
        let delta = (secs * 1_000_000.0).round() as u64;
        self.micros.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkClock for ManualClock {
    fn now(&self) -> f64 {
        self.micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }

    async fn delay(&self, secs: f64) {
        let target = self.now() + secs;
        while self.now() < target {
            tokio::task::yield_now().await;
        }
    }
}

/// Convenience alias for the shared-ownership form every component stores.
pub type SharedClock = Arc<dyn NetworkClock>;
