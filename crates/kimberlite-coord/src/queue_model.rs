//! Smoothed per-endpoint load model (`spec.md` §4.2).
//!
//! `QueueModel` is private to one client loop; concurrent calls from the
//! same loop serialize through the inner mutex by construction, matching
//! the "shared-resource policy" in `spec.md` §5.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kimberlite_types::EndpointToken;
use tokio::task::JoinSet;

use crate::clock::SharedClock;
use crate::constants::{FUTURE_VERSION_DEBOUNCE_SECS, MEASUREMENT_SMOOTHING_HALF_LIFE_SECS};
use kimberlite_config::HedgingTunables;

/// Smoothed load measurement for one endpoint token.
#[derive(Debug, Clone, Copy)]
pub struct Measurement {
    pub smooth_outstanding: f64,
    pub latency: f64,
    pub penalty: f64,
    pub failed_until: f64,
    last_update: f64,
}

impl Measurement {
    fn new(now: f64) -> Self {
        Self {
            smooth_outstanding: 0.0,
            latency: 0.0,
            penalty: 1.0,
            failed_until: 0.0,
            last_update: now,
        }
    }

    fn decay(&mut self, now: f64) {
        let elapsed = (now - self.last_update).max(0.0);
        if elapsed == 0.0 {
            return;
        }
        let factor = 0.5f64.powf(elapsed / MEASUREMENT_SMOOTHING_HALF_LIFE_SECS);
        self.smooth_outstanding *= factor;
        self.last_update = now;
    }
}

struct Inner {
    measurements: HashMap<EndpointToken, Measurement>,
    second_multiplier: f64,
    second_budget: f64,
    lagging: JoinSet<()>,
    lagging_count: usize,
}

/// Cheaply cloneable handle to one client's queue model. All mutation goes
/// through an internal mutex, matching `ModelHolder`'s RAII contract:
/// `add_request` is always paired with exactly one `end_request`, whichever
/// exit path the caller takes.
#[derive(Clone)]
pub struct QueueModel {
    inner: Arc<Mutex<Inner>>,
    hedging: HedgingTunables,
    max_lagging: usize,
}

impl QueueModel {
    pub fn new(hedging: HedgingTunables, max_lagging: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                measurements: HashMap::new(),
                second_multiplier: 1.0,
                second_budget: hedging.second_request_max_budget,
                lagging: JoinSet::new(),
                lagging_count: 0,
            })),
            hedging,
            max_lagging,
        }
    }

    /// Construct from the configured tunables, wiring
    /// `AlternativesTunables::max_lagging_requests_outstanding` (`spec.md`
    /// §6.3's `MAX_LAGGING_REQUESTS_OUTSTANDING`) as the lagging-collection
    /// cap. This is the constructor a real caller should use; [`QueueModel::new`]
    /// stays available for tests that want a specific cap.
    pub fn from_tunables(hedging: HedgingTunables, alternatives: &kimberlite_config::AlternativesTunables) -> Self {
        Self::new(hedging, alternatives.max_lagging_requests_outstanding)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("queue model poisoned")
    }

    /// Snapshot of the current measurement for `token`, if one has been
    /// recorded yet. Used by the load balancer's selection pass.
    pub fn measurement(&self, token: EndpointToken, now: f64) -> Measurement {
        let mut inner = self.lock();
        let m = inner
            .measurements
            .entry(token)
            .or_insert_with(|| Measurement::new(now));
        m.decay(now);
        *m
    }

    /// Record the start of a new attempt against `token`. Returns the
    /// delta added to `smooth_outstanding`, which the caller must hand
    /// back unchanged to `end_request` so the net contribution nets to
    /// zero regardless of how the attempt ends.
    pub fn add_request(&self, token: EndpointToken, now: f64) -> f64 {
        let mut inner = self.lock();
        let m = inner
            .measurements
            .entry(token)
            .or_insert_with(|| Measurement::new(now));
        m.decay(now);
        let delta = 1.0;
        m.smooth_outstanding += delta;
        delta
    }

    /// Undo `add_request`'s contribution and fold in the attempt's
    /// outcome. `clean` means the reply was observed with a directly
    /// measured latency; `future_version` debounces the endpoint briefly
    /// so the caller doesn't hammer a server that is still ahead of it.
    pub fn end_request(
        &self,
        token: EndpointToken,
        latency: Option<f64>,
        penalty: f64,
        delta: f64,
        clean: bool,
        future_version: bool,
        now: f64,
    ) {
        let mut inner = self.lock();
        let m = inner
            .measurements
            .entry(token)
            .or_insert_with(|| Measurement::new(now));
        m.decay(now);
        m.smooth_outstanding = (m.smooth_outstanding - delta).max(0.0);
        let _ = clean; // `clean` gates the caller's decision to pass a latency sample at all.
        if let Some(latency) = latency {
            let alpha = 0.5f64.powf(1.0 / MEASUREMENT_SMOOTHING_HALF_LIFE_SECS);
            m.latency = m.latency * alpha + latency * (1.0 - alpha);
        }
        m.penalty = penalty;
        if future_version {
            m.failed_until = now + FUTURE_VERSION_DEBOUNCE_SECS;
        }
    }

    /// Called on a clean success of the non-hedged first alternative:
    /// decay `second_multiplier` back toward 1.0 and let `second_budget`
    /// refill, capped.
    pub fn note_clean_success(&self) {
        let mut inner = self.lock();
        let decay = self.hedging.second_request_multiplier_decay;
        inner.second_multiplier = 1.0 + (inner.second_multiplier - 1.0) * decay;
        inner.second_budget =
            (inner.second_budget + self.hedging.second_request_budget_growth)
                .min(self.hedging.second_request_max_budget);
    }

    /// Ask to spend a hedge. Returns `false` (refusing to hedge) if the
    /// budget is exhausted; otherwise grows `second_multiplier` and spends
    /// one unit of budget.
    pub fn try_spend_hedge(&self) -> bool {
        let mut inner = self.lock();
        if inner.second_budget < 1.0 {
            return false;
        }
        inner.second_budget -= 1.0;
        inner.second_multiplier *= self.hedging.second_request_multiplier_growth;
        true
    }

    pub fn second_multiplier(&self) -> f64 {
        self.lock().second_multiplier
    }

    /// Detach a still-pending attempt into the background lagging
    /// collection. `task` resolves once the eventual reply (or its
    /// cancellation) has folded back into `end_request`; if the
    /// collection's cap is exceeded, the *entire* prior collection is
    /// cancelled and a fresh one started (`spec.md` §9's "cyclic
    /// references" note), bounding memory at the cost of losing a few
    /// stale model updates.
    pub fn add_lagging<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.lagging_count >= self.max_lagging {
            inner.lagging.abort_all();
            inner.lagging = JoinSet::new();
            inner.lagging_count = 0;
        }
        inner.lagging.spawn(task);
        inner.lagging_count += 1;
    }

    /// Number of lagging requests currently retained. Exposed for tests.
    pub fn lagging_count(&self) -> usize {
        self.lock().lagging_count
    }
}

/// RAII handle binding one [`QueueModel::add_request`] call to its
/// eventual release. Guarantees release on every exit path: normal
/// completion via [`ModelHolder::release`], or drop (treated as an
/// unmeasured, non-clean release) if the caller forgets or panics before
/// calling it explicitly.
pub struct ModelHolder {
    model: QueueModel,
    token: EndpointToken,
    delta: f64,
    released: bool,
}

impl ModelHolder {
    /// Acquire a new holder, registering the attempt with `model`.
    pub fn acquire(model: QueueModel, token: EndpointToken, now: f64) -> Self {
        let delta = model.add_request(token, now);
        Self {
            model,
            token,
            delta,
            released: false,
        }
    }

    /// Release with a fully-classified outcome. Idempotent: a second call
    /// (or the `Drop` impl firing afterward) is a no-op.
    pub fn release(
        &mut self,
        clock: &dyn crate::clock::NetworkClock,
        latency: Option<f64>,
        penalty: f64,
        clean: bool,
        future_version: bool,
    ) {
        if self.released {
            return;
        }
        self.released = true;
        self.model.end_request(
            self.token,
            latency,
            penalty,
            self.delta,
            clean,
            future_version,
            clock.now(),
        );
    }

    /// Detach this holder's eventual release into the model's lagging
    /// collection, keyed to the given future. The future is expected to
    /// itself call `end_request` (typically by resolving a cloned
    /// `ModelHolder::release` against the late reply) before completing.
    pub fn into_lagging<F>(mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.released = true; // the spawned task now owns the release.
        self.model.add_lagging(task);
    }

    pub fn token(&self) -> EndpointToken {
        self.token
    }
}

impl Drop for ModelHolder {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // No clock reachable from `Drop`; approximate "now" by reusing the
        // last recorded update time so the model still sees a net-zero
        // contribution even on an unexpected exit path (panic, early
        // return before an explicit release).
        let now = self.model.lock().measurements.get(&self.token).map_or(0.0, |m| m.last_update);
        self.model
            .end_request(self.token, None, 1.0, self.delta, false, false, now);
    }
}
