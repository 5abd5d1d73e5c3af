//! Two-choice load balancing with a hedged second request (`spec.md` §4.4).
//!
//! Grounded on the racing pattern in `scylla-rust-driver`'s speculative
//! execution policy (`FuturesUnordered` + a `select!` between the first
//! attempt and a delay future that, on firing, launches the hedge) and
//! generalized from "retry N times" to "pick from a set of endpoints
//! biased by a queue-length model."

use std::future::Future;
use std::pin::Pin;

use futures::future::select_all;
use kimberlite_types::{Endpoint, TaskPriority};
use rand::Rng;

use crate::clock::NetworkClock;
use crate::constants::{PENALTY_BAD_THRESHOLD, SIM_WATCHDOG_THRESHOLD_SECS, WATCHDOG_THRESHOLD_SECS};
use crate::error::{CoordError, CoordResult, TransportError};
use crate::failure_monitor::{EndpointState, FailureMonitor};
use crate::metrics::CoordMetrics;
use crate::queue_model::QueueModel;
use crate::request_data::{LoadBalancedReply, Outcome, RequestData};
use kimberlite_config::{AlternativesTunables, BackoffTunables, HedgingTunables};

/// An ordered set of interchangeable endpoints serving the same logical
/// RPC. The `count_best` prefix shares the caller's locality tier.
/// `fresh` marks whether the set is authoritative; a stale (non-fresh)
/// set that fails entirely gets a grace period before raising
/// [`CoordError::AllAlternativesFailed`], since the caller may simply not
/// have refreshed it yet.
#[derive(Debug, Clone)]
pub struct AlternativesSet {
    pub endpoints: Vec<Endpoint>,
    pub count_best: usize,
    pub fresh: bool,
}

impl AlternativesSet {
    pub fn new(endpoints: Vec<Endpoint>, count_best: usize, fresh: bool) -> Self {
        Self {
            endpoints,
            count_best,
            fresh,
        }
    }
}

/// Bundled tunables for one `load_balance` call.
#[derive(Debug, Clone)]
pub struct LoadBalancerTunables {
    pub hedging: HedgingTunables,
    pub backoff: BackoffTunables,
    pub alternatives: AlternativesTunables,
    pub watchdog_threshold_secs: f64,
}

impl Default for LoadBalancerTunables {
    fn default() -> Self {
        Self {
            hedging: HedgingTunables::default(),
            backoff: BackoffTunables::default(),
            alternatives: AlternativesTunables::default(),
            watchdog_threshold_secs: WATCHDOG_THRESHOLD_SECS,
        }
    }
}

impl LoadBalancerTunables {
    /// The same defaults, but with the tighter watchdog bound appropriate
    /// to a compressed-time test or simulation harness (`spec.md` §4.4's
    /// watchdog note: "different in simulation vs production").
    pub fn simulated() -> Self {
        Self {
            watchdog_threshold_secs: SIM_WATCHDOG_THRESHOLD_SECS,
            ..Self::default()
        }
    }
}

struct Selection {
    best: usize,
    next: Option<usize>,
}

fn select_with_model(
    endpoints: &[Endpoint],
    model: &QueueModel,
    failure_monitor: &FailureMonitor,
    now: f64,
    penalty_is_bad: bool,
    count_best: usize,
    max_bad_options: usize,
) -> Option<Selection> {
    let mut best: Option<(usize, f64)> = None;
    let mut next: Option<(usize, f64)> = None;
    let mut bad_count = 0usize;

    for (i, ep) in endpoints.iter().enumerate() {
        // Once both a best and a second (hedge) candidate are known from
        // the local prefix and the bad-endpoint count stays within
        // tolerance, stop scanning the remote tail (`LOAD_BALANCE_MAX_BAD_OPTIONS`).
        // If either condition fails, keep scanning into the remote
        // alternatives so a viable second choice is still found.
        if i == count_best && best.is_some() && next.is_some() && bad_count <= max_bad_options {
            break;
        }

        if failure_monitor.get_state(*ep) == EndpointState::Failed {
            continue;
        }
        let m = model.measurement(ep.token(), now);
        if m.failed_until > now {
            continue;
        }
        let is_bad = penalty_is_bad && m.penalty > PENALTY_BAD_THRESHOLD;
        if is_bad {
            bad_count += 1;
        }
        let outstanding = m.smooth_outstanding;

        match best {
            None => best = Some((i, outstanding)),
            Some((_, b)) if outstanding < b => {
                next = best;
                best = Some((i, outstanding));
            }
            _ => match next {
                None => next = Some((i, outstanding)),
                Some((_, n)) if outstanding < n => next = Some((i, outstanding)),
                _ => {}
            },
        }
    }

    best.map(|(b, _)| Selection {
        best: b,
        next: next.map(|(n, _)| n),
    })
}

fn select_without_model(endpoints: &[Endpoint], failure_monitor: &FailureMonitor) -> Option<Selection> {
    if endpoints.is_empty() {
        return None;
    }
    let start = rand::thread_rng().gen_range(0..endpoints.len());
    for offset in 0..endpoints.len() {
        let i = (start + offset) % endpoints.len();
        if failure_monitor.get_state(endpoints[i]) != EndpointState::Failed {
            return Some(Selection { best: i, next: None });
        }
    }
    None
}

fn compute_second_delay(
    model: &QueueModel,
    hedging: &HedgingTunables,
    best_ep: Endpoint,
    next_ep: Endpoint,
    now: f64,
) -> f64 {
    let best_latency = model.measurement(best_ep.token(), now).latency;
    let next_latency = model.measurement(next_ep.token(), now).latency;
    let biased_next = model.second_multiplier() * next_latency + hedging.base_second_request_time_secs;
    if best_latency > hedging.instant_second_request_multiplier * biased_next {
        0.0
    } else {
        biased_next
    }
}

async fn wait_for_any_healthy_or_timeout(
    alternatives: &AlternativesSet,
    failure_monitor: &FailureMonitor,
    clock: &dyn NetworkClock,
    tunables: &LoadBalancerTunables,
) -> bool {
    let waiters: Vec<Pin<Box<dyn Future<Output = ()> + Send + '_>>> = alternatives
        .endpoints
        .iter()
        .map(|ep| -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(failure_monitor.on_state_equal(*ep, EndpointState::Ok))
        })
        .collect();
    let any_healthy = select_all(waiters);

    if alternatives.fresh {
        any_healthy.await;
        true
    } else {
        let grace = rand::thread_rng().gen_range(
            tunables.alternatives.failure_min_delay_secs..=tunables.alternatives.failure_max_delay_secs,
        );
        tokio::select! {
            _ = any_healthy => true,
            _ = clock.delay(grace) => false,
        }
    }
}

/// One attempt: send to `first`, and if a hedge was selected, race it
/// against `second` once `delay` elapses. The loser of a race (if any)
/// is detached into the model's lagging collection rather than dropped
/// outright, so `smooth_outstanding` still nets to zero.
async fn attempt<Req, Rep, F, Fut>(
    first: Endpoint,
    second: Option<(Endpoint, f64)>,
    request: Req,
    send: &F,
    model: Option<&QueueModel>,
    clock: &dyn NetworkClock,
    at_most_once: bool,
    tried_all_options: bool,
    metrics: Option<&CoordMetrics>,
) -> Outcome<Rep>
where
    Req: Clone + Send,
    Rep: LoadBalancedReply + Send + 'static,
    F: Fn(Endpoint, Req) -> Fut,
    Fut: Future<Output = Result<Rep, TransportError>> + Send + 'static,
{
    let mut first_rd = RequestData::new(first);
    first_rd.start_request(model, clock, tried_all_options);
    let mut first_fut: Pin<Box<dyn Future<Output = Result<Rep, TransportError>> + Send>> =
        Box::pin(send(first, request.clone()));

    let Some((second_endpoint, delay)) = second else {
        let result = (&mut first_fut).await;
        return first_rd.check_and_process_result(result, at_most_once, clock);
    };

    let delay_fut = clock.delay(delay);
    tokio::pin!(delay_fut);

    tokio::select! {
        biased;
        result = &mut first_fut => {
            return first_rd.check_and_process_result(result, at_most_once, clock);
        }
        _ = &mut delay_fut => {}
    }

    if !model.is_none_or(|m| m.try_spend_hedge()) {
        let result = (&mut first_fut).await;
        return first_rd.check_and_process_result(result, at_most_once, clock);
    }

    if let Some(metrics) = metrics {
        metrics.record_hedge_sent();
    }
    let mut second_rd = RequestData::new(second_endpoint);
    second_rd.start_request(model, clock, tried_all_options);
    let mut second_fut: Pin<Box<dyn Future<Output = Result<Rep, TransportError>> + Send>> =
        Box::pin(send(second_endpoint, request));

    tokio::select! {
        result = &mut first_fut => {
            let outcome = first_rd.check_and_process_result(result, at_most_once, clock);
            second_rd.into_lagging(second_fut);
            outcome
        }
        result = &mut second_fut => {
            let outcome = second_rd.check_and_process_result(result, at_most_once, clock);
            first_rd.into_lagging(first_fut);
            outcome
        }
    }
}

/// Run one load-balanced RPC to completion, retrying under backoff and
/// hedging against a second alternative when the model says the first is
/// running slow.
///
/// `send` plays the role the source calls a field-selector picking the
/// `RequestStream<T>` out of an endpoint's interface: given an endpoint
/// and the (cloned) request, it returns the in-flight reply future.
pub async fn load_balance<Req, Rep, F, Fut>(
    alternatives: &AlternativesSet,
    request: Req,
    send: F,
    _priority: TaskPriority,
    at_most_once: bool,
    model: Option<QueueModel>,
    clock: &dyn NetworkClock,
    failure_monitor: &FailureMonitor,
    tunables: &LoadBalancerTunables,
    metrics: Option<&CoordMetrics>,
) -> CoordResult<Rep>
where
    Req: Clone + Send,
    Rep: LoadBalancedReply + Send + 'static,
    F: Fn(Endpoint, Req) -> Fut,
    Fut: Future<Output = Result<Rep, TransportError>> + Send + 'static,
{
    // `_priority` is part of the documented call surface (spec.md §4.4's
    // inputs list) but this crate doesn't encode wire headers; callers
    // that need it on the wire thread it into `Req` themselves.
    if alternatives.endpoints.is_empty() {
        return if alternatives.fresh {
            Err(CoordError::AllAlternativesFailed)
        } else {
            std::future::pending::<()>().await;
            unreachable!("a non-fresh, empty alternatives set never completes")
        };
    }

    let call_start = clock.now();
    let mut backoff = tunables.backoff.start_backoff_secs;
    let mut attempts_since_growth = 0usize;
    let mut tried_all_options = false;

    loop {
        if clock.now() - call_start > tunables.watchdog_threshold_secs {
            tracing::warn!(
                elapsed_secs = clock.now() - call_start,
                endpoint_count = alternatives.endpoints.len(),
                "load_balance call exceeded watchdog threshold; continuing to retry"
            );
        }

        let selection = match &model {
            Some(m) => select_with_model(
                &alternatives.endpoints,
                m,
                failure_monitor,
                clock.now(),
                tunables.backoff.penalty_is_bad,
                alternatives.count_best,
                tunables.backoff.max_bad_options,
            ),
            None => select_without_model(&alternatives.endpoints, failure_monitor),
        };

        let Some(choice) = selection else {
            if !wait_for_any_healthy_or_timeout(alternatives, failure_monitor, clock, tunables).await {
                return Err(CoordError::AllAlternativesFailed);
            }
            // A healthy endpoint just appeared after an all-failed spell;
            // don't carry the grown backoff into what is effectively a
            // fresh situation.
            backoff = tunables.backoff.start_backoff_secs;
            attempts_since_growth = 0;
            continue;
        };

        attempts_since_growth += 1;
        if attempts_since_growth >= alternatives.endpoints.len() {
            backoff = (backoff * tunables.backoff.backoff_rate).min(tunables.backoff.max_backoff_secs);
            attempts_since_growth = 0;
            tried_all_options = true;
        }

        if backoff > tunables.backoff.start_backoff_secs {
            clock.delay(backoff).await;
        }

        let first_endpoint = alternatives.endpoints[choice.best];
        let second = choice.next.and_then(|next_idx| {
            let model = model.as_ref()?;
            let next_endpoint = alternatives.endpoints[next_idx];
            let delay = compute_second_delay(model, &tunables.hedging, first_endpoint, next_endpoint, clock.now());
            Some((next_endpoint, delay))
        });

        let outcome = attempt(
            first_endpoint,
            second,
            request.clone(),
            &send,
            model.as_ref(),
            clock,
            at_most_once,
            tried_all_options,
            metrics,
        )
        .await;

        match outcome {
            Outcome::Delivered(reply) => {
                if let Some(model) = &model {
                    model.note_clean_success();
                }
                return Ok(reply);
            }
            Outcome::Fatal(e) => return Err(e.into()),
            Outcome::MaybeDelivered => return Err(CoordError::RequestMaybeDelivered),
            Outcome::ProcessBehind => return Err(CoordError::ProcessBehind),
            Outcome::Retriable | Outcome::FutureVersion => {
                if let Some(metrics) = metrics {
                    metrics.record_retry();
                }
                continue;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use kimberlite_types::EndpointToken;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    struct Reply(f64);
    impl LoadBalancedReply for Reply {
        fn penalty(&self) -> f64 {
            self.0
        }
    }

    fn endpoint(token: u64) -> Endpoint {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        Endpoint::new(addr, EndpointToken::new(token))
    }

    #[tokio::test]
    async fn single_healthy_endpoint_succeeds_immediately() {
        let clock = ManualClock::new();
        let fm = FailureMonitor::new();
        let alts = AlternativesSet::new(vec![endpoint(1)], 1, true);
        let tunables = LoadBalancerTunables::default();

        let result = load_balance(
            &alts,
            (),
            |_ep, ()| async move { Ok(Reply(1.0)) },
            TaskPriority::Default,
            false,
            None,
            &clock,
            &fm,
            &tunables,
            None,
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn empty_fresh_alternatives_fails_immediately() {
        let clock = ManualClock::new();
        let fm = FailureMonitor::new();
        let alts = AlternativesSet::new(vec![], 0, true);
        let tunables = LoadBalancerTunables::default();

        let result: CoordResult<Reply> = load_balance(
            &alts,
            (),
            |_ep, ()| async move { Ok(Reply(1.0)) },
            TaskPriority::Default,
            false,
            None,
            &clock,
            &fm,
            &tunables,
            None,
        )
        .await;
        assert!(matches!(result, Err(CoordError::AllAlternativesFailed)));
    }

    #[tokio::test]
    async fn retries_past_a_retriable_failure() {
        let clock = ManualClock::new();
        let fm = FailureMonitor::new();
        let alts = AlternativesSet::new(vec![endpoint(1)], 1, true);
        let mut tunables = LoadBalancerTunables::default();
        tunables.backoff.start_backoff_secs = 0.0;
        let calls = Arc::new(AtomicUsize::new(0));
        let metrics = CoordMetrics::new();

        let calls2 = calls.clone();
        let result = load_balance(
            &alts,
            (),
            move |_ep, ()| {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(TransportError::ServerOverloaded)
                    } else {
                        Ok(Reply(1.0))
                    }
                }
            },
            TaskPriority::Default,
            false,
            None,
            &clock,
            &fm,
            &tunables,
            Some(&metrics),
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(metrics.requests_retried(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let clock = ManualClock::new();
        let fm = FailureMonitor::new();
        let alts = AlternativesSet::new(vec![endpoint(1)], 1, true);
        let tunables = LoadBalancerTunables::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls2 = calls.clone();
        let result: CoordResult<Reply> = load_balance(
            &alts,
            (),
            move |_ep, ()| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TransportError::PleaseReboot)
                }
            },
            TaskPriority::Default,
            false,
            None,
            &clock,
            &fm,
            &tunables,
            None,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn at_most_once_surfaces_maybe_delivered_instead_of_retrying() {
        let clock = ManualClock::new();
        let fm = FailureMonitor::new();
        let alts = AlternativesSet::new(vec![endpoint(1)], 1, true);
        let tunables = LoadBalancerTunables::default();

        let result: CoordResult<Reply> = load_balance(
            &alts,
            (),
            |_ep, ()| async move { Err(TransportError::BrokenPromise) },
            TaskPriority::Default,
            true,
            None,
            &clock,
            &fm,
            &tunables,
            None,
        )
        .await;
        assert!(matches!(result, Err(CoordError::RequestMaybeDelivered)));
    }

    #[test]
    fn simulated_tunables_use_the_tighter_watchdog() {
        let sim = LoadBalancerTunables::simulated();
        let prod = LoadBalancerTunables::default();
        assert!(sim.watchdog_threshold_secs < prod.watchdog_threshold_secs);
    }

    #[test]
    fn select_with_model_stops_scanning_remotes_once_local_pair_is_healthy() {
        let model = QueueModel::new(HedgingTunables::default(), 8);
        // Two healthy locals (count_best=2) followed by a remote that would
        // otherwise win on outstanding count alone.
        let local_a = endpoint(1);
        let local_b = endpoint(2);
        let remote = endpoint(3);
        model.end_request(local_a.token(), Some(0.01), 1.0, 0.0, true, false, 0.0);
        model.end_request(local_b.token(), Some(0.01), 1.0, 0.0, true, false, 0.0);
        model.end_request(remote.token(), Some(0.01), 1.0, 0.0, true, false, 0.0);

        let fm = FailureMonitor::new();
        let selection = select_with_model(
            &[local_a, local_b, remote],
            &model,
            &fm,
            0.0,
            true,
            2,
            1,
        )
        .unwrap();
        assert_eq!(selection.best, 0);
        assert_eq!(selection.next, Some(1));
    }

    #[test]
    fn select_with_model_falls_through_to_remote_when_no_local_second_choice() {
        let model = QueueModel::new(HedgingTunables::default(), 8);
        let local_only = endpoint(1);
        let remote = endpoint(2);
        model.end_request(local_only.token(), Some(0.01), 1.0, 0.0, true, false, 0.0);
        model.end_request(remote.token(), Some(0.01), 1.0, 0.0, true, false, 0.0);

        let fm = FailureMonitor::new();
        // count_best=1: only one local alternative, so the early stop at
        // i==count_best requires `next` to already be Some, which it isn't
        // — the remote must still be considered as the hedge candidate.
        let selection = select_with_model(&[local_only, remote], &model, &fm, 0.0, true, 1, 1).unwrap();
        assert_eq!(selection.best, 0);
        assert_eq!(selection.next, Some(1));
    }

    #[test]
    fn hedge_is_instant_when_best_is_much_slower() {
        let model = QueueModel::new(HedgingTunables::default(), 8);
        let best = endpoint(1);
        let next = endpoint(2);
        // Seed latencies via end_request's EWMA.
        model.end_request(best.token(), Some(0.5), 1.0, 0.0, true, false, 0.0);
        model.end_request(next.token(), Some(0.005), 1.0, 0.0, true, false, 0.0);
        let delay = compute_second_delay(&model, &HedgingTunables::default(), best, next, 0.0);
        assert_eq!(delay, 0.0);
    }
}
