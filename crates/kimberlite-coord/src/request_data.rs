//! One in-flight replica attempt's state machine (`spec.md` §4.3).

use std::future::Future;
use std::time::Duration;

use kimberlite_types::{Endpoint, EndpointToken};

use crate::clock::NetworkClock;
use crate::error::TransportError;
use crate::queue_model::{ModelHolder, QueueModel};

/// A reply that carries an optional server-declared self-penalty. Request
/// types served through the load balancer implement this so `RequestData`
/// can feed the penalty back into the queue model.
///
/// The default penalty is `1.0`: per `spec.md` §9's open question, a reply
/// that lacks a `LoadBalancedReply` header but carries a non-error payload
/// is treated as an ordinary success with the default penalty, for every
/// request type this crate serves.
pub trait LoadBalancedReply {
    fn penalty(&self) -> f64 {
        1.0
    }
}

/// Outcome of classifying one delivered (or failed) attempt.
#[derive(Debug)]
pub enum Outcome<Rep> {
    Delivered(Rep),
    Retriable,
    Fatal(TransportError),
    MaybeDelivered,
    FutureVersion,
    ProcessBehind,
}

/// State machine for one attempt against one [`Endpoint`].
///
/// Lifecycle: `setup -> (delay?) -> sent -> (reply | cancel | lagging)`.
/// If the attempt is dropped after being sent but before its result was
/// processed, [`RequestData::into_lagging`] detaches it into the model's
/// background collection so accounting still nets to zero; a plain
/// [`Drop`] before send has nothing to reconcile.
pub struct RequestData<Rep> {
    endpoint: Endpoint,
    model_holder: Option<ModelHolder>,
    request_started: bool,
    request_processed: bool,
    tried_all_options: bool,
    _marker: std::marker::PhantomData<Rep>,
}

impl<Rep> RequestData<Rep> {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            model_holder: None,
            request_started: false,
            request_processed: false,
            tried_all_options: false,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn tried_all_options(&self) -> bool {
        self.tried_all_options
    }

    /// Begin the attempt. If `backoff` is positive, the caller must have
    /// already awaited that delay before calling this (the `ModelHolder`
    /// is only acquired once the send actually happens, so backed-off
    /// attempts don't pollute the model with premature bookkeeping).
    pub fn start_request(
        &mut self,
        model: Option<&QueueModel>,
        clock: &dyn NetworkClock,
        tried_all_options: bool,
    ) {
        self.tried_all_options = tried_all_options;
        self.request_started = true;
        if let Some(model) = model {
            self.model_holder = Some(ModelHolder::acquire(
                model.clone(),
                self.endpoint.token(),
                clock.now(),
            ));
        }
    }

    /// Classify a transport result into an [`Outcome`], folding the
    /// outcome back into the queue model via the held `ModelHolder`.
    pub fn check_and_process_result(
        &mut self,
        result: Result<Rep, TransportError>,
        at_most_once: bool,
        clock: &dyn NetworkClock,
    ) -> Outcome<Rep>
    where
        Rep: LoadBalancedReply,
    {
        self.request_processed = true;
        let mut holder = self.model_holder.take();

        let outcome = match result {
            Ok(reply) => {
                let penalty = reply.penalty();
                if let Some(h) = holder.as_mut() {
                    h.release(clock, Some(0.0), penalty, true, false);
                }
                return Outcome::Delivered(reply);
            }
            Err(e) if e.is_maybe_delivered() => {
                if at_most_once {
                    Outcome::MaybeDelivered
                } else {
                    Outcome::Retriable
                }
            }
            Err(TransportError::ServerOverloaded) => Outcome::Retriable,
            Err(TransportError::FutureVersion) => Outcome::FutureVersion,
            Err(TransportError::ProcessBehind) => {
                if self.tried_all_options {
                    Outcome::ProcessBehind
                } else {
                    Outcome::Retriable
                }
            }
            Err(other) => Outcome::Fatal(other),
        };

        if let Some(h) = holder.as_mut() {
            let future_version = matches!(outcome, Outcome::FutureVersion);
            h.release(clock, None, 1.0, false, future_version);
        }
        outcome
    }

    /// Detach into a lagging request: the caller no longer awaits this
    /// attempt's reply, but `reply_future`'s eventual resolution must
    /// still fold back into the model so `smooth_outstanding` nets to
    /// zero. No-op if the attempt never acquired a `ModelHolder` (it
    /// hadn't started, or already finished).
    pub fn into_lagging<F>(mut self, reply_future: F)
    where
        Rep: LoadBalancedReply + Send + 'static,
        F: Future<Output = Result<Rep, TransportError>> + Send + 'static,
    {
        let Some(holder) = self.model_holder.take() else {
            return;
        };
        if self.request_processed {
            return;
        }
        holder.into_lagging(async move {
            let mut holder = holder;
            match reply_future.await {
                Ok(reply) => holder.release(&crate::clock::TokioClock, Some(0.0), reply.penalty(), true, false),
                Err(e) => {
                    let future_version = matches!(e, TransportError::FutureVersion);
                    holder.release(&crate::clock::TokioClock, None, 1.0, false, future_version);
                }
            }
        });
    }

    /// Whether this attempt has been sent but not yet classified — the
    /// condition under which dropping it should instead call
    /// `into_lagging`.
    pub fn needs_lagging_detach(&self) -> bool {
        self.request_started && !self.request_processed && self.model_holder.is_some()
    }
}

/// Compute the delay before the hedge/retry send, or zero for an
/// unconditional immediate send. Exposed standalone so `load_balancer`
/// can schedule it with `tokio::time::sleep` without threading a whole
/// `RequestData` through the delay.
pub async fn wait_backoff(clock: &dyn NetworkClock, backoff: Duration) {
    if !backoff.is_zero() {
        clock.delay(backoff.as_secs_f64()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use kimberlite_types::EndpointToken;
    use std::net::SocketAddr;
    use test_case::test_case;

    #[derive(Debug)]
    struct TestReply {
        penalty: f64,
    }

    impl LoadBalancedReply for TestReply {
        fn penalty(&self) -> f64 {
            self.penalty
        }
    }

    fn endpoint() -> Endpoint {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        Endpoint::new(addr, EndpointToken::new(9))
    }

    #[test]
    fn success_without_model_is_delivered() {
        let clock = ManualClock::new();
        let mut rd = RequestData::<TestReply>::new(endpoint());
        rd.start_request(None, &clock, false);
        let outcome = rd.check_and_process_result(Ok(TestReply { penalty: 1.0 }), false, &clock);
        assert!(matches!(outcome, Outcome::Delivered(_)));
    }

    #[test]
    fn broken_promise_is_retriable_unless_at_most_once() {
        let clock = ManualClock::new();
        let mut rd = RequestData::<TestReply>::new(endpoint());
        rd.start_request(None, &clock, false);
        let outcome = rd.check_and_process_result(Err(TransportError::BrokenPromise), false, &clock);
        assert!(matches!(outcome, Outcome::Retriable));

        let mut rd = RequestData::<TestReply>::new(endpoint());
        rd.start_request(None, &clock, false);
        let outcome = rd.check_and_process_result(Err(TransportError::BrokenPromise), true, &clock);
        assert!(matches!(outcome, Outcome::MaybeDelivered));
    }

    #[test]
    fn process_behind_surfaces_only_after_all_options_tried() {
        let clock = ManualClock::new();
        let mut rd = RequestData::<TestReply>::new(endpoint());
        rd.start_request(None, &clock, false);
        let outcome = rd.check_and_process_result(Err(TransportError::ProcessBehind), false, &clock);
        assert!(matches!(outcome, Outcome::Retriable));

        let mut rd = RequestData::<TestReply>::new(endpoint());
        rd.start_request(None, &clock, true);
        let outcome = rd.check_and_process_result(Err(TransportError::ProcessBehind), false, &clock);
        assert!(matches!(outcome, Outcome::ProcessBehind));
    }

    #[test]
    fn other_inner_error_is_fatal() {
        let clock = ManualClock::new();
        let mut rd = RequestData::<TestReply>::new(endpoint());
        rd.start_request(None, &clock, false);
        let outcome =
            rd.check_and_process_result(Err(TransportError::PleaseReboot), false, &clock);
        assert!(matches!(outcome, Outcome::Fatal(TransportError::PleaseReboot)));
    }

    // Table-driven coverage of the reply classification matrix (`spec.md`
    // §4.3): one row per `(error, at_most_once, tried_all_options)` input,
    // asserting the outcome each combination must classify to.
    #[test_case(TransportError::BrokenPromise, false, false => matches Outcome::Retriable; "broken promise retries when not at-most-once")]
    #[test_case(TransportError::BrokenPromise, true, false => matches Outcome::MaybeDelivered; "broken promise surfaces maybe-delivered under at-most-once")]
    #[test_case(TransportError::RequestMaybeDelivered, false, false => matches Outcome::Retriable; "request maybe delivered retries when not at-most-once")]
    #[test_case(TransportError::RequestMaybeDelivered, true, false => matches Outcome::MaybeDelivered; "request maybe delivered surfaces under at-most-once")]
    #[test_case(TransportError::ServerOverloaded, false, false => matches Outcome::Retriable; "server overloaded is retriable")]
    #[test_case(TransportError::FutureVersion, false, false => matches Outcome::FutureVersion; "future version is reported distinctly")]
    #[test_case(TransportError::ProcessBehind, false, false => matches Outcome::Retriable; "process behind retries before all options tried")]
    #[test_case(TransportError::ProcessBehind, false, true => matches Outcome::ProcessBehind; "process behind surfaces after all options tried")]
    #[test_case(TransportError::PleaseReboot, false, false => matches Outcome::Fatal(TransportError::PleaseReboot); "please reboot is fatal")]
    #[test_case(TransportError::PleaseRebootDelete, false, false => matches Outcome::Fatal(TransportError::PleaseRebootDelete); "please reboot and delete is fatal")]
    fn reply_classification_matrix(
        err: TransportError,
        at_most_once: bool,
        tried_all_options: bool,
    ) -> Outcome<TestReply> {
        let clock = ManualClock::new();
        let mut rd = RequestData::<TestReply>::new(endpoint());
        rd.start_request(None, &clock, tried_all_options);
        rd.check_and_process_result(Err(err), at_most_once, &clock)
    }

    #[test]
    fn model_accounting_nets_to_zero_on_success() {
        let clock = ManualClock::new();
        let model = QueueModel::new(kimberlite_config::HedgingTunables::default(), 8);
        let mut rd = RequestData::<TestReply>::new(endpoint());
        rd.start_request(Some(&model), &clock, false);
        assert!(model.measurement(endpoint().token(), clock.now()).smooth_outstanding > 0.0);
        let _ = rd.check_and_process_result(Ok(TestReply { penalty: 1.0 }), false, &clock);
        assert_eq!(
            model.measurement(endpoint().token(), clock.now()).smooth_outstanding,
            0.0
        );
    }
}
