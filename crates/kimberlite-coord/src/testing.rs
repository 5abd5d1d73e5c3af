//! Shared test harness: a scripted fake transport and endpoint builders,
//! used by this crate's own unit tests and exposed (behind the `testing`
//! feature) so downstream crates can drive [`crate::load_balancer`]
//! deterministically without standing up a real transport.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kimberlite_types::{Endpoint, EndpointToken};

use crate::error::TransportError;
use crate::request_data::LoadBalancedReply;

/// Build a loopback [`Endpoint`] carrying `token`. All of this crate's
/// tests that need "some endpoint, distinguished only by token" go
/// through this rather than repeating the `SocketAddr` parse.
pub fn test_endpoint(token: u64) -> Endpoint {
    let addr: SocketAddr = "127.0.0.1:4000".parse().expect("valid loopback address");
    Endpoint::new(addr, EndpointToken::new(token))
}

/// One scripted step: a reply, a transport error, or an endpoint that
/// never responds at all (models an unresponsive replica for hedge
/// testing — the in-flight future simply never resolves).
#[derive(Clone)]
pub enum Step<Rep> {
    Reply(Rep),
    Fail(TransportError),
    Hang,
}

/// A fake transport that replays a fixed script per endpoint, looping the
/// last entry once exhausted. Pair with [`crate::load_balancer::load_balance`]
/// via its `send` closure:
///
/// ```ignore
/// let transport = ScriptedTransport::new();
/// transport.script(endpoint, vec![Step::Fail(TransportError::ServerOverloaded), Step::Reply(reply)]);
/// load_balance(&alts, (), |ep, req| transport.send(ep, req), ...).await
/// ```
#[derive(Clone, Default)]
pub struct ScriptedTransport<Rep> {
    scripts: Arc<std::sync::Mutex<std::collections::HashMap<EndpointToken, Vec<Step<Rep>>>>>,
    calls: Arc<AtomicUsize>,
}

impl<Rep: Clone + Send + 'static> ScriptedTransport<Rep> {
    pub fn new() -> Self {
        Self {
            scripts: Arc::new(std::sync::Mutex::new(std::collections::HashMap::new())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replace the script for `endpoint`. Steps are consumed front-to-back
    /// across successive calls; the final step repeats once the script
    /// runs out.
    pub fn script(&self, endpoint: Endpoint, steps: Vec<Step<Rep>>) {
        self.scripts
            .lock()
            .expect("scripted transport poisoned")
            .insert(endpoint.token(), steps);
    }

    /// Total number of `send` invocations across every endpoint so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn send(&self, endpoint: Endpoint, _request: ()) -> Result<Rep, TransportError>
    where
        Rep: LoadBalancedReply,
    {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = {
            let mut scripts = self.scripts.lock().expect("scripted transport poisoned");
            let steps = scripts
                .get_mut(&endpoint.token())
                .expect("send called against an endpoint with no script");
            if steps.len() > 1 {
                steps.remove(0)
            } else {
                steps[0].clone()
            }
        };
        match step {
            Step::Reply(rep) => Ok(rep),
            Step::Fail(err) => Err(err),
            Step::Hang => std::future::pending().await,
        }
    }
}
