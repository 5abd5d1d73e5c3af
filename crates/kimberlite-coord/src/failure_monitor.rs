//! Per-endpoint reachability oracle (`spec.md` §4.1).
//!
//! `FailureMonitor` is consumed, not defined, by the core: production code
//! wires it to whatever liveness-ping transport the surrounding process
//! uses. This crate owns only the query/notify interface and an in-memory
//! implementation suitable both for production (fed by an external
//! reporter) and for deterministic tests (fed directly).

use std::collections::HashMap;
use std::sync::Mutex;

use kimberlite_types::{Endpoint, EndpointToken};
use tokio::sync::watch;

/// Reachability state of one endpoint token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Ok,
    Failed,
}

impl EndpointState {
    fn as_bool(self) -> bool {
        matches!(self, EndpointState::Failed)
    }
}

struct Record {
    tx: watch::Sender<bool>,
}

/// Tracks reachability per [`EndpointToken`] with edge-triggered
/// notifications. State changes are monotone only within one "generation"
/// of a token: when an address disappears and returns, the transport mints
/// a new token (see `kimberlite_types::EndpointToken`), so an old token
/// that was marked failed never recovers.
#[derive(Default)]
pub struct FailureMonitor {
    records: Mutex<HashMap<EndpointToken, Record>>,
}

impl FailureMonitor {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    fn record_for(&self, token: EndpointToken) -> watch::Receiver<bool> {
        let mut records = self.records.lock().expect("failure monitor poisoned");
        records
            .entry(token)
            .or_insert_with(|| {
                let (tx, _rx) = watch::channel(false);
                Record { tx }
            })
            .tx
            .subscribe()
    }

    /// Current reachability of `endpoint`. Unknown endpoints default to
    /// `Ok` until reported otherwise.
    pub fn get_state(&self, endpoint: Endpoint) -> EndpointState {
        let rx = self.record_for(endpoint.token());
        if *rx.borrow() {
            EndpointState::Failed
        } else {
            EndpointState::Ok
        }
    }

    /// A notification that resolves the next time `endpoint` is *observed*
    /// in `want`. If it is already in that state when called, resolves
    /// immediately — mirroring FDB's `onStateEqual`, which returns an
    /// already-set future rather than waiting for a fresh edge when the
    /// state already matches.
    pub async fn on_state_equal(&self, endpoint: Endpoint, want: EndpointState) {
        let mut rx = self.record_for(endpoint.token());
        let want = want.as_bool();
        loop {
            if *rx.borrow() == want {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped; the monitor itself is gone. Treat as a
                // terminal observation rather than hanging forever.
                return;
            }
        }
    }

    /// Report a reachability transition. Used by the production liveness
    /// reporter and directly by tests.
    pub fn report(&self, endpoint: Endpoint, state: EndpointState) {
        let mut records = self.records.lock().expect("failure monitor poisoned");
        let record = records.entry(endpoint.token()).or_insert_with(|| {
            let (tx, _rx) = watch::channel(false);
            Record { tx }
        });
        record.tx.send_if_modified(|current| {
            let new = state.as_bool();
            let changed = *current != new;
            *current = new;
            changed
        });
    }
}
