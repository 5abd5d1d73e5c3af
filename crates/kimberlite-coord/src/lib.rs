//! Load-balanced RPC dispatch, master-side version coordination, and
//! transaction-tag admission control.
//!
//! This crate is the concurrency core shared by commit proxies, GRV
//! proxies, and the cluster master: the part of the system that decides
//! *which* replica to call and *when* to retry ([`load_balancer`],
//! [`failure_monitor`], [`queue_model`], [`request_data`]), *which*
//! commit version a transaction gets ([`version_coordinator`]), and
//! *whether* a read-version request is admitted right now
//! ([`tag_throttler`]). It owns no network codec, no durable storage, and
//! no query planning — those live in sibling crates.
//!
//! All time-dependent behavior is threaded through [`clock::NetworkClock`]
//! rather than read from the wall clock directly, so the whole crate is
//! deterministically testable under [`clock::ManualClock`].

pub mod clock;
pub mod constants;
pub mod error;
pub mod failure_monitor;
pub mod load_balancer;
pub mod metrics;
pub mod queue_model;
pub mod request_data;
pub mod tag_throttler;
pub mod version_coordinator;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use clock::{ManualClock, NetworkClock, SharedClock, TokioClock};
pub use error::{CoordError, CoordResult, TransportError};
pub use failure_monitor::{EndpointState, FailureMonitor};
pub use load_balancer::{load_balance, AlternativesSet, LoadBalancerTunables};
pub use metrics::CoordMetrics;
pub use queue_model::{ModelHolder, QueueModel};
pub use request_data::{wait_backoff, LoadBalancedReply, Outcome, RequestData};
pub use tag_throttler::{ReleasedRequest, Sequence, TagThrottler};
pub use version_coordinator::{
    GetCommitVersionReply, GetRawCommittedVersionReply, ReportRawCommittedVersionRequest,
    UpdateRecoveryDataRequest, VersionCoordinator,
};
