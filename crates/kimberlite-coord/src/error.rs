//! Error taxonomy for the coordination subsystem.

use kimberlite_types::{Endpoint, ProxyId, TerminationReason};
use thiserror::Error;

/// Result type used throughout this crate.
pub type CoordResult<T> = Result<T, CoordError>;

/// Errors raised by a transport attempt (`RequestStream::try_get_reply`).
///
/// These are reported by the caller-supplied `send` closure, not
/// constructed internally; [`RequestData`](crate::request_data::RequestData)
/// classifies them per the reply classification matrix.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// The connection was dropped before any reply was observed.
    #[error("broken promise")]
    BrokenPromise,

    /// The request may have been applied on the remote side; retrying is
    /// unsafe under `at_most_once`.
    #[error("request maybe delivered")]
    RequestMaybeDelivered,

    /// The remote endpoint is shedding load.
    #[error("server overloaded")]
    ServerOverloaded,

    /// The remote endpoint is ahead of the version the requester holds.
    #[error("future version")]
    FutureVersion,

    /// The remote endpoint has fallen behind and cannot serve the request.
    #[error("process behind")]
    ProcessBehind,

    /// The remote process is being told to restart; escapes retry wrapping
    /// unchanged.
    #[error("please reboot")]
    PleaseReboot,

    /// As `PleaseReboot`, but the process should also delete its local data.
    #[error("please reboot and delete")]
    PleaseRebootDelete,

    /// Any other inner error carried by the reply; surfaced immediately.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn is_maybe_delivered(&self) -> bool {
        matches!(
            self,
            TransportError::BrokenPromise | TransportError::RequestMaybeDelivered
        )
    }
}

/// Errors surfaced by the three coordination engines.
#[derive(Debug, Error, Clone)]
pub enum CoordError {
    /// Every alternative in a non-fresh set was observed failed and the
    /// debounced grace period elapsed; the caller should refresh its set.
    #[error("all alternatives failed")]
    AllAlternativesFailed,

    /// The request may have reached the remote side; safe to retry was
    /// not possible under `at_most_once`.
    #[error("request maybe delivered")]
    RequestMaybeDelivered,

    /// Surfaced only after every alternative has been attempted once in
    /// the current pass.
    #[error("process behind")]
    ProcessBehind,

    /// A proxy issued a `getCommitVersion` request outside its generation's
    /// registered set.
    #[error("proxy {0} is not registered in the current generation")]
    UnregisteredProxy(ProxyId),

    /// A proxy's `requestNum` sequence would exceed what a `u64` counter can
    /// represent within this generation. Generations are assumed short
    /// enough that this never legitimately fires (`spec.md` §8 boundary
    /// case); the proxy is rejected rather than silently wrapped.
    #[error("proxy {0} request_num sequence exhausted (u64 wraparound)")]
    RequestNumWraparound(ProxyId),

    /// The generation this coordinator was bound to has been replaced.
    #[error("coordinator lifetime terminated ({reason}): {detail}")]
    LifetimeTerminated {
        reason: TerminationReason,
        detail: &'static str,
    },

    /// An inner error carried by a delivered reply that does not fit any
    /// retriable category.
    #[error("remote error: {0}")]
    Remote(String),

    /// A request passed `TaskPriority::Immediate` into the tag throttler,
    /// which must never happen (immediate priority bypasses admission
    /// control entirely).
    #[error("immediate-priority request reached the tag throttler")]
    ImmediatePriorityThrottled,

    #[error("transport error from {endpoint}: {source}")]
    Transport {
        endpoint: Endpoint,
        #[source]
        source: TransportError,
    },
}

impl From<TransportError> for CoordError {
    fn from(err: TransportError) -> Self {
        CoordError::Remote(err.to_string())
    }
}
