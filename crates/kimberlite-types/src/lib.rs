//! Core types shared by the Kimberlite coordination subsystem:
//! - Routable RPC identity ([`Endpoint`], [`EndpointToken`])
//! - Transaction tagging ([`Tag`], [`TaskPriority`])
//! - Commit-version bookkeeping ([`CommitVersion`], [`RequestNum`], [`ProxyId`])
//! - Recruitment-generation identity ([`LifetimeToken`], [`TerminationReason`])
//!
//! These are deliberately thin: the coordination crate (`kimberlite-coord`)
//! owns all behavior, this crate owns only the identifiers that cross its
//! module boundaries and would otherwise be duplicated.

use std::fmt::{self, Debug, Display};
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ============================================================================
// Endpoint identity
// ============================================================================

/// Stable 64-bit token identifying one incarnation of a routable endpoint.
///
/// When the underlying address disappears and later comes back up, the
/// transport mints a new token for the new incarnation; a token is never
/// reused. Equality and hashing on [`Endpoint`] is defined purely in terms
/// of this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointToken(u64);

impl EndpointToken {
    pub fn new(token: u64) -> Self {
        Self(token)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for EndpointToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for EndpointToken {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A routable endpoint for one logical RPC.
///
/// Declared at process startup and invalidated on process exit, which the
/// failure monitor observes as the endpoint transitioning to `failed` and
/// never recovering under its old token (see [`EndpointToken`]).
#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    addr: SocketAddr,
    token: EndpointToken,
}

impl Endpoint {
    pub fn new(addr: SocketAddr, token: EndpointToken) -> Self {
        Self { addr, token }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn token(&self) -> EndpointToken {
        self.token
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
    }
}

impl Eq for Endpoint {}

impl std::hash::Hash for Endpoint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.token.hash(state);
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.token, self.addr)
    }
}

// ============================================================================
// Transaction tags
// ============================================================================

/// A short opaque byte string attached to a transaction for rate-limiting.
///
/// Cloning a `Tag` is an `Arc` bump, not a byte copy, since the same tag is
/// looked up repeatedly (once per throttled request) and held as a map key
/// for the lifetime of its queue.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(Arc<[u8]>);

impl Tag {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Self(Arc::from(value.as_bytes()))
    }
}

impl From<String> for Tag {
    fn from(value: String) -> Self {
        Self(Arc::from(value.into_bytes().into_boxed_slice()))
    }
}

impl Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "Tag({s:?})"),
            Err(_) => write!(f, "Tag({:?})", self.0),
        }
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{s}"),
            Err(_) => write!(f, "{:02x?}", self.0),
        }
    }
}

/// Priority class of a read-version request.
///
/// `Immediate` bypasses the tag throttler entirely and must never be
/// observed inside a `TagQueue` (see `kimberlite_coord::tag_throttler`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskPriority {
    Batch,
    Default,
    Immediate,
}

impl TaskPriority {
    /// Whether this priority is admitted into a `TagThrottler` queue at all.
    pub fn is_throttled(self) -> bool {
        !matches!(self, TaskPriority::Immediate)
    }
}

impl Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskPriority::Batch => "batch",
            TaskPriority::Default => "default",
            TaskPriority::Immediate => "immediate",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Commit-proxy / version identity
// ============================================================================

/// Identifies one registered commit proxy within a recovery generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProxyId(u64);

impl ProxyId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proxy-{}", self.0)
    }
}

impl From<u64> for ProxyId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A per-proxy, strictly increasing sequence number for `getCommitVersion`
/// requests. `u64` is sufficient because a recovery generation is always
/// short-lived relative to `u64::MAX` requests (see `spec.md` §8 boundary
/// cases); wraparound within one generation is a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestNum(u64);

impl RequestNum {
    pub const ZERO: RequestNum = RequestNum(0);

    pub fn new(n: u64) -> Self {
        Self(n)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The next request number, or `None` on the `u64` wraparound that
    /// §8 says must be detected and rejected rather than silently wrapped.
    pub fn checked_next(self) -> Option<RequestNum> {
        self.0.checked_add(1).map(RequestNum)
    }
}

impl Display for RequestNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A commit or read version: a logical timestamp assigned by the version
/// coordinator. Mirrors FoundationDB's signed version space so that
/// `INVALID` (the not-yet-initialized sentinel) is representable without
/// an `Option` wrapper threaded through every comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitVersion(i64);

impl CommitVersion {
    /// Sentinel meaning "never assigned"; strictly less than every real version.
    pub const INVALID: CommitVersion = CommitVersion(-1);

    pub fn new(v: i64) -> Self {
        Self(v)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    pub fn saturating_add(self, delta: i64) -> Self {
        Self(self.0.saturating_add(delta))
    }
}

impl Display for CommitVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "<invalid>")
        }
    }
}

impl Default for CommitVersion {
    fn default() -> Self {
        Self::INVALID
    }
}

// ============================================================================
// Recruitment generation identity
// ============================================================================

/// Identifies one recruitment generation (epoch) of the cluster's
/// coordination roles. A `VersionCoordinator` is bound to exactly one
/// `LifetimeToken` for its entire life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LifetimeToken(u64);

impl LifetimeToken {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Whether `self` still matches the cluster's currently published
    /// generation identity `current`. A mismatch means a new generation
    /// has taken over and `self`'s owner must terminate cooperatively.
    pub fn matches(self, current: LifetimeToken) -> bool {
        self == current
    }
}

impl Display for LifetimeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen-{}", self.0)
    }
}

/// Why a generation-bound task stopped cooperating with its
/// `LifetimeToken`. Distinguishes an orderly handover from a fault, so
/// callers can decide whether to log at `info` or `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TerminationReason {
    /// A newer generation was published; this one steps aside.
    Superseded,
    /// This generation gave up on its own (watchdog, unrecoverable I/O).
    FatalFault,
}

impl Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::Superseded => write!(f, "superseded"),
            TerminationReason::FatalFault => write!(f, "fatal fault"),
        }
    }
}

impl From<u64> for LifetimeToken {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_equality_is_token_only() {
        let a1: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let a2: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let e1 = Endpoint::new(a1, EndpointToken::new(7));
        let e2 = Endpoint::new(a2, EndpointToken::new(7));
        assert_eq!(e1, e2, "equality is defined on token alone");
    }

    #[test]
    fn commit_version_invalid_is_less_than_any_real_version() {
        assert!(CommitVersion::INVALID < CommitVersion::new(0));
        assert!(!CommitVersion::INVALID.is_valid());
        assert!(CommitVersion::new(42).is_valid());
    }

    #[test]
    fn request_num_wraparound_is_detected() {
        let max = RequestNum::new(u64::MAX);
        assert_eq!(max.checked_next(), None);
        assert_eq!(RequestNum::ZERO.checked_next(), Some(RequestNum::new(1)));
    }

    #[test]
    fn tag_display_round_trips_utf8() {
        let t = Tag::from("sampleTag");
        assert_eq!(t.to_string(), "sampleTag");
    }

    #[test]
    fn immediate_priority_is_not_throttled() {
        assert!(!TaskPriority::Immediate.is_throttled());
        assert!(TaskPriority::Batch.is_throttled());
        assert!(TaskPriority::Default.is_throttled());
    }

    #[test]
    fn lifetime_token_matches_is_equality() {
        let a = LifetimeToken::new(1);
        let b = LifetimeToken::new(1);
        let c = LifetimeToken::new(2);
        assert!(a.matches(b));
        assert!(!a.matches(c));
    }

    #[test]
    fn termination_reason_displays_distinctly() {
        assert_eq!(TerminationReason::Superseded.to_string(), "superseded");
        assert_eq!(TerminationReason::FatalFault.to_string(), "fatal fault");
    }
}
