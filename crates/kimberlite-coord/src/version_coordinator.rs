//! Commit-version allocation and live-committed-version tracking
//! (`spec.md` §4.5).
//!
//! One `VersionCoordinator` is bound to exactly one [`LifetimeToken`] for
//! its whole life (a recruitment generation); `spec.md` §4.5's "Lifetime"
//! subsection is implemented by [`VersionCoordinator::check_lifetime`],
//! called by callers before trusting a cached handle across a
//! generation change, mirroring the epoch/view token checks in
//! `kimberlite-vsr`'s reconfiguration handling.

use std::collections::BTreeMap;
use std::collections::HashMap;

use kimberlite_types::{CommitVersion, LifetimeToken, ProxyId, RequestNum, TerminationReason};
use tokio::sync::{watch, Mutex};

use crate::clock::SharedClock;
use crate::error::{CoordError, CoordResult};
use crate::metrics::CoordMetrics;
use kimberlite_config::VersionTunables;

/// Reply to `GetCommitVersionRequest`.
#[derive(Debug, Clone, PartialEq)]
pub struct GetCommitVersionReply {
    pub version: CommitVersion,
    pub prev_version: CommitVersion,
    pub request_num: RequestNum,
}

/// Request to `ReportRawCommittedVersion`.
#[derive(Debug, Clone)]
pub struct ReportRawCommittedVersionRequest {
    pub version: CommitVersion,
    pub prev_version: Option<CommitVersion>,
    pub min_known_committed_version: CommitVersion,
    pub locked: bool,
    pub metadata_version: Option<Vec<u8>>,
}

/// Reply to `GetRawCommittedVersionRequest`.
#[derive(Debug, Clone)]
pub struct GetRawCommittedVersionReply {
    pub version: CommitVersion,
    pub locked: bool,
    pub metadata_version: Vec<u8>,
    pub min_known_committed_version: CommitVersion,
}

/// Request to `UpdateRecoveryData`.
#[derive(Debug, Clone)]
pub struct UpdateRecoveryDataRequest {
    pub recovery_transaction_version: CommitVersion,
    pub last_epoch_end: CommitVersion,
    pub commit_proxies: Vec<ProxyId>,
    pub version_epoch: Option<i64>,
    pub primary_locality: Vec<String>,
}

struct ProxyReplyCache {
    replies: BTreeMap<RequestNum, GetCommitVersionReply>,
    latest_request_num: RequestNum,
    latest_tx: watch::Sender<RequestNum>,
}

impl ProxyReplyCache {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(RequestNum::ZERO);
        Self {
            replies: BTreeMap::new(),
            latest_request_num: RequestNum::ZERO,
            latest_tx: tx,
        }
    }
}

struct Inner {
    version: CommitVersion,
    last_version_time: f64,
    last_epoch_end: CommitVersion,
    recovery_transaction_version: CommitVersion,
    reference_version: Option<i64>,
    min_known_committed_version: CommitVersion,
    database_locked: bool,
    proxy_metadata_version: Vec<u8>,
    locality: Vec<String>,
    report_live_committed_version_requests: u64,
    proxies: HashMap<ProxyId, ProxyReplyCache>,
}

/// Master-side version allocator for one recovery generation.
pub struct VersionCoordinator {
    lifetime: LifetimeToken,
    tunables: VersionTunables,
    clock: SharedClock,
    inner: Mutex<Inner>,
    live_committed_tx: watch::Sender<CommitVersion>,
    metrics: CoordMetrics,
}

impl VersionCoordinator {
    pub fn new(lifetime: LifetimeToken, tunables: VersionTunables, clock: SharedClock) -> Self {
        let (live_committed_tx, _rx) = watch::channel(CommitVersion::INVALID);
        Self {
            lifetime,
            tunables,
            clock,
            metrics: CoordMetrics::new(),
            inner: Mutex::new(Inner {
                version: CommitVersion::INVALID,
                last_version_time: 0.0,
                last_epoch_end: CommitVersion::INVALID,
                recovery_transaction_version: CommitVersion::INVALID,
                reference_version: None,
                min_known_committed_version: CommitVersion::INVALID,
                database_locked: false,
                proxy_metadata_version: Vec::new(),
                locality: Vec::new(),
                report_live_committed_version_requests: 0,
                proxies: HashMap::new(),
            }),
            live_committed_tx,
        }
    }

    pub fn lifetime(&self) -> LifetimeToken {
        self.lifetime
    }

    /// Counters for requests this coordinator has served; see
    /// [`crate::metrics`].
    pub fn metrics(&self) -> &CoordMetrics {
        &self.metrics
    }

    /// Check this instance is still bound to the cluster's current
    /// generation; callers should call this before trusting a long-held
    /// reference across a reconfiguration.
    pub fn check_lifetime(&self, current: LifetimeToken) -> CoordResult<()> {
        if self.lifetime.matches(current) {
            Ok(())
        } else {
            Err(CoordError::LifetimeTerminated {
                reason: TerminationReason::Superseded,
                detail: "generation replaced; coordinator is terminating cooperatively",
            })
        }
    }

    async fn next_version(&self, inner: &mut Inner) -> (CommitVersion, CommitVersion) {
        let now = self.clock.now();
        if !inner.version.is_valid() {
            let prev = inner.last_epoch_end;
            inner.version = inner.recovery_transaction_version;
            inner.last_version_time = now;
            return (inner.version, prev);
        }

        let prev = inner.version;
        let dt = (now - inner.last_version_time).max(0.0);
        let raw_to_add = self.tunables.versions_per_second as f64 * dt;
        let to_add = raw_to_add.clamp(1.0, self.tunables.max_read_transaction_life_versions as f64);

        let new_version = if let Some(reference) = inner.reference_version {
            let expected = now * self.tunables.versions_per_second as f64 - reference as f64;
            let max_offset =
                (to_add * self.tunables.max_version_rate_modifier).min(self.tunables.max_version_rate_offset as f64);
            let lower = prev.as_i64() as f64 + to_add - max_offset;
            let upper = prev.as_i64() as f64 + to_add + max_offset;
            CommitVersion::new(expected.clamp(lower, upper).round() as i64)
        } else {
            prev.saturating_add(to_add.round() as i64)
        };

        inner.version = new_version;
        inner.last_version_time = now;
        (new_version, prev)
    }

    /// Allocate (or replay) the commit version for one proxy's
    /// `requestNum`. See `spec.md` §4.5 for the six-step contract this
    /// follows exactly.
    pub async fn get_commit_version(
        &self,
        proxy: ProxyId,
        request_num: RequestNum,
        most_recent_processed_request_num: RequestNum,
    ) -> CoordResult<GetCommitVersionReply> {
        let mut rx = {
            let inner = self.inner.lock().await;
            let cache = inner
                .proxies
                .get(&proxy)
                .ok_or(CoordError::UnregisteredProxy(proxy))?;
            cache.latest_tx.subscribe()
        };

        let threshold = RequestNum::new(request_num.as_u64().saturating_sub(1));
        while *rx.borrow() < threshold {
            if rx.changed().await.is_err() {
                return Err(CoordError::LifetimeTerminated {
                    reason: TerminationReason::FatalFault,
                    detail: "proxy reply cache dropped while waiting for FIFO order",
                });
            }
        }

        let mut inner = self.inner.lock().await;

        if let Some(cached) = inner
            .proxies
            .get(&proxy)
            .and_then(|cache| cache.replies.get(&request_num))
        {
            return Ok(cached.clone());
        }

        let is_stale = inner
            .proxies
            .get(&proxy)
            .map(|cache| request_num <= cache.latest_request_num)
            .unwrap_or(true);
        if is_stale {
            drop(inner);
            // The caller has moved on; §4.5 step 4 says to signal "no
            // reply" rather than an error, which this models as a future
            // that never resolves.
            std::future::pending::<()>().await;
            unreachable!("stale getCommitVersion never replies");
        }

        // §4.5 step 5 / §8 boundary case: requestNum wraparound within a
        // generation is not supported. Detect an attempt to advance past
        // u64::MAX and reject the proxy rather than silently wrapping.
        if request_num.checked_next().is_none() {
            return Err(CoordError::RequestNumWraparound(proxy));
        }

        let (version, prev_version) = self.next_version(&mut inner).await;
        self.metrics.record_version_allocated();

        let reply = GetCommitVersionReply {
            version,
            prev_version,
            request_num,
        };

        let cache = inner
            .proxies
            .get_mut(&proxy)
            .ok_or(CoordError::UnregisteredProxy(proxy))?;
        cache.replies.insert(request_num, reply.clone());
        cache
            .replies
            .retain(|&seq, _| seq > most_recent_processed_request_num);
        cache.latest_request_num = request_num;
        cache.latest_tx.send(request_num).ok();

        Ok(reply)
    }

    async fn wait_live_committed_at_least(&self, threshold: CommitVersion) {
        let mut rx = self.live_committed_tx.subscribe();
        while *rx.borrow() < threshold {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Fold in a proxy's committed-version report.
    pub async fn update_live_committed_version(&self, req: ReportRawCommittedVersionRequest) -> CoordResult<()> {
        if self.tunables.enable_version_vector {
            if let Some(prev) = req.prev_version {
                self.wait_live_committed_at_least(prev).await;
            }
        }

        let mut inner = self.inner.lock().await;
        inner.min_known_committed_version = inner.min_known_committed_version.max(req.min_known_committed_version);

        let current = *self.live_committed_tx.borrow();
        if req.version > current {
            inner.database_locked = req.locked;
            if let Some(mv) = req.metadata_version {
                inner.proxy_metadata_version = mv;
            }
            self.live_committed_tx.send(req.version).ok();
        }
        inner.report_live_committed_version_requests += 1;
        Ok(())
    }

    /// Serve a `GetRawCommittedVersionRequest`.
    pub async fn get_live_committed_version(&self) -> GetRawCommittedVersionReply {
        let mut inner = self.inner.lock().await;
        if !self.live_committed_tx.borrow().is_valid() {
            let v = inner.recovery_transaction_version;
            self.live_committed_tx.send(v).ok();
        }
        GetRawCommittedVersionReply {
            version: *self.live_committed_tx.borrow(),
            locked: inner.database_locked,
            metadata_version: inner.proxy_metadata_version.clone(),
            min_known_committed_version: inner.min_known_committed_version,
        }
    }

    /// Apply a recovery data update. Processed strictly one at a time by
    /// virtue of holding the same `inner` mutex as every other operation.
    pub async fn update_recovery_data(&self, req: UpdateRecoveryDataRequest) {
        let mut inner = self.inner.lock().await;
        inner.recovery_transaction_version = req.recovery_transaction_version;
        inner.last_epoch_end = req.last_epoch_end;
        inner.reference_version = req.version_epoch;
        inner.locality = req.primary_locality;

        inner.proxies.clear();
        for proxy in req.commit_proxies {
            inner.proxies.insert(proxy, ProxyReplyCache::new());
        }
    }

    /// Number of currently registered commit proxies. Exposed for tests.
    pub async fn registered_proxy_count(&self) -> usize {
        self.inner.lock().await.proxies.len()
    }
}
