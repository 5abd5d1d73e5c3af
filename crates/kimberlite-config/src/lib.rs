//! Configuration loading for the coordination subsystem.
//!
//! Provides hierarchical configuration loading from multiple sources,
//! highest precedence first:
//! 1. Environment variables (`KMBCOORD_*` prefix)
//! 2. `kimberlite-coord.local.toml` (gitignored, local overrides)
//! 3. `kimberlite-coord.toml` (git-tracked, project config)
//! 4. `~/.config/kimberlite-coord/config.toml` (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Tunable constants for the load balancer, version coordinator, and tag
/// throttler (`spec.md` §6.3). Every field here is read at construction
/// time by the corresponding coordination type; none are re-read mid-call,
/// matching how the teacher crate treats its own tunables as load-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordConfig {
    pub version: VersionTunables,
    pub hedging: HedgingTunables,
    pub backoff: BackoffTunables,
    pub alternatives: AlternativesTunables,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            version: VersionTunables::default(),
            hedging: HedgingTunables::default(),
            backoff: BackoffTunables::default(),
            alternatives: AlternativesTunables::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionTunables {
    /// Target version-allocation rate (`VERSIONS_PER_SECOND`).
    pub versions_per_second: i64,
    /// Upper bound on the per-call version step (`MAX_READ_TRANSACTION_LIFE_VERSIONS`).
    pub max_read_transaction_life_versions: i64,
    /// Cap on version catch-up as a fraction of the nominal step (`MAX_VERSION_RATE_MODIFIER`).
    pub max_version_rate_modifier: f64,
    /// Absolute cap on version catch-up (`MAX_VERSION_RATE_OFFSET`).
    pub max_version_rate_offset: i64,
    /// Whether `updateLiveCommittedVersion` enforces the version-vector
    /// ordering rule (wait for `prevVersion` before publishing).
    pub enable_version_vector: bool,
}

impl Default for VersionTunables {
    fn default() -> Self {
        Self {
            versions_per_second: 1_000_000,
            max_read_transaction_life_versions: 5_000_000,
            max_version_rate_modifier: 0.1,
            max_version_rate_offset: 100_000,
            enable_version_vector: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HedgingTunables {
    /// Threshold ratio above which a hedge is sent immediately (`INSTANT_SECOND_REQUEST_MULTIPLIER`).
    pub instant_second_request_multiplier: f64,
    /// Additive hedge delay in seconds (`BASE_SECOND_REQUEST_TIME`).
    pub base_second_request_time_secs: f64,
    /// Growth factor applied to `secondMultiplier` when a hedge is used.
    pub second_request_multiplier_growth: f64,
    /// Decay factor applied to `secondMultiplier` on a clean first-alternative success.
    pub second_request_multiplier_decay: f64,
    /// Amount `secondBudget` refills by per accounting tick.
    pub second_request_budget_growth: f64,
    /// Cap on `secondBudget`.
    pub second_request_max_budget: f64,
}

impl Default for HedgingTunables {
    fn default() -> Self {
        Self {
            instant_second_request_multiplier: 2.0,
            base_second_request_time_secs: 0.01,
            second_request_multiplier_growth: 1.01,
            second_request_multiplier_decay: 0.995,
            second_request_budget_growth: 0.01,
            second_request_max_budget: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffTunables {
    pub start_backoff_secs: f64,
    pub max_backoff_secs: f64,
    pub backoff_rate: f64,
    /// Bad-endpoint tolerance before considering remote alternatives (`LOAD_BALANCE_MAX_BAD_OPTIONS`).
    pub max_bad_options: usize,
    /// Whether `penalty > 1.001` marks an endpoint bad (`LOAD_BALANCE_PENALTY_IS_BAD`).
    pub penalty_is_bad: bool,
}

impl Default for BackoffTunables {
    fn default() -> Self {
        Self {
            start_backoff_secs: 0.01,
            max_backoff_secs: 1.0,
            backoff_rate: 2.0,
            max_bad_options: 1,
            penalty_is_bad: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AlternativesTunables {
    /// Minimum jittered delay before raising `all_alternatives_failed` on a
    /// non-fresh alternatives set.
    pub failure_min_delay_secs: f64,
    /// Maximum jittered delay for the same case.
    pub failure_max_delay_secs: f64,
    /// Cap on retained lagging-request closures (`MAX_LAGGING_REQUESTS_OUTSTANDING`).
    pub max_lagging_requests_outstanding: usize,
}

impl Default for AlternativesTunables {
    fn default() -> Self {
        Self {
            failure_min_delay_secs: 0.1,
            failure_max_delay_secs: 1.0,
            max_lagging_requests_outstanding: 1_000,
        }
    }
}

impl CoordConfig {
    /// Load configuration from default locations.
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from a specific project directory.
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }
}
