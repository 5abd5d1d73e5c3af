//! Tunable constants (`spec.md` §6.3), bridged from `kimberlite-config`.
//!
//! Every coordination type takes its tunables as an explicit constructor
//! argument rather than reading a global, so the constants here are just
//! re-exports of the `kimberlite-config` structs under the names this
//! crate's modules use internally.

pub use kimberlite_config::{
    AlternativesTunables, BackoffTunables, HedgingTunables, VersionTunables,
};

/// Threshold below which a penalty is considered "self-reported bad" by a
/// delivered reply (`LOAD_BALANCE_PENALTY_IS_BAD`'s companion constant:
/// the value itself, not whether the check is enabled).
pub const PENALTY_BAD_THRESHOLD: f64 = 1.001;

/// Watchdog threshold for a single `load_balance` call in production. Kept
/// generous since tripping it is diagnostic, not fatal.
pub const WATCHDOG_THRESHOLD_SECS: f64 = 5.0;

/// Watchdog threshold under simulation, where wall-clock time is compressed
/// and a tighter bound catches runaway retries sooner.
pub const SIM_WATCHDOG_THRESHOLD_SECS: f64 = 1.0;

/// Short debounce horizon applied to `Measurement::failed_until` when a
/// reply comes back `future_version`, so the load balancer doesn't
/// immediately re-select an endpoint that is still ahead of us.
pub const FUTURE_VERSION_DEBOUNCE_SECS: f64 = 1.0;

/// Half-life used to decay `smooth_outstanding` and `latency` measurements
/// between samples.
pub const MEASUREMENT_SMOOTHING_HALF_LIFE_SECS: f64 = 1.0;
