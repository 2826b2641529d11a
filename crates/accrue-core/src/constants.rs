//! Engine constants. Balances are virtual points expressed as `f64`.

/// Fraction of the base rate credited for (and to) the direct referrer.
pub const T0_REFERRAL_SHARE: f64 = 0.25;

/// Fraction of the base rate credited for (and to) the referrer's referrer.
pub const T_MINUS_1_REFERRAL_SHARE: f64 = 0.05;

/// Mining sessions per day when the time unit is hours.
pub const SESSIONS_PER_DAY: f64 = 24.0;

/// Mining sessions per "day" in development mode, where the unit is minutes.
pub const DEVELOPMENT_SESSIONS_PER_DAY: f64 = 1.0;

/// Overshoot applied to degradation so that a reference amount reaches zero
/// slightly before the end of its period instead of leaving dust.
pub const DEGRADATION_PRECISION: f64 = 1.005;

/// Default number of mining loop workers.
pub const DEFAULT_WORKERS: u32 = 10;

/// Default number of users fetched per mining loop iteration.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default days over which an expired balance slashes to zero.
pub const DEFAULT_SLASHING_DAYS_COUNT: f64 = 60.0;

/// Default total balance at or below which slashing stops.
pub const DEFAULT_SLASHING_FLOOR: f64 = 0.0;

/// Default per-call timeout for store and broker calls, in milliseconds.
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;

/// Minimum base mining rate; anything below is treated as a misconfigured curve.
pub const MIN_BASE_MINING_RATE: f64 = 0.0;

/// Balances closer to zero than this are snapped to exactly zero.
pub const BALANCE_EPSILON: f64 = 1e-9;

/// Snap tiny float residue to zero and floor negatives.
pub fn floor_balance(value: f64) -> f64 {
    if value < BALANCE_EPSILON { 0.0 } else { value }
}
