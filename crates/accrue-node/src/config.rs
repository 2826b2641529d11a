//! Daemon configuration.
//!
//! [`MinerConfig`] has usable defaults for every field. [`MinerConfig::load`]
//! layers an optional TOML file and then `ACCRUE_*` environment variables
//! (nested keys separated by `__`, e.g. `ACCRUE_RECALC__WORKERS=8`) over
//! those defaults. CLI flags are applied on top by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use accrue_core::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_SLASHING_DAYS_COUNT, DEFAULT_SLASHING_FLOOR, DEFAULT_STORE_TIMEOUT_MS,
    DEFAULT_WORKERS,
};
use accrue_core::error::ConfigError;
use accrue_core::time::TimeUnit;
use accrue_core::types::{MiningBoostLevel, UserId};
use accrue_engine::settings::{EngineSettings, RecalcSettings};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Daily window during which users with enough balance are collected for
/// coin distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoinDistributionConfig {
    pub enabled: bool,
    /// UTC hour the window opens, inclusive.
    pub start_hour: u32,
    /// UTC hour the window closes, exclusive.
    pub end_hour: u32,
    pub min_balance: f64,
}

impl Default for CoinDistributionConfig {
    fn default() -> Self {
        Self { enabled: false, start_hour: 0, end_hour: 6, min_balance: 1.0 }
    }
}

/// Balance recalculation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecalcConfig {
    /// One worker per ledger shard.
    pub workers: u32,
    pub batch_size: usize,
    pub interval_ms: u64,
    pub rollback_after_secs: u64,
    pub rollback_until_secs: u64,
    pub aggressive_after_secs: u64,
    pub aggressive_period_secs: u64,
}

impl Default for RecalcConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 100,
            interval_ms: 1_000,
            rollback_after_secs: 60 * 60,
            rollback_until_secs: 7 * 24 * 60 * 60,
            aggressive_after_secs: 7 * 24 * 60 * 60,
            aggressive_period_secs: 7 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    pub workers: u32,
    pub batch_size: usize,
    /// Switch the accrual unit from hours to minutes everywhere.
    pub development: bool,
    pub slashing_days_count: f64,
    pub slashing_floor: f64,
    pub welcome_bonus: f64,
    /// Base rate used until the first adoption milestone is stored.
    pub base_mining_rate: f64,
    /// Length of a mining session in accrual units.
    pub session_length_units: u32,
    pub extra_bonus_duration_secs: u64,
    pub extra_bonus_claim_interval_secs: u64,
    pub boost_levels: Vec<MiningBoostLevel>,
    pub disabled_teams: Vec<UserId>,
    pub coin_distribution: CoinDistributionConfig,
    pub recalc: RecalcConfig,
    pub store_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    /// Pause after a worker has no users to process.
    pub idle_ms: u64,
    /// Flush minted/slashed totals into the global counters every N iterations.
    pub balance_sync_every: u64,
    /// Log aggregated phase timings every N iterations.
    pub telemetry_every: u64,
    pub config_refresh_secs: u64,
    /// Log level filter string (e.g. "info", "accrue_node_lib=debug").
    pub log_level: String,
    /// "text" or "json".
    pub log_format: String,
}

impl Default for MinerConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("accrue");

        Self {
            data_dir,
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            development: false,
            slashing_days_count: DEFAULT_SLASHING_DAYS_COUNT,
            slashing_floor: DEFAULT_SLASHING_FLOOR,
            welcome_bonus: 0.0,
            base_mining_rate: 16.0,
            session_length_units: 24,
            extra_bonus_duration_secs: 24 * 60 * 60,
            extra_bonus_claim_interval_secs: 24 * 60 * 60,
            boost_levels: Vec::new(),
            disabled_teams: Vec::new(),
            coin_distribution: CoinDistributionConfig::default(),
            recalc: RecalcConfig::default(),
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            retry_backoff_ms: 500,
            idle_ms: 1_000,
            balance_sync_every: 10,
            telemetry_every: 100,
            config_refresh_secs: 30,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl MinerConfig {
    /// Defaults, then `path` (if given), then `ACCRUE_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("ACCRUE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        let cfg: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid { field, reason: reason.to_string() })
        }

        if self.workers == 0 {
            return invalid("workers", "must be at least 1");
        }
        if self.batch_size == 0 {
            return invalid("batch_size", "must be at least 1");
        }
        if !(self.slashing_days_count.is_finite() && self.slashing_days_count > 0.0) {
            return invalid("slashing_days_count", "must be a positive number");
        }
        if !(self.slashing_floor.is_finite() && self.slashing_floor >= 0.0) {
            return invalid("slashing_floor", "must be non-negative");
        }
        if !(self.welcome_bonus.is_finite() && self.welcome_bonus >= 0.0) {
            return invalid("welcome_bonus", "must be non-negative");
        }
        if !(self.base_mining_rate.is_finite() && self.base_mining_rate >= 0.0) {
            return invalid("base_mining_rate", "must be non-negative");
        }
        if self.session_length_units == 0 {
            return invalid("session_length_units", "must be at least 1");
        }
        let cd = &self.coin_distribution;
        if cd.enabled && !(cd.start_hour < cd.end_hour && cd.end_hour <= 24) {
            return invalid("coin_distribution", "window must satisfy start_hour < end_hour <= 24");
        }
        if self.recalc.workers == 0 {
            return invalid("recalc.workers", "must be at least 1");
        }
        if self.recalc.batch_size == 0 {
            return invalid("recalc.batch_size", "must be at least 1");
        }
        if self.recalc.rollback_after_secs >= self.recalc.rollback_until_secs {
            return invalid("recalc.rollback_after_secs", "rollback window is empty");
        }
        if self.recalc.aggressive_period_secs == 0 {
            return invalid("recalc.aggressive_period_secs", "must be positive");
        }
        if self.store_timeout_ms == 0 {
            return invalid("store_timeout_ms", "must be positive");
        }
        if self.balance_sync_every == 0 || self.telemetry_every == 0 {
            return invalid("balance_sync_every", "cadences must be at least 1");
        }
        if self.log_format != "text" && self.log_format != "json" {
            return invalid("log_format", "expected \"text\" or \"json\"");
        }
        Ok(())
    }

    /// Path to the RocksDB data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("accruedata")
    }

    pub fn time_unit(&self) -> TimeUnit {
        TimeUnit::from_development(self.development)
    }

    pub fn session_length(&self) -> Duration {
        self.time_unit().unit() * self.session_length_units as i32
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            time_unit: self.time_unit(),
            slashing_days_count: self.slashing_days_count,
            slashing_floor: self.slashing_floor,
            welcome_bonus: self.welcome_bonus,
            extra_bonus_duration: secs(self.extra_bonus_duration_secs),
            extra_bonus_claim_interval: secs(self.extra_bonus_claim_interval_secs),
            boost_levels: self.boost_levels.clone(),
            disabled_teams: self.disabled_teams.iter().copied().collect(),
        }
    }

    /// Degradation runs over the same number of "days" as slashing, where a
    /// day is `sessions_per_day` accrual units.
    pub fn recalc_settings(&self) -> RecalcSettings {
        let unit = self.time_unit();
        let day_secs = unit.unit().num_seconds() as f64 * unit.sessions_per_day();
        RecalcSettings {
            time_unit: unit,
            degradation_period: secs((day_secs * self.slashing_days_count) as u64),
            aggressive_after: secs(self.recalc.aggressive_after_secs),
            aggressive_period: secs(self.recalc.aggressive_period_secs),
            rollback_after: secs(self.recalc.rollback_after_secs),
            rollback_until: secs(self.recalc.rollback_until_secs),
            extra_bonus_duration: secs(self.extra_bonus_duration_secs),
        }
    }

    pub fn store_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.store_timeout_ms)
    }

    pub fn retry_backoff(&self) -> StdDuration {
        StdDuration::from_millis(self.retry_backoff_ms)
    }

    pub fn idle(&self) -> StdDuration {
        StdDuration::from_millis(self.idle_ms)
    }

    pub fn config_refresh(&self) -> StdDuration {
        StdDuration::from_secs(self.config_refresh_secs.max(1))
    }
}

fn secs(s: u64) -> Duration {
    Duration::seconds(i64::try_from(s).unwrap_or(i64::MAX / 1_000))
}
