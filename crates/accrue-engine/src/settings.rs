//! Tunables consumed by the accrual and recalculation math.

use std::collections::HashSet;

use accrue_core::constants::{DEFAULT_SLASHING_DAYS_COUNT, DEFAULT_SLASHING_FLOOR};
use accrue_core::error::AccrualError;
use accrue_core::time::TimeUnit;
use accrue_core::types::{MiningBoostLevel, UserId, UserState};
use chrono::Duration;

/// Settings for [`AccrualEngine`](crate::accrual::AccrualEngine).
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub time_unit: TimeUnit,
    pub slashing_days_count: f64,
    /// Own total at or below which slashing stops for the session.
    pub slashing_floor: f64,
    /// One-time credit on the first pass of a new user; `0` disables it.
    pub welcome_bonus: f64,
    pub extra_bonus_duration: Duration,
    /// How long after a bonus window starts the next one can be claimed.
    pub extra_bonus_claim_interval: Duration,
    pub boost_levels: Vec<MiningBoostLevel>,
    /// Users whose T1/T2 team earnings are suspended.
    pub disabled_teams: HashSet<UserId>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            time_unit: TimeUnit::Hours,
            slashing_days_count: DEFAULT_SLASHING_DAYS_COUNT,
            slashing_floor: DEFAULT_SLASHING_FLOOR,
            welcome_bonus: 0.0,
            extra_bonus_duration: Duration::hours(24),
            extra_bonus_claim_interval: Duration::hours(24),
            boost_levels: Vec::new(),
            disabled_teams: HashSet::new(),
        }
    }
}

impl EngineSettings {
    /// Boost level of `user`, `None` when the user has none.
    pub fn boost_level(&self, user: &UserState) -> Result<Option<&MiningBoostLevel>, AccrualError> {
        match user.mining_boost_level_index {
            None => Ok(None),
            Some(index) => self
                .boost_levels
                .get(index)
                .map(Some)
                .ok_or(AccrualError::UnknownBoostLevel { index, len: self.boost_levels.len() }),
        }
    }

    pub fn team_disabled(&self, user_id: UserId) -> bool {
        self.disabled_teams.contains(&user_id)
    }
}

/// Settings for [`Recalculator`](crate::recalculation::Recalculator).
#[derive(Debug, Clone, PartialEq)]
pub struct RecalcSettings {
    pub time_unit: TimeUnit,
    /// Time for a reference balance to fully degrade after session end.
    pub degradation_period: Duration,
    /// Offset after session end at which aggressive degradation begins.
    pub aggressive_after: Duration,
    pub aggressive_period: Duration,
    /// A new session starting in `[end + after, end + until)` rolls back decay.
    pub rollback_after: Duration,
    pub rollback_until: Duration,
    pub extra_bonus_duration: Duration,
}

impl Default for RecalcSettings {
    fn default() -> Self {
        Self {
            time_unit: TimeUnit::Hours,
            degradation_period: Duration::days(DEFAULT_SLASHING_DAYS_COUNT as i64),
            aggressive_after: Duration::days(7),
            aggressive_period: Duration::days(7),
            rollback_after: Duration::hours(1),
            rollback_until: Duration::days(7),
            extra_bonus_duration: Duration::hours(24),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boost_level_lookup() {
        let settings = EngineSettings {
            boost_levels: vec![MiningBoostLevel { max_t1_referrals: Some(5), slashing_disabled: false }],
            ..EngineSettings::default()
        };
        let mut user = UserState::new(1);
        assert_eq!(settings.boost_level(&user).unwrap(), None);
        user.mining_boost_level_index = Some(0);
        assert_eq!(settings.boost_level(&user).unwrap().and_then(|l| l.max_t1_referrals), Some(5));
        user.mining_boost_level_index = Some(3);
        assert_eq!(settings.boost_level(&user), Err(AccrualError::UnknownBoostLevel { index: 3, len: 1 }));
    }

    #[test]
    fn disabled_teams_membership() {
        let settings = EngineSettings { disabled_teams: HashSet::from([7]), ..EngineSettings::default() };
        assert!(settings.team_disabled(7));
        assert!(!settings.team_disabled(8));
    }
}
