//! Decay of tier balances after a mining session expires.
//!
//! On first expiry each tier gets a linear rate that would drain its balance
//! over `slashing_days_count` days. Slashing stops permanently for an expiry
//! once the boost level exempts the user or the own total reaches the floor.
//! A resurrection marker credits back everything slashed during the gap
//! between the previous session end and the new session start.

use std::ops::AddAssign;

use accrue_core::constants::{floor_balance, BALANCE_EPSILON};
use accrue_core::error::AccrualError;
use accrue_core::types::{Tier, UserState};
use tracing::debug;

use crate::settings::EngineSettings;
use crate::window::ExpiredSpan;

/// Whether each referrer is mining at the time of the pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReferrerActivity {
    pub t0: bool,
    pub t_minus_1: bool,
}

impl ReferrerActivity {
    /// Tiers that are held steady by an active referrer.
    pub fn shields(&self, tier: Tier) -> bool {
        match tier {
            Tier::T0 | Tier::ForT0 => self.t0,
            Tier::ForTMinus1 => self.t_minus_1,
            _ => false,
        }
    }
}

/// Signed balance changes from one slashing or resurrection step.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SlashingEffect {
    /// Amount removed from the user's own tiers (negative when restored).
    pub slashed: f64,
    /// Change of `forT0`, forwarded to the T0 referrer's T1 pending credit.
    pub for_t0: f64,
    /// Change of `forTMinus1`, forwarded to the T-1 referrer's T2 pending credit.
    pub for_t_minus_1: f64,
    pub stopped: bool,
    pub resurrected: bool,
}

impl AddAssign for SlashingEffect {
    fn add_assign(&mut self, rhs: Self) {
        self.slashed += rhs.slashed;
        self.for_t0 += rhs.for_t0;
        self.for_t_minus_1 += rhs.for_t_minus_1;
        self.stopped |= rhs.stopped;
        self.resurrected |= rhs.resurrected;
    }
}

pub struct SlashingController<'a> {
    settings: &'a EngineSettings,
}

impl<'a> SlashingController<'a> {
    pub fn new(settings: &'a EngineSettings) -> Self {
        Self { settings }
    }

    /// Per-unit rate that drains `balance` over the configured slashing days.
    pub fn initial_rate(&self, balance: f64) -> f64 {
        let sessions_per_day = self.settings.time_unit.sessions_per_day();
        balance / self.settings.slashing_days_count / sessions_per_day
    }

    /// Decay `user` over one expired span.
    pub fn slash(
        &self,
        user: &mut UserState,
        expired: &ExpiredSpan,
        referrers: ReferrerActivity,
    ) -> Result<SlashingEffect, AccrualError> {
        let mut effect = SlashingEffect::default();
        if user.slashing_stopped_for == Some(expired.expired_at) || user.is_absolute_zero() {
            return Ok(effect);
        }
        let exempt = self.settings.boost_level(user)?.is_some_and(|l| l.slashing_disabled);
        if exempt || user.own_total() <= self.settings.slashing_floor {
            stop(user, expired);
            effect.stopped = true;
            return Ok(effect);
        }

        let units = self.settings.time_unit.between(expired.span.from, expired.span.to);
        for tier in Tier::ALL {
            if referrers.shields(tier) {
                continue;
            }
            let balance = user.balance(tier);
            if balance <= 0.0 {
                continue;
            }
            if user.slashing_rate(tier) <= 0.0 {
                *user.slashing_rate_mut(tier) = self.initial_rate(balance);
            }
            let amount = (user.slashing_rate(tier) * units).min(balance);
            let remaining = floor_balance(balance - amount);
            *user.balance_mut(tier) = remaining;
            if remaining == 0.0 {
                if let Some(pending) = tier.pending() {
                    user.pending_mut(pending).snap();
                }
            }
            match tier {
                Tier::ForT0 => effect.for_t0 -= amount,
                Tier::ForTMinus1 => effect.for_t_minus_1 -= amount,
                _ => effect.slashed += amount,
            }
        }

        if user.own_total() <= self.settings.slashing_floor {
            stop(user, expired);
            effect.stopped = true;
        }
        Ok(effect)
    }

    /// Credit back `rate × gap` per tier for an unconsumed resurrection marker.
    pub fn resurrect(&self, user: &mut UserState) -> SlashingEffect {
        let mut effect = SlashingEffect::default();
        let Some(marker) = user.resurrect_solo_used_at else {
            return effect;
        };
        if user.resurrect_applied_for == Some(marker) {
            return effect;
        }
        let (Some(prev_end), Some(start)) = (user.solo_previously_ended_at, user.solo_started_at) else {
            return effect;
        };

        let gap = self.settings.time_unit.between(prev_end, start);
        for tier in Tier::ALL {
            let credit = user.slashing_rate(tier) * gap;
            *user.slashing_rate_mut(tier) = 0.0;
            if credit <= BALANCE_EPSILON {
                continue;
            }
            *user.balance_mut(tier) += credit;
            match tier {
                Tier::ForT0 => effect.for_t0 += credit,
                Tier::ForTMinus1 => effect.for_t_minus_1 += credit,
                _ => effect.slashed -= credit,
            }
        }
        user.resurrect_applied_for = Some(marker);
        effect.resurrected = true;
        debug!(user_id = user.id, gap_units = gap, "resurrected");
        effect
    }
}

fn stop(user: &mut UserState, expired: &ExpiredSpan) {
    user.slashing_stopped_for = Some(expired.expired_at);
    for tier in Tier::ALL {
        *user.slashing_rate_mut(tier) = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::Span;
    use accrue_core::types::MiningBoostLevel;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, h, 0, 0).unwrap()
    }

    fn settings(days: f64) -> EngineSettings {
        EngineSettings { slashing_days_count: days, ..EngineSettings::default() }
    }

    fn expired(end: u32, to: u32) -> ExpiredSpan {
        ExpiredSpan { span: Span::new(ts(end), ts(to)).unwrap(), expired_at: ts(end) }
    }

    #[test]
    fn rate_drains_over_slashing_days() {
        let s = settings(4.0);
        let ctl = SlashingController::new(&s);
        assert_eq!(ctl.initial_rate(96.0), 1.0);
    }

    #[test]
    fn three_hours_of_slashing() {
        let s = settings(4.0);
        let ctl = SlashingController::new(&s);
        let mut user = UserState::new(1);
        user.balance_solo = 96.0;
        let effect = ctl.slash(&mut user, &expired(0, 3), ReferrerActivity::default()).unwrap();
        assert_eq!(user.slashing_rate_solo, 1.0);
        assert_eq!(user.balance_solo, 93.0);
        assert_eq!(effect.slashed, 3.0);
    }

    #[test]
    fn exempt_boost_level_stops_permanently() {
        let s = EngineSettings {
            boost_levels: vec![MiningBoostLevel { max_t1_referrals: None, slashing_disabled: true }],
            ..settings(4.0)
        };
        let ctl = SlashingController::new(&s);
        let mut user = UserState::new(1);
        user.balance_solo = 96.0;
        user.slashing_rate_solo = 1.0;
        user.mining_boost_level_index = Some(0);
        let effect = ctl.slash(&mut user, &expired(0, 3), ReferrerActivity::default()).unwrap();
        assert!(effect.stopped);
        assert_eq!(user.balance_solo, 96.0);
        assert_eq!(user.slashing_rate_solo, 0.0);
        assert_eq!(user.slashing_stopped_for, Some(ts(0)));
    }

    #[test]
    fn reaching_floor_stops_and_drops_pending() {
        let s = EngineSettings { slashing_floor: 0.0, ..settings(4.0) };
        let ctl = SlashingController::new(&s);
        let mut user = UserState::new(1);
        user.balance_solo = 2.0;
        user.slashing_rate_solo = 1.0;
        user.solo_pending.pending = 5.0;
        let effect = ctl.slash(&mut user, &expired(0, 5), ReferrerActivity::default()).unwrap();
        assert_eq!(user.balance_solo, 0.0);
        assert_eq!(effect.slashed, 2.0);
        assert!(effect.stopped);
        assert!(!user.has_unapplied_pending());

        // Stopped for that expiry: later spans are ignored.
        user.balance_solo = 1.0;
        let again = ctl.slash(&mut user, &expired(0, 9), ReferrerActivity::default()).unwrap();
        assert_eq!(again, SlashingEffect::default());
        assert_eq!(user.balance_solo, 1.0);
    }

    #[test]
    fn active_referrer_shields_its_tiers() {
        let s = settings(4.0);
        let ctl = SlashingController::new(&s);
        let mut user = UserState::new(1);
        user.balance_solo = 96.0;
        user.balance_for_t0 = 96.0;
        user.balance_for_t_minus_1 = 96.0;
        let effect = ctl
            .slash(&mut user, &expired(0, 3), ReferrerActivity { t0: true, t_minus_1: false })
            .unwrap();
        assert_eq!(user.balance_for_t0, 96.0);
        assert_eq!(user.balance_for_t_minus_1, 93.0);
        assert_eq!(effect.for_t_minus_1, -3.0);
        assert_eq!(effect.for_t0, 0.0);
    }

    #[test]
    fn zero_balances_are_left_alone() {
        let s = settings(4.0);
        let ctl = SlashingController::new(&s);
        let mut user = UserState::new(1);
        let before = user.clone();
        let effect = ctl.slash(&mut user, &expired(0, 3), ReferrerActivity::default()).unwrap();
        assert_eq!(effect, SlashingEffect::default());
        assert_eq!(user, before);
    }

    #[test]
    fn resurrection_credits_gap_once() {
        let s = settings(4.0);
        let ctl = SlashingController::new(&s);
        let mut user = UserState::new(1);
        user.balance_solo = 93.0;
        user.balance_for_t0 = 46.5;
        user.slashing_rate_solo = 1.0;
        user.slashing_rate_for_t0 = 0.5;
        user.solo_previously_ended_at = Some(ts(0));
        user.solo_started_at = Some(ts(3));
        user.resurrect_solo_used_at = Some(ts(3));

        let effect = ctl.resurrect(&mut user);
        assert!(effect.resurrected);
        assert_eq!(user.balance_solo, 96.0);
        assert_eq!(user.balance_for_t0, 48.0);
        assert_eq!(effect.for_t0, 1.5);
        assert_eq!(effect.slashed, -3.0);
        assert_eq!(user.slashing_rate_solo, 0.0);

        assert_eq!(ctl.resurrect(&mut user), SlashingEffect::default());
        assert_eq!(user.balance_solo, 96.0);
    }
}
