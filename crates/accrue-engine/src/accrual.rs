//! Per-user accrual pass.
//!
//! [`AccrualEngine::accrue`] is a pure function of the prior user record,
//! the referrer snapshots and the current instant. It never touches a store;
//! the mining loop persists whatever it returns.
//!
//! A pass walks the elapsed interval `[balance_last_updated_at, now)`:
//! expired pieces are slashed, an unconsumed resurrection marker is credited
//! back, mining pieces are minted per the adoption curve, then queued
//! pending credits, the welcome bonus and the pre-staking split are applied.

use accrue_core::constants::{floor_balance, BALANCE_EPSILON, T0_REFERRAL_SHARE, T_MINUS_1_REFERRAL_SHARE};
use accrue_core::error::AccrualError;
use accrue_core::types::{
    CounterDelta, PendingIncrement, PendingTier, ReferralSnapshot, SessionWindow, Tier, UserState,
};
use chrono::{DateTime, Utc};

use crate::adoption::AdoptionCurve;
use crate::referral::ReferralPropagator;
use crate::settings::EngineSettings;
use crate::slashing::{ReferrerActivity, SlashingController, SlashingEffect};
use crate::staking::split_pre_staking;
use crate::window::{expired_spans, mining_spans, Span};

/// Where a user sits in the session lifecycle after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccrualState {
    #[default]
    NoSession,
    ActivelyMining,
    ExpiredDecaying,
    ExpiredAtFloor,
    /// Mining again, with a resurrection credited this pass.
    Resurrected,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccrualOutcome {
    /// The updated record, `None` when nothing changed.
    pub user: Option<UserState>,
    pub state: AccrualState,
    /// A history cycle boundary was crossed since the last update.
    pub record_history: bool,
    pub tier_link_changed: bool,
    /// Credit for the T0 referrer's T1 pending field.
    pub pending_for_t0: f64,
    /// Credit for the T-1 referrer's T2 pending field.
    pub pending_for_t_minus_1: f64,
    pub counter_deltas: Vec<CounterDelta>,
    pub minted: f64,
    pub slashed: f64,
    /// Set when an extra bonus became claimable and has not been announced.
    pub extra_bonus_available_at: Option<DateTime<Utc>>,
}

impl AccrualOutcome {
    fn skip(state: AccrualState) -> Self {
        Self { state, ..Self::default() }
    }

    pub fn is_noop(&self) -> bool {
        self.user.is_none()
    }

    /// Cross-tier pending credits addressed to the updated user's referrers.
    pub fn pending_increments(&self) -> Vec<PendingIncrement> {
        let Some(user) = &self.user else {
            return Vec::new();
        };
        let mut out = Vec::new();
        if let Some(id) = user.id_t0.id().filter(|_| self.pending_for_t0.abs() > BALANCE_EPSILON) {
            out.push(PendingIncrement { user_id: id, tier: PendingTier::T1, amount: self.pending_for_t0 });
        }
        if let Some(id) = user.id_t_minus_1.id().filter(|_| self.pending_for_t_minus_1.abs() > BALANCE_EPSILON) {
            out.push(PendingIncrement { user_id: id, tier: PendingTier::T2, amount: self.pending_for_t_minus_1 });
        }
        out
    }
}

pub struct AccrualEngine<'a> {
    settings: &'a EngineSettings,
    curve: &'a AdoptionCurve,
}

impl<'a> AccrualEngine<'a> {
    pub fn new(settings: &'a EngineSettings, curve: &'a AdoptionCurve) -> Self {
        Self { settings, curve }
    }

    pub fn settings(&self) -> &EngineSettings {
        self.settings
    }

    pub fn accrue(
        &self,
        now: DateTime<Utc>,
        user: &UserState,
        t0: Option<&ReferralSnapshot>,
        t_minus_1: Option<&ReferralSnapshot>,
    ) -> Result<AccrualOutcome, AccrualError> {
        let Some(started_at) = user.solo_started_at.filter(|_| user.has_session()) else {
            return Ok(AccrualOutcome::skip(AccrualState::NoSession));
        };
        let unit = self.settings.time_unit;
        let mut next = user.clone();
        let last = user.balance_last_updated_at.unwrap_or(started_at).min(now);

        let record_history = user.balance_last_updated_at.is_some_and(|l| unit.crossed_cycle(l, now));
        if record_history {
            next.total_minted = 0.0;
            next.total_slashed = 0.0;
        }

        let propagation = ReferralPropagator::propagate(&mut next, now, t0);
        let referrers = ReferrerActivity {
            t0: t0.filter(|r| Some(r.id) == next.id_t0.id()).is_some_and(|r| r.is_mining(now)),
            t_minus_1: t_minus_1.filter(|r| Some(r.id) == next.id_t_minus_1.id()).is_some_and(|r| r.is_mining(now)),
        };

        let window = SessionWindow::from(user);
        let slashing = SlashingController::new(self.settings);
        let mut effect = SlashingEffect::default();
        for expired in expired_spans(last, now, &window) {
            effect += slashing.slash(&mut next, &expired, referrers)?;
        }

        let mining = user.is_mining(now);
        if mining {
            effect += slashing.resurrect(&mut next);
        }

        let mut minted = 0.0;
        for span in mining_spans(last, now, &window) {
            minted += self.mint(&mut next, span, referrers)?;
        }
        // Each expiry derives fresh rates from the balances it starts with.
        if mining {
            for tier in Tier::ALL {
                *next.slashing_rate_mut(tier) = 0.0;
            }
        }
        if referrers.t0 {
            *next.slashing_rate_mut(Tier::T0) = 0.0;
            *next.slashing_rate_mut(Tier::ForT0) = 0.0;
        }
        if referrers.t_minus_1 {
            *next.slashing_rate_mut(Tier::ForTMinus1) = 0.0;
        }

        for tier in PendingTier::ALL {
            let pair = next.pending(tier);
            if pair.has_unapplied() {
                let credit = pair.unapplied();
                *next.balance_mut(tier.tier()) += credit;
            }
            next.pending_mut(tier).snap();
        }

        match user.welcome_bonus_applied {
            Some(true) => next.welcome_bonus_applied = None,
            _ if self.settings.welcome_bonus > 0.0 => {
                next.balance_solo += self.settings.welcome_bonus;
                minted += self.settings.welcome_bonus;
                next.welcome_bonus_applied = Some(true);
            }
            _ => next.welcome_bonus_applied = None,
        }

        let extra_bonus_available_at = self.extra_bonus_availability(&mut next, now);

        for tier in Tier::ALL {
            let floored = floor_balance(next.balance(tier));
            *next.balance_mut(tier) = floored;
        }
        let (standard, pre_staking) =
            split_pre_staking(next.own_total(), next.pre_staking_allocation, next.pre_staking_bonus);
        next.total_standard = standard;
        next.total_pre_staking = pre_staking;
        next.total_minted += minted;
        next.total_slashed = floor_balance(next.total_slashed + effect.slashed);
        next.balance_last_updated_at = Some(now);

        let state = if mining {
            if effect.resurrected { AccrualState::Resurrected } else { AccrualState::ActivelyMining }
        } else if next.slashing_stopped_for.is_some() && next.slashing_stopped_for == user.solo_ended_at {
            AccrualState::ExpiredAtFloor
        } else {
            AccrualState::ExpiredDecaying
        };

        let mut settled = next.clone();
        settled.balance_last_updated_at = user.balance_last_updated_at;
        if settled.welcome_bonus_applied.is_none() {
            settled.welcome_bonus_applied = user.welcome_bonus_applied;
        }
        let unchanged = settled == *user
            && propagation.counter_deltas.is_empty()
            && !propagation.tier_link_changed
            && effect.for_t0 == 0.0
            && effect.for_t_minus_1 == 0.0;
        if unchanged {
            return Ok(AccrualOutcome::skip(state));
        }

        Ok(AccrualOutcome {
            user: Some(next),
            state,
            record_history,
            tier_link_changed: propagation.tier_link_changed,
            pending_for_t0: effect.for_t0,
            pending_for_t_minus_1: effect.for_t_minus_1,
            counter_deltas: propagation.counter_deltas,
            minted,
            slashed: effect.slashed,
            extra_bonus_available_at,
        })
    }

    /// Credit one mining piece. Returns the amount added to the user's own tiers.
    fn mint(&self, user: &mut UserState, span: Span, referrers: ReferrerActivity) -> Result<f64, AccrualError> {
        let unit = self.settings.time_unit;
        let base = self.curve.integrate(unit, span.from, span.to);
        if base <= 0.0 {
            return Ok(0.0);
        }

        let mut solo = base;
        if user.extra_bonus > 0.0 {
            if let Some(bonus_start) = user.extra_bonus_started_at {
                let bonus_end = bonus_start + self.settings.extra_bonus_duration;
                if let Some(bonus) = span.clip(Some(bonus_start), Some(bonus_end)) {
                    solo += self.curve.integrate(unit, bonus.from, bonus.to) * user.extra_bonus / 100.0;
                }
            }
        }
        user.balance_solo += solo;
        let mut own = solo;

        if referrers.t0 {
            let share = base * T0_REFERRAL_SHARE;
            user.balance_t0 += share;
            user.balance_for_t0 += share;
            own += share;
        }
        if referrers.t_minus_1 {
            user.balance_for_t_minus_1 += base * T_MINUS_1_REFERRAL_SHARE;
        }

        if !self.settings.team_disabled(user.id) {
            let mut active_t1 = user.active_t1_referrals.max(0) as f64;
            if let Some(cap) = self.settings.boost_level(user)?.and_then(|l| l.max_t1_referrals) {
                active_t1 = active_t1.min(f64::from(cap));
            }
            let active_t2 = user.active_t2_referrals.max(0) as f64;
            let t1 = base * T0_REFERRAL_SHARE * active_t1;
            let t2 = base * T_MINUS_1_REFERRAL_SHARE * active_t2;
            user.balance_t1 += t1;
            user.balance_t2 += t2;
            own += t1 + t2;
        }
        Ok(own)
    }

    fn extra_bonus_availability(&self, user: &mut UserState, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let interval = self.settings.extra_bonus_claim_interval;
        if interval <= chrono::Duration::zero() {
            return None;
        }
        let available_at = user.extra_bonus_started_at? + interval;
        if now < available_at || user.extra_bonus_available_notified_at == Some(available_at) {
            return None;
        }
        user.extra_bonus_available_notified_at = Some(available_at);
        Some(available_at)
    }
}
