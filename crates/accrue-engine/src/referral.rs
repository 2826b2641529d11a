//! Referral link confirmation and active-referral counter moves.
//!
//! `counted_t0` / `counted_t_minus_1` record which referrer currently holds
//! an active count for this user. Each pass compares them with the referrer
//! that *should* hold the count (the linked one, while the user mines) and
//! emits a decrement/increment pair only when they differ, so an unchanged
//! link re-read on every pass never moves a counter.

use accrue_core::types::{
    CounterDelta, CounterField, ReferralSnapshot, TierLink, UserId, UserState,
};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Propagation {
    pub tier_link_changed: bool,
    pub counter_deltas: Vec<CounterDelta>,
    /// The user's mining start was propagated this pass.
    pub started: bool,
    /// The user's mining stop was propagated this pass.
    pub stopped: bool,
}

pub struct ReferralPropagator;

impl ReferralPropagator {
    /// Update links, counted referrers and the change guard on `user`.
    ///
    /// `t0` is the snapshot of the user's direct referrer; its own `id_t0`
    /// is the user's T-1.
    pub fn propagate(user: &mut UserState, now: DateTime<Utc>, t0: Option<&ReferralSnapshot>) -> Propagation {
        let mut out = Propagation::default();

        if user.id_t0.is_default() {
            user.id_t0 = user.id_t0.confirmed();
            out.tier_link_changed = true;
        }
        let t_minus_1 = expected_t_minus_1(user, t0);
        if user.id_t_minus_1 != t_minus_1 {
            user.id_t_minus_1 = t_minus_1;
            out.tier_link_changed = true;
        }

        let mining = user.is_mining(now);
        let linked = |link: TierLink| if mining { link.id().filter(|id| *id != user.id) } else { None };
        let want_t0 = linked(user.id_t0);
        let want_t_minus_1 = linked(user.id_t_minus_1);

        move_count(&mut out.counter_deltas, CounterField::ActiveT1Referrals, user.counted_t0, want_t0);
        move_count(&mut out.counter_deltas, CounterField::ActiveT2Referrals, user.counted_t_minus_1, want_t_minus_1);
        user.counted_t0 = want_t0;
        user.counted_t_minus_1 = want_t_minus_1;

        let guard = user.referrals_count_change_guard_updated_at;
        if mining {
            if guard != user.solo_started_at {
                user.referrals_count_change_guard_updated_at = user.solo_started_at;
                out.started = true;
            }
        } else if user.has_session() && guard == user.solo_started_at {
            if let Some(ended) = user.solo_ended_at.filter(|end| *end <= now) {
                user.referrals_count_change_guard_updated_at = Some(ended);
                out.stopped = true;
            }
        }
        out
    }
}

fn expected_t_minus_1(user: &UserState, t0: Option<&ReferralSnapshot>) -> TierLink {
    let Some(t0_id) = user.id_t0.id() else {
        return TierLink::None;
    };
    let id = t0
        .filter(|snap| snap.id == t0_id)
        .and_then(|snap| snap.id_t0.id())
        .filter(|id| *id != user.id && *id != t0_id);
    TierLink::explicit(id)
}

fn move_count(out: &mut Vec<CounterDelta>, field: CounterField, from: Option<UserId>, to: Option<UserId>) {
    if from == to {
        return;
    }
    if let Some(user_id) = from {
        out.push(CounterDelta { user_id, field, delta: -1 });
    }
    if let Some(user_id) = to {
        out.push(CounterDelta { user_id, field, delta: 1 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, h, 0, 0).unwrap()
    }

    fn mining_user(id: UserId, t0: TierLink) -> UserState {
        let mut u = UserState::new(id);
        u.id_t0 = t0;
        u.solo_started_at = Some(ts(1));
        u.solo_last_started_at = Some(ts(1));
        u.solo_ended_at = Some(ts(10));
        u
    }

    fn snapshot(id: UserId, t0: TierLink) -> ReferralSnapshot {
        ReferralSnapshot { id, id_t0: t0, ..ReferralSnapshot::default() }
    }

    fn delta(user_id: UserId, field: CounterField, delta: i64) -> CounterDelta {
        CounterDelta { user_id, field, delta }
    }

    // --- Link confirmation ---

    #[test]
    fn default_link_is_confirmed_and_counted_once() {
        let mut u = mining_user(5, TierLink::Default(2));
        let referrer = snapshot(2, TierLink::Explicit(1));
        let first = ReferralPropagator::propagate(&mut u, ts(2), Some(&referrer));
        assert!(first.tier_link_changed);
        assert!(first.started);
        assert_eq!(u.id_t0, TierLink::Explicit(2));
        assert_eq!(u.id_t_minus_1, TierLink::Explicit(1));
        assert_eq!(
            first.counter_deltas,
            vec![delta(2, CounterField::ActiveT1Referrals, 1), delta(1, CounterField::ActiveT2Referrals, 1)]
        );

        let second = ReferralPropagator::propagate(&mut u, ts(3), Some(&referrer));
        assert_eq!(second, Propagation::default());
    }

    #[test]
    fn relink_moves_count_to_new_referrer() {
        let mut u = mining_user(5, TierLink::Explicit(2));
        ReferralPropagator::propagate(&mut u, ts(2), Some(&snapshot(2, TierLink::None)));
        u.id_t0 = TierLink::Default(3);
        let out = ReferralPropagator::propagate(&mut u, ts(3), Some(&snapshot(3, TierLink::None)));
        assert!(out.tier_link_changed);
        assert_eq!(
            out.counter_deltas,
            vec![delta(2, CounterField::ActiveT1Referrals, -1), delta(3, CounterField::ActiveT1Referrals, 1)]
        );
    }

    // --- Mining stop ---

    #[test]
    fn stop_decrements_once() {
        let mut u = mining_user(5, TierLink::Explicit(2));
        let referrer = snapshot(2, TierLink::None);
        ReferralPropagator::propagate(&mut u, ts(2), Some(&referrer));
        assert_eq!(u.referrals_count_change_guard_updated_at, Some(ts(1)));

        let stop = ReferralPropagator::propagate(&mut u, ts(11), Some(&referrer));
        assert!(stop.stopped);
        assert_eq!(stop.counter_deltas, vec![delta(2, CounterField::ActiveT1Referrals, -1)]);
        assert_eq!(u.referrals_count_change_guard_updated_at, Some(ts(10)));

        let again = ReferralPropagator::propagate(&mut u, ts(12), Some(&referrer));
        assert_eq!(again, Propagation::default());
    }

    #[test]
    fn self_referral_is_never_counted() {
        let mut u = mining_user(5, TierLink::Explicit(5));
        let out = ReferralPropagator::propagate(&mut u, ts(2), Some(&snapshot(5, TierLink::Explicit(5))));
        assert!(out.counter_deltas.is_empty());
        assert_eq!(u.id_t_minus_1, TierLink::None);
    }

    proptest! {
        /// Re-reading an unchanged link any number of times nets exactly one increment.
        #[test]
        fn repeated_reads_count_exactly_once(passes in 1usize..20, referrer in 2u64..50) {
            let mut u = mining_user(1, TierLink::Default(referrer));
            let snap = snapshot(referrer, TierLink::None);
            let mut net = 0i64;
            for i in 0..passes {
                let out = ReferralPropagator::propagate(&mut u, ts(2) + chrono::Duration::minutes(i as i64), Some(&snap));
                net += out.counter_deltas.iter().filter(|d| d.user_id == referrer).map(|d| d.delta).sum::<i64>();
            }
            prop_assert_eq!(net, 1);
        }
    }
}
