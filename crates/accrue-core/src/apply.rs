//! Store-agnostic application of commit batches and ledger changes.
//!
//! Both the in-memory store and the RocksDB store load the affected records,
//! run them through these functions and write the result back, so the merge
//! and invariant rules live in one place.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::InvariantViolation;
use crate::types::{
    CommitBatch, CounterField, LedgerChanges, RecalcContext, SessionWindow, UserId, UserState,
};

/// Every user record a batch reads or writes.
pub fn affected_users(batch: &CommitBatch) -> BTreeSet<UserId> {
    let mut ids: BTreeSet<UserId> = batch.users.iter().map(|u| u.id).collect();
    ids.extend(batch.counter_deltas.iter().map(|d| d.user_id));
    ids.extend(batch.pending_increments.iter().map(|p| p.user_id));
    ids
}

/// Net counter change per `(user, field)`.
pub fn net_counter_deltas(batch: &CommitBatch) -> Result<HashMap<(UserId, CounterField), i64>, InvariantViolation> {
    let mut net: HashMap<(UserId, CounterField), i64> = HashMap::new();
    for delta in &batch.counter_deltas {
        if delta.delta == 0 {
            return Err(InvariantViolation::ZeroCounterDelta(delta.user_id));
        }
        *net.entry((delta.user_id, delta.field)).or_default() += delta.delta;
    }
    Ok(net)
}

/// Apply `batch` to the loaded `stored` records.
///
/// Counters are validated before anything is mutated, so on error `stored`
/// is untouched. Users missing from `stored` (deleted by an external
/// collaborator mid-iteration) are skipped.
pub fn apply_commit(stored: &mut BTreeMap<UserId, UserState>, batch: &CommitBatch) -> Result<(), InvariantViolation> {
    let net = net_counter_deltas(batch)?;
    for ((user_id, field), delta) in &net {
        if let Some(user) = stored.get(user_id) {
            let value = counter(user, *field) + delta;
            if value < 0 {
                return Err(InvariantViolation::NegativeCounter { user_id: *user_id, field: field.name(), value });
            }
        }
    }

    for update in &batch.users {
        if let Some(user) = stored.get_mut(&update.id) {
            user.merge_engine_fields(update);
        }
    }
    for ((user_id, field), delta) in net {
        if let Some(user) = stored.get_mut(&user_id) {
            *counter_mut(user, field) += delta;
        }
    }
    for inc in &batch.pending_increments {
        if let Some(user) = stored.get_mut(&inc.user_id) {
            user.pending_mut(inc.tier).pending += inc.amount;
        }
    }
    Ok(())
}

/// Reject ledger rows that break the single-sign representation.
pub fn validate_ledger_changes(changes: &LedgerChanges) -> Result<(), InvariantViolation> {
    match changes.replacements.iter().find(|r| r.amount < 0.0 || r.amount.is_nan()) {
        Some(row) => Err(InvariantViolation::NegativeLedgerMagnitude(row.key.user_id)),
        None => Ok(()),
    }
}

/// Join a user with its referrers' session windows.
pub fn recalc_context(user: &UserState, t0: Option<&UserState>, t_minus_1: Option<&UserState>) -> RecalcContext {
    RecalcContext {
        user_id: user.id,
        session: SessionWindow::from(user),
        t0: t0.map(|r| (r.id, SessionWindow::from(r))),
        t_minus_1: t_minus_1.map(|r| (r.id, SessionWindow::from(r))),
        active_t1_referrals: user.active_t1_referrals,
        active_t2_referrals: user.active_t2_referrals,
        extra_bonus: user.extra_bonus,
        extra_bonus_started_at: user.extra_bonus_started_at,
    }
}

fn counter(user: &UserState, field: CounterField) -> i64 {
    match field {
        CounterField::ActiveT1Referrals => user.active_t1_referrals,
        CounterField::ActiveT2Referrals => user.active_t2_referrals,
    }
}

fn counter_mut(user: &mut UserState, field: CounterField) -> &mut i64 {
    match field {
        CounterField::ActiveT1Referrals => &mut user.active_t1_referrals,
        CounterField::ActiveT2Referrals => &mut user.active_t2_referrals,
    }
}
