//! Retroactive re-derivation of the six aggregated balance views.
//!
//! Raw ledger rows are `Dated`, `Reverse` and `Pending` deltas; `UntilNow`
//! rows are derived per balance type as the sum of the raw rows. One pass
//! over a user:
//!
//! 1. consumes `Pending` rows into the current dated bucket,
//! 2. mints over the mining pieces of `[last, now)`, split at bucket,
//!    milestone and referrer-session boundaries, so the bucket spanning a
//!    session boundary is backfilled exactly up to it,
//! 3. degrades after session end, linearly against the positive reference
//!    of each type, switching to the aggressive period once the gap is long,
//! 4. reverts the decay rows of the rollback window when a new session
//!    starts inside it,
//! 5. rewrites the `UntilNow` aggregates and emits whole-row replacements.
//!
//! Every change is a whole-row replacement or deletion, so replaying a pass
//! from the same input yields the same rows.

use std::collections::{BTreeMap, HashMap};

use accrue_core::constants::{BALANCE_EPSILON, DEGRADATION_PRECISION, T0_REFERRAL_SHARE, T_MINUS_1_REFERRAL_SHARE};
use accrue_core::types::{
    BalanceType, Event, HistoryRow, LedgerBalance, LedgerChanges, LedgerKey, RecalcContext, RecalcWorkerRow,
    SessionWindow, TypeDetail, UserId,
};
use chrono::{DateTime, Duration, Utc};
use tracing::trace;

use crate::adoption::AdoptionCurve;
use crate::settings::RecalcSettings;
use crate::window::{expired_spans, mining_spans, ExpiredSpan, Span};

/// Balance types whose rows are bucketed by date.
const DATED_TYPES: [BalanceType; 4] = [BalanceType::Total, BalanceType::T0, BalanceType::T1, BalanceType::T2];

/// Everything one user's pass reads.
#[derive(Debug, Clone, Copy)]
pub struct RecalcInput<'a> {
    pub row: RecalcWorkerRow,
    pub context: &'a RecalcContext,
    pub ledger: &'a [LedgerBalance],
    /// History rows covering `[last_iteration_finished_at, now)`.
    pub history: &'a [HistoryRow],
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecalcOutcome {
    pub changes: LedgerChanges,
    pub events: Vec<Event>,
    pub minted: f64,
    pub degraded: f64,
    pub rolled_back: f64,
    pub pending_consumed: f64,
    pub disabled: bool,
}

pub struct Recalculator<'a> {
    settings: &'a RecalcSettings,
    curve: &'a AdoptionCurve,
}

impl<'a> Recalculator<'a> {
    pub fn new(settings: &'a RecalcSettings, curve: &'a AdoptionCurve) -> Self {
        Self { settings, curve }
    }

    pub fn recalculate(&self, now: DateTime<Utc>, input: RecalcInput<'_>) -> RecalcOutcome {
        let ctx = input.context;
        let mut row = input.row;
        let mut out = RecalcOutcome::default();
        let mut ledger = Ledger::load(row.shard, ctx.user_id, input.ledger);
        let before = ledger.raw.clone();

        let last = row
            .last_iteration_finished_at
            .or(ctx.session.started_at)
            .unwrap_or(now)
            .min(now);

        out.pending_consumed = ledger.consume_pending(self.settings.time_unit.bucket_start(now));

        let counts = ActiveCounts::new(ctx, input.history, self.settings);
        for span in mining_spans(last, now, &ctx.session) {
            for piece in span.split(self.boundaries(span, ctx)) {
                out.minted += self.mint(&mut ledger, ctx, &counts, piece);
            }
        }

        for expired in expired_spans(last, now, &ctx.session) {
            let aggressive_from = expired.expired_at + self.settings.aggressive_after;
            let cuts = self.bucket_boundaries(expired.span).chain(std::iter::once(aggressive_from));
            for piece in expired.span.split(cuts) {
                out.degraded += self.degrade(&mut ledger, &expired, piece);
            }
        }

        if let Some(start) = self.rollback_start(&ctx.session, &row) {
            out.rolled_back = ledger.rollback(self.settings.time_unit.bucket_start(start.0), start.1);
            row.rollback_applied_for = Some(start.1);
        }

        let previous_total_update = ledger.until_now_updated_at(BalanceType::Total);
        if let Some(event) = self.free_session_event(ctx, &row, previous_total_update, now) {
            out.events.push(event);
        }

        ledger.refresh_until_now();
        out.disabled = ledger.all_until_now_zero() && !ctx.session.is_mining(now);
        row.enabled = !out.disabled;
        row.last_iteration_finished_at = Some(now);

        out.changes = ledger.diff(&before, now);
        out.changes.worker_rows.push(row);
        trace!(
            user_id = ctx.user_id,
            minted = out.minted,
            degraded = out.degraded,
            rolled_back = out.rolled_back,
            "recalculated"
        );
        out
    }

    fn mint(&self, ledger: &mut Ledger, ctx: &RecalcContext, counts: &ActiveCounts, piece: Span) -> f64 {
        let unit = self.settings.time_unit;
        let base = self.curve.integrate(unit, piece.from, piece.to);
        if base <= 0.0 {
            return 0.0;
        }
        let bucket = TypeDetail::Dated(unit.bucket_start(piece.from));
        let mut minted = 0.0;
        let mut credit = |ledger: &mut Ledger, balance_type: BalanceType, detail: TypeDetail, amount: f64| {
            if amount > 0.0 {
                ledger.add(balance_type, detail, amount);
                minted += amount;
            }
        };

        let bonus_active = ctx.extra_bonus > 0.0
            && ctx.extra_bonus_started_at.is_some_and(|start| {
                piece.from >= start && piece.from < start + self.settings.extra_bonus_duration
            });
        let solo = if bonus_active { base * (1.0 + ctx.extra_bonus / 100.0) } else { base };
        credit(ledger, BalanceType::Total, bucket, solo);

        if let Some((t0_id, _)) = ctx.t0.filter(|(_, w)| w.is_mining(piece.from)) {
            credit(ledger, BalanceType::T0, bucket, base * T0_REFERRAL_SHARE);
            credit(ledger, BalanceType::T0Reverse, TypeDetail::Reverse(t0_id), base * T0_REFERRAL_SHARE);
        }
        if let Some((tm1_id, _)) = ctx.t_minus_1.filter(|(_, w)| w.is_mining(piece.from)) {
            credit(ledger, BalanceType::TMinus1Reverse, TypeDetail::Reverse(tm1_id), base * T_MINUS_1_REFERRAL_SHARE);
        }

        let (active_t1, active_t2) = counts.at(piece.from);
        credit(ledger, BalanceType::T1, bucket, base * T0_REFERRAL_SHARE * active_t1);
        credit(ledger, BalanceType::T2, bucket, base * T_MINUS_1_REFERRAL_SHARE * active_t2);
        minted
    }

    /// Degrade every type over one expired piece. Returns the amount removed.
    fn degrade(&self, ledger: &mut Ledger, expired: &ExpiredSpan, piece: Span) -> f64 {
        let aggressive = piece.from >= expired.expired_at + self.settings.aggressive_after;
        let period = if aggressive { self.settings.aggressive_period } else { self.settings.degradation_period };
        let fraction = duration_ratio(piece.to - piece.from, period) * DEGRADATION_PRECISION;
        let bucket = TypeDetail::Degraded(self.settings.time_unit.bucket_start(piece.from));

        let mut degraded = 0.0;
        let mut reverse_ratio = fraction.min(1.0);
        for balance_type in DATED_TYPES {
            let current = ledger.sum(balance_type);
            let reference = ledger.positive_sum(balance_type);
            if current <= 0.0 || reference <= 0.0 {
                continue;
            }
            let amount = (reference * fraction).min(current);
            ledger.add(balance_type, bucket, -amount);
            degraded += amount;
            if balance_type == BalanceType::Total {
                reverse_ratio = amount / current;
            }
        }

        // Reverse rows are single per referrer; they shrink in step with Total,
        // or linearly on their own when Total has nothing left.
        for balance_type in [BalanceType::T0Reverse, BalanceType::TMinus1Reverse] {
            for (_, value) in ledger.raw.iter_mut().filter(|(k, v)| k.balance_type == balance_type && **v > 0.0) {
                let amount = *value * reverse_ratio;
                *value -= amount;
                degraded += amount;
            }
        }
        degraded
    }

    /// `(session end, new start)` when a rollback is due for this pass.
    fn rollback_start(&self, session: &SessionWindow, row: &RecalcWorkerRow) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let (Some(prev_end), Some(start)) = (session.previously_ended_at, session.started_at) else {
            return None;
        };
        if row.rollback_applied_for == Some(start) {
            return None;
        }
        let window_from = prev_end + self.settings.rollback_after;
        let window_until = prev_end + self.settings.rollback_until;
        (start >= window_from && start < window_until).then_some((window_from, start))
    }

    fn free_session_event(
        &self,
        ctx: &RecalcContext,
        row: &RecalcWorkerRow,
        total_updated_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<Event> {
        let session = &ctx.session;
        let (Some(started_at), Some(ended_at)) = (session.started_at, session.ended_at) else {
            return None;
        };
        let unseen = |at: Option<DateTime<Utc>>| at.is_none_or(|t| t < started_at);
        (session.free && started_at <= now && unseen(total_updated_at) && unseen(row.last_iteration_finished_at))
            .then_some(Event::FreeMiningSessionStarted { user_id: ctx.user_id, started_at, ended_at })
    }

    /// Cut points for mint pieces: buckets, extra bonus window, referrer sessions.
    fn boundaries(&self, span: Span, ctx: &RecalcContext) -> Vec<DateTime<Utc>> {
        let mut cuts: Vec<DateTime<Utc>> = self.bucket_boundaries(span).collect();
        if let Some(start) = ctx.extra_bonus_started_at {
            cuts.push(start);
            cuts.push(start + self.settings.extra_bonus_duration);
        }
        for (_, w) in ctx.t0.iter().chain(ctx.t_minus_1.iter()) {
            cuts.extend(w.started_at);
            cuts.extend(w.ended_at);
        }
        cuts
    }

    fn bucket_boundaries(&self, span: Span) -> impl Iterator<Item = DateTime<Utc>> {
        let step = self.settings.time_unit.unit();
        let first = self.settings.time_unit.bucket_start(span.from) + step;
        std::iter::successors(Some(first), move |t| Some(*t + step)).take_while(move |t| *t < span.to)
    }
}

/// Active referral counts per history cycle, falling back to the current ones.
struct ActiveCounts {
    by_cycle: HashMap<DateTime<Utc>, (f64, f64)>,
    current: (f64, f64),
    time_unit: accrue_core::time::TimeUnit,
}

impl ActiveCounts {
    fn new(ctx: &RecalcContext, history: &[HistoryRow], settings: &RecalcSettings) -> Self {
        let clamp = |n: i64| n.max(0) as f64;
        Self {
            by_cycle: history
                .iter()
                .filter(|h| h.user_id == ctx.user_id)
                .map(|h| (h.cycle_started_at, (clamp(h.active_t1_referrals), clamp(h.active_t2_referrals))))
                .collect(),
            current: (clamp(ctx.active_t1_referrals), clamp(ctx.active_t2_referrals)),
            time_unit: settings.time_unit,
        }
    }

    fn at(&self, at: DateTime<Utc>) -> (f64, f64) {
        self.by_cycle.get(&self.time_unit.cycle_start(at)).copied().unwrap_or(self.current)
    }
}

/// Working copy of one user's rows as signed values.
struct Ledger {
    shard: u32,
    user_id: UserId,
    raw: BTreeMap<LedgerKey, f64>,
    until_now: BTreeMap<BalanceType, (f64, DateTime<Utc>)>,
    fresh_until_now: BTreeMap<BalanceType, f64>,
}

impl Ledger {
    fn load(shard: u32, user_id: UserId, rows: &[LedgerBalance]) -> Self {
        let mut ledger = Self {
            shard,
            user_id,
            raw: BTreeMap::new(),
            until_now: BTreeMap::new(),
            fresh_until_now: BTreeMap::new(),
        };
        for row in rows.iter().filter(|r| r.key.user_id == user_id) {
            if row.key.type_detail.is_raw() {
                *ledger.raw.entry(row.key).or_default() += row.signed();
            } else {
                ledger.until_now.insert(row.key.balance_type, (row.signed(), row.updated_at));
            }
        }
        ledger
    }

    fn key(&self, balance_type: BalanceType, type_detail: TypeDetail) -> LedgerKey {
        LedgerKey { shard: self.shard, user_id: self.user_id, balance_type, type_detail }
    }

    fn add(&mut self, balance_type: BalanceType, detail: TypeDetail, amount: f64) {
        let key = self.key(balance_type, detail);
        *self.raw.entry(key).or_default() += amount;
    }

    fn sum(&self, balance_type: BalanceType) -> f64 {
        self.raw.iter().filter(|(k, _)| k.balance_type == balance_type).map(|(_, v)| *v).sum()
    }

    fn positive_sum(&self, balance_type: BalanceType) -> f64 {
        self.raw
            .iter()
            .filter(|(k, v)| k.balance_type == balance_type && **v > 0.0)
            .map(|(_, v)| *v)
            .sum()
    }

    /// Move every `Pending` row into the dated bucket of `bucket`.
    fn consume_pending(&mut self, bucket: DateTime<Utc>) -> f64 {
        let pending: Vec<LedgerKey> =
            self.raw.keys().filter(|k| k.type_detail == TypeDetail::Pending).copied().collect();
        let mut consumed = 0.0;
        for key in pending {
            let value = self.raw.remove(&key).unwrap_or_default();
            self.add(key.balance_type, TypeDetail::Dated(bucket), value);
            consumed += value;
        }
        consumed
    }

    /// Drop the decay rows of `[from, until)`. Returns the amount reverted.
    fn rollback(&mut self, from: DateTime<Utc>, until: DateTime<Utc>) -> f64 {
        let in_window = |key: &LedgerKey| matches!(key.type_detail, TypeDetail::Degraded(b) if b >= from && b < until);
        let decay: Vec<LedgerKey> = self.raw.keys().filter(|k| in_window(*k)).copied().collect();
        let mut reverted = 0.0;
        for key in decay {
            reverted -= self.raw.remove(&key).unwrap_or_default();
        }
        reverted
    }

    fn until_now_updated_at(&self, balance_type: BalanceType) -> Option<DateTime<Utc>> {
        self.until_now.get(&balance_type).map(|(_, at)| *at)
    }

    fn refresh_until_now(&mut self) {
        self.fresh_until_now = BalanceType::ALL.iter().map(|bt| (*bt, self.sum(*bt))).collect();
    }

    fn all_until_now_zero(&self) -> bool {
        self.fresh_until_now.values().all(|v| v.abs() <= BALANCE_EPSILON)
    }

    /// Whole-row replacements and deletions turning `before` into the current rows.
    fn diff(&self, before: &BTreeMap<LedgerKey, f64>, now: DateTime<Utc>) -> LedgerChanges {
        let mut changes = LedgerChanges::default();
        let keys: std::collections::BTreeSet<LedgerKey> = before.keys().chain(self.raw.keys()).copied().collect();
        for key in keys {
            let old = before.get(&key).copied();
            let new = self.raw.get(&key).copied().unwrap_or_default();
            push_change(&mut changes, key, old, new, now);
        }
        for (balance_type, value) in &self.fresh_until_now {
            let key = self.key(*balance_type, TypeDetail::UntilNow);
            let old = self.until_now.get(balance_type).map(|(v, _)| *v);
            push_change(&mut changes, key, old, *value, now);
        }
        changes
    }
}

fn push_change(changes: &mut LedgerChanges, key: LedgerKey, old: Option<f64>, new: f64, now: DateTime<Utc>) {
    match (old, LedgerBalance::from_signed(key, new, now)) {
        (Some(old), Some(row)) if old != new => changes.replacements.push(row),
        (None, Some(row)) => changes.replacements.push(row),
        (Some(_), None) => changes.deletions.push(key),
        _ => {}
    }
}

fn duration_ratio(part: Duration, whole: Duration) -> f64 {
    let whole = whole.num_milliseconds();
    if whole <= 0 {
        return f64::INFINITY;
    }
    part.num_milliseconds().max(0) as f64 / whole as f64
}
