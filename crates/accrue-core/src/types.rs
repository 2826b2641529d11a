//! Core record types for the Accrue engine.
//!
//! [`UserState`] is a single flat record per participant. Capability grouping
//! (per-tier balances, per-tier slashing rates, pending shadow pairs) is
//! exposed through the [`Tier`] and [`PendingTier`] accessors rather than
//! nested structs, so the store can persist it as one hash.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::BALANCE_EPSILON;

/// Dense integer user identifier. Id `0` is never allocated.
pub type UserId = u64;

/// Referral link to a referrer.
///
/// `Default` is a link written by an external collaborator that the engine
/// has not yet propagated into referrer counters; `Explicit` is a link the
/// engine has confirmed. Both carry the referrer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TierLink {
    #[default]
    None,
    Default(UserId),
    Explicit(UserId),
}

impl TierLink {
    pub fn id(&self) -> Option<UserId> {
        match self {
            Self::None => None,
            Self::Default(id) | Self::Explicit(id) => Some(*id),
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Self::Default(_))
    }

    /// The confirmed form of this link.
    pub fn confirmed(self) -> Self {
        match self {
            Self::Default(id) => Self::Explicit(id),
            other => other,
        }
    }

    pub fn explicit(id: Option<UserId>) -> Self {
        id.map_or(Self::None, Self::Explicit)
    }
}

/// One of the six per-user balance tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    Solo,
    T0,
    T1,
    T2,
    ForT0,
    ForTMinus1,
}

impl Tier {
    pub const ALL: [Tier; 6] = [Tier::Solo, Tier::T0, Tier::T1, Tier::T2, Tier::ForT0, Tier::ForTMinus1];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Solo => "solo",
            Self::T0 => "t0",
            Self::T1 => "t1",
            Self::T2 => "t2",
            Self::ForT0 => "for_t0",
            Self::ForTMinus1 => "for_t_minus_1",
        }
    }

    /// The pending shadow pair feeding this tier, if any.
    pub fn pending(&self) -> Option<PendingTier> {
        match self {
            Self::Solo => Some(PendingTier::Solo),
            Self::T1 => Some(PendingTier::T1),
            Self::T2 => Some(PendingTier::T2),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tiers that receive externally-queued credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingTier {
    Solo,
    T1,
    T2,
}

impl PendingTier {
    pub const ALL: [PendingTier; 3] = [PendingTier::Solo, PendingTier::T1, PendingTier::T2];

    pub fn tier(&self) -> Tier {
        match self {
            Self::Solo => Tier::Solo,
            Self::T1 => Tier::T1,
            Self::T2 => Tier::T2,
        }
    }
}

/// Shadow pair for externally-queued credits.
///
/// `pending` is only ever incremented by external writers; `applied` is only
/// ever written by the engine. `pending - applied` is what remains to apply.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PendingPair {
    pub pending: f64,
    pub applied: f64,
}

impl PendingPair {
    pub fn unapplied(&self) -> f64 {
        self.pending - self.applied
    }

    pub fn has_unapplied(&self) -> bool {
        self.unapplied().abs() > BALANCE_EPSILON
    }

    /// Mark everything pending as applied.
    pub fn snap(&mut self) {
        self.applied = self.pending;
    }
}

/// A participant's full accrual state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserState {
    pub id: UserId,

    pub solo_started_at: Option<DateTime<Utc>>,
    pub solo_last_started_at: Option<DateTime<Utc>>,
    pub solo_ended_at: Option<DateTime<Utc>>,
    pub solo_previously_ended_at: Option<DateTime<Utc>>,
    /// The current session was granted without user action (day off).
    pub free_session: bool,
    pub balance_last_updated_at: Option<DateTime<Utc>>,

    pub balance_solo: f64,
    pub balance_t0: f64,
    pub balance_t1: f64,
    pub balance_t2: f64,
    pub balance_for_t0: f64,
    pub balance_for_t_minus_1: f64,
    pub solo_pending: PendingPair,
    pub t1_pending: PendingPair,
    pub t2_pending: PendingPair,
    pub total_standard: f64,
    pub total_pre_staking: f64,
    pub total_minted: f64,
    pub total_slashed: f64,

    pub slashing_rate_solo: f64,
    pub slashing_rate_t0: f64,
    pub slashing_rate_t1: f64,
    pub slashing_rate_t2: f64,
    pub slashing_rate_for_t0: f64,
    pub slashing_rate_for_t_minus_1: f64,
    /// Session end whose decay was permanently stopped.
    pub slashing_stopped_for: Option<DateTime<Utc>>,
    pub resurrect_solo_used_at: Option<DateTime<Utc>>,
    /// Resurrect marker already credited back.
    pub resurrect_applied_for: Option<DateTime<Utc>>,

    pub id_t0: TierLink,
    pub id_t_minus_1: TierLink,
    /// Referrer currently holding an active-T1 count for this user.
    pub counted_t0: Option<UserId>,
    /// Referrer currently holding an active-T2 count for this user.
    pub counted_t_minus_1: Option<UserId>,
    pub referrals_count_change_guard_updated_at: Option<DateTime<Utc>>,
    pub active_t1_referrals: i64,
    pub active_t2_referrals: i64,

    pub mining_boost_level_index: Option<usize>,
    pub pre_staking_allocation: f64,
    pub pre_staking_bonus: f64,
    pub extra_bonus: f64,
    pub extra_bonus_started_at: Option<DateTime<Utc>>,
    pub extra_bonus_available_notified_at: Option<DateTime<Utc>>,
    /// `Some(true)` is written once when the bonus is credited; the engine
    /// emits `None` afterwards, which the store treats as "leave unchanged".
    pub welcome_bonus_applied: Option<bool>,
    pub coin_distribution_collected_at: Option<DateTime<Utc>>,
}

impl UserState {
    pub fn new(id: UserId) -> Self {
        Self { id, ..Self::default() }
    }

    pub fn balance(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Solo => self.balance_solo,
            Tier::T0 => self.balance_t0,
            Tier::T1 => self.balance_t1,
            Tier::T2 => self.balance_t2,
            Tier::ForT0 => self.balance_for_t0,
            Tier::ForTMinus1 => self.balance_for_t_minus_1,
        }
    }

    pub fn balance_mut(&mut self, tier: Tier) -> &mut f64 {
        match tier {
            Tier::Solo => &mut self.balance_solo,
            Tier::T0 => &mut self.balance_t0,
            Tier::T1 => &mut self.balance_t1,
            Tier::T2 => &mut self.balance_t2,
            Tier::ForT0 => &mut self.balance_for_t0,
            Tier::ForTMinus1 => &mut self.balance_for_t_minus_1,
        }
    }

    pub fn slashing_rate(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Solo => self.slashing_rate_solo,
            Tier::T0 => self.slashing_rate_t0,
            Tier::T1 => self.slashing_rate_t1,
            Tier::T2 => self.slashing_rate_t2,
            Tier::ForT0 => self.slashing_rate_for_t0,
            Tier::ForTMinus1 => self.slashing_rate_for_t_minus_1,
        }
    }

    pub fn slashing_rate_mut(&mut self, tier: Tier) -> &mut f64 {
        match tier {
            Tier::Solo => &mut self.slashing_rate_solo,
            Tier::T0 => &mut self.slashing_rate_t0,
            Tier::T1 => &mut self.slashing_rate_t1,
            Tier::T2 => &mut self.slashing_rate_t2,
            Tier::ForT0 => &mut self.slashing_rate_for_t0,
            Tier::ForTMinus1 => &mut self.slashing_rate_for_t_minus_1,
        }
    }

    pub fn pending(&self, tier: PendingTier) -> &PendingPair {
        match tier {
            PendingTier::Solo => &self.solo_pending,
            PendingTier::T1 => &self.t1_pending,
            PendingTier::T2 => &self.t2_pending,
        }
    }

    pub fn pending_mut(&mut self, tier: PendingTier) -> &mut PendingPair {
        match tier {
            PendingTier::Solo => &mut self.solo_pending,
            PendingTier::T1 => &mut self.t1_pending,
            PendingTier::T2 => &mut self.t2_pending,
        }
    }

    /// Sum of the balances the user owns (excludes amounts accrued for referrers).
    pub fn own_total(&self) -> f64 {
        self.balance_solo + self.balance_t0 + self.balance_t1 + self.balance_t2
    }

    pub fn is_absolute_zero(&self) -> bool {
        Tier::ALL.iter().all(|t| self.balance(*t) == 0.0)
    }

    pub fn has_unapplied_pending(&self) -> bool {
        PendingTier::ALL.iter().any(|t| self.pending(*t).has_unapplied())
    }

    pub fn has_session(&self) -> bool {
        self.solo_started_at.is_some() && self.solo_ended_at.is_some()
    }

    pub fn is_mining(&self, now: DateTime<Utc>) -> bool {
        self.has_session() && self.solo_ended_at.is_some_and(|end| end > now)
    }

    /// Overlay the fields the mining engine owns onto a freshly read record.
    ///
    /// Session timestamps, counters, `pending` halves of the shadow pairs and
    /// external settings stay as stored, since other writers own them. The
    /// `Default -> Explicit` confirmation of `id_t0` only lands when the
    /// stored link is still the one that was confirmed.
    pub fn merge_engine_fields(&mut self, update: &UserState) {
        self.balance_last_updated_at = update.balance_last_updated_at;
        for tier in Tier::ALL {
            *self.balance_mut(tier) = update.balance(tier);
            *self.slashing_rate_mut(tier) = update.slashing_rate(tier);
        }
        for tier in PendingTier::ALL {
            self.pending_mut(tier).applied = update.pending(tier).applied;
        }
        self.total_standard = update.total_standard;
        self.total_pre_staking = update.total_pre_staking;
        self.total_minted = update.total_minted;
        self.total_slashed = update.total_slashed;
        self.slashing_stopped_for = update.slashing_stopped_for;
        self.resurrect_applied_for = update.resurrect_applied_for;

        if let (TierLink::Default(stored), TierLink::Explicit(confirmed)) = (self.id_t0, update.id_t0) {
            if stored == confirmed {
                self.id_t0 = update.id_t0;
            }
        }
        self.id_t_minus_1 = update.id_t_minus_1;
        self.counted_t0 = update.counted_t0;
        self.counted_t_minus_1 = update.counted_t_minus_1;
        self.referrals_count_change_guard_updated_at = update.referrals_count_change_guard_updated_at;

        if update.welcome_bonus_applied.is_some() {
            self.welcome_bonus_applied = update.welcome_bonus_applied;
        }
        self.extra_bonus_available_notified_at = update.extra_bonus_available_notified_at;
        self.coin_distribution_collected_at = update.coin_distribution_collected_at;
    }
}

/// Read-only copy of a referrer's session window and balances for one iteration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReferralSnapshot {
    pub id: UserId,
    pub id_t0: TierLink,
    pub solo_started_at: Option<DateTime<Utc>>,
    pub solo_ended_at: Option<DateTime<Utc>>,
    pub solo_previously_ended_at: Option<DateTime<Utc>>,
    pub free_session: bool,
    pub own_total: f64,
}

impl ReferralSnapshot {
    pub fn is_mining(&self, now: DateTime<Utc>) -> bool {
        self.solo_started_at.is_some() && self.solo_ended_at.is_some_and(|end| end > now)
    }
}

impl From<&UserState> for ReferralSnapshot {
    fn from(user: &UserState) -> Self {
        Self {
            id: user.id,
            id_t0: user.id_t0,
            solo_started_at: user.solo_started_at,
            solo_ended_at: user.solo_ended_at,
            solo_previously_ended_at: user.solo_previously_ended_at,
            free_session: user.free_session,
            own_total: user.own_total(),
        }
    }
}

/// A step change in the base mining rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdoptionMilestone {
    pub milestone: u64,
    pub achieved_at: DateTime<Utc>,
    pub base_mining_rate: f64,
}

/// One row of the boost-level table.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MiningBoostLevel {
    /// Cap on the active T1 referrals that earn; `None` means uncapped.
    pub max_t1_referrals: Option<u32>,
    pub slashing_disabled: bool,
}

/// Outbound domain events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    MiningSessionStarted {
        user_id: UserId,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    },
    FreeMiningSessionStarted {
        user_id: UserId,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    },
    ExtraBonusAvailable {
        user_id: UserId,
        available_at: DateTime<Utc>,
    },
    BalanceUpdated {
        user_id: UserId,
        total_standard: f64,
        total_pre_staking: f64,
        total_minted: f64,
        total_slashed: f64,
        at: DateTime<Utc>,
    },
    CoinDistributionReady {
        user_id: UserId,
        amount: f64,
        at: DateTime<Utc>,
    },
}

impl Event {
    pub fn user_id(&self) -> UserId {
        match self {
            Self::MiningSessionStarted { user_id, .. }
            | Self::FreeMiningSessionStarted { user_id, .. }
            | Self::ExtraBonusAvailable { user_id, .. }
            | Self::BalanceUpdated { user_id, .. }
            | Self::CoinDistributionReady { user_id, .. } => *user_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MiningSessionStarted { .. } => "mining_session_started",
            Self::FreeMiningSessionStarted { .. } => "free_mining_session_started",
            Self::ExtraBonusAvailable { .. } => "extra_bonus_available",
            Self::BalanceUpdated { .. } => "balance_updated",
            Self::CoinDistributionReady { .. } => "coin_distribution_ready",
        }
    }
}

/// Per-user, per-cycle snapshot appended to the history store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub user_id: UserId,
    pub cycle_started_at: DateTime<Utc>,
    pub balance_solo: f64,
    pub balance_t0: f64,
    pub balance_t1: f64,
    pub balance_t2: f64,
    pub total_standard: f64,
    pub total_pre_staking: f64,
    pub total_minted: f64,
    pub total_slashed: f64,
    pub active_t1_referrals: i64,
    pub active_t2_referrals: i64,
}

impl HistoryRow {
    /// Snapshot of `user` closing the cycle that started at `cycle_started_at`.
    pub fn closing(user: &UserState, cycle_started_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user.id,
            cycle_started_at,
            balance_solo: user.balance_solo,
            balance_t0: user.balance_t0,
            balance_t1: user.balance_t1,
            balance_t2: user.balance_t2,
            total_standard: user.total_standard,
            total_pre_staking: user.total_pre_staking,
            total_minted: user.total_minted,
            total_slashed: user.total_slashed,
            active_t1_referrals: user.active_t1_referrals,
            active_t2_referrals: user.active_t2_referrals,
        }
    }
}

// --- Mining loop commit batch ---

/// Referrer counters the mining loop increments across users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterField {
    ActiveT1Referrals,
    ActiveT2Referrals,
}

impl CounterField {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ActiveT1Referrals => "active_t1_referrals",
            Self::ActiveT2Referrals => "active_t2_referrals",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDelta {
    pub user_id: UserId,
    pub field: CounterField,
    pub delta: i64,
}

/// Float increment of another user's `pending` shadow field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PendingIncrement {
    pub user_id: UserId,
    pub tier: PendingTier,
    pub amount: f64,
}

/// Process-wide counters flushed by the balance synchronization cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GlobalCounter {
    TotalMinted,
    TotalSlashed,
}

impl GlobalCounter {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TotalMinted => "total_minted",
            Self::TotalSlashed => "total_slashed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// One atomic write for the whole batch.
    Transactional,
    /// Independent per-user writes; each is idempotent on its own.
    Pipelined,
}

/// Every mutation produced by one mining loop iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitBatch {
    pub users: Vec<UserState>,
    pub counter_deltas: Vec<CounterDelta>,
    pub pending_increments: Vec<PendingIncrement>,
    pub leaderboard: Vec<(UserId, f64)>,
    pub global_deltas: Vec<(GlobalCounter, f64)>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.counter_deltas.is_empty()
            && self.pending_increments.is_empty()
            && self.leaderboard.is_empty()
            && self.global_deltas.is_empty()
    }

    /// Whether the batch touches anything other than the users it was read for.
    pub fn is_cross_user(&self) -> bool {
        !self.counter_deltas.is_empty()
            || !self.pending_increments.is_empty()
            || !self.leaderboard.is_empty()
            || !self.global_deltas.is_empty()
    }

    pub fn mode(&self) -> CommitMode {
        if self.is_cross_user() { CommitMode::Transactional } else { CommitMode::Pipelined }
    }
}

// --- Balance recalculation ledger ---

/// The six aggregated balance views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BalanceType {
    Total,
    T0Reverse,
    TMinus1Reverse,
    T0,
    T1,
    T2,
}

impl BalanceType {
    pub const ALL: [BalanceType; 6] = [
        BalanceType::Total,
        BalanceType::T0Reverse,
        BalanceType::TMinus1Reverse,
        BalanceType::T0,
        BalanceType::T1,
        BalanceType::T2,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TypeDetail {
    /// Derived aggregate of all raw rows of the same type.
    UntilNow,
    /// Externally-queued delta awaiting consumption.
    Pending,
    /// Delta accrued inside the bucket starting at this instant.
    Dated(DateTime<Utc>),
    /// Decay applied inside the bucket starting at this instant. Kept apart
    /// from `Dated` so a rollback reverts decay and nothing else.
    Degraded(DateTime<Utc>),
    /// Amount accrued for a specific referrer.
    Reverse(UserId),
}

impl TypeDetail {
    /// Raw rows carry value; `UntilNow` is derived from them.
    pub fn is_raw(&self) -> bool {
        !matches!(self, Self::UntilNow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey {
    pub shard: u32,
    pub user_id: UserId,
    pub balance_type: BalanceType,
    pub type_detail: TypeDetail,
}

/// A signed ledger amount. Exactly one sign is populated: `amount` is a
/// non-negative magnitude and `negative` selects the sign. Rows whose amount
/// reaches zero are deleted rather than stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LedgerBalance {
    pub key: LedgerKey,
    pub amount: f64,
    pub negative: bool,
    pub updated_at: DateTime<Utc>,
}

impl LedgerBalance {
    /// Build a row from a signed value; `None` when the value is zero.
    pub fn from_signed(key: LedgerKey, value: f64, updated_at: DateTime<Utc>) -> Option<Self> {
        if value.abs() <= BALANCE_EPSILON {
            return None;
        }
        Some(Self { key, amount: value.abs(), negative: value < 0.0, updated_at })
    }

    pub fn signed(&self) -> f64 {
        if self.negative { -self.amount } else { self.amount }
    }
}

/// Per-user recalculation bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecalcWorkerRow {
    pub user_id: UserId,
    pub shard: u32,
    pub last_iteration_finished_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    /// Session start whose rollback has already been applied.
    pub rollback_applied_for: Option<DateTime<Utc>>,
}

impl RecalcWorkerRow {
    pub fn new(user_id: UserId, shards: u32) -> Self {
        Self {
            user_id,
            shard: shard_of(user_id, shards),
            last_iteration_finished_at: None,
            enabled: true,
            rollback_applied_for: None,
        }
    }
}

/// Ledger shard owning a user.
pub fn shard_of(user_id: UserId, shards: u32) -> u32 {
    (user_id % u64::from(shards.max(1))) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionWindow {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub previously_ended_at: Option<DateTime<Utc>>,
    pub free: bool,
}

impl SessionWindow {
    pub fn is_mining(&self, at: DateTime<Utc>) -> bool {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => start <= at && at < end,
            _ => false,
        }
    }
}

impl From<&UserState> for SessionWindow {
    fn from(user: &UserState) -> Self {
        Self {
            started_at: user.solo_started_at,
            ended_at: user.solo_ended_at,
            previously_ended_at: user.solo_previously_ended_at,
            free: user.free_session,
        }
    }
}

/// Referral, adoption and extra-bonus context joined for one user.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecalcContext {
    pub user_id: UserId,
    pub session: SessionWindow,
    pub t0: Option<(UserId, SessionWindow)>,
    pub t_minus_1: Option<(UserId, SessionWindow)>,
    pub active_t1_referrals: i64,
    pub active_t2_referrals: i64,
    pub extra_bonus: f64,
    pub extra_bonus_started_at: Option<DateTime<Utc>>,
}

/// One read of the recalculation pipeline: worker rows with their context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecalcPage {
    pub rows: Vec<(RecalcWorkerRow, RecalcContext)>,
    pub adoption: Vec<AdoptionMilestone>,
}

/// Replacement and deletion sets produced by one recalculation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerChanges {
    pub replacements: Vec<LedgerBalance>,
    pub deletions: Vec<LedgerKey>,
    pub worker_rows: Vec<RecalcWorkerRow>,
}

impl LedgerChanges {
    pub fn is_empty(&self) -> bool {
        self.replacements.is_empty() && self.deletions.is_empty() && self.worker_rows.is_empty()
    }

    pub fn extend(&mut self, other: LedgerChanges) {
        self.replacements.extend(other.replacements);
        self.deletions.extend(other.deletions);
        self.worker_rows.extend(other.worker_rows);
    }
}
