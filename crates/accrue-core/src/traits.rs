//! Trait interfaces for the Accrue engine.
//!
//! These traits define the contracts between crates:
//! - [`UserStore`]: sharded per-user key-value records (accrue-node implements on RocksDB)
//! - [`LedgerStore`]: raw ledger rows and recalculation worker rows
//! - [`HistoryStore`]: append-only per-cycle history snapshots
//! - [`EventPublisher`]: outbound domain events with synchronous delivery confirmation

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{PublishError, StoreError};
use crate::types::{
    AdoptionMilestone, CommitBatch, CommitMode, Event, GlobalCounter, HistoryRow, LedgerBalance,
    LedgerChanges, PendingTier, RecalcPage, RecalcWorkerRow, ReferralSnapshot, UserId, UserState,
};

/// Per-user records addressed by dense integer id.
///
/// Implementations must make [`commit`](Self::commit) all-or-nothing in
/// [`CommitMode::Transactional`] and must apply user records through
/// [`UserState::merge_engine_fields`] so concurrent external writers are not
/// clobbered.
pub trait UserStore: Send + Sync {
    /// Highest id ever allocated, `0` when no user exists.
    fn max_user_id(&self) -> Result<UserId, StoreError>;

    /// Compare-and-set the id counter. Returns `false` when `expected` is stale.
    fn compare_and_set_max_user_id(&self, expected: UserId, new: UserId) -> Result<bool, StoreError>;

    /// Allocate the next user id, retrying transparently on CAS conflicts.
    fn allocate_user_id(&self) -> Result<UserId, StoreError> {
        loop {
            let current = self.max_user_id()?;
            let next = current + 1;
            if self.compare_and_set_max_user_id(current, next)? {
                return Ok(next);
            }
        }
    }

    /// Fetch the users that exist among `ids`, in `ids` order.
    fn get_users(&self, ids: &[UserId]) -> Result<Vec<UserState>, StoreError>;

    fn get_user(&self, id: UserId) -> Result<Option<UserState>, StoreError> {
        Ok(self.get_users(&[id])?.into_iter().next())
    }

    /// Referral snapshots for the users that exist among `ids`.
    fn get_referrals(&self, ids: &[UserId]) -> Result<Vec<ReferralSnapshot>, StoreError> {
        Ok(self.get_users(ids)?.iter().map(ReferralSnapshot::from).collect())
    }

    /// Create `user`, failing with [`StoreError::AlreadyExists`] if the id is taken.
    fn create_user_if_absent(&self, user: &UserState) -> Result<(), StoreError>;

    /// Atomically read-modify-write one user. Returns `false` if absent.
    fn modify_user(&self, id: UserId, f: &mut dyn FnMut(&mut UserState)) -> Result<bool, StoreError>;

    /// Persist one mining loop iteration.
    fn commit(&self, batch: &CommitBatch, mode: CommitMode) -> Result<(), StoreError>;

    /// Add `amount` to a user's `pending` shadow field once per `token`.
    ///
    /// Returns `false` when the token was already claimed (duplicate delivery).
    fn credit_pending_once(
        &self,
        token: &str,
        user_id: UserId,
        tier: PendingTier,
        amount: f64,
    ) -> Result<bool, StoreError>;

    /// Highest-ranked users, best first.
    fn leaderboard_top(&self, limit: usize) -> Result<Vec<(UserId, f64)>, StoreError>;

    fn global_counter(&self, counter: GlobalCounter) -> Result<f64, StoreError>;

    /// Milestones ordered by `achieved_at`.
    fn adoption_milestones(&self) -> Result<Vec<AdoptionMilestone>, StoreError>;

    /// Append a milestone. Only external writers call this.
    fn put_adoption_milestone(&self, milestone: AdoptionMilestone) -> Result<(), StoreError>;
}

/// Raw ledger rows and per-user recalculation bookkeeping.
pub trait LedgerStore: Send + Sync {
    /// Enabled worker rows of `shard`, oldest `last_iteration_finished_at`
    /// first (never-run rows lead), joined with their context in one read.
    fn fetch_recalc_page(&self, shard: u32, limit: usize) -> Result<RecalcPage, StoreError>;

    /// All ledger rows of the given users.
    fn ledger_rows(&self, user_ids: &[UserId]) -> Result<Vec<LedgerBalance>, StoreError>;

    /// Apply whole-row replacements, deletions and worker-row updates atomically.
    fn apply_ledger_changes(&self, changes: &LedgerChanges) -> Result<(), StoreError>;

    /// Insert or re-enable a worker row.
    fn enroll_recalc_worker(&self, row: RecalcWorkerRow) -> Result<(), StoreError>;
}

/// Append-only history snapshots.
pub trait HistoryStore: Send + Sync {
    fn append_history(&self, rows: &[HistoryRow]) -> Result<(), StoreError>;

    /// Rows of `user_id` whose cycle started in `[from, to)`, oldest first.
    fn history_range(
        &self,
        user_id: UserId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HistoryRow>, StoreError>;
}

/// Outbound event bus. A send only returns `Ok` once delivery is confirmed.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: Event) -> Result<(), PublishError>;

    /// Send events in order, stopping at the first unconfirmed delivery.
    async fn publish_all(&self, events: Vec<Event>) -> Result<(), PublishError> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}
