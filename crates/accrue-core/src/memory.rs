//! In-memory implementation of the store traits.
//!
//! [`MemoryStore`] mirrors the semantics of the production RocksDB store and
//! is used throughout the test suites. A single write lock serializes every
//! mutation, which makes batches trivially atomic.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ordered_float::OrderedFloat;
use parking_lot::RwLock;

use crate::apply::{affected_users, apply_commit, recalc_context, validate_ledger_changes};
use crate::error::StoreError;
use crate::traits::{HistoryStore, LedgerStore, UserStore};
use crate::types::{
    AdoptionMilestone, CommitBatch, CommitMode, GlobalCounter, HistoryRow, LedgerBalance,
    LedgerChanges, LedgerKey, PendingTier, RecalcPage, RecalcWorkerRow, UserId, UserState,
};

#[derive(Default)]
struct Inner {
    users: BTreeMap<UserId, UserState>,
    max_user_id: UserId,
    leaderboard: BTreeSet<(Reverse<OrderedFloat<f64>>, UserId)>,
    scores: HashMap<UserId, f64>,
    globals: HashMap<GlobalCounter, f64>,
    adoption: Vec<AdoptionMilestone>,
    ledger: BTreeMap<LedgerKey, LedgerBalance>,
    workers: BTreeMap<UserId, RecalcWorkerRow>,
    history: BTreeMap<(UserId, DateTime<Utc>), HistoryRow>,
}

/// In-memory user, ledger and history store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    tokens: DashMap<String, DateTime<Utc>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a user record verbatim (test fixtures).
    pub fn put_user(&self, user: UserState) {
        let mut inner = self.inner.write();
        inner.max_user_id = inner.max_user_id.max(user.id);
        inner.users.insert(user.id, user);
    }

    /// Insert a raw ledger row verbatim (external writers and fixtures).
    pub fn put_ledger_row(&self, row: LedgerBalance) {
        self.inner.write().ledger.insert(row.key, row);
    }

    pub fn worker_row(&self, user_id: UserId) -> Option<RecalcWorkerRow> {
        self.inner.read().workers.get(&user_id).copied()
    }

    pub fn user_count(&self) -> usize {
        self.inner.read().users.len()
    }
}

impl Inner {
    fn set_score(&mut self, user_id: UserId, score: f64) {
        if let Some(old) = self.scores.insert(user_id, score) {
            self.leaderboard.remove(&(Reverse(OrderedFloat(old)), user_id));
        }
        self.leaderboard.insert((Reverse(OrderedFloat(score)), user_id));
    }
}

impl UserStore for MemoryStore {
    fn max_user_id(&self) -> Result<UserId, StoreError> {
        Ok(self.inner.read().max_user_id)
    }

    fn compare_and_set_max_user_id(&self, expected: UserId, new: UserId) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        if inner.max_user_id != expected {
            return Ok(false);
        }
        inner.max_user_id = new;
        Ok(true)
    }

    fn get_users(&self, ids: &[UserId]) -> Result<Vec<UserState>, StoreError> {
        let inner = self.inner.read();
        Ok(ids.iter().filter_map(|id| inner.users.get(id).cloned()).collect())
    }

    fn create_user_if_absent(&self, user: &UserState) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.users.contains_key(&user.id) {
            return Err(StoreError::AlreadyExists(format!("user:{}", user.id)));
        }
        inner.max_user_id = inner.max_user_id.max(user.id);
        inner.users.insert(user.id, user.clone());
        Ok(())
    }

    fn modify_user(&self, id: UserId, f: &mut dyn FnMut(&mut UserState)) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        match inner.users.get_mut(&id) {
            Some(user) => {
                f(user);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn commit(&self, batch: &CommitBatch, _mode: CommitMode) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let mut loaded: BTreeMap<UserId, UserState> = affected_users(batch)
            .into_iter()
            .filter_map(|id| inner.users.get(&id).cloned().map(|u| (id, u)))
            .collect();
        apply_commit(&mut loaded, batch)?;
        inner.users.extend(loaded);
        for (user_id, score) in &batch.leaderboard {
            inner.set_score(*user_id, *score);
        }
        for (counter, delta) in &batch.global_deltas {
            *inner.globals.entry(*counter).or_default() += delta;
        }
        Ok(())
    }

    fn credit_pending_once(
        &self,
        token: &str,
        user_id: UserId,
        tier: PendingTier,
        amount: f64,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        if self.tokens.contains_key(token) {
            return Ok(false);
        }
        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user:{user_id}")))?;
        user.pending_mut(tier).pending += amount;
        self.tokens.insert(token.to_string(), Utc::now());
        Ok(true)
    }

    fn leaderboard_top(&self, limit: usize) -> Result<Vec<(UserId, f64)>, StoreError> {
        let inner = self.inner.read();
        Ok(inner.leaderboard.iter().take(limit).map(|(Reverse(score), id)| (*id, score.0)).collect())
    }

    fn global_counter(&self, counter: GlobalCounter) -> Result<f64, StoreError> {
        Ok(self.inner.read().globals.get(&counter).copied().unwrap_or(0.0))
    }

    fn adoption_milestones(&self) -> Result<Vec<AdoptionMilestone>, StoreError> {
        Ok(self.inner.read().adoption.clone())
    }

    fn put_adoption_milestone(&self, milestone: AdoptionMilestone) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.adoption.push(milestone);
        inner.adoption.sort_by_key(|m| m.achieved_at);
        Ok(())
    }
}

impl LedgerStore for MemoryStore {
    fn fetch_recalc_page(&self, shard: u32, limit: usize) -> Result<RecalcPage, StoreError> {
        let guard = self.inner.read();
        let inner: &Inner = &guard;
        let mut rows: Vec<RecalcWorkerRow> =
            inner.workers.values().filter(|w| w.enabled && w.shard == shard).copied().collect();
        rows.sort_by_key(|w| (w.last_iteration_finished_at, w.user_id));
        rows.truncate(limit);

        let lookup = |id: Option<UserId>| id.and_then(|id| inner.users.get(&id));
        let rows = rows
            .into_iter()
            .filter_map(|row| {
                let user = inner.users.get(&row.user_id)?;
                let ctx = recalc_context(user, lookup(user.id_t0.id()), lookup(user.id_t_minus_1.id()));
                Some((row, ctx))
            })
            .collect();
        Ok(RecalcPage { rows, adoption: inner.adoption.clone() })
    }

    fn ledger_rows(&self, user_ids: &[UserId]) -> Result<Vec<LedgerBalance>, StoreError> {
        let inner = self.inner.read();
        Ok(inner.ledger.values().filter(|r| user_ids.contains(&r.key.user_id)).copied().collect())
    }

    fn apply_ledger_changes(&self, changes: &LedgerChanges) -> Result<(), StoreError> {
        validate_ledger_changes(changes)?;
        let mut inner = self.inner.write();
        for key in &changes.deletions {
            inner.ledger.remove(key);
        }
        for row in &changes.replacements {
            inner.ledger.insert(row.key, *row);
        }
        for row in &changes.worker_rows {
            inner.workers.insert(row.user_id, *row);
        }
        Ok(())
    }

    fn enroll_recalc_worker(&self, row: RecalcWorkerRow) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner
            .workers
            .entry(row.user_id)
            .and_modify(|existing| existing.enabled = true)
            .or_insert(row);
        Ok(())
    }
}

impl HistoryStore for MemoryStore {
    fn append_history(&self, rows: &[HistoryRow]) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        for row in rows {
            inner.history.insert((row.user_id, row.cycle_started_at), row.clone());
        }
        Ok(())
    }

    fn history_range(
        &self,
        user_id: UserId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HistoryRow>, StoreError> {
        if to <= from {
            return Ok(Vec::new());
        }
        let inner = self.inner.read();
        Ok(inner.history.range((user_id, from)..(user_id, to)).map(|(_, row)| row.clone()).collect())
    }
}
