//! RocksDB-backed user, ledger and history storage.
//!
//! Implements [`UserStore`], [`LedgerStore`] and [`HistoryStore`] using
//! column families. Values are bincode-encoded serde records; keys are
//! big-endian so iteration follows id and time order. Every read-modify-write
//! runs under one store mutex and lands in a single [`WriteBatch`].

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;

use accrue_core::apply::{affected_users, apply_commit, recalc_context, validate_ledger_changes};
use accrue_core::error::StoreError;
use accrue_core::traits::{HistoryStore, LedgerStore, UserStore};
use accrue_core::types::{
    AdoptionMilestone, CommitBatch, CommitMode, GlobalCounter, HistoryRow, LedgerBalance, LedgerChanges,
    LedgerKey, PendingTier, RecalcPage, RecalcWorkerRow, UserId, UserState,
};

// --- Column family names ---

const CF_USERS: &str = "users";
const CF_META: &str = "meta";
const CF_LEADERBOARD: &str = "leaderboard";
const CF_SCORES: &str = "scores";
const CF_HISTORY: &str = "history";
const CF_TOKENS: &str = "tokens";
const CF_LEDGER: &str = "ledger";
const CF_RECALC_WORKERS: &str = "recalc_workers";
/// Enabled worker rows keyed by shard, then last pass, then user id.
const CF_RECALC_QUEUE: &str = "recalc_queue";
const CF_ADOPTION: &str = "adoption";

/// All column family names.
const ALL_CFS: &[&str] = &[
    CF_USERS,
    CF_META,
    CF_LEADERBOARD,
    CF_SCORES,
    CF_HISTORY,
    CF_TOKENS,
    CF_LEDGER,
    CF_RECALC_WORKERS,
    CF_RECALC_QUEUE,
    CF_ADOPTION,
];

// --- Metadata keys ---

const META_MAX_USER_ID: &[u8] = b"max_user_id";

pub struct RocksStore {
    db: DB,
    /// Serializes every read-modify-write.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a database at `path`, creating missing column families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> =
            ALL_CFS.iter().map(|name| ColumnFamilyDescriptor::new(*name, Options::default())).collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors).map_err(backend)?;
        Ok(Self { db, write_lock: Mutex::new(()) })
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(backend)
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db.cf_handle(name).ok_or_else(|| StoreError::Backend(format!("missing column family: {name}")))
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(cf, key).map_err(backend)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn read_user(&self, id: UserId) -> Result<Option<UserState>, StoreError> {
        self.get(CF_USERS, &id.to_be_bytes())
    }

    fn put_user(&self, batch: &mut WriteBatch, user: &UserState) -> Result<(), StoreError> {
        batch.put_cf(self.cf_handle(CF_USERS)?, user.id.to_be_bytes(), encode(user)?);
        Ok(())
    }

    fn read_f64(&self, cf: &str, key: &[u8]) -> Result<Option<f64>, StoreError> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(cf, key).map_err(backend)? {
            Some(bytes) => {
                let raw: [u8; 8] =
                    bytes.as_slice().try_into().map_err(|_| StoreError::Codec("invalid f64 length".into()))?;
                Ok(Some(f64::from_le_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    /// Every `(key, value)` of `cf` whose key starts with `prefix`.
    fn scan_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let cf = self.cf_handle(cf)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item.map_err(backend)?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    fn decode_all<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>, StoreError> {
        self.scan_prefix(cf, &[])?.iter().map(|(_, v)| decode(v)).collect()
    }

    /// Write a worker row and move its queue entry. Caller holds `write_lock`.
    fn put_worker_row(&self, batch: &mut WriteBatch, row: &RecalcWorkerRow) -> Result<(), StoreError> {
        let key = row.user_id.to_be_bytes();
        let cf_queue = self.cf_handle(CF_RECALC_QUEUE)?;
        if let Some(old) = self.get::<RecalcWorkerRow>(CF_RECALC_WORKERS, &key)? {
            batch.delete_cf(cf_queue, queue_key(&old));
        }
        if row.enabled {
            batch.put_cf(cf_queue, queue_key(row), b"");
        }
        batch.put_cf(self.cf_handle(CF_RECALC_WORKERS)?, key, encode(row)?);
        Ok(())
    }

    fn write_leaderboard(
        &self,
        batch: &mut WriteBatch,
        entries: &[(UserId, f64)],
    ) -> Result<(), StoreError> {
        let cf_lb = self.cf_handle(CF_LEADERBOARD)?;
        let cf_scores = self.cf_handle(CF_SCORES)?;
        let mut written: HashMap<UserId, f64> = HashMap::new();
        for (user_id, score) in entries {
            let old = match written.get(user_id) {
                Some(s) => Some(*s),
                None => self.read_f64(CF_SCORES, &user_id.to_be_bytes())?,
            };
            if let Some(old) = old {
                batch.delete_cf(cf_lb, leaderboard_key(old, *user_id));
            }
            batch.put_cf(cf_lb, leaderboard_key(*score, *user_id), score.to_le_bytes());
            batch.put_cf(cf_scores, user_id.to_be_bytes(), score.to_le_bytes());
            written.insert(*user_id, *score);
        }
        Ok(())
    }

    fn write_globals(&self, batch: &mut WriteBatch, deltas: &[(GlobalCounter, f64)]) -> Result<(), StoreError> {
        let mut summed: BTreeMap<&'static str, f64> = BTreeMap::new();
        for (counter, delta) in deltas {
            *summed.entry(counter.name()).or_default() += delta;
        }
        let cf = self.cf_handle(CF_META)?;
        for (name, delta) in summed {
            let key = global_key(name);
            let current = self.read_f64(CF_META, &key)?.unwrap_or(0.0);
            batch.put_cf(cf, key, (current + delta).to_le_bytes());
        }
        Ok(())
    }
}

impl UserStore for RocksStore {
    fn max_user_id(&self) -> Result<UserId, StoreError> {
        let cf = self.cf_handle(CF_META)?;
        match self.db.get_cf(cf, META_MAX_USER_ID).map_err(backend)? {
            Some(bytes) => {
                let raw: [u8; 8] =
                    bytes.as_slice().try_into().map_err(|_| StoreError::Codec("invalid max_user_id".into()))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    fn compare_and_set_max_user_id(&self, expected: UserId, new: UserId) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        if self.max_user_id()? != expected {
            return Ok(false);
        }
        let cf = self.cf_handle(CF_META)?;
        self.db.put_cf(cf, META_MAX_USER_ID, new.to_be_bytes()).map_err(backend)?;
        Ok(true)
    }

    fn get_users(&self, ids: &[UserId]) -> Result<Vec<UserState>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(user) = self.read_user(*id)? {
                out.push(user);
            }
        }
        Ok(out)
    }

    fn create_user_if_absent(&self, user: &UserState) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        if self.read_user(user.id)?.is_some() {
            return Err(StoreError::AlreadyExists(format!("user:{}", user.id)));
        }
        let mut batch = WriteBatch::default();
        self.put_user(&mut batch, user)?;
        if user.id > self.max_user_id()? {
            batch.put_cf(self.cf_handle(CF_META)?, META_MAX_USER_ID, user.id.to_be_bytes());
        }
        self.db.write(batch).map_err(backend)
    }

    fn modify_user(&self, id: UserId, f: &mut dyn FnMut(&mut UserState)) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        let Some(mut user) = self.read_user(id)? else {
            return Ok(false);
        };
        f(&mut user);
        let mut batch = WriteBatch::default();
        self.put_user(&mut batch, &user)?;
        self.db.write(batch).map_err(backend)?;
        Ok(true)
    }

    fn commit(&self, batch: &CommitBatch, mode: CommitMode) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut loaded = BTreeMap::new();
        for id in affected_users(batch) {
            if let Some(user) = self.read_user(id)? {
                loaded.insert(id, user);
            }
        }
        apply_commit(&mut loaded, batch)?;

        match mode {
            CommitMode::Transactional => {
                let mut wb = WriteBatch::default();
                for user in loaded.values() {
                    self.put_user(&mut wb, user)?;
                }
                self.write_leaderboard(&mut wb, &batch.leaderboard)?;
                self.write_globals(&mut wb, &batch.global_deltas)?;
                self.db.write(wb).map_err(backend)
            }
            CommitMode::Pipelined => {
                for user in loaded.values() {
                    let mut wb = WriteBatch::default();
                    self.put_user(&mut wb, user)?;
                    self.db.write(wb).map_err(backend)?;
                }
                if !batch.leaderboard.is_empty() || !batch.global_deltas.is_empty() {
                    let mut wb = WriteBatch::default();
                    self.write_leaderboard(&mut wb, &batch.leaderboard)?;
                    self.write_globals(&mut wb, &batch.global_deltas)?;
                    self.db.write(wb).map_err(backend)?;
                }
                Ok(())
            }
        }
    }

    fn credit_pending_once(
        &self,
        token: &str,
        user_id: UserId,
        tier: PendingTier,
        amount: f64,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        let cf_tokens = self.cf_handle(CF_TOKENS)?;
        if self.db.get_cf(cf_tokens, token.as_bytes()).map_err(backend)?.is_some() {
            return Ok(false);
        }
        let mut user = self.read_user(user_id)?.ok_or_else(|| StoreError::NotFound(format!("user:{user_id}")))?;
        user.pending_mut(tier).pending += amount;

        let mut batch = WriteBatch::default();
        self.put_user(&mut batch, &user)?;
        batch.put_cf(cf_tokens, token.as_bytes(), encode(&Utc::now())?);
        self.db.write(batch).map_err(backend)?;
        Ok(true)
    }

    fn leaderboard_top(&self, limit: usize) -> Result<Vec<(UserId, f64)>, StoreError> {
        let cf = self.cf_handle(CF_LEADERBOARD)?;
        let mut out = Vec::with_capacity(limit);
        for item in self.db.iterator_cf(cf, IteratorMode::Start).take(limit) {
            let (key, value) = item.map_err(backend)?;
            let id: [u8; 8] = key.get(8..16).and_then(|b| b.try_into().ok()).ok_or_else(|| {
                StoreError::Codec("invalid leaderboard key".into())
            })?;
            let score: [u8; 8] =
                value.as_ref().try_into().map_err(|_| StoreError::Codec("invalid leaderboard score".into()))?;
            out.push((u64::from_be_bytes(id), f64::from_le_bytes(score)));
        }
        Ok(out)
    }

    fn global_counter(&self, counter: GlobalCounter) -> Result<f64, StoreError> {
        Ok(self.read_f64(CF_META, &global_key(counter.name()))?.unwrap_or(0.0))
    }

    fn adoption_milestones(&self) -> Result<Vec<AdoptionMilestone>, StoreError> {
        self.decode_all(CF_ADOPTION)
    }

    fn put_adoption_milestone(&self, milestone: AdoptionMilestone) -> Result<(), StoreError> {
        let mut key = time_key(milestone.achieved_at).to_vec();
        key.extend_from_slice(&milestone.milestone.to_be_bytes());
        let cf = self.cf_handle(CF_ADOPTION)?;
        self.db.put_cf(cf, key, encode(&milestone)?).map_err(backend)
    }
}

impl LedgerStore for RocksStore {
    fn fetch_recalc_page(&self, shard: u32, limit: usize) -> Result<RecalcPage, StoreError> {
        let cf_queue = self.cf_handle(CF_RECALC_QUEUE)?;
        let prefix = shard.to_be_bytes();
        let mut rows = Vec::with_capacity(limit);
        for item in self.db.iterator_cf(cf_queue, IteratorMode::From(&prefix[..], Direction::Forward)) {
            if rows.len() >= limit {
                break;
            }
            let (key, _) = item.map_err(backend)?;
            if !key.starts_with(&prefix[..]) {
                break;
            }
            let id_bytes: [u8; 8] = key[key.len() - 8..]
                .try_into()
                .map_err(|_| StoreError::Codec("invalid recalc queue key".into()))?;
            let user_id = UserId::from_be_bytes(id_bytes);
            if let Some(row) = self.get::<RecalcWorkerRow>(CF_RECALC_WORKERS, &user_id.to_be_bytes())? {
                rows.push(row);
            }
        }

        let mut page = RecalcPage { rows: Vec::with_capacity(rows.len()), adoption: self.adoption_milestones()? };
        for row in rows {
            let Some(user) = self.read_user(row.user_id)? else {
                continue;
            };
            let t0 = match user.id_t0.id() {
                Some(id) => self.read_user(id)?,
                None => None,
            };
            let t_minus_1 = match user.id_t_minus_1.id() {
                Some(id) => self.read_user(id)?,
                None => None,
            };
            page.rows.push((row, recalc_context(&user, t0.as_ref(), t_minus_1.as_ref())));
        }
        Ok(page)
    }

    fn ledger_rows(&self, user_ids: &[UserId]) -> Result<Vec<LedgerBalance>, StoreError> {
        let mut out = Vec::new();
        for id in user_ids {
            for (_, value) in self.scan_prefix(CF_LEDGER, &id.to_be_bytes())? {
                out.push(decode(&value)?);
            }
        }
        Ok(out)
    }

    fn apply_ledger_changes(&self, changes: &LedgerChanges) -> Result<(), StoreError> {
        validate_ledger_changes(changes)?;
        let _guard = self.write_lock.lock();
        let cf_ledger = self.cf_handle(CF_LEDGER)?;
        let mut batch = WriteBatch::default();
        for key in &changes.deletions {
            batch.delete_cf(cf_ledger, ledger_key(key)?);
        }
        for row in &changes.replacements {
            batch.put_cf(cf_ledger, ledger_key(&row.key)?, encode(row)?);
        }
        for row in &changes.worker_rows {
            self.put_worker_row(&mut batch, row)?;
        }
        self.db.write(batch).map_err(backend)
    }

    fn enroll_recalc_worker(&self, row: RecalcWorkerRow) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let row = match self.get::<RecalcWorkerRow>(CF_RECALC_WORKERS, &row.user_id.to_be_bytes())? {
            Some(existing) => RecalcWorkerRow { enabled: true, ..existing },
            None => row,
        };
        let mut batch = WriteBatch::default();
        self.put_worker_row(&mut batch, &row)?;
        self.db.write(batch).map_err(backend)
    }
}

impl HistoryStore for RocksStore {
    fn append_history(&self, rows: &[HistoryRow]) -> Result<(), StoreError> {
        let cf = self.cf_handle(CF_HISTORY)?;
        let mut batch = WriteBatch::default();
        for row in rows {
            batch.put_cf(cf, history_key(row.user_id, row.cycle_started_at), encode(row)?);
        }
        self.db.write(batch).map_err(backend)
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
        let cf = self.cf_handle(CF_HISTORY)?;
        let start = history_key(user_id, from);
        let end = history_key(user_id, to);
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item.map_err(backend)?;
            if key.as_ref() >= end.as_slice() {
                break;
            }
            out.push(decode(&value)?);
        }
        Ok(out)
    }
}

// --- Encoding ---

fn backend(e: rocksdb::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StoreError::Codec(e.to_string()))
}

fn global_key(name: &str) -> Vec<u8> {
    format!("global:{name}").into_bytes()
}

/// Big-endian instant with the sign bit flipped, so byte order is time order.
fn time_key(at: DateTime<Utc>) -> [u8; 8] {
    ((at.timestamp_millis() as u64) ^ (1 << 63)).to_be_bytes()
}

fn history_key(user_id: UserId, cycle_started_at: DateTime<Utc>) -> Vec<u8> {
    let mut key = user_id.to_be_bytes().to_vec();
    key.extend_from_slice(&time_key(cycle_started_at));
    key
}

/// Shard, then the last pass (never-run rows first), then user id.
fn queue_key(row: &RecalcWorkerRow) -> Vec<u8> {
    let mut key = row.shard.to_be_bytes().to_vec();
    match row.last_iteration_finished_at {
        None => key.extend_from_slice(&[0u8; 9]),
        Some(at) => {
            key.push(1);
            key.extend_from_slice(&time_key(at));
        }
    }
    key.extend_from_slice(&row.user_id.to_be_bytes());
    key
}

/// User id prefix, then the encoded key, so one user's rows are contiguous.
fn ledger_key(key: &LedgerKey) -> Result<Vec<u8>, StoreError> {
    let mut out = key.user_id.to_be_bytes().to_vec();
    out.extend(encode(key)?);
    Ok(out)
}

/// Descending score order, ties broken by ascending id.
fn leaderboard_key(score: f64, user_id: UserId) -> [u8; 16] {
    let bits = score.to_bits();
    let ascending = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&(!ascending).to_be_bytes());
    key[8..].copy_from_slice(&user_id.to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use accrue_core::types::{BalanceType, CounterDelta, CounterField, TierLink, TypeDetail};
    use chrono::TimeZone;

    fn temp_store() -> (RocksStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path().join("accruedata")).unwrap();
        (store, dir)
    }

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 4, h, 0, 0).unwrap()
    }

    fn ledger_row(user_id: UserId, detail: TypeDetail, value: f64) -> LedgerBalance {
        let key = LedgerKey { shard: 0, user_id, balance_type: BalanceType::Total, type_detail: detail };
        LedgerBalance::from_signed(key, value, ts(0)).unwrap()
    }

    // --- Users ---

    #[test]
    fn open_empty_store() {
        let (store, _dir) = temp_store();
        assert_eq!(store.max_user_id().unwrap(), 0);
        assert!(store.get_user(1).unwrap().is_none());
        assert!(store.leaderboard_top(10).unwrap().is_empty());
    }

    #[test]
    fn create_if_absent_round_trips_and_fails_loudly() {
        let (store, _dir) = temp_store();
        let mut user = UserState::new(5);
        user.id_t0 = TierLink::Default(2);
        user.solo_started_at = Some(ts(1));
        store.create_user_if_absent(&user).unwrap();
        assert_eq!(store.get_user(5).unwrap(), Some(user.clone()));
        assert_eq!(store.max_user_id().unwrap(), 5);
        assert_eq!(store.create_user_if_absent(&user), Err(StoreError::AlreadyExists("user:5".into())));
    }

    #[test]
    fn allocate_user_id_uses_cas() {
        let (store, _dir) = temp_store();
        assert_eq!(store.allocate_user_id().unwrap(), 1);
        assert_eq!(store.allocate_user_id().unwrap(), 2);
        assert!(!store.compare_and_set_max_user_id(0, 9).unwrap());
    }

    #[test]
    fn reopen_preserves_users() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            store.create_user_if_absent(&UserState::new(3)).unwrap();
            store.flush().unwrap();
        }
        let store = RocksStore::open(dir.path()).unwrap();
        assert!(store.get_user(3).unwrap().is_some());
        assert_eq!(store.max_user_id().unwrap(), 3);
    }

    #[test]
    fn modify_user_missing_returns_false() {
        let (store, _dir) = temp_store();
        assert!(!store.modify_user(4, &mut |u| u.balance_solo = 1.0).unwrap());
    }

    // --- Commit ---

    #[test]
    fn transactional_commit_applies_counters_and_pending() {
        let (store, _dir) = temp_store();
        for id in [1, 2] {
            store.create_user_if_absent(&UserState::new(id)).unwrap();
        }
        let mut u1 = UserState::new(1);
        u1.balance_solo = 10.0;
        u1.solo_started_at = Some(ts(9));
        let batch = CommitBatch {
            users: vec![u1],
            counter_deltas: vec![CounterDelta { user_id: 2, field: CounterField::ActiveT1Referrals, delta: 1 }],
            pending_increments: vec![accrue_core::types::PendingIncrement {
                user_id: 2,
                tier: PendingTier::T1,
                amount: 2.5,
            }],
            leaderboard: vec![(1, 10.0)],
            global_deltas: vec![(GlobalCounter::TotalMinted, 10.0)],
        };
        store.commit(&batch, batch.mode()).unwrap();

        let u1 = store.get_user(1).unwrap().unwrap();
        assert_eq!(u1.balance_solo, 10.0);
        // Session timestamps belong to other writers.
        assert_eq!(u1.solo_started_at, None);
        let u2 = store.get_user(2).unwrap().unwrap();
        assert_eq!(u2.active_t1_referrals, 1);
        assert_eq!(u2.t1_pending.pending, 2.5);
        assert_eq!(store.global_counter(GlobalCounter::TotalMinted).unwrap(), 10.0);
    }

    #[test]
    fn negative_counter_rejects_whole_batch() {
        let (store, _dir) = temp_store();
        store.create_user_if_absent(&UserState::new(1)).unwrap();
        let mut u1 = UserState::new(1);
        u1.balance_solo = 7.0;
        let batch = CommitBatch {
            users: vec![u1],
            counter_deltas: vec![CounterDelta { user_id: 1, field: CounterField::ActiveT2Referrals, delta: -1 }],
            ..CommitBatch::default()
        };
        assert!(matches!(store.commit(&batch, batch.mode()), Err(StoreError::Invariant(_))));
        assert_eq!(store.get_user(1).unwrap().unwrap().balance_solo, 0.0);
    }

    #[test]
    fn pipelined_commit_writes_each_user() {
        let (store, _dir) = temp_store();
        let mut users = Vec::new();
        for id in [1, 2, 3] {
            store.create_user_if_absent(&UserState::new(id)).unwrap();
            let mut u = UserState::new(id);
            u.balance_t1 = id as f64;
            users.push(u);
        }
        let batch = CommitBatch { users, ..CommitBatch::default() };
        assert_eq!(batch.mode(), CommitMode::Pipelined);
        store.commit(&batch, batch.mode()).unwrap();
        let totals: Vec<f64> = store.get_users(&[1, 2, 3]).unwrap().iter().map(|u| u.balance_t1).collect();
        assert_eq!(totals, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn leaderboard_orders_descending_and_rescores() {
        let (store, _dir) = temp_store();
        let batch = CommitBatch { leaderboard: vec![(1, 5.0), (2, 9.0), (3, 7.0)], ..CommitBatch::default() };
        store.commit(&batch, batch.mode()).unwrap();
        let rescore = CommitBatch { leaderboard: vec![(2, 1.0)], ..CommitBatch::default() };
        store.commit(&rescore, rescore.mode()).unwrap();
        assert_eq!(store.leaderboard_top(3).unwrap(), vec![(3, 7.0), (1, 5.0), (2, 1.0)]);
    }

    #[test]
    fn leaderboard_key_orders_scores() {
        assert!(leaderboard_key(10.0, 1) < leaderboard_key(2.0, 1));
        assert!(leaderboard_key(0.0, 1) < leaderboard_key(-3.0, 1));
        assert!(leaderboard_key(4.0, 1) < leaderboard_key(4.0, 2));
    }

    // --- Idempotency tokens ---

    #[test]
    fn credit_pending_once_dedups() {
        let (store, _dir) = temp_store();
        store.create_user_if_absent(&UserState::new(8)).unwrap();
        assert!(store.credit_pending_once("m-1", 8, PendingTier::Solo, 3.0).unwrap());
        assert!(!store.credit_pending_once("m-1", 8, PendingTier::Solo, 3.0).unwrap());
        assert_eq!(store.get_user(8).unwrap().unwrap().solo_pending.pending, 3.0);
        assert!(matches!(store.credit_pending_once("m-2", 99, PendingTier::Solo, 1.0), Err(StoreError::NotFound(_))));
    }

    // --- Ledger ---

    #[test]
    fn ledger_rows_are_scoped_per_user() {
        let (store, _dir) = temp_store();
        let changes = LedgerChanges {
            replacements: vec![
                ledger_row(1, TypeDetail::Dated(ts(1)), 4.0),
                ledger_row(1, TypeDetail::Dated(ts(2)), -1.5),
                ledger_row(2, TypeDetail::Pending, 2.0),
            ],
            ..LedgerChanges::default()
        };
        store.apply_ledger_changes(&changes).unwrap();
        let rows = store.ledger_rows(&[1]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().map(|r| r.signed()).sum::<f64>(), 2.5);

        let delete = LedgerChanges { deletions: vec![rows[0].key], ..LedgerChanges::default() };
        store.apply_ledger_changes(&delete).unwrap();
        assert_eq!(store.ledger_rows(&[1]).unwrap().len(), 1);
        assert_eq!(store.ledger_rows(&[2]).unwrap().len(), 1);
    }

    #[test]
    fn negative_magnitude_is_rejected() {
        let (store, _dir) = temp_store();
        let mut row = ledger_row(1, TypeDetail::Pending, 1.0);
        row.amount = -1.0;
        let changes = LedgerChanges { replacements: vec![row], ..LedgerChanges::default() };
        assert!(matches!(store.apply_ledger_changes(&changes), Err(StoreError::Invariant(_))));
    }

    #[test]
    fn recalc_page_orders_and_reenables() {
        let (store, _dir) = temp_store();
        for id in [2, 4, 6] {
            store.create_user_if_absent(&UserState::new(id)).unwrap();
        }
        let mut done = RecalcWorkerRow::new(2, 2);
        done.last_iteration_finished_at = Some(ts(5));
        let mut disabled = RecalcWorkerRow::new(4, 2);
        disabled.enabled = false;
        let changes = LedgerChanges { worker_rows: vec![done, disabled], ..LedgerChanges::default() };
        store.apply_ledger_changes(&changes).unwrap();
        store.enroll_recalc_worker(RecalcWorkerRow::new(6, 2)).unwrap();

        let ids: Vec<UserId> = store.fetch_recalc_page(0, 10).unwrap().rows.iter().map(|(r, _)| r.user_id).collect();
        assert_eq!(ids, vec![6, 2]);

        store.enroll_recalc_worker(RecalcWorkerRow::new(4, 2)).unwrap();
        let ids: Vec<UserId> = store.fetch_recalc_page(0, 10).unwrap().rows.iter().map(|(r, _)| r.user_id).collect();
        assert_eq!(ids, vec![4, 6, 2]);
    }

    #[test]
    fn recalc_queue_follows_worker_rows() {
        let (store, _dir) = temp_store();
        for id in 1..=6 {
            store.create_user_if_absent(&UserState::new(id)).unwrap();
            store.enroll_recalc_worker(RecalcWorkerRow::new(id, 2)).unwrap();
        }
        let shard_of_1 = RecalcWorkerRow::new(1, 2).shard;
        let page = |limit| -> Vec<UserId> {
            store.fetch_recalc_page(shard_of_1, limit).unwrap().rows.iter().map(|(r, _)| r.user_id).collect()
        };
        let first = page(10);
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|id| RecalcWorkerRow::new(*id, 2).shard == shard_of_1));
        assert_eq!(page(2), first[..2].to_vec());

        // A finished pass moves the row behind the never-run ones.
        let mut done = RecalcWorkerRow::new(first[0], 2);
        done.last_iteration_finished_at = Some(ts(3));
        let changes = LedgerChanges { worker_rows: vec![done], ..LedgerChanges::default() };
        store.apply_ledger_changes(&changes).unwrap();
        assert_eq!(page(10), vec![first[1], first[2], first[0]]);

        // Disabling drops it from the queue.
        done.enabled = false;
        done.last_iteration_finished_at = Some(ts(4));
        let changes = LedgerChanges { worker_rows: vec![done], ..LedgerChanges::default() };
        store.apply_ledger_changes(&changes).unwrap();
        assert_eq!(page(10), vec![first[1], first[2]]);
    }

    // --- History and adoption ---

    #[test]
    fn history_range_is_half_open() {
        let (store, _dir) = temp_store();
        let user = UserState::new(3);
        let rows: Vec<HistoryRow> = [1, 2, 3].iter().map(|h| HistoryRow::closing(&user, ts(*h))).collect();
        store.append_history(&rows).unwrap();
        store.append_history(&[HistoryRow::closing(&UserState::new(4), ts(2))]).unwrap();
        let got = store.history_range(3, ts(1), ts(3)).unwrap();
        assert_eq!(got.iter().map(|r| r.cycle_started_at).collect::<Vec<_>>(), vec![ts(1), ts(2)]);
        assert!(store.history_range(3, ts(3), ts(1)).unwrap().is_empty());
    }

    #[test]
    fn adoption_milestones_are_time_ordered() {
        let (store, _dir) = temp_store();
        for (n, h, rate) in [(2, 6, 8.0), (1, 0, 16.0)] {
            store
                .put_adoption_milestone(AdoptionMilestone { milestone: n, achieved_at: ts(h), base_mining_rate: rate })
                .unwrap();
        }
        let rates: Vec<f64> = store.adoption_milestones().unwrap().iter().map(|m| m.base_mining_rate).collect();
        assert_eq!(rates, vec![16.0, 8.0]);
    }
}
