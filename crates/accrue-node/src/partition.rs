//! Key-space partitioning across mining workers.
//!
//! Worker `w` of `W` owns the keys `{W * i + w : i >= 0}`. The partition is
//! closed-form, so two workers can never fetch the same user.

use accrue_core::types::UserId;

/// Assignment of user keys to workers.
pub trait Partition: Send + Sync {
    fn workers(&self) -> u32;

    /// The `index`-th key owned by `worker`.
    fn key(&self, worker: u32, index: u64) -> UserId;

    fn owner(&self, key: UserId) -> u32;
}

/// Round-robin striding: key `k` belongs to worker `k mod W`.
#[derive(Debug, Clone, Copy)]
pub struct Strided {
    workers: u32,
}

impl Strided {
    pub fn new(workers: u32) -> Self {
        Self { workers: workers.max(1) }
    }
}

impl Partition for Strided {
    fn workers(&self) -> u32 {
        self.workers
    }

    fn key(&self, worker: u32, index: u64) -> UserId {
        u64::from(self.workers) * index + u64::from(worker)
    }

    fn owner(&self, key: UserId) -> u32 {
        (key % u64::from(self.workers)) as u32
    }
}

/// Pages through one worker's keys, wrapping around at the highest id.
///
/// The cursor only moves on [`advance`](Self::advance), so a failed
/// iteration re-reads the same page.
pub struct ShardedBatchScanner<P> {
    worker: u32,
    partition: P,
    batch_size: usize,
    start: u64,
    cursor: u64,
}

impl<P: Partition> ShardedBatchScanner<P> {
    pub fn new(worker: u32, partition: P, batch_size: usize) -> Self {
        // Id 0 is never allocated.
        let start = u64::from(partition.key(worker, 0) == 0);
        Self { worker, partition, batch_size: batch_size.max(1), start, cursor: start }
    }

    pub fn worker(&self) -> u32 {
        self.worker
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Keys of the current page that can exist given `max_user_id`.
    ///
    /// Restarts from the first page once the cursor has passed every
    /// allocated id.
    pub fn page(&mut self, max_user_id: UserId) -> Vec<UserId> {
        if self.partition.key(self.worker, self.cursor) > max_user_id {
            self.cursor = self.start;
        }
        (self.cursor..self.cursor + self.batch_size as u64)
            .map(|i| self.partition.key(self.worker, i))
            .take_while(|k| *k <= max_user_id)
            .collect()
    }

    pub fn advance(&mut self) {
        self.cursor += self.batch_size as u64;
    }
}
