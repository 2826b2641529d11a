//! Accumulation and persistence of one mining loop iteration.
//!
//! [`Iteration`] gathers every accrual outcome of a page in memory. Nothing
//! reaches the store until [`PersistenceCommitter::persist`] runs, and if any
//! step fails the whole `Iteration` is dropped and the page is re-read.

use std::sync::Arc;

use accrue_core::error::AccrueError;
use accrue_core::time::TimeUnit;
use accrue_core::traits::EventPublisher;
use accrue_core::types::{CommitBatch, Event, HistoryRow, UserState};
use accrue_engine::accrual::AccrualOutcome;
use chrono::{DateTime, Utc};

use crate::handle::StoreHandle;
use crate::telemetry::{Phase, PhaseTimer};

#[derive(Debug, Default)]
pub struct Iteration {
    pub batch: CommitBatch,
    pub events: Vec<Event>,
    pub history: Vec<HistoryRow>,
    pub minted: f64,
    pub slashed: f64,
}

impl Iteration {
    /// Fold one user's outcome in. `before` is the record the pass read.
    pub fn record(&mut self, before: &UserState, outcome: AccrualOutcome, now: DateTime<Utc>, unit: TimeUnit) {
        let pending = outcome.pending_increments();
        let Some(user) = outcome.user else {
            return;
        };

        self.batch.counter_deltas.extend(outcome.counter_deltas);
        self.batch.pending_increments.extend(pending);
        self.minted += outcome.minted;
        self.slashed += outcome.slashed;

        if outcome.record_history {
            if let Some(last) = before.balance_last_updated_at {
                self.history.push(HistoryRow::closing(before, unit.cycle_start(last)));
            }
            self.batch.leaderboard.push((user.id, user.total_standard + user.total_pre_staking));
        }
        if let Some(available_at) = outcome.extra_bonus_available_at {
            self.events.push(Event::ExtraBonusAvailable { user_id: user.id, available_at });
        }
        self.events.push(Event::BalanceUpdated {
            user_id: user.id,
            total_standard: user.total_standard,
            total_pre_staking: user.total_pre_staking,
            total_minted: user.total_minted,
            total_slashed: user.total_slashed,
            at: now,
        });
        self.batch.users.push(user);
    }

    pub fn updated_users(&self) -> usize {
        self.batch.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty() && self.events.is_empty() && self.history.is_empty()
    }
}

/// Sends events, appends history, then commits the batch.
#[derive(Clone)]
pub struct PersistenceCommitter {
    store: StoreHandle,
    publisher: Arc<dyn EventPublisher>,
}

impl PersistenceCommitter {
    pub fn new(store: StoreHandle, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { store, publisher }
    }

    pub async fn persist(&self, iteration: Iteration, timer: &mut PhaseTimer) -> Result<(), AccrueError> {
        let Iteration { batch, events, history, .. } = iteration;

        self.publisher.publish_all(events).await?;
        timer.mark(Phase::Events);

        if !history.is_empty() {
            self.store.call(move |s| s.append_history(&history)).await?;
        }
        timer.mark(Phase::History);

        if !batch.is_empty() {
            self.store.call(move |s| s.commit(&batch, batch.mode())).await?;
        }
        timer.mark(Phase::Commit);
        Ok(())
    }
}
