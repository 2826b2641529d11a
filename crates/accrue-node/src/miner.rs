//! Sharded mining loop.
//!
//! Each [`MiningWorker`] owns a disjoint slice of the user key space and runs
//! strictly sequential iterations over it: fetch a page, fetch the referrer
//! snapshots, accrue, then persist through the [`PersistenceCommitter`].
//! A transient failure drops the whole iteration and re-reads the same page;
//! an invariant violation stops the worker with an error. A user the engine
//! rejects (an unknown boost level) is left untouched and the rest of the
//! page still commits.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use accrue_core::error::AccrueError;
use accrue_core::types::{ReferralSnapshot, UserId};
use accrue_engine::accrual::AccrualEngine;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::committer::{Iteration, PersistenceCommitter};
use crate::config::MinerConfig;
use crate::distribution::{collect, collects, window_start, PhaseCoordinator};
use crate::handle::StoreHandle;
use crate::partition::{ShardedBatchScanner, Strided};
use crate::snapshot::ConfigCell;
use crate::telemetry::{Phase, PhaseTimer, TelemetryGovernor};

/// Result of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// No allocated user falls in this worker's slice yet.
    Idle,
    Processed { users: usize, updated: usize },
}

pub struct MiningWorker {
    scanner: ShardedBatchScanner<Strided>,
    store: StoreHandle,
    committer: PersistenceCommitter,
    cell: Arc<ConfigCell>,
    coordinator: Arc<PhaseCoordinator>,
    governor: TelemetryGovernor,
    retry_backoff: Duration,
    idle: Duration,
}

impl MiningWorker {
    pub fn new(
        worker: u32,
        config: &MinerConfig,
        store: StoreHandle,
        committer: PersistenceCommitter,
        cell: Arc<ConfigCell>,
        coordinator: Arc<PhaseCoordinator>,
    ) -> Self {
        Self {
            scanner: ShardedBatchScanner::new(worker, Strided::new(config.workers), config.batch_size),
            store,
            committer,
            cell,
            coordinator,
            governor: TelemetryGovernor::new(worker, config.balance_sync_every, config.telemetry_every),
            retry_backoff: config.retry_backoff(),
            idle: config.idle(),
        }
    }

    pub fn worker(&self) -> u32 {
        self.scanner.worker()
    }

    /// Loop until `shutdown` flips. The iteration in flight always finishes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), AccrueError> {
        let worker = self.worker();
        info!(worker, "mining worker started");
        while !*shutdown.borrow() {
            let pause = match self.iterate(Utc::now()).await {
                Ok(Step::Processed { .. }) => {
                    self.scanner.advance();
                    None
                }
                Ok(Step::Idle) => Some(self.idle),
                Err(e) if e.is_fatal() => {
                    error!(worker, page = self.scanner.cursor(), "invariant violated: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!(worker, page = self.scanner.cursor(), "iteration failed, retrying page: {}", e);
                    Some(self.retry_backoff)
                }
            };
            if let Some(pause) = pause {
                if sleep_or_shutdown(&mut shutdown, pause).await {
                    break;
                }
            }
        }
        info!(worker, iterations = self.governor.iterations(), "mining worker stopped");
        Ok(())
    }

    /// Process the current page once. Never moves the scanner cursor.
    pub async fn iterate(&mut self, now: DateTime<Utc>) -> Result<Step, AccrueError> {
        let snapshot = self.cell.current();
        let mut timer = PhaseTimer::start();

        let max_user_id = self.store.call(|s| s.max_user_id()).await?;
        let ids = self.scanner.page(max_user_id);
        if ids.is_empty() {
            return Ok(Step::Idle);
        }
        let users = self.store.call(move |s| s.get_users(&ids)).await?;
        timer.mark(Phase::Fetch);

        let referrer_ids: Vec<UserId> = users
            .iter()
            .flat_map(|u| [u.id_t0.id(), u.id_t_minus_1.id()])
            .flatten()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let referrals: HashMap<UserId, ReferralSnapshot> = if referrer_ids.is_empty() {
            HashMap::new()
        } else {
            self.store
                .call(move |s| s.get_referrals(&referrer_ids))
                .await?
                .into_iter()
                .map(|r| (r.id, r))
                .collect()
        };
        timer.mark(Phase::Referrals);

        let distribution = &snapshot.coin_distribution;
        self.coordinator.observe(distribution, now).await;
        let collecting = if collects(distribution, now, self.governor.iterations()) {
            window_start(distribution, now)
        } else {
            None
        };

        let engine = AccrualEngine::new(&snapshot.engine, &snapshot.curve);
        let unit = snapshot.engine.time_unit;
        let mut iteration = Iteration::default();
        for user in &users {
            let t0 = user.id_t0.id().and_then(|id| referrals.get(&id));
            let t_minus_1 = user.id_t_minus_1.id().and_then(|id| referrals.get(&id));
            let mut outcome = match engine.accrue(now, user, t0, t_minus_1) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(worker = self.worker(), user_id = user.id, "skipping user: {}", e);
                    continue;
                }
            };

            if let Some(start) = collecting {
                let mut candidate = outcome.user.clone().unwrap_or_else(|| user.clone());
                if let Some(event) = collect(&mut candidate, distribution.min_balance, start, now) {
                    iteration.events.push(event);
                    outcome.user = Some(candidate);
                }
            }
            iteration.record(user, outcome, now, unit);
        }
        iteration.batch.global_deltas = self.governor.global_deltas(iteration.minted, iteration.slashed);
        timer.mark(Phase::Accrue);

        let (minted, slashed, updated) = (iteration.minted, iteration.slashed, iteration.updated_users());
        self.committer.persist(iteration, &mut timer).await?;

        timer.log(self.worker(), users.len());
        self.governor.committed(minted, slashed, users.len(), &timer);
        debug!(worker = self.worker(), users = users.len(), updated, version = snapshot.version, "iteration committed");
        Ok(Step::Processed { users: users.len(), updated })
    }
}

/// `true` when shutdown was requested (or its sender dropped) during the pause.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, pause: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(pause) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
