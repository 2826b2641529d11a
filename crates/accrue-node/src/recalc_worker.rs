//! Balance recalculation pipeline.
//!
//! One [`RecalcWorker`] per ledger shard pulls the users whose last pass is
//! oldest, re-derives their ledger rows and writes every replacement and
//! deletion of the page in one atomic ledger write. Events found during the
//! pass are published before that write, so a failed page regenerates them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use accrue_core::error::AccrueError;
use accrue_core::traits::EventPublisher;
use accrue_core::types::{HistoryRow, LedgerBalance, LedgerChanges, UserId};
use accrue_engine::adoption::AdoptionCurve;
use accrue_engine::recalculation::{RecalcInput, Recalculator};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::MinerConfig;
use crate::handle::StoreHandle;
use crate::snapshot::ConfigCell;

/// Aggregates of one page.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RecalcPass {
    pub users: usize,
    pub minted: f64,
    pub degraded: f64,
    pub rolled_back: f64,
    pub pending_consumed: f64,
    pub disabled: usize,
    pub events: usize,
}

pub struct RecalcWorker {
    shard: u32,
    batch_size: usize,
    store: StoreHandle,
    publisher: Arc<dyn EventPublisher>,
    cell: Arc<ConfigCell>,
    interval: Duration,
    retry_backoff: Duration,
}

impl RecalcWorker {
    pub fn new(
        shard: u32,
        config: &MinerConfig,
        store: StoreHandle,
        publisher: Arc<dyn EventPublisher>,
        cell: Arc<ConfigCell>,
    ) -> Self {
        Self {
            shard,
            batch_size: config.recalc.batch_size.max(1),
            store,
            publisher,
            cell,
            interval: Duration::from_millis(config.recalc.interval_ms),
            retry_backoff: config.retry_backoff(),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), AccrueError> {
        info!(shard = self.shard, "recalculation worker started");
        let mut passes = 0u64;
        while !*shutdown.borrow() {
            let pause = match self.pass(Utc::now()).await {
                Ok(pass) if pass.users == self.batch_size => {
                    passes += 1;
                    None
                }
                Ok(_) => {
                    passes += 1;
                    Some(self.interval)
                }
                Err(e) if e.is_fatal() => {
                    error!(shard = self.shard, "invariant violated: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!(shard = self.shard, "recalculation pass failed: {}", e);
                    Some(self.retry_backoff)
                }
            };
            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!(shard = self.shard, passes, "recalculation worker stopped");
        Ok(())
    }

    /// Recalculate one page of this shard.
    pub async fn pass(&self, now: DateTime<Utc>) -> Result<RecalcPass, AccrueError> {
        let snapshot = self.cell.current();
        let (shard, limit) = (self.shard, self.batch_size);
        let page = self.store.call(move |s| s.fetch_recalc_page(shard, limit)).await?;
        if page.rows.is_empty() {
            return Ok(RecalcPass::default());
        }

        let ids: Vec<UserId> = page.rows.iter().map(|(row, _)| row.user_id).collect();
        let ledger_ids = ids.clone();
        let rows = self.store.call(move |s| s.ledger_rows(&ledger_ids)).await?;
        let mut ledger: HashMap<UserId, Vec<LedgerBalance>> = HashMap::new();
        for row in rows {
            ledger.entry(row.key.user_id).or_default().push(row);
        }

        let windows: Vec<(UserId, DateTime<Utc>)> = page
            .rows
            .iter()
            .map(|(row, ctx)| (row.user_id, row.last_iteration_finished_at.or(ctx.session.started_at).unwrap_or(now)))
            .collect();
        let history = self
            .store
            .call(move |s| {
                let mut out: HashMap<UserId, Vec<HistoryRow>> = HashMap::new();
                for (user_id, from) in windows {
                    out.insert(user_id, s.history_range(user_id, from, now)?);
                }
                Ok(out)
            })
            .await?;

        let page_curve;
        let curve = if page.adoption.is_empty() {
            &snapshot.curve
        } else {
            page_curve = AdoptionCurve::new(page.adoption.clone())?;
            &page_curve
        };
        let recalculator = Recalculator::new(&snapshot.recalc, curve);

        let mut pass = RecalcPass { users: page.rows.len(), ..RecalcPass::default() };
        let mut changes = LedgerChanges::default();
        let mut events = Vec::new();
        for (row, context) in &page.rows {
            let input = RecalcInput {
                row: *row,
                context,
                ledger: ledger.get(&row.user_id).map(Vec::as_slice).unwrap_or_default(),
                history: history.get(&row.user_id).map(Vec::as_slice).unwrap_or_default(),
            };
            let outcome = recalculator.recalculate(now, input);
            pass.minted += outcome.minted;
            pass.degraded += outcome.degraded;
            pass.rolled_back += outcome.rolled_back;
            pass.pending_consumed += outcome.pending_consumed;
            pass.disabled += usize::from(outcome.disabled);
            events.extend(outcome.events);
            changes.extend(outcome.changes);
        }

        pass.events = events.len();
        self.publisher.publish_all(events).await?;
        self.store.call(move |s| s.apply_ledger_changes(&changes)).await?;
        debug!(
            shard = self.shard,
            users = pass.users,
            minted = pass.minted,
            degraded = pass.degraded,
            disabled = pass.disabled,
            "recalculation pass"
        );
        Ok(pass)
    }
}
