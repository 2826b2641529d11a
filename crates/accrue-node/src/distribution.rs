//! Coin-distribution collection window.
//!
//! While the daily window is open, even iterations of each mining worker
//! collect users whose standard balance clears the minimum and emit a
//! `CoinDistributionReady` event for each, once per window. The window's
//! start and end are announced to a consumer task over a single-slot channel.
//! A barrier mutex serializes the announcements: whichever worker first
//! observes a transition sends it, and `Started` always precedes `Ended` for
//! the same activation.

use accrue_core::types::{Event, UserState};
use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::CoinDistributionConfig;

/// Start of the window containing `now`, if the window is open.
pub fn window_start(config: &CoinDistributionConfig, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !config.enabled || now.hour() < config.start_hour || now.hour() >= config.end_hour {
        return None;
    }
    let start = NaiveTime::from_hms_opt(config.start_hour, 0, 0)?;
    Some(now.date_naive().and_time(start).and_utc())
}

/// Whether a worker's `iteration` collects for the distribution.
pub fn collects(config: &CoinDistributionConfig, now: DateTime<Utc>, iteration: u64) -> bool {
    iteration % 2 == 0 && window_start(config, now).is_some()
}

/// Mark `user` collected for the window and return its event.
///
/// `None` when the user was already collected in this window or holds less
/// than the minimum.
pub fn collect(user: &mut UserState, min_balance: f64, window_start: DateTime<Utc>, now: DateTime<Utc>) -> Option<Event> {
    if user.coin_distribution_collected_at.is_some_and(|at| at >= window_start) {
        return None;
    }
    let amount = user.total_standard;
    if amount <= 0.0 || amount < min_balance {
        return None;
    }
    user.coin_distribution_collected_at = Some(now);
    Some(Event::CoinDistributionReady { user_id: user.id, amount, at: now })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseSignal {
    Started(DateTime<Utc>),
    Ended(DateTime<Utc>),
}

/// Serializes window transitions observed by any worker.
///
/// Both signals share one channel with a single slot, so delivery is ordered
/// but not a rendezvous: a send returns once the signal is buffered, and only
/// waits while the consumer has not yet taken the previous one.
pub struct PhaseCoordinator {
    tx: mpsc::Sender<PhaseSignal>,
    active: Mutex<Option<DateTime<Utc>>>,
}

impl PhaseCoordinator {
    /// Coordinator plus the receiver for [`spawn_phase_consumer`].
    pub fn new() -> (Self, mpsc::Receiver<PhaseSignal>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx, active: Mutex::new(None) }, rx)
    }

    /// Announce a transition if the window state differs from the last one
    /// announced. Best effort: a closed consumer is ignored.
    pub async fn observe(&self, config: &CoinDistributionConfig, now: DateTime<Utc>) {
        let mut active = self.active.lock().await;
        match (*active, window_start(config, now)) {
            (None, Some(start)) => {
                *active = Some(start);
                let _ = self.tx.send(PhaseSignal::Started(start)).await;
            }
            (Some(current), Some(start)) if start != current => {
                let _ = self.tx.send(PhaseSignal::Ended(now)).await;
                *active = Some(start);
                let _ = self.tx.send(PhaseSignal::Started(start)).await;
            }
            (Some(_), None) => {
                *active = None;
                let _ = self.tx.send(PhaseSignal::Ended(now)).await;
            }
            _ => {}
        }
    }

    /// Close an open window on shutdown.
    pub async fn finish(&self, now: DateTime<Utc>) {
        let mut active = self.active.lock().await;
        if active.take().is_some() {
            let _ = self.tx.send(PhaseSignal::Ended(now)).await;
        }
    }
}

/// Summary returned by the consumer once every sender is gone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseLog {
    pub started: u32,
    pub ended: u32,
}

/// Drain phase signals until the coordinator is dropped.
pub fn spawn_phase_consumer(mut rx: mpsc::Receiver<PhaseSignal>) -> JoinHandle<PhaseLog> {
    tokio::spawn(async move {
        let mut log = PhaseLog::default();
        let mut opened_at: Option<DateTime<Utc>> = None;
        while let Some(signal) = rx.recv().await {
            match signal {
                PhaseSignal::Started(at) => {
                    log.started += 1;
                    opened_at = Some(at);
                    info!(%at, "coin distribution window opened");
                }
                PhaseSignal::Ended(at) => {
                    log.ended += 1;
                    let open_for = opened_at.take().map(|o| at - o).unwrap_or_else(Duration::zero);
                    info!(%at, open_secs = open_for.num_seconds(), "coin distribution window closed");
                }
            }
        }
        debug!(started = log.started, ended = log.ended, "phase consumer drained");
        log
    })
}
