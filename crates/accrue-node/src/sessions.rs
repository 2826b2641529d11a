//! Mining session start and extension.
//!
//! The first start of a user creates its record with create-if-absent. A
//! concurrent creator that loses the race sees `AlreadyExists` and falls
//! back to updating the record that won.

use std::sync::Arc;

use accrue_core::error::{AccrueError, StoreError};
use accrue_core::traits::EventPublisher;
use accrue_core::types::{Event, RecalcWorkerRow, TierLink, UserId, UserState};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::handle::StoreHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartRequest {
    /// Credit back the decay of the gap since the previous session.
    pub resurrect: bool,
    /// Day-off session granted without user action.
    pub free: bool,
    /// Referrer to link when the user has none yet.
    pub referrer: Option<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStart {
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// An active session was prolonged instead of a new one started.
    pub extended: bool,
    pub created: bool,
}

pub struct SessionStarter {
    store: StoreHandle,
    publisher: Arc<dyn EventPublisher>,
    session_length: Duration,
    recalc_shards: u32,
}

impl SessionStarter {
    pub fn new(store: StoreHandle, publisher: Arc<dyn EventPublisher>, session_length: Duration, recalc_shards: u32) -> Self {
        Self { store, publisher, session_length, recalc_shards }
    }

    pub async fn start(&self, user_id: UserId, now: DateTime<Utc>, request: StartRequest) -> Result<SessionStart, AccrueError> {
        let length = self.session_length;
        let shards = self.recalc_shards;
        let start = self
            .store
            .call(move |s| {
                let mut fresh = UserState::new(user_id);
                let initial = apply_start(&mut fresh, now, length, request);
                match s.create_user_if_absent(&fresh) {
                    Ok(()) => return Ok(SessionStart { created: true, ..initial }),
                    Err(StoreError::AlreadyExists(_)) => {}
                    Err(e) => return Err(e),
                }
                let mut outcome = None;
                let found = s.modify_user(user_id, &mut |user| outcome = Some(apply_start(user, now, length, request)))?;
                match outcome.filter(|_| found) {
                    Some(start) => Ok(start),
                    None => Err(StoreError::NotFound(format!("user:{user_id}"))),
                }
            })
            .await?;

        self.store.call(move |s| s.enroll_recalc_worker(RecalcWorkerRow::new(user_id, shards))).await?;

        if !start.extended {
            self.publisher
                .publish(Event::MiningSessionStarted {
                    user_id,
                    started_at: start.started_at,
                    ended_at: start.ended_at,
                })
                .await?;
            info!(user_id, created = start.created, free = request.free, "mining session started");
        } else {
            debug!(user_id, ended_at = %start.ended_at, "mining session extended");
        }
        Ok(start)
    }

    /// Allocate the next dense user id and start its first session.
    pub async fn register(&self, now: DateTime<Utc>, request: StartRequest) -> Result<SessionStart, AccrueError> {
        let user_id = self.store.call(|s| s.allocate_user_id()).await?;
        debug!(user_id, "allocated user id");
        self.start(user_id, now, request).await
    }
}

fn apply_start(user: &mut UserState, now: DateTime<Utc>, length: Duration, request: StartRequest) -> SessionStart {
    if user.id_t0 == TierLink::None {
        if let Some(referrer) = request.referrer.filter(|r| *r != user.id) {
            user.id_t0 = TierLink::Default(referrer);
        }
    }
    let ended_at = now + length;
    user.solo_last_started_at = Some(now);
    user.free_session = request.free;

    if user.is_mining(now) {
        user.solo_ended_at = Some(ended_at);
        let started_at = user.solo_started_at.unwrap_or(now);
        return SessionStart { user_id: user.id, started_at, ended_at, extended: true, created: false };
    }

    user.solo_previously_ended_at = user.solo_ended_at;
    user.solo_started_at = Some(now);
    user.solo_ended_at = Some(ended_at);
    if request.resurrect && user.solo_previously_ended_at.is_some() {
        user.resurrect_solo_used_at = Some(now);
    }
    SessionStart { user_id: user.id, started_at: now, ended_at, extended: false, created: false }
}
