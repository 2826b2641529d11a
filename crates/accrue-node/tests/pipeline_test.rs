//! End-to-end pass over a RocksDB store: session start, mining iteration,
//! ledger recalculation and pending credits.

use std::sync::Arc;
use std::time::Duration;

use accrue_core::error::PublishError;
use accrue_core::traits::{EventPublisher, LedgerStore, UserStore};
use accrue_core::types::{BalanceType, Event, LedgerBalance, PendingTier, TierLink, TypeDetail, UserId};
use accrue_engine::adoption::AdoptionCurve;
use accrue_node_lib::committer::PersistenceCommitter;
use accrue_node_lib::distribution::PhaseCoordinator;
use accrue_node_lib::miner::{MiningWorker, Step};
use accrue_node_lib::pending::Consumed;
use accrue_node_lib::recalc_worker::RecalcWorker;
use accrue_node_lib::snapshot::ConfigCell;
use accrue_node_lib::{MinerConfig, PendingCredit, PendingCreditConsumer, RocksStore, SessionStarter, StartRequest, StoreHandle};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

fn ts(h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 11, 2, h, 0, 0).unwrap()
}

#[derive(Default)]
struct Recording(Mutex<Vec<Event>>);

#[async_trait]
impl EventPublisher for Recording {
    async fn publish(&self, event: Event) -> Result<(), PublishError> {
        self.0.lock().push(event);
        Ok(())
    }
}

fn config() -> MinerConfig {
    let mut config = MinerConfig { workers: 1, batch_size: 10, base_mining_rate: 10.0, ..MinerConfig::default() };
    config.recalc.workers = 1;
    config.recalc.batch_size = 10;
    config
}

struct Daemon {
    store: Arc<RocksStore>,
    handle: StoreHandle,
    events: Arc<Recording>,
    cell: Arc<ConfigCell>,
    config: MinerConfig,
}

impl Daemon {
    fn open(path: &std::path::Path) -> Self {
        let config = config();
        let store = Arc::new(RocksStore::open(path).unwrap());
        let handle = StoreHandle::new(store.clone(), Duration::from_secs(5));
        let cell = Arc::new(ConfigCell::new(&config, AdoptionCurve::constant(10.0).unwrap()));
        Self { store, handle, events: Arc::default(), cell, config }
    }

    fn starter(&self) -> SessionStarter {
        SessionStarter::new(self.handle.clone(), self.events.clone(), self.config.session_length(), 1)
    }

    fn miner(&self) -> MiningWorker {
        let committer = PersistenceCommitter::new(self.handle.clone(), self.events.clone());
        let (coordinator, _phases) = PhaseCoordinator::new();
        MiningWorker::new(0, &self.config, self.handle.clone(), committer, Arc::clone(&self.cell), Arc::new(coordinator))
    }

    fn recalc(&self) -> RecalcWorker {
        RecalcWorker::new(0, &self.config, self.handle.clone(), self.events.clone(), Arc::clone(&self.cell))
    }
}

fn until_now_total(store: &RocksStore, user_id: UserId) -> f64 {
    store
        .ledger_rows(&[user_id])
        .unwrap()
        .iter()
        .filter(|r| r.key.balance_type == BalanceType::Total && r.key.type_detail == TypeDetail::UntilNow)
        .map(LedgerBalance::signed)
        .sum()
}

#[tokio::test]
async fn session_to_ledger_round() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accruedata");

    {
        let d = Daemon::open(&path);
        d.starter().start(1, ts(0), StartRequest::default()).await.unwrap();
        let req = StartRequest { referrer: Some(1), ..StartRequest::default() };
        d.starter().start(2, ts(0), req).await.unwrap();
        assert_eq!(d.store.max_user_id().unwrap(), 2);

        // Mining iteration two hours in.
        let mut miner = d.miner();
        assert_eq!(miner.iterate(ts(2)).await.unwrap(), Step::Processed { users: 2, updated: 2 });
        let referrer = d.store.get_user(1).unwrap().unwrap();
        assert!((referrer.balance_solo - 20.0).abs() < 1e-9);
        assert_eq!(referrer.active_t1_referrals, 1);
        let referee = d.store.get_user(2).unwrap().unwrap();
        assert_eq!(referee.id_t0, TierLink::Explicit(1));
        assert_eq!(referee.solo_started_at, Some(ts(0)));

        // Ledger recalculation over the same interval.
        let pass = d.recalc().pass(ts(2)).await.unwrap();
        assert_eq!(pass.users, 2);
        assert!(pass.minted > 0.0);
        assert!(until_now_total(&d.store, 1) >= 20.0 - 1e-9);

        // Pending credit redelivered once.
        let consumer = PendingCreditConsumer::new(d.handle.clone());
        let credit = PendingCredit { token: "t1-bonus-7".into(), user_id: 2, tier: PendingTier::T1, amount: 3.0 };
        assert_eq!(consumer.consume(credit.clone()).await.unwrap(), Consumed::Credited);
        assert_eq!(consumer.consume(credit).await.unwrap(), Consumed::Duplicate);

        miner.iterate(ts(3)).await.unwrap();
        let referee = d.store.get_user(2).unwrap().unwrap();
        assert!(referee.balance_t1 >= 3.0);
        assert!(!referee.t1_pending.has_unapplied());

        let started = d.events.0.lock().iter().filter(|e| matches!(e, Event::MiningSessionStarted { .. })).count();
        assert_eq!(started, 2);
        d.store.flush().unwrap();
    }

    // Everything survives a reopen.
    let reopened = RocksStore::open(&path).unwrap();
    let referee = reopened.get_user(2).unwrap().unwrap();
    assert_eq!(referee.id_t0, TierLink::Explicit(1));
    assert!(referee.balance_t1 >= 3.0);
    assert!(until_now_total(&reopened, 1) >= 20.0 - 1e-9);
}
