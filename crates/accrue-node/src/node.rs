//! Daemon composition.
//!
//! [`AccrueNode`] wires storage, the event bus, the runtime settings cell and
//! the coin-distribution coordinator together. [`AccrueNode::start`] spawns
//! the mining workers, the recalculation workers and the config syncer into
//! one [`WorkerPool`]; [`RunningNode::run_until`] drives them until a
//! shutdown signal or a fatal worker error.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use accrue_core::error::AccrueError;
use accrue_core::traits::EventPublisher;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::committer::PersistenceCommitter;
use crate::config::MinerConfig;
use crate::distribution::{spawn_phase_consumer, PhaseCoordinator, PhaseLog};
use crate::events::{log_sink, spawn_sink, ChannelPublisher};
use crate::handle::{Store, StoreHandle};
use crate::miner::MiningWorker;
use crate::pending::PendingCreditConsumer;
use crate::pool::WorkerPool;
use crate::recalc_worker::RecalcWorker;
use crate::sessions::SessionStarter;
use crate::snapshot::{curve_from, ConfigCell, ConfigSyncer};
use crate::storage::RocksStore;

/// Capacity of the in-process event bus.
const EVENT_BUS_CAPACITY: usize = 1024;

pub struct AccrueNode {
    config: MinerConfig,
    config_path: Option<PathBuf>,
    store: StoreHandle,
    publisher: Arc<dyn EventPublisher>,
    cell: Arc<ConfigCell>,
    coordinator: Arc<PhaseCoordinator>,
    phase_consumer: JoinHandle<PhaseLog>,
}

impl AccrueNode {
    /// Open the RocksDB store under `config.data_dir` and compose the node.
    pub async fn open(config: MinerConfig, config_path: Option<PathBuf>) -> Result<Self, AccrueError> {
        // Open storage.
        let store = RocksStore::open(config.db_path())?;
        info!(path = %config.db_path().display(), "opened store");
        Self::with_store(config, Arc::new(store), config_path).await
    }

    /// Compose the node over an existing store.
    pub async fn with_store(
        config: MinerConfig,
        store: Arc<dyn Store>,
        config_path: Option<PathBuf>,
    ) -> Result<Self, AccrueError> {
        config.validate()?;
        let store = StoreHandle::new(store, config.store_timeout());

        // Event bus, drained into the log.
        let (publisher, rx) = ChannelPublisher::channel(EVENT_BUS_CAPACITY, config.store_timeout());
        spawn_sink(rx, log_sink);

        // First settings snapshot.
        let milestones = store.call(|s| s.adoption_milestones()).await?;
        let curve = curve_from(milestones, config.base_mining_rate)?;
        let cell = Arc::new(ConfigCell::new(&config, curve));

        // Coin-distribution phase handoff.
        let (coordinator, phases) = PhaseCoordinator::new();
        let phase_consumer = spawn_phase_consumer(phases);

        Ok(Self {
            config,
            config_path,
            store,
            publisher: Arc::new(publisher),
            cell,
            coordinator: Arc::new(coordinator),
            phase_consumer,
        })
    }

    pub fn config(&self) -> &MinerConfig {
        &self.config
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn settings(&self) -> &Arc<ConfigCell> {
        &self.cell
    }

    pub fn session_starter(&self) -> SessionStarter {
        SessionStarter::new(
            self.store.clone(),
            Arc::clone(&self.publisher),
            self.config.session_length(),
            self.config.recalc.workers,
        )
    }

    pub fn pending_consumer(&self) -> PendingCreditConsumer {
        PendingCreditConsumer::new(self.store.clone())
    }

    /// Spawn every worker.
    pub fn start(self) -> RunningNode {
        let mut pool = WorkerPool::new();
        let committer = PersistenceCommitter::new(self.store.clone(), Arc::clone(&self.publisher));

        for worker in 0..self.config.workers {
            let miner = MiningWorker::new(
                worker,
                &self.config,
                self.store.clone(),
                committer.clone(),
                Arc::clone(&self.cell),
                Arc::clone(&self.coordinator),
            );
            pool.spawn(miner.run(pool.subscribe()));
        }
        for shard in 0..self.config.recalc.workers {
            let recalc = RecalcWorker::new(
                shard,
                &self.config,
                self.store.clone(),
                Arc::clone(&self.publisher),
                Arc::clone(&self.cell),
            );
            pool.spawn(recalc.run(pool.subscribe()));
        }

        let syncer = ConfigSyncer::new(Arc::clone(&self.cell), self.store.clone(), self.config.clone(), self.config_path)
            .spawn(self.config.config_refresh(), pool.subscribe());

        info!(
            workers = self.config.workers,
            recalc_workers = self.config.recalc.workers,
            development = self.config.development,
            "accrue node started"
        );
        RunningNode { pool, syncer, coordinator: self.coordinator, phase_consumer: self.phase_consumer }
    }
}

/// What shutdown observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub phases: PhaseLog,
}

pub struct RunningNode {
    pool: WorkerPool,
    syncer: JoinHandle<()>,
    coordinator: Arc<PhaseCoordinator>,
    phase_consumer: JoinHandle<PhaseLog>,
}

impl RunningNode {
    /// Run until `signal` resolves, then shut down cleanly.
    ///
    /// Returns early with the error of the first worker that failed fatally.
    pub async fn run_until<F>(mut self, signal: F) -> Result<ShutdownReport, AccrueError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.pool.join() => {
                result?;
                warn!("all workers exited without a shutdown request");
            }
            _ = signal => info!("shutdown requested"),
        }
        self.shutdown().await
    }

    /// Stop every worker after its current iteration and drain the phase consumer.
    pub async fn shutdown(mut self) -> Result<ShutdownReport, AccrueError> {
        self.pool.shutdown();
        self.pool.join().await?;
        if let Err(e) = self.syncer.await {
            warn!("config syncer ended abnormally: {}", e);
        }

        self.coordinator.finish(Utc::now()).await;
        drop(self.coordinator);
        let phases = self.phase_consumer.await.map_err(|_| AccrueError::Cancelled)?;
        info!(windows = phases.started, "accrue node stopped");
        Ok(ShutdownReport { phases })
    }
}
