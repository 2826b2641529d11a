//! Read-mostly runtime settings shared by every worker.
//!
//! Readers call [`ConfigCell::current`], which clones the `Arc` under a
//! short read lock; a snapshot never changes once published, so a worker
//! sees one consistent version for a whole iteration. The only writer is
//! [`ConfigSyncer`], which publishes a new version when the configuration
//! file or the stored adoption milestones change.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use accrue_core::error::{AccrualError, AccrueError};
use accrue_core::types::AdoptionMilestone;
use accrue_engine::adoption::AdoptionCurve;
use accrue_engine::settings::{EngineSettings, RecalcSettings};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{CoinDistributionConfig, MinerConfig};
use crate::handle::StoreHandle;

/// One immutable version of the runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSnapshot {
    pub version: u64,
    pub engine: EngineSettings,
    pub recalc: RecalcSettings,
    pub curve: AdoptionCurve,
    pub coin_distribution: CoinDistributionConfig,
}

impl RuntimeSnapshot {
    fn build(version: u64, config: &MinerConfig, curve: AdoptionCurve) -> Self {
        Self {
            version,
            engine: config.engine_settings(),
            recalc: config.recalc_settings(),
            curve,
            coin_distribution: config.coin_distribution.clone(),
        }
    }

    fn same_content(&self, other: &Self) -> bool {
        self.engine == other.engine
            && self.recalc == other.recalc
            && self.curve == other.curve
            && self.coin_distribution == other.coin_distribution
    }
}

pub struct ConfigCell {
    current: RwLock<Arc<RuntimeSnapshot>>,
}

impl ConfigCell {
    pub fn new(config: &MinerConfig, curve: AdoptionCurve) -> Self {
        Self { current: RwLock::new(Arc::new(RuntimeSnapshot::build(1, config, curve))) }
    }

    /// The latest published snapshot.
    pub fn current(&self) -> Arc<RuntimeSnapshot> {
        Arc::clone(&*self.current.read())
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Publish settings derived from `config` with `curve`.
    ///
    /// Returns the new version, or `None` when nothing changed.
    pub fn publish(&self, config: &MinerConfig, curve: AdoptionCurve) -> Option<u64> {
        let mut current = self.current.write();
        let next = RuntimeSnapshot::build(current.version + 1, config, curve);
        if next.same_content(&current) {
            return None;
        }
        let version = next.version;
        *current = Arc::new(next);
        Some(version)
    }
}

/// Adoption curve from stored milestones, or a flat `fallback_rate` before
/// the first milestone is written.
pub fn curve_from(milestones: Vec<AdoptionMilestone>, fallback_rate: f64) -> Result<AdoptionCurve, AccrualError> {
    if milestones.is_empty() {
        return AdoptionCurve::constant(fallback_rate);
    }
    AdoptionCurve::new(milestones)
}

/// Periodically re-reads configuration and adoption milestones.
pub struct ConfigSyncer {
    cell: Arc<ConfigCell>,
    store: StoreHandle,
    config: MinerConfig,
    path: Option<PathBuf>,
}

impl ConfigSyncer {
    pub fn new(cell: Arc<ConfigCell>, store: StoreHandle, config: MinerConfig, path: Option<PathBuf>) -> Self {
        Self { cell, store, config, path }
    }

    /// One refresh. Returns the published version, if any.
    pub async fn sync_once(&mut self) -> Result<Option<u64>, AccrueError> {
        if let Some(path) = &self.path {
            match MinerConfig::load(Some(path)) {
                Ok(fresh) => {
                    // The time unit is fixed for the life of the process.
                    self.config = MinerConfig { development: self.config.development, ..fresh };
                }
                Err(e) => warn!("keeping previous configuration: {}", e),
            }
        }
        let milestones = self.store.call(|s| s.adoption_milestones()).await?;
        let curve = curve_from(milestones, self.config.base_mining_rate)?;
        Ok(self.cell.publish(&self.config, curve))
    }

    pub fn spawn(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                match self.sync_once().await {
                    Ok(Some(version)) => info!(version, "published runtime settings"),
                    Ok(None) => debug!("runtime settings unchanged"),
                    Err(e) => warn!("config sync failed: {}", e),
                }
            }
            debug!("config syncer stopped");
        })
    }
}
