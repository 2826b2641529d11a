//! # accrue-node-lib: mining daemon, RocksDB storage and orchestration.
//!
//! Composes the accrual engine into a running daemon:
//! - [`storage::RocksStore`]: persistent user, ledger and history state backed by RocksDB
//! - [`miner::MiningWorker`]: fetch, accrue, publish and commit loop over one user slice
//! - [`recalc_worker::RecalcWorker`]: per-shard balance recalculation pipeline
//! - [`node::AccrueNode`]: wires storage, the event bus and every worker together
//! - [`config::MinerConfig`]: daemon configuration

pub mod committer;
pub mod config;
pub mod distribution;
pub mod events;
pub mod handle;
pub mod miner;
pub mod node;
pub mod partition;
pub mod pending;
pub mod pool;
pub mod recalc_worker;
pub mod sessions;
pub mod snapshot;
pub mod storage;
pub mod telemetry;

pub use config::MinerConfig;
pub use handle::{Store, StoreHandle};
pub use node::{AccrueNode, RunningNode, ShutdownReport};
pub use pending::{PendingCredit, PendingCreditConsumer};
pub use sessions::{SessionStarter, StartRequest};
pub use storage::RocksStore;
