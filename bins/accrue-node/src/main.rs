//! Accrue mining daemon.
//!
//! Opens the RocksDB store, then runs the mining workers, the balance
//! recalculation workers and the settings syncer until Ctrl+C.

use std::path::PathBuf;
use std::process;

use accrue_node_lib::{AccrueNode, MinerConfig};
use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

/// Accrue mining daemon.
#[derive(Parser, Debug)]
#[command(name = "accrue-node", version, about = "Sharded virtual token-accrual daemon over RocksDB")]
struct Args {
    /// TOML configuration file, layered under ACCRUE_* environment variables
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for the RocksDB store
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Number of mining workers
    #[arg(long)]
    workers: Option<u32>,

    /// Accrue per minute instead of per hour
    #[arg(long)]
    development: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long)]
    log_format: Option<String>,
}

impl Args {
    /// Load the layered configuration and apply CLI overrides.
    fn into_config(self) -> anyhow::Result<(MinerConfig, Option<PathBuf>)> {
        let mut config = MinerConfig::load(self.config.as_deref()).context("loading configuration")?;

        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if self.development {
            config.development = true;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        config.validate().context("applying command-line overrides")?;
        Ok((config, self.config))
    }
}

#[tokio::main]
async fn main() {
    // Parse CLI arguments.
    let (config, config_path) = match Args::parse().into_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("invalid configuration: {e:#}");
            process::exit(1);
        }
    };

    // Initialize logging.
    init_logging(&config.log_level, &config.log_format);

    info!("Accrue node v{}", env!("CARGO_PKG_VERSION"));
    info!("data_dir: {:?}", config.data_dir);
    info!("workers: {} mining, {} recalculation", config.workers, config.recalc.workers);
    info!("time unit: {:?}", config.time_unit());

    // Create data directory if it doesn't exist.
    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        error!("failed to create data_dir: {}", e);
        process::exit(1);
    }

    // Open the node.
    let node = match AccrueNode::open(config, config_path).await {
        Ok(n) => n,
        Err(e) => {
            error!("failed to start node: {}", e);
            process::exit(1);
        }
    };

    info!("Accrue node running (Ctrl+C to stop)");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("received Ctrl+C, shutting down...");
    };

    match node.start().run_until(shutdown_signal).await {
        Ok(report) => {
            info!(
                distribution_windows = report.phases.started,
                "Accrue node shutdown complete"
            );
        }
        Err(e) if e.is_fatal() => {
            error!("fatal: {}", e);
            process::abort();
        }
        Err(e) => {
            error!("node stopped with error: {}", e);
            process::exit(1);
        }
    }
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// `format = "json"` gives structured JSON output. Any other value defaults
/// to human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
