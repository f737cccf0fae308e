//! Vantage launcher
//!
//! Opens (or creates) a database, reports its state and shuts down
//! cleanly. The network layer drives the engine through the library API;
//! this binary exists to initialize databases and verify recovery.

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vantage::config::Config;
use vantage::storage::StorageEngine;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Fixed series length for the database
    #[arg(long = "ts_length")]
    ts_length: Option<usize>,

    /// Root directory for databases
    #[arg(long = "data_dir")]
    data_dir: Option<PathBuf>,

    /// Database name (subdirectory under data_dir)
    #[arg(long = "db_name")]
    db_name: Option<String>,

    /// Log-flush cadence in operations
    #[arg(long = "flush_every")]
    flush_every: Option<usize>,

    /// Optional TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::from_env(),
    };

    // CLI flags win over file and environment
    if let Some(ts_length) = args.ts_length {
        config.database.ts_length = ts_length;
    }
    if let Some(data_dir) = &args.data_dir {
        config.database.data_dir = data_dir.display().to_string();
    }
    if let Some(db_name) = &args.db_name {
        config.database.db_name = db_name.clone();
    }
    if let Some(flush_every) = args.flush_every {
        config.database.flush_every = flush_every;
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| format!("vantage={}", config.logging.level)),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Vantage v{}", env!("CARGO_PKG_VERSION"));

    let storage = config.storage_config();
    tracing::info!(
        "opening {} under {:?} (L={}, flush_every={})",
        storage.db_name,
        storage.data_dir,
        storage.ts_length,
        storage.flush_every
    );

    let engine = StorageEngine::open(storage, Vec::new())?;
    tracing::info!("{}", engine.stats()?);

    engine.close()?;
    tracing::info!("shutdown complete");
    Ok(())
}
