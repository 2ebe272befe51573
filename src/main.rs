// ABOUTME: CLI entry point for realtime-sync
// ABOUTME: Runs the engine against a change-stream source or validates config

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::interval;
use tracing_subscriber::EnvFilter;

use realtime_sync::config::SyncConfig;
use realtime_sync::engine::{EngineConfig, SyncEngine};
use realtime_sync::store::{MemoryStore, SyncStore};
use realtime_sync::transport::TcpTransport;

#[derive(Parser)]
#[command(name = "realtime-sync")]
#[command(about = "Client-side realtime CDC synchronization engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info", env = "REALTIME_SYNC_LOG")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a change-stream source and sync into the local store
    Run {
        /// Change-stream endpoint (host:port); falls back to the config file
        #[arg(long)]
        source: Option<String>,
        /// Path to config.toml (defaults to ~/.realtime-sync/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Seconds between store statistics log lines
        #[arg(long, default_value_t = 30)]
        stats_interval: u64,
    },
    /// Load a configuration file and report what it resolves to
    Validate {
        /// Path to config.toml
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(filter: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(filter).or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to init tracing subscriber: {err}"))
}

fn load_config(path: Option<PathBuf>) -> Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::load(&path),
        None => {
            let default = SyncConfig::default_path()?;
            if default.exists() {
                SyncConfig::load(&default)
            } else {
                Ok(SyncConfig::default())
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log)?;

    match cli.command {
        Commands::Run {
            source,
            config,
            stats_interval,
        } => run(source, config, stats_interval).await,
        Commands::Validate { config } => validate(&config),
    }
}

async fn run(source: Option<String>, config: Option<PathBuf>, stats_interval: u64) -> Result<()> {
    let config = load_config(config)?;
    let source = source
        .or_else(|| config.source.clone())
        .context("no change-stream source; pass --source or set `source` in the config")?;

    let engine_config = EngineConfig {
        tables: config.tables_or_default(),
        buffer: config.buffer.to_buffer_config(),
        max_pending_updates: config.engine.max_pending_updates,
    };
    tracing::info!(
        source = %source,
        tables = engine_config.tables.len(),
        max_batch_size = engine_config.buffer.max_batch_size,
        "starting realtime sync"
    );

    let transport = Arc::new(TcpTransport::new(source));
    let store = MemoryStore::shared();
    let engine = SyncEngine::new(transport, store.clone() as Arc<dyn SyncStore>, engine_config);
    engine.initialize();

    let mut stats_ticker = interval(Duration::from_secs(stats_interval.max(1)));
    stats_ticker.tick().await; // first tick is immediate
    loop {
        tokio::select! {
            biased; // Check shutdown first

            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for shutdown signal")?;
                tracing::info!("shutdown signal received, stopping sync engine");
                break;
            }
            _ = stats_ticker.tick() => {
                let stats = store.stats();
                tracing::info!(
                    connection = %engine.connection_state(),
                    batches = stats.batches_applied,
                    events = stats.events_applied,
                    records = stats.records_held,
                    "sync progress"
                );
            }
        }
    }

    let stats = store.stats();
    tracing::info!(
        batches = stats.batches_applied,
        events = stats.events_applied,
        deleted = stats.rows_deleted,
        records = stats.records_held,
        "final sync statistics"
    );
    engine.destroy();
    Ok(())
}

fn validate(path: &std::path::Path) -> Result<()> {
    let config = SyncConfig::load(path)?;
    let tables = config.tables_or_default();
    if tables.is_empty() {
        bail!("config resolves to zero watched tables");
    }
    let buffer = config.buffer.to_buffer_config();
    if buffer.max_batch_size == 0 {
        bail!("max_batch_size must be at least 1");
    }
    if buffer.min_batch_interval > buffer.max_batch_interval {
        bail!(
            "min_batch_interval ({:?}) exceeds max_batch_interval ({:?})",
            buffer.min_batch_interval,
            buffer.max_batch_interval
        );
    }

    println!("Configuration OK");
    println!(
        "  source: {}",
        config.source.as_deref().unwrap_or("<unset, pass --source>")
    );
    println!(
        "  buffer: min {:?}, max {:?}, batch size {}, priority flush {}",
        buffer.min_batch_interval,
        buffer.max_batch_interval,
        buffer.max_batch_size,
        buffer.priority_flush
    );
    println!("  watched tables ({}):", tables.len());
    for table in &tables {
        match &table.filter {
            Some(filter) => println!("    {} ({})", table.name, filter),
            None => println!("    {}", table.name),
        }
    }
    Ok(())
}
