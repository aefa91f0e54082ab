//! tillsync command-line entry point.
//!
//! Three modes: a one-shot `sync`, a read-only `status` report, and a
//! long-running `watch` loop for terminals that stay powered on.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tillsync::config::{SyncConfig, DEFAULT_WATCH_INTERVAL_SECS};
use tillsync::engine::tables::SYNC_TABLES;
use tillsync::engine::SyncEngine;
use tillsync::store::outbox::OutboxStore;
use tillsync::store::watermark::{WatermarkStore, EPOCH_ISO};
use tillsync::store::LocalStore;

#[derive(Parser)]
#[command(name = "tillsync", version, about = "Offline-first POS sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one push → pull cycle and exit.
    Sync {
        /// Trigger label recorded in logs.
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// Show pending uploads and per-table watermarks.
    Status,
    /// Sync on a fixed interval until interrupted.
    Watch {
        /// Seconds between cycles.
        #[arg(long)]
        interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tillsync=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::load()?;

    match cli.command {
        Command::Sync { reason } => {
            let engine = SyncEngine::from_config(&config)?;
            let outcome = engine.run_cycle(&reason).await;
            if let Some(error) = &outcome.error {
                eprintln!("sync failed: {error}");
                std::process::exit(1);
            }
            println!(
                "sync complete ({})",
                if outcome.did_work { "changes applied" } else { "nothing to do" }
            );
        }
        Command::Status => print_status(&config)?,
        Command::Watch { interval } => {
            let engine = SyncEngine::from_config(&config)?;
            let secs = interval
                .or(Some(config.watch_interval_secs))
                .filter(|s| *s > 0)
                .unwrap_or(DEFAULT_WATCH_INTERVAL_SECS);
            watch(engine, Duration::from_secs(secs)).await;
        }
    }

    Ok(())
}

fn print_status(config: &SyncConfig) -> Result<()> {
    let local = Arc::new(LocalStore::open(&config.database_path())?);
    let outbox = OutboxStore::new(local.clone())?;
    let watermarks = WatermarkStore::new(local)?;

    println!("configured: {}", config.is_configured());
    println!("pending uploads: {}", outbox.count()?);
    for table in SYNC_TABLES {
        let wm = watermarks.get(table)?;
        let shown = if wm == EPOCH_ISO { "never" } else { wm.as_str() };
        println!("  {table:<12} {shown}");
    }
    Ok(())
}

async fn watch(engine: SyncEngine, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!(period_secs = period.as_secs(), "Watch mode started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let outcome = engine.run_cycle("interval").await;
                if let Some(error) = &outcome.error {
                    tracing::warn!(%error, "Cycle failed; will retry next tick");
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    tracing::error!(?err, "Signal handler failed; exiting");
                }
                tracing::info!("Shutting down");
                break;
            }
        }
    }
}
