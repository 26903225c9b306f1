//! hosttrackd - host/device tracking daemon.
//!
//! Entry point: wires the tracker with default collaborators, starts the
//! expiration sweep, and runs until interrupted. Observation sources and
//! real topology/classifier services attach through the library API.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hosttrackd::{sweep, DeviceTracker, TrackerConfig};

#[derive(Debug, Parser)]
#[command(name = "hosttrackd", about = "Host/device tracking daemon")]
struct Args {
    /// Path to a JSON config file; defaults apply for missing fields.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(true)
        .init();
}

fn load_config(args: &Args) -> anyhow::Result<TrackerConfig> {
    match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))
        }
        None => Ok(TrackerConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();
    let config = load_config(&args)?;

    info!("--- starting hosttrackd ---");
    let tracker = Arc::new(DeviceTracker::new(config));

    let shutdown = CancellationToken::new();
    let sweep_handle = sweep::spawn(tracker.clone(), shutdown.clone());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    shutdown.cancel();
    sweep_handle.await.context("joining sweep task")?;

    info!(devices = tracker.all_devices().len(), "hosttrackd stopped");
    Ok(())
}
