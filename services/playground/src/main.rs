//! Kite playground node
//!
//! Boots a worker pool from a plan file, serves the gate controller over
//! WebSocket and runs until Ctrl-C or until every worker has exited.

mod behaviors;
mod logging;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kite_actors::{Coordinator, MemoryTransport, Registry, Transports};
use kite_config::defaults::DEFAULT_TRANSPORT;
use kite_config::BootPlan;
use tokio::task::LocalSet;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Boot plan file (defaults to kite.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the worker count
    #[arg(short, long)]
    threads: Option<usize>,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut plan = BootPlan::load(args.config.as_deref()).context("Failed to load boot plan")?;
    if let Some(threads) = args.threads {
        plan.threads = Some(threads);
        plan.validate()?;
    }
    logging::init(&plan.logging, args.json)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        threads = plan.threads(),
        services = plan.services.len(),
        controllers = plan.controllers.len(),
        "Starting Kite playground"
    );

    let registry = behaviors::registry()?;
    let transports = Transports::new()
        .with(DEFAULT_TRANSPORT, Arc::new(ws::WsTransport::new()))
        .with("memory", Arc::new(MemoryTransport::new()));

    LocalSet::new().run_until(run(plan, registry, transports)).await
}

async fn run(plan: BootPlan, registry: Registry, transports: Transports) -> anyhow::Result<()> {
    let coordinator = Coordinator::new(plan, registry, transports);

    if let Err(e) = coordinator.start().await {
        error!(error = %e, "Boot failed");
        coordinator.shutdown();
        coordinator.run_until_exit().await;
        return Err(e.into());
    }

    let signal = coordinator.clone();
    tokio::task::spawn_local(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                signal.shutdown();
            }
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    let abnormal = coordinator.run_until_exit().await;
    if abnormal > 0 {
        anyhow::bail!("{abnormal} worker(s) exited abnormally");
    }
    info!(cluster = %coordinator.cluster_id(), "Kite playground stopped");
    Ok(())
}
