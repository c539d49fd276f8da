//! drill: mesh TCP port forwarding between authenticated nodes.
//!
//! Usage: drill [config.toml] [--log-level info] [--node-id <uuid>]

mod config;
mod drill;
mod forward;
mod identity;
mod transport;

use anyhow::Context;
use clap::Parser;
use config::Config;
use drill::Drill;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "drill", version, about = "Mesh TCP port forwarding node")]
struct Cli {
    /// Path to config file (TOML)
    #[arg(default_value = "drill.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Fixed node id, overriding the config file and the derived machine id
    #[arg(long)]
    node_id: Option<Uuid>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting drill");

    if let Err(e) = run(cli).await {
        error!(error = %format!("{e:#}"), "drill failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;

    let node_id = cli
        .node_id
        .or(config.node_id)
        .unwrap_or_else(identity::machine_node_id);

    let drill = Drill::start(config, node_id)
        .await
        .context("failed to start node")?;
    if let Some(addr) = drill.inbound_addr() {
        info!(%addr, node_id = %drill.node_id(), "accepting node links");
    }

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = status.tick() => drill.log_status().await,
            _ = &mut shutdown => break,
        }
    }

    info!("received shutdown signal");
    drill.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
