//! anchord — the Anchor daemon.
//!
//! Runs N peers of one sticky-active group in a single process against a
//! shared redb coordination store:
//! - Coordination store (redb) with its expired-key reaper
//! - Service registry, cached discovery and the registry sweeper
//! - One `SingleActiveService` per peer
//! - Resilient caller over the in-process transport
//! - HTTP status, metrics and call API
//!
//! # Usage
//!
//! ```text
//! anchord standalone --config anchor.toml --peers 3 --port 8470
//! anchord config --config anchor.toml
//! ```

mod api;
mod group;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anchor_core::AnchorConfig;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::group::PeerGroup;

const DEFAULT_FILTER: &str = "info,anchord=debug,anchor=debug";

#[derive(Parser)]
#[command(name = "anchord", about = "Anchor coordination daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a group of peers in this process.
    Standalone {
        /// Path to anchor.toml; built-in defaults when absent.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of peers competing for the lease.
        #[arg(long, default_value = "3")]
        peers: usize,

        /// Port for the HTTP API.
        #[arg(long, default_value = "8470")]
        port: u16,

        /// Directory for the redb file. Overrides `store.path`.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print the effective configuration and election timings.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Standalone {
            config,
            peers,
            port,
            data_dir,
        } => run_standalone(load_config(config.as_deref())?, peers, port, data_dir).await,
        Command::Config { config } => print_config(&load_config(config.as_deref())?),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AnchorConfig> {
    match path {
        Some(path) => {
            let config = AnchorConfig::from_file(path)?;
            info!(path = ?path, "configuration loaded");
            Ok(config)
        }
        None => Ok(AnchorConfig::default()),
    }
}

fn print_config(config: &AnchorConfig) -> anyhow::Result<()> {
    let timings = config.election_timings()?;
    println!("{}", config.to_toml_string()?);
    println!("# effective election timings");
    println!("# lease_ttl        = {:?}", timings.lease_ttl);
    println!("# renew_interval   = {:?}", timings.renew_interval);
    println!("# monitor_interval = {:?}", timings.monitor_interval);
    println!("# grace_delay      = {:?}", timings.grace_delay);
    Ok(())
}

async fn run_standalone(
    config: AnchorConfig,
    peers: usize,
    port: u16,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    anyhow::ensure!(peers > 0, "--peers must be at least 1");
    info!(
        service = %config.instance.service_name,
        group = %config.instance.group_id,
        policy = ?config.election.failover_policy,
        peers,
        "Anchor daemon starting in standalone mode"
    );

    let group = Arc::new(PeerGroup::build(config, peers, data_dir.as_deref())?);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = group.start(shutdown_rx).await?;

    // ── Start API server ───────────────────────────────────────

    let router = api::build_router(group.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
    });
    server.await?;

    group.shutdown().await;
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }

    info!("Anchor daemon stopped");
    Ok(())
}
