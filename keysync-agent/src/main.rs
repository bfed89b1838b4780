//! keysync agent
//!
//! Keeps the Fernet and credential key repositories of this node in step with
//! the rest of the cluster. See `keysync-agent --help`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keysync_agent::coordinator::{KeyCoordinator, TickReason};
use keysync_agent::node::{self, build, status_report};
use keysync_config::AppConfig;
use keysync_logging::init_logging;
use peer_store_client::{LeadershipFlag, StaticLeadership};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::time::{interval, MissedTickBehavior};
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

/// keysync agent CLI
#[derive(Parser)]
#[command(name = "keysync-agent")]
#[command(about = "Fernet and credential key lifecycle coordinator")]
#[command(version)]
struct Cli {
    /// Node ID (overrides KEYSYNC_NODE_ID)
    #[arg(long)]
    node_id: Option<String>,

    /// Act as the leader (overrides KEYSYNC_LEADER)
    #[arg(long)]
    leader: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator until interrupted (default)
    Run,
    /// Run a single tick and exit; fails if the tick recorded an error
    Once,
    /// Print local and published key repositories as JSON
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    init_logging(
        "keysync-agent",
        &config.node_id,
        config.log_level(),
        config.log_format,
    )
    .context("Failed to initialize logging")?;

    match cli.command {
        Some(Command::Once) => once(config).await,
        Some(Command::Status) => status(config).await,
        Some(Command::Run) | None => run(&cli, config).await,
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = AppConfig::from_env().context("Failed to load configuration")?;
    if let Some(node_id) = &cli.node_id {
        config.node_id = node_id.clone();
    }
    if cli.leader {
        config.leader = true;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run(cli: &Cli, config: AppConfig) -> Result<()> {
    info!("Starting keysync agent v{}", env!("CARGO_PKG_VERSION"));

    let node = build(&config).await?;
    let coordinator = Arc::clone(&node.coordinator);
    let store = Arc::clone(&node.store);

    coordinator.tick(TickReason::ConfigChanged).await;

    let mut timer = interval(config.tick_interval());
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    timer.tick().await;

    let mut changes = store.watch();
    let mut hangup = unix_signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    info!(
        tick_interval_secs = config.tick_interval_secs,
        "keysync agent running. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = timer.tick() => spawn_tick(&coordinator, TickReason::Scheduled),
            change = changes.next() => match change {
                Some(Ok(_)) => spawn_tick(&coordinator, TickReason::PeerKeysChanged),
                Some(Err(e)) => {
                    // Missed notifications: reconcile against the latest snapshot
                    warn!(error = %e, "Peer store watch error");
                    spawn_tick(&coordinator, TickReason::PeerKeysChanged);
                }
                None => {
                    warn!("Peer store watch ended, resubscribing");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    changes = store.watch();
                }
            },
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading configuration");
                reload(cli, &coordinator, &node.leadership);
                spawn_tick(&coordinator, TickReason::ConfigChanged);
            }
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Shutdown signal received"),
                    Err(e) => error!(error = %e, "Unable to listen for shutdown signal"),
                }
                break;
            }
        }
    }

    // Let a running tick finish before exiting
    let state = coordinator.state().await;
    info!(ticks = state.ticks, "keysync agent stopped");
    Ok(())
}

fn spawn_tick(coordinator: &Arc<KeyCoordinator>, reason: TickReason) {
    let coordinator = Arc::clone(coordinator);
    tokio::spawn(async move {
        coordinator.tick(reason).await;
    });
}

/// Apply a reloaded configuration; the previous one stays on failure
fn reload(cli: &Cli, coordinator: &KeyCoordinator, leadership: &LeadershipFlag) {
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Configuration reload failed, keeping previous configuration");
            return;
        }
    };

    match node::rotation_policy(&config) {
        Ok(policy) => coordinator.update_policy(policy),
        Err(e) => error!(error = %e, "Invalid rotation policy, keeping previous policy"),
    }

    if config.leader {
        leadership.grant();
    } else {
        leadership.revoke();
    }
}

async fn once(config: AppConfig) -> Result<()> {
    let node = build(&config).await?;
    let state = node
        .coordinator
        .tick(TickReason::ConfigChanged)
        .await
        .context("Tick already in progress")?;

    println!("{}", serde_json::to_string_pretty(&state)?);

    if let Some(e) = state.last_error {
        anyhow::bail!("Tick failed: {}", e);
    }
    Ok(())
}

async fn status(config: AppConfig) -> Result<()> {
    let storage = node::local_storage(&config);
    let store = node::connect_store(&config, Arc::new(StaticLeadership(config.leader))).await?;

    let report = status_report(&storage, store.as_ref()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
