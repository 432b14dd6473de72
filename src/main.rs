// Proxguard Service
//
// Reads command intents as JSON lines on stdin and answers each with a
// command result on stdout. Monitor alerts are written to the same stream
// as they happen. Logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{BufReader, Stdout};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use proxguard::service::{forward_alerts, serve_until_closed, SharedWriter};
use proxguard::{
    load_config, save_config, ChannelAlertSink, LifecycleOrchestrator, MonitoringScheduler,
    ProxmoxClient, ServiceConfig, WatchListStore,
};

/// Proxguard - lifecycle commands and downtime alerts for a Proxmox node
#[derive(Parser)]
#[command(name = "proxguard-service")]
#[command(version)]
#[command(about = "Lifecycle orchestration and monitoring for Proxmox VMs and containers", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the service config file
    #[arg(short, long, global = true, env = "PROXGUARD_CONFIG", default_value = "proxguard.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve intents from stdin and run the monitor
    Run {
        /// Stop the service when stdin closes instead of monitoring on
        #[arg(long)]
        exit_on_eof: bool,
    },

    /// Write a config file with default values
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

type SharedStdout = SharedWriter<Stdout>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run { exit_on_eof } => run(&cli.config, exit_on_eof).await,
        Commands::InitConfig { force } => init_config(&cli.config, force),
    }
}

fn init_config(path: &str, force: bool) -> Result<()> {
    if Path::new(path).exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path);
    }
    save_config(path, &ServiceConfig::default())?;
    info!("Wrote default config to {}", path);
    Ok(())
}

async fn run(config_path: &str, exit_on_eof: bool) -> Result<()> {
    let mut config = if Path::new(config_path).exists() {
        load_config(config_path)?
    } else {
        warn!("{} not found, using defaults", config_path);
        ServiceConfig::default()
    };
    config.apply_env_overrides();
    config.validate()?;

    let client = ProxmoxClient::new(
        &config.proxmox_url,
        &config.proxmox_token_id,
        &config.proxmox_token_secret,
        &config.proxmox_node,
        config.client_options(),
    )?;
    let backend = Arc::new(client);

    let watchlist = Arc::new(
        WatchListStore::open(&config.watchlist_path, &config.initial_watchlist)
            .await
            .context("Failed to open watch-list")?,
    );

    let orchestrator = Arc::new(LifecycleOrchestrator::new(
        backend.clone(),
        watchlist.clone(),
        config.orchestrator_settings(),
    ));

    let (sink, alerts) = ChannelAlertSink::new();
    let scheduler = Arc::new(MonitoringScheduler::new(
        backend,
        watchlist,
        Arc::new(sink),
        config.monitor_settings(),
    ));

    info!(
        "Proxguard started for node {} at {}",
        config.proxmox_node, config.proxmox_url
    );

    let stdout: SharedStdout = Arc::new(Mutex::new(tokio::io::stdout()));
    let cleanup_interval = config.confirmation_cleanup_interval();

    let commands = serve_until_closed(
        orchestrator.clone(),
        BufReader::new(tokio::io::stdin()),
        stdout.clone(),
        exit_on_eof,
    );

    tokio::select! {
        _ = commands => Ok(()),
        _ = scheduler.run() => {
            error!("Monitor loop exited");
            Ok(())
        }
        _ = forward_alerts(alerts, stdout.clone()) => {
            error!("Alert forwarder exited");
            Ok(())
        }
        _ = cleanup_loop(orchestrator.clone(), cleanup_interval) => {
            error!("Cleanup loop exited");
            Ok(())
        }
        result = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            result.context("Failed to listen for ctrl-c")
        }
    }
}

async fn cleanup_loop(orchestrator: Arc<LifecycleOrchestrator>, interval: std::time::Duration) {
    loop {
        tokio::time::sleep(interval).await;
        orchestrator.purge_expired_confirmations().await;
    }
}
