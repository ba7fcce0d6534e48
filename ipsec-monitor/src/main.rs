// IPsec Tunnel Monitor Daemon

use anyhow::{Context, Result};
use clap::Parser;
use ipsec_monitor::{
    config::load_config,
    coordinator::{Coordinator, REFRESH_INTERVAL_SECS},
    entity::{DisplayStatus, ATTRIBUTE_LABELS},
    fetcher::TunnelFetcher,
    reconciler::EntityRegistry,
    state_file::StateFileSink,
    types::TunnelMap,
    vici::ViciClient,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "ipsec-monitor")]
#[command(about = "strongSwan IPsec tunnel status monitor", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/ipsec-monitor/config.toml")]
    config: PathBuf,

    /// Query the daemon once, print every tunnel and exit
    #[arg(long)]
    once: bool,
}

fn main() -> Result<()> {
    // 2 threads: one for the main loop, one for the refresh schedule
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("ipsec-monitor")
        .thread_stack_size(2 * 1024 * 1024) // 2MB stack (vs 8MB default)
        .enable_time()
        .enable_io()
        .build()?;

    runtime.block_on(async_main())
}

/// Print one block per tunnel to stdout
fn print_tunnels(tunnels: &TunnelMap) {
    if tunnels.is_empty() {
        println!("No IPsec connections configured");
        return;
    }

    for (name, record) in tunnels {
        println!(
            "IPSec Connection {}: {}",
            name,
            DisplayStatus::from_state(&record.state)
        );
        let values = [
            &record.local_addr,
            &record.remote_addr,
            &record.local_net,
            &record.remote_net,
            &record.state,
            &record.remote_host,
        ];
        for (label, value) in ATTRIBUTE_LABELS.iter().zip(values) {
            println!("    {:<12} {}", label, value);
        }
    }
}

async fn async_main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.general.log_level),
    )
    .init();

    let client = ViciClient::new(&config.general.socket_path);
    let fetcher = TunnelFetcher::new(Arc::new(client));
    let coordinator = Arc::new(Coordinator::new(fetcher));

    if args.once {
        if !coordinator.refresh().await {
            anyhow::bail!(
                "Could not query IKE daemon at {:?}",
                config.general.socket_path
            );
        }
        print_tunnels(&coordinator.data());
        return Ok(());
    }

    log::info!("Starting ipsec-monitor daemon");
    log::info!(
        "VICI socket: {:?}, status file: {:?}, removal policy: {:?}",
        config.general.socket_path,
        config.general.state_file,
        config.general.removal_policy
    );

    let sink = Arc::new(StateFileSink::new(&config.general.state_file));

    // Reconciler goes first so entities exist before they are notified
    let registry = EntityRegistry::new(
        coordinator.clone(),
        sink.clone(),
        config.general.removal_policy,
    );
    registry.attach();

    let cancel = CancellationToken::new();
    let scheduler = coordinator.schedule_refresh(
        Duration::from_secs(REFRESH_INTERVAL_SECS),
        cancel.clone(),
    );

    // Set up signal handlers for graceful shutdown
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .context("Failed to set up SIGHUP handler")?;

    // On-demand refreshes, joined before teardown
    let mut refreshes = JoinSet::new();

    log::info!("Daemon started successfully");

    // Main event loop
    loop {
        tokio::select! {
            // Shutdown signals
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT");
                break;
            }

            // On-demand refresh
            _ = sighup.recv() => {
                log::info!("Received SIGHUP, refreshing IPsec connections");
                let coordinator = coordinator.clone();
                let cancel = cancel.clone();
                refreshes.spawn(async move {
                    coordinator.refresh_until_cancelled(&cancel).await;
                });
            }

            // Reap finished on-demand refreshes
            Some(result) = refreshes.join_next(), if !refreshes.is_empty() => {
                if let Err(e) = result {
                    log::error!("On-demand refresh task failed: {}", e);
                }
            }
        }
    }

    log::info!("Shutting down gracefully...");

    cancel.cancel();
    if let Err(e) = scheduler.await {
        log::error!("Refresh task failed: {}", e);
    }
    while let Some(result) = refreshes.join_next().await {
        if let Err(e) = result {
            log::error!("On-demand refresh task failed: {}", e);
        }
    }

    registry.shutdown();

    // Clean up state file
    sink.cleanup();

    log::info!("Shutdown complete");
    Ok(())
}
