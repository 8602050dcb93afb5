//! Tether Daemon - device checkin engine
//!
//! Restores the device registry, runs the workflow sweep and stale-write
//! retry loops, and writes a final snapshot on shutdown. The checkin
//! transport embeds [`tether_daemon::Engine`].

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tether_daemon::{load_trust_anchors, DaemonConfig, Engine, LogNotifier};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Tether Daemon - device enrollment and command dispatch
#[derive(Parser)]
#[command(name = "tether-daemon", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    config: DaemonConfig,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default if no command given)
    Serve,

    /// Print the command templates operators can queue
    Templates,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Templates) => cmd_templates(&cli.config),
        Some(Commands::Serve) | None => cmd_serve(cli.config).await,
    }
}

fn cmd_templates(config: &DaemonConfig) -> anyhow::Result<()> {
    let catalog = tether_core::CommandCatalog::standard(&config.management_tools_manifest);
    for name in catalog.names() {
        if let Some(template) = catalog.get(name) {
            println!("{:<28} {}", name, template.request_type);
        }
    }
    Ok(())
}

async fn cmd_serve(config: DaemonConfig) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    config.validate()?;

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let anchors_path = config.trust_anchors_path();
    let anchors = load_trust_anchors(&anchors_path)?;
    tracing::info!(
        path = %anchors_path.display(),
        count = anchors.len(),
        "Loaded trust anchors"
    );

    let engine = Engine::open(&config, anchors, Arc::new(LogNotifier)).await?;
    tracing::info!(
        devices = engine.registry().len(),
        templates = engine.catalog().len(),
        "Tether daemon started"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep = tokio::spawn(
        engine
            .orchestrator()
            .run(config.sweep_interval(), shutdown_rx.clone()),
    );
    let retry = tokio::spawn(Arc::clone(engine.registry()).run_retry(shutdown_rx));

    wait_for_signal().await;
    let _ = shutdown_tx.send(true);

    for task in [sweep, retry] {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }

    match engine.shutdown().await {
        Ok(()) => {
            tracing::info!("Daemon shutdown complete");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "Daemon shutdown with error");
            Err(e.into())
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
