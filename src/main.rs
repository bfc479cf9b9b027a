// hookq - durable hook-event queue for Claude Code
//
// Hook invocations (`hookq capture`) write one JSON file per event into a
// queue directory and return immediately. The daemon (`hookq run`) drains the
// queue in the background and correlates events into conversations in SQLite.
//
// Architecture:
// - Queue (queue/): rename-based state machine over incoming/processing/...
// - Watcher: notify + periodic reconciliation feed a worker pool
// - Pipeline: claim, parse, correlate, retry, dead-letter, archive
// - Correlator: orders events into exchanges, buffers out-of-order arrivals
// - Health (axum): GET /health

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use hookq::config::Config;
use hookq::daemon::Daemon;
use hookq::health;
use hookq::logging::{self, Console};
use hookq::store::SqliteStore;
use std::sync::Arc;
use tokio::net::TcpListener;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run);

    // Config management works even when the file is broken
    if let Commands::Config(args) = &command {
        cli::handle_config(args);
        return Ok(());
    }

    if matches!(command, Commands::Run) {
        // Ensure config template exists (helps users discover options)
        Config::ensure_config_exists();
    }

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            e.report();
            std::process::exit(1);
        }
    };

    match command {
        Commands::Run => run(config),
        Commands::Capture => {
            // Hook stdout belongs to the client; keep it clean
            let _guard = logging::init(&config.logging, Console::Stderr);
            cli::handle_capture(&config);
            Ok(())
        }
        command => {
            let _guard = logging::init(&config.logging, Console::Stderr);
            match command {
                Commands::Drain => cli::handle_drain(&config),
                Commands::Status { json } => cli::handle_status(&config, json),
                Commands::RetryFailed => cli::handle_retry_failed(&config),
                Commands::Show { session_id } => cli::handle_show(&config, &session_id),
                Commands::Run | Commands::Capture | Commands::Config(_) => Ok(()),
            }
        }
    }
}

/// Daemon mode: worker threads plus the async health server
#[tokio::main]
async fn run(config: Config) -> Result<()> {
    // The guard must be kept alive for the duration of the program to ensure logs flush
    let _log_guard = logging::init(&config.logging, Console::Stdout);

    let store = SqliteStore::open(&config.store.db_path, config.store.options())
        .with_context(|| format!("Failed to open database {}", config.store.db_path.display()))?;
    tracing::info!("Store: {}", config.store.db_path.display());

    let mut handle = Daemon::new(config.daemon_config(), Arc::new(store)).start()?;

    // Oneshot: the health server shuts down once
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let health_handle = if config.health.enabled {
        let listener = TcpListener::bind(config.health.bind_addr)
            .await
            .with_context(|| format!("Failed to bind health endpoint {}", config.health.bind_addr))?;
        let state = handle.health_state();
        Some(tokio::spawn(async move {
            if let Err(e) = health::serve(listener, state, shutdown_rx).await {
                tracing::error!("Health server failed: {}", e);
            }
        }))
    } else {
        None
    };

    wait_for_shutdown_signal().await?;
    tracing::info!("Shutting down...");

    // If the send fails, the server has already stopped
    let _ = shutdown_tx.send(());
    if let Some(handle) = health_handle {
        let _ = handle.await;
    }

    // Joins OS threads; keep it off the async workers
    tokio::task::spawn_blocking(move || handle.stop())
        .await
        .context("Daemon shutdown panicked")?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).context("SIGTERM handler failed")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("Ctrl+C handler failed")?,
            _ = term.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Ctrl+C handler failed")?;
        Ok(())
    }
}
