// chatbridge - OpenAI-compatible gateway for conversation-oriented chat backends
//
// Clients speak chat completions; the upstream speaks `chat-messages` with
// server-side conversations. The gateway bridges the two and remembers which
// client chat maps to which upstream conversation.
//
// Architecture:
// - Proxy server (axum): chat completions, model listing, mapping maintenance
// - Identity: session key and user id from headers, body and metadata
// - Storage (SQLite, WAL): session key → upstream conversation id, shared by
//   every worker process on the host
// - Relay: upstream SSE → paced chat completion chunks

mod cli;
mod config;
mod proxy;
mod storage;
mod util;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, LoggingConfig};
use storage::MappingStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Handle offline CLI commands first (config, mappings)
    // If a command was handled, exit early
    if cli::handle_cli(cli::Cli::parse())? {
        return Ok(());
    }

    let config = Config::load().context("Failed to load configuration")?;

    // The guard must be kept alive for the duration of the program to ensure logs flush
    let _file_guard = init_tracing(&config.logging);

    // Fail closed before anything is bound
    config.validate().context("Invalid configuration")?;

    let store = {
        let options = config.store.store_options();
        tokio::task::spawn_blocking(move || MappingStore::open(options))
            .await
            .context("Mapping store initialization task failed")?
            .with_context(|| {
                format!(
                    "Failed to open mapping store at {}",
                    config.store.db_path.display()
                )
            })?
    };
    let store = Arc::new(store);
    tracing::debug!("Mapping policy: {}", config.store.mapping_policy.as_str());

    let sweep_handle = config.store.retention().map(|max_age| {
        spawn_retention_sweep(
            store.clone(),
            max_age,
            Duration::from_secs(config.store.sweep_interval_secs),
        )
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let server_config = config.clone();
    let server_store = store.clone();
    let mut server_handle = tokio::spawn(async move {
        proxy::start_gateway(server_config, server_store, shutdown_rx).await
    });

    tokio::select! {
        result = &mut server_handle => {
            // Server exited on its own (bind failure, serve error)
            if let Some(handle) = sweep_handle {
                handle.abort();
            }
            return result.context("Gateway task failed")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
        }
    }

    tracing::info!("Shutting down...");

    if let Some(handle) = sweep_handle {
        handle.abort();
    }

    // If the send fails, the server has already shut down (which is fine)
    let _ = shutdown_tx.send(());
    server_handle.await.context("Gateway task failed")??;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Install the global subscriber
///
/// Precedence: RUST_LOG env var > configured level > default "info".
/// File logging writes JSON through a non-blocking rolling appender; the
/// returned guard flushes it on drop.
fn init_tracing(logging: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.filter_directive()));

    let (file_layer, guard) = if logging.file_enabled {
        match logging.file_appender() {
            Ok(appender) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_ansi(false);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                // Subscriber isn't up yet; fall back to stdout-only logging
                eprintln!(
                    "Warning: Could not open log file in {:?}: {}",
                    logging.file_dir, e
                );
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    guard
}

/// Periodically purge mappings unused for longer than `max_age`
fn spawn_retention_sweep(
    store: Arc<MappingStore>,
    max_age: Duration,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tracing::info!(
        "Retention sweep enabled: every {:?}, max age {} day(s)",
        every,
        max_age.as_secs() / 86_400
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let store = store.clone();
            match tokio::task::spawn_blocking(move || store.purge(max_age)).await {
                Ok(Ok(0)) => tracing::debug!("Retention sweep: nothing to remove"),
                Ok(Ok(removed)) => {
                    tracing::info!("Retention sweep removed {} mapping(s)", removed)
                }
                Ok(Err(e)) => tracing::warn!("Retention sweep failed: {}", e),
                Err(e) => tracing::error!("Retention sweep task failed: {}", e),
            }
        }
    })
}
