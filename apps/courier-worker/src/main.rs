//! Courier retry worker.
//!
//! Connects to PostgreSQL, applies migrations, and runs the webhook retry
//! worker until Ctrl+C or SIGTERM.

mod config;
mod logging;

use std::sync::Arc;

use anyhow::Context;
use courier_db::{run_migrations, DbPool, PgStore, Store};
use courier_webhooks::{
    CircuitBreakerConfig, CircuitState, RetryPolicy, SecretCipher, WebhookDispatcher,
    WebhookWorker, WorkerConfig,
};
use tokio::signal;
use tracing::{info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = Config::from_env().context("Failed to load configuration")?;
    logging::init_logging(&config.rust_log)?;

    if config.uses_insecure_master_key() {
        warn!(
            app_env = %config.app_env,
            "WEBHOOK_MASTER_KEY not set, using the insecure development key"
        );
    }

    info!(
        app_env = %config.app_env,
        poll_interval_secs = config.poll_interval.as_secs(),
        batch_size = config.batch_size,
        max_attempts = config.max_attempts,
        "Starting courier worker"
    );

    let pool = DbPool::connect_with(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    info!("Database ready");

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));

    let dispatcher = WebhookDispatcher::new(store, SecretCipher::from_master_key(&config.master_key))
        .context("Failed to build webhook dispatcher")?
        .with_retry_policy(RetryPolicy::default().with_max_attempts(config.max_attempts))
        .with_timeout(config.delivery_timeout);

    let worker = WebhookWorker::new(
        dispatcher,
        WorkerConfig::default()
            .with_poll_interval(config.poll_interval)
            .with_error_cooldown(config.error_cooldown)
            .with_batch_size(config.batch_size)
            .with_success_retention(config.success_retention),
    )
    .with_circuit_breaker_config(
        CircuitBreakerConfig::default()
            .with_failure_threshold(config.circuit_failure_threshold)
            .with_open_timeout(config.circuit_open_timeout),
    );
    let breakers = worker.breakers().clone();
    let handle = worker.start();

    shutdown_signal().await;
    handle.stop().await;

    for (subscriber_id, status) in breakers.snapshot() {
        if status.state != CircuitState::Closed {
            info!(
                %subscriber_id,
                state = %status.state,
                failure_count = status.failure_count,
                "Circuit not closed at shutdown"
            );
        }
    }

    pool.close().await;
    info!("Courier worker stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        () = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
