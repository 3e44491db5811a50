//! Hookline delivery worker.
//!
//! Runs the asynchronous webhook workers against PostgreSQL until a
//! shutdown signal arrives. Events are routed into the queue by processes
//! that attach a `DeliveryEngine` to their event bus.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookline_core::{RealClock, Storage};
use hookline_delivery::DeliveryEngine;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!(
        database_url = %config.database_url_masked(),
        queue = %config.queue_name,
        workers = config.worker_pool_size,
        "starting hookline delivery worker"
    );

    let pool = create_database_pool(&config).await?;
    let storage = Arc::new(Storage::new(pool.clone()));
    storage.health_check().await.context("database health check failed")?;
    storage.ensure_schema().await.context("failed to create delivery tables")?;
    info!("database schema ready");

    let mut engine =
        DeliveryEngine::postgres(storage, config.to_engine_config(), Arc::new(RealClock::new()))
            .context("failed to build delivery engine")?;
    engine.start().await.context("failed to start delivery workers")?;

    shutdown_signal().await;
    info!("shutdown signal received, stopping workers");

    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "delivery workers did not stop cleanly");
    }

    pool.close().await;
    info!("hookline shutdown complete");
    Ok(())
}

/// Initializes tracing from `RUST_LOG`, falling back to the configured
/// filter.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().with_target(true).with_file(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Connects to PostgreSQL, retrying while the database comes up.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to connect to database after retries");
            },
        }
    }
}

/// Waits for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C"),
        () = terminate => info!("received SIGTERM"),
    }
}
