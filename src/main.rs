use anyhow::Result;
use axum::Router;
use std::{fs, io::ErrorKind};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use services::{
    lifecycle_service::LifecycleService,
    partition::PartitionSet,
    scheduler::{BackoffPolicy, PeriodicTask},
};

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
#[cfg(test)]
mod testing;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting tier-store with config: {:?}", cfg);

    // --- Ensure data directory exists ---
    if !cfg.data_dir.exists() {
        fs::create_dir_all(&cfg.data_dir)?;
        tracing::info!("Created data directory at {}", cfg.data_dir.display());
    }

    // --- Open one partition per tier (schema is applied on open) ---
    let partitions = PartitionSet::open_sqlite(&cfg.data_dir).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Partition schemas are up to date.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core service ---
    let service = LifecycleService::new(partitions, cfg.lifecycle_settings()?);

    // --- Periodic drivers ---
    let shutdown = CancellationToken::new();

    let sweep_service = service.clone();
    let sweep = tokio::spawn(
        PeriodicTask::new("migration sweep", cfg.sweep_interval, cfg.backoff).run(
            shutdown.clone(),
            move || {
                let service = sweep_service.clone();
                async move { service.run_migration_sweep().await }
            },
        ),
    );

    // A failed pass simply waits for the next interval.
    let reconcile_service = service.clone();
    let reconcile = tokio::spawn(
        PeriodicTask::new(
            "reconciliation",
            cfg.reconcile_interval,
            BackoffPolicy {
                max_attempts: 1,
                ..cfg.backoff
            },
        )
        .run(shutdown.clone(), move || {
            let service = reconcile_service.clone();
            async move { service.run_reconciliation().await }
        }),
    );

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // In-flight sweep or reconciliation work finishes before exit.
    shutdown.cancel();
    let (sweep, reconcile) = tokio::join!(sweep, reconcile);
    sweep?;
    reconcile?;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Resolves on Ctrl-C and cancels the periodic drivers.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
    }
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
