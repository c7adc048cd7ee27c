// Main entry point for the pipeline orchestrator

use std::sync::Arc;

use anyhow::{Context, Result};
use server_core::kernel::{Kernel, NoTools};
use server_core::testing::{MockEmbedder, MockReasoner};
use server_core::{Config, Orchestrator, OrchestratorConfig};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting pipeline orchestrator");

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Reasoner and embedder providers are deployment-specific; the stub
    // implementations keep the orchestrator runnable without external
    // services wired up.
    let kernel = Arc::new(Kernel::postgres(
        pool,
        Arc::new(MockReasoner::new()),
        Arc::new(MockEmbedder::new()),
        Arc::new(NoTools),
        OrchestratorConfig::default(),
    ));

    let orchestrator = Orchestrator::new(kernel);
    let handle = orchestrator.start();
    tracing::info!("Orchestrator services running");

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down...");
    handle.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}
