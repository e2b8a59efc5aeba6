use anyhow::Context;
use sluice_core::domain::pipeline::PipelineDefinition;
use sluice_runner::{
    EnvSecretStore, LocalExecutor, PipelineOrchestrator, RunnerConfig, StageRunner,
    TriggerListener,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod config;
pub mod db;
pub mod repository;
pub mod service;

use config::ServerConfig;
use repository::PgRunHistory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "sluice_orchestrator=debug,sluice_runner=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Sluice Orchestrator...");

    let server = ServerConfig::from_env();
    server.validate()?;
    let runner = RunnerConfig::from_env()?;
    runner.validate()?;

    let source = std::fs::read_to_string(&server.pipeline_file).with_context(|| {
        format!(
            "Failed to read pipeline file {}",
            server.pipeline_file.display()
        )
    })?;
    let definition = PipelineDefinition::from_json(&source)?;
    tracing::info!(
        "Loaded pipeline '{}' with {} stage(s)",
        definition.name,
        definition.stages.len()
    );

    tracing::info!("Connecting to database...");
    let pool = db::create_pool(&server.database_url)
        .await
        .context("Failed to create database pool")?;
    tracing::info!("Database connection pool created");

    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let executor = LocalExecutor::new(runner.cancel_grace).scrub_env_prefix(&server.secret_prefix);
    let secrets = EnvSecretStore::new(&server.secret_prefix);
    let stages = StageRunner::new(Arc::new(executor), Arc::new(secrets), runner.step_timeout)
        .with_default_retries(runner.default_retries);

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        Arc::new(definition),
        Arc::new(stages),
        Arc::new(PgRunHistory::new(pool)),
        &runner,
    )?);
    let listener = Arc::new(TriggerListener::new(
        runner.trigger_branch.clone(),
        Arc::clone(&orchestrator),
    ));
    tracing::info!("Watching branch {}", listener.branch());

    // Build router with all API endpoints
    let app = api::create_router(api::AppState {
        orchestrator,
        listener,
    });

    tracing::info!("Listening on {}", server.bind_addr);

    let tcp = tokio::net::TcpListener::bind(&server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", server.bind_addr))?;

    axum::serve(tcp, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await
        .context("Failed to start server")?;

    Ok(())
}
