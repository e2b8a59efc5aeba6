//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod hooks;
pub mod run;

use axum::{
    Router,
    routing::{get, post},
};
use sluice_runner::{PipelineOrchestrator, TriggerListener};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub listener: Arc<TriggerListener>,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Source control hooks
        .route("/hooks/push", post(hooks::push))
        // Run endpoints
        .route("/runs", get(run::list_runs))
        .route("/runs/{id}", get(run::get_run))
        .route("/runs/{id}/logs", get(run::get_run_logs))
        .route("/runs/{id}/cancel", post(run::cancel_run))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
