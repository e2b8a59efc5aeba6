//! Health endpoint
//!
//! Reports what this orchestrator serves along with its current load.

use axum::{Json, extract::State};
use sluice_core::dto::health::HealthResponse;

use super::AppState;

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        pipeline: state.orchestrator.definition().name.clone(),
        trigger_branch: state.listener.branch().to_string(),
        active_runs: state.orchestrator.active_runs(),
    })
}
