//! Run API Handlers
//!
//! HTTP endpoints for run queries and cancellation.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use sluice_core::domain::log::LogEntry;
use sluice_core::domain::run::Run;
use sluice_core::dto::run::{CancelResponse, ListRuns, RunSummary};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::run_service;

/// GET /runs
/// List recent runs, optionally filtered by `status` and bounded by `limit`
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRuns>,
) -> ApiResult<Json<Vec<RunSummary>>> {
    tracing::debug!("Listing runs");

    let runs = run_service::list_runs(&state.orchestrator, query).await?;
    Ok(Json(runs))
}

/// GET /runs/{id}
/// Get a run with all stage results
pub async fn get_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Run>> {
    tracing::debug!("Getting run: {}", id);

    let run = run_service::get_run(&state.orchestrator, id).await?;
    Ok(Json(run))
}

/// GET /runs/{id}/logs
/// Get the redacted logs of a run
pub async fn get_run_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    tracing::debug!("Getting logs for run: {}", id);

    let logs = run_service::get_logs(&state.orchestrator, id).await?;
    Ok(Json(logs))
}

/// POST /runs/{id}/cancel
/// Request cancellation of an executing run
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CancelResponse>> {
    tracing::info!("Cancel requested for run: {}", id);

    let response = run_service::cancel_run(&state.orchestrator, id).await?;
    Ok(Json(response))
}
