//! Hook API Handlers
//!
//! Push notifications from source control.

use axum::{Json, extract::State, http::StatusCode};
use sluice_core::dto::trigger::{PushEvent, TriggerResponse};

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::hook_service;

/// POST /hooks/push
/// Start a run for a push to the trigger branch
///
/// Answers 202 with the run id when a run starts, 200 when the push is ignored.
pub async fn push(
    State(state): State<AppState>,
    Json(event): Json<PushEvent>,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    tracing::info!("Push to {} at {}", event.branch, event.commit);

    let response = hook_service::handle_push(&state.listener, event).await?;
    let status = if response.run_id.is_some() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };

    Ok((status, Json(response)))
}
