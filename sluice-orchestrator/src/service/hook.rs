//! Hook Service
//!
//! Turns push notifications into runs.

use sluice_core::dto::trigger::{PushEvent, TriggerResponse};
use sluice_runner::TriggerListener;

/// Service error type
#[derive(Debug)]
pub enum HookError {
    ValidationError(String),
}

/// Handle a push; starts a run when the branch is the trigger branch
pub async fn handle_push(
    listener: &TriggerListener,
    event: PushEvent,
) -> Result<TriggerResponse, HookError> {
    if event.branch.trim().is_empty() {
        return Err(HookError::ValidationError(
            "push event has no branch".to_string(),
        ));
    }
    if event.commit.trim().is_empty() {
        return Err(HookError::ValidationError(
            "push event has no commit".to_string(),
        ));
    }

    match listener.on_push(&event.branch, &event.commit).await {
        Some(run_id) => Ok(TriggerResponse::started(run_id)),
        None => Ok(TriggerResponse::ignored(&event.branch)),
    }
}
