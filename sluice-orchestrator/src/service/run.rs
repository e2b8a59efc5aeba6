//! Run Service
//!
//! Queries over run history and run cancellation.

use sluice_core::domain::log::LogEntry;
use sluice_core::domain::run::Run;
use sluice_core::dto::run::{CancelResponse, ListRuns, RunSummary};
use sluice_runner::PipelineOrchestrator;
use sluice_runner::service::HistoryError;
use uuid::Uuid;

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;

/// Service error type
#[derive(Debug)]
pub enum RunError {
    NotFound(Uuid),
    /// The run exists but is not executing here (already finished)
    NotActive(Uuid),
    ValidationError(String),
    HistoryError(HistoryError),
}

impl From<HistoryError> for RunError {
    fn from(err: HistoryError) -> Self {
        RunError::HistoryError(err)
    }
}

/// Get a run by ID
pub async fn get_run(orchestrator: &PipelineOrchestrator, id: Uuid) -> Result<Run, RunError> {
    orchestrator
        .history()
        .get(id)
        .await?
        .ok_or(RunError::NotFound(id))
}

/// List recent runs
pub async fn list_runs(
    orchestrator: &PipelineOrchestrator,
    query: ListRuns,
) -> Result<Vec<RunSummary>, RunError> {
    let limit = match query.limit {
        None => DEFAULT_LIST_LIMIT,
        Some(limit) if limit < 1 => {
            return Err(RunError::ValidationError(
                "limit must be at least 1".to_string(),
            ));
        }
        Some(limit) => usize::try_from(limit)
            .unwrap_or(MAX_LIST_LIMIT)
            .min(MAX_LIST_LIMIT),
    };

    let runs = orchestrator.history().list(query.status, limit).await?;
    Ok(runs.iter().map(RunSummary::from).collect())
}

/// Get the redacted logs of a run
pub async fn get_logs(
    orchestrator: &PipelineOrchestrator,
    id: Uuid,
) -> Result<Vec<LogEntry>, RunError> {
    // Distinguish an unknown run from one without output
    get_run(orchestrator, id).await?;
    Ok(orchestrator.history().logs(id).await?)
}

/// Request cancellation of an executing run
pub async fn cancel_run(
    orchestrator: &PipelineOrchestrator,
    id: Uuid,
) -> Result<CancelResponse, RunError> {
    if orchestrator.cancel(id) {
        tracing::info!("Cancellation requested for run {}", id);
        return Ok(CancelResponse {
            run_id: id,
            cancel_requested: true,
        });
    }

    match orchestrator.history().get(id).await? {
        Some(_) => Err(RunError::NotActive(id)),
        None => Err(RunError::NotFound(id)),
    }
}
