//! Run DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::run::{Run, RunStatus, StageStatus};

/// Lightweight run summary for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub pipeline: String,
    pub branch: String,
    pub commit_ref: String,
    pub status: RunStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub stages_succeeded: usize,
    pub stages_total: usize,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id,
            pipeline: run.pipeline.clone(),
            branch: run.trigger.branch.clone(),
            commit_ref: run.trigger.commit_ref.clone(),
            status: run.status,
            created_at: run.created_at,
            finished_at: run.finished_at,
            stages_succeeded: run
                .stages
                .values()
                .filter(|s| s.status == StageStatus::Succeeded)
                .count(),
            stages_total: run.stages.len(),
        }
    }
}

/// Answer to a cancel request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub run_id: Uuid,
    /// `false` when the run was not executing on this orchestrator
    pub cancel_requested: bool,
}

/// Query parameters for listing runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRuns {
    pub status: Option<RunStatus>,
    pub limit: Option<i64>,
}
