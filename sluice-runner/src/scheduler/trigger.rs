//! Push trigger listener
//!
//! Starts a run for pushes to the configured trigger branch and ignores
//! everything else.

use sluice_core::domain::run::{RunOutcome, Trigger};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::scheduler::PipelineOrchestrator;

const BRANCH_REF_PREFIX: &str = "refs/heads/";

pub struct TriggerListener {
    branch: String,
    orchestrator: Arc<PipelineOrchestrator>,
}

impl TriggerListener {
    pub fn new(branch: impl Into<String>, orchestrator: Arc<PipelineOrchestrator>) -> Self {
        Self {
            branch: normalize(&branch.into()).to_string(),
            orchestrator,
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Whether a push to `branch` (short name or `refs/heads/...`) starts a run
    pub fn matches(&self, branch: &str) -> bool {
        normalize(branch) == self.branch
    }

    /// Handles a push event; returns the id of the started run
    pub async fn on_push(&self, branch: &str, commit_ref: &str) -> Option<Uuid> {
        self.dispatch(branch, commit_ref).await.map(|(id, _)| id)
    }

    /// Like [`Self::on_push`], also returning the handle of the executing run
    pub async fn dispatch(
        &self,
        branch: &str,
        commit_ref: &str,
    ) -> Option<(Uuid, JoinHandle<RunOutcome>)> {
        if !self.matches(branch) {
            debug!(
                "Ignoring push to {} (trigger branch is {})",
                branch, self.branch
            );
            return None;
        }

        let run = self
            .orchestrator
            .create_run(Trigger::push(normalize(branch), commit_ref));
        let run_id = run.id;

        // Visible to observers before the first stage starts
        if let Err(e) = self.orchestrator.history().save(&run).await {
            warn!(run_id = %run_id, "Failed to store new run: {}", e);
        }

        info!(
            run_id = %run_id,
            commit = %commit_ref,
            "Push to {} triggered a run",
            self.branch
        );

        let orchestrator = Arc::clone(&self.orchestrator);
        let handle = tokio::spawn(async move { orchestrator.start(run).await });
        Some((run_id, handle))
    }
}

fn normalize(branch: &str) -> &str {
    branch.strip_prefix(BRANCH_REF_PREFIX).unwrap_or(branch)
}
