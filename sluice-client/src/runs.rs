//! Run-related API endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use sluice_core::domain::log::LogEntry;
use sluice_core::domain::run::{Run, RunStatus};
use sluice_core::dto::run::{CancelResponse, ListRuns, RunSummary};
use uuid::Uuid;

impl OrchestratorClient {
    /// List recent runs, newest first
    ///
    /// # Arguments
    /// * `status` - Only return runs in this status
    /// * `limit` - Maximum number of runs (server default when `None`)
    pub async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: Option<i64>,
    ) -> Result<Vec<RunSummary>> {
        let url = format!("{}/runs", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&ListRuns { status, limit })
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Get a run with all of its stage results
    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        let url = format!("{}/runs/{}", self.base_url, run_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Get the redacted logs of a run in the order they were produced
    pub async fn get_run_logs(&self, run_id: Uuid) -> Result<Vec<LogEntry>> {
        let url = format!("{}/runs/{}/logs", self.base_url, run_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Request cancellation of an executing run
    ///
    /// Fails with a 409 API error when the run has already finished.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<CancelResponse> {
        let url = format!("{}/runs/{}/cancel", self.base_url, run_id);
        let response = self.client.post(&url).send().await?;

        self.handle_response(response).await
    }
}
