//! Source control hook endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use sluice_core::dto::trigger::{PushEvent, TriggerResponse};

impl OrchestratorClient {
    /// Notify the orchestrator of a push
    ///
    /// # Arguments
    /// * `branch` - Branch name, with or without the `refs/heads/` prefix
    /// * `commit` - Commit the branch now points at
    ///
    /// # Returns
    /// The started run id, or `None` when the branch does not trigger the pipeline
    ///
    /// # Example
    /// ```no_run
    /// # use sluice_client::OrchestratorClient;
    /// # async fn example() -> anyhow::Result<()> {
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// let response = client.push("main", "9f1c2e").await?;
    /// if let Some(run_id) = response.run_id {
    ///     println!("started {}", run_id);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn push(&self, branch: &str, commit: &str) -> Result<TriggerResponse> {
        let url = format!("{}/hooks/push", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&PushEvent {
                branch: branch.to_string(),
                commit: commit.to_string(),
            })
            .send()
            .await?;

        self.handle_response(response).await
    }
}
