//! Health endpoint

use crate::OrchestratorClient;
use crate::error::Result;
use sluice_core::dto::health::HealthResponse;

impl OrchestratorClient {
    /// Fetch the orchestrator's health report
    pub async fn health(&self) -> Result<HealthResponse> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }
}
