//! Orchestrator health report

use serde::{Deserialize, Serialize};

/// Answer of `GET /health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the process can serve requests
    pub status: String,
    pub version: String,
    /// Name of the pipeline this orchestrator executes
    pub pipeline: String,
    /// Branch whose pushes start runs
    pub trigger_branch: String,
    /// Runs currently executing on this orchestrator
    pub active_runs: usize,
}
