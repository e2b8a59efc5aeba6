//! Trigger DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Push notification from source control
///
/// Accepts both the short form (`branch`, `commit`) and the webhook form
/// (`ref`, `after`) sent by common forges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    #[serde(alias = "ref")]
    pub branch: String,
    #[serde(alias = "after")]
    pub commit: String,
}

/// Answer to a push notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResponse {
    /// Run started for the push, `None` when the branch is not watched
    pub run_id: Option<Uuid>,
    pub message: String,
}

impl TriggerResponse {
    pub fn started(run_id: Uuid) -> Self {
        Self {
            run_id: Some(run_id),
            message: format!("run {} started", run_id),
        }
    }

    pub fn ignored(branch: &str) -> Self {
        Self {
            run_id: None,
            message: format!("branch '{}' does not trigger this pipeline", branch),
        }
    }
}
