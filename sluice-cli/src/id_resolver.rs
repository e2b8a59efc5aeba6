//! ID resolver module
//!
//! Resolves run ID prefixes to full UUIDs by querying recent runs.

use anyhow::{Context, Result, anyhow};
use sluice_client::OrchestratorClient;
use sluice_core::dto::run::RunSummary;
use uuid::Uuid;

use crate::types::IdOrPrefix;

/// Number of recent runs searched for a matching prefix
const RESOLVE_WINDOW: i64 = 500;

/// Resolve a run ID or prefix to a full UUID
///
/// # Errors
/// Returns an error if no recent run matches, the prefix is ambiguous,
/// or the API call fails.
pub async fn resolve_run_id(client: &OrchestratorClient, id_or_prefix: &IdOrPrefix) -> Result<Uuid> {
    if let Some(uuid) = id_or_prefix.as_uuid() {
        return Ok(uuid);
    }

    let runs = client
        .list_runs(None, Some(RESOLVE_WINDOW))
        .await
        .context("Failed to fetch runs for ID resolution")?;

    match_prefix(&runs, &id_or_prefix.as_str())
}

fn match_prefix(runs: &[RunSummary], prefix: &str) -> Result<Uuid> {
    let matches: Vec<Uuid> = runs
        .iter()
        .map(|r| r.id)
        .filter(|id| id.to_string().starts_with(prefix))
        .collect();

    match matches.as_slice() {
        [] => Err(anyhow!("No run found with ID starting with '{}'", prefix)),
        [id] => Ok(*id),
        _ => {
            let ids: Vec<String> = matches.iter().map(Uuid::to_string).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple runs: {}",
                prefix,
                ids.join(", ")
            ))
        }
    }
}
