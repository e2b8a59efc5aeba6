//! Push trigger command

use anyhow::{Context, Result};
use colored::*;
use sluice_client::OrchestratorClient;

use crate::config::Config;

/// Notify the orchestrator of a push and report whether a run started
pub async fn push(config: &Config, branch: &str, commit: &str) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url);
    let response = client
        .push(branch, commit)
        .await
        .context("Failed to send push event")?;

    match response.run_id {
        Some(run_id) => {
            println!("{}", "✓ Run started".green().bold());
            println!("  ID: {}", run_id.to_string().cyan());
            println!(
                "\n{}",
                format!("Follow it with: sluice runs get {}", run_id).dimmed()
            );
        }
        None => println!("{}", response.message.yellow()),
    }

    Ok(())
}
