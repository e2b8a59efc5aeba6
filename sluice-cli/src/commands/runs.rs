//! Run command handlers
//!
//! Lists, inspects and cancels runs held by the orchestrator.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use sluice_client::OrchestratorClient;
use sluice_core::domain::run::RunStatus;

use crate::config::Config;
use crate::display::{print_log_entry, print_run_details, print_run_summary};
use crate::id_resolver::resolve_run_id;
use crate::types::IdOrPrefix;

/// Run subcommands
#[derive(Subcommand)]
pub enum RunCommands {
    /// List recent runs
    List {
        /// Only show runs in this status (pending, running, succeeded, failed, cancelled)
        #[arg(long)]
        status: Option<RunStatus>,

        /// Maximum number of runs
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Get run details
    Get {
        /// Run ID or unambiguous prefix
        id: String,
    },
    /// Get run logs
    Logs {
        /// Run ID or unambiguous prefix
        id: String,
    },
    /// Cancel an executing run
    Cancel {
        /// Run ID or unambiguous prefix
        id: String,
    },
}

/// Handle run commands
pub async fn handle_runs_command(command: RunCommands, config: &Config) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    match command {
        RunCommands::List { status, limit } => list_runs(&client, status, limit).await,
        RunCommands::Get { id } => get_run(&client, &id).await,
        RunCommands::Logs { id } => get_run_logs(&client, &id).await,
        RunCommands::Cancel { id } => cancel_run(&client, &id).await,
    }
}

async fn list_runs(client: &OrchestratorClient, status: Option<RunStatus>, limit: i64) -> Result<()> {
    let runs = client
        .list_runs(status, Some(limit))
        .await
        .context("Failed to list runs")?;

    if runs.is_empty() {
        println!("{}", "No runs found.".yellow());
    } else {
        println!("{}", format!("Found {} run(s):", runs.len()).bold());
        println!();
        for run in &runs {
            print_run_summary(run);
        }
    }

    Ok(())
}

async fn get_run(client: &OrchestratorClient, id: &str) -> Result<()> {
    let uuid = resolve_run_id(client, &IdOrPrefix::parse(id)).await?;
    let run = client.get_run(uuid).await?;

    print_run_details(&run, None);

    Ok(())
}

async fn get_run_logs(client: &OrchestratorClient, id: &str) -> Result<()> {
    let uuid = resolve_run_id(client, &IdOrPrefix::parse(id)).await?;
    let logs = client.get_run_logs(uuid).await?;

    if logs.is_empty() {
        println!("{}", "No logs found for this run.".yellow());
    } else {
        println!("{}", format!("Logs for run {}:", uuid).bold());
        println!("{}", "─".repeat(80).dimmed());
        for log in &logs {
            print_log_entry(log);
        }
        println!("{}", "─".repeat(80).dimmed());
    }

    Ok(())
}

async fn cancel_run(client: &OrchestratorClient, id: &str) -> Result<()> {
    let uuid = resolve_run_id(client, &IdOrPrefix::parse(id)).await?;

    match client.cancel_run(uuid).await {
        Ok(_) => {
            println!("{}", "✓ Cancellation requested".green().bold());
            println!("  ID: {}", uuid.to_string().cyan());
            Ok(())
        }
        Err(e) if e.is_conflict() => {
            println!("{}", format!("Run {} has already finished.", uuid).yellow());
            Ok(())
        }
        Err(e) => Err(e).context("Failed to cancel run"),
    }
}
