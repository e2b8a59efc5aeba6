//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod pipeline;
mod runs;
mod trigger;

pub use pipeline::RunArgs;
pub use runs::RunCommands;

use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Check a pipeline file: schema, stage references and cycles
    Validate {
        /// Pipeline definition (JSON)
        file: PathBuf,
    },
    /// Execute a pipeline on this machine
    Run(RunArgs),
    /// Inspect and cancel runs on the orchestrator
    Runs {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Send a push event to the orchestrator
    Trigger {
        /// Branch that was pushed
        #[arg(long, default_value = "main")]
        branch: String,

        /// Commit the branch now points at
        #[arg(long)]
        commit: String,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Validate { file } => pipeline::validate(&file),
        Commands::Run(args) => pipeline::run(args).await,
        Commands::Runs { command } => runs::handle_runs_command(command, config).await,
        Commands::Trigger { branch, commit } => trigger::push(config, &branch, &commit).await,
    }
}
