//! Local pipeline commands
//!
//! `validate` checks a definition without running anything; `run` executes it
//! on this machine with the same orchestrator the server uses.

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use sluice_core::domain::pipeline::PipelineDefinition;
use sluice_core::domain::run::{RunStatus, Trigger};
use sluice_runner::{
    ActionRegistry, DependencyGraph, EnvSecretStore, InMemoryRunHistory, InMemorySecretStore, LocalExecutor,
    PipelineOrchestrator, RunHistory, RunnerConfig, SecretStore, StageRunner,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::display::{print_log_entry, print_run_details};
use crate::types::KeyValue;

/// Options for a local run
#[derive(Args)]
pub struct RunArgs {
    /// Pipeline definition (JSON)
    pub file: PathBuf,

    /// Secret made available to steps, repeatable
    #[arg(long = "secret", value_name = "NAME=VALUE", conflicts_with = "env_secrets")]
    pub secrets: Vec<KeyValue>,

    /// Resolve secrets from SLUICE_SECRET_<NAME> environment variables
    #[arg(long)]
    pub env_secrets: bool,

    /// Variable exported to every step, repeatable
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub variables: Vec<KeyValue>,

    /// Action available to `uses` steps as NAME=COMMAND, repeatable
    /// (e.g. `kubectl-apply=kubectl apply -f k8s/`)
    #[arg(long = "action", value_name = "NAME=COMMAND")]
    pub actions: Vec<KeyValue>,

    /// Maximum number of stages running at once
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Branch recorded as the trigger
    #[arg(long, default_value = "main")]
    pub branch: String,

    /// Commit recorded as the trigger
    #[arg(long, default_value = "local")]
    pub commit: String,

    /// Directory copied into every stage workspace (default: current directory)
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// Directory under which stage workspaces are created
    #[arg(long, env = "SLUICE_WORKSPACE_BASE")]
    pub workspace: Option<PathBuf>,

    /// Keep stage workspaces after the run
    #[arg(long)]
    pub keep_workspaces: bool,

    /// Default step timeout in seconds
    #[arg(long, default_value_t = 1800)]
    pub step_timeout: u64,

    /// Seconds a cancelled command gets to exit before it is killed
    #[arg(long, default_value_t = 10)]
    pub cancel_grace: u64,

    /// Stage retries for stages that do not declare their own
    #[arg(long, default_value_t = 0)]
    pub retries: u32,
}

fn load_definition(file: &Path) -> Result<PipelineDefinition> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read pipeline file {}", file.display()))?;
    PipelineDefinition::from_json(&source)
        .with_context(|| format!("Invalid pipeline file {}", file.display()))
}

/// Validate a pipeline file and print its execution order
pub fn validate(file: &Path) -> Result<()> {
    let definition = load_definition(file)?;
    let graph = DependencyGraph::build(&definition)
        .with_context(|| format!("Invalid pipeline '{}'", definition.name))?;

    println!("{}", "✓ Pipeline is valid".green().bold());
    println!("  Name:   {}", definition.name.cyan());
    if let Some(description) = &definition.description {
        println!("  About:  {}", description);
    }
    println!("  Stages: {}", graph.len());

    println!("\n{}", "Execution order:".bold());
    for (i, stage) in graph.topological_order().into_iter().enumerate() {
        let needs = graph.dependencies(stage);
        if needs.is_empty() {
            println!("  {}. {}", i + 1, stage);
        } else {
            println!(
                "  {}. {} {}",
                i + 1,
                stage,
                format!("(needs {})", needs.join(", ")).dimmed()
            );
        }
    }

    let secrets = definition.secret_refs();
    if !secrets.is_empty() {
        println!("\n{}", "Secrets referenced:".bold());
        for secret in secrets {
            println!("  {}", secret.name().yellow());
        }
    }

    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sluice_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn runner_config(args: &RunArgs) -> Result<RunnerConfig> {
    let workspace_base = args
        .workspace
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("sluice"));
    let source_dir = match &args.source {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };

    let mut config = RunnerConfig::new(workspace_base);
    config.worker_limit = args.workers;
    config.step_timeout = Duration::from_secs(args.step_timeout);
    config.cancel_grace = Duration::from_secs(args.cancel_grace);
    config.source_dir = Some(source_dir);
    config.keep_workspaces = args.keep_workspaces;
    config.default_retries = args.retries;
    config.trigger_branch = args.branch.clone();
    for var in &args.variables {
        config = config.with_variable(var.key.clone(), var.value.clone());
    }
    config.validate()?;
    Ok(config)
}

fn secret_store(args: &RunArgs) -> Arc<dyn SecretStore> {
    if args.env_secrets {
        return Arc::new(EnvSecretStore::default());
    }
    let store = InMemorySecretStore::new();
    for secret in &args.secrets {
        store.insert(secret.key.clone(), secret.value.clone());
    }
    Arc::new(store)
}

fn action_registry(args: &RunArgs) -> Result<ActionRegistry> {
    let mut registry = ActionRegistry::new();
    for action in &args.actions {
        let argv: Vec<String> = action.value.split_whitespace().map(str::to_string).collect();
        if argv.is_empty() {
            anyhow::bail!("Action '{}' has an empty command", action.key);
        }
        registry.register(action.key.clone(), argv);
    }
    Ok(registry)
}

/// Execute a pipeline locally
///
/// Ctrl-C cancels the run; it is reported once every stage has stopped.
/// Returns an error unless the run succeeded.
pub async fn run(args: RunArgs) -> Result<()> {
    init_tracing();

    let definition = load_definition(&args.file)?;
    let config = runner_config(&args)?;

    let executor = LocalExecutor::new(config.cancel_grace)
        .scrub_env_prefix(EnvSecretStore::DEFAULT_PREFIX);
    let stages = StageRunner::new(Arc::new(executor), secret_store(&args), config.step_timeout)
        .with_default_retries(config.default_retries)
        .with_actions(action_registry(&args)?);
    let history = Arc::new(InMemoryRunHistory::new());
    let orchestrator = Arc::new(
        PipelineOrchestrator::new(
            Arc::new(definition),
            Arc::new(stages),
            history.clone(),
            &config,
        )
        .context("Invalid pipeline")?,
    );

    let run = orchestrator.create_run(Trigger::push(&args.branch, &args.commit));
    let run_id = run.id;
    println!(
        "{} {} {}",
        "▸ Running".cyan().bold(),
        orchestrator.definition().name.bold(),
        run_id.to_string().dimmed()
    );

    let mut handle = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.execute(run).await }
    });

    let run = tokio::select! {
        run = &mut handle => run.context("Run task failed")?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}", "Cancelling run, waiting for stages to stop...".yellow());
            orchestrator.cancel(run_id);
            handle.await.context("Run task failed")?
        }
    };

    let logs = history.logs(run_id).await?;
    println!("{}", "─".repeat(80).dimmed());
    for log in &logs {
        print_log_entry(log);
    }
    println!("{}", "─".repeat(80).dimmed());

    let graph = DependencyGraph::build(orchestrator.definition())?;
    let order = graph.topological_order();
    print_run_details(&run, Some(order.as_slice()));

    match run.status {
        RunStatus::Succeeded => Ok(()),
        status => anyhow::bail!("Run {} {}", run_id, status),
    }
}
