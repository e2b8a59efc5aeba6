//! Runner configuration
//!
//! Defines all configurable parameters for pipeline execution including
//! worker limits, timeouts, cancellation grace and workspace placement.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Runner configuration
///
/// All timeouts and limits are configurable to allow tuning for different
/// hosts (a laptop running one stage at a time vs a build box).
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum number of stages executing at the same time
    pub worker_limit: usize,

    /// Timeout applied to steps that do not declare their own
    pub step_timeout: Duration,

    /// How long running commands get to exit after a cancellation signal
    pub cancel_grace: Duration,

    /// Directory under which per-run, per-stage workspaces are created
    pub workspace_base: PathBuf,

    /// Checkout copied into every stage workspace before its first step
    pub source_dir: Option<PathBuf>,

    /// Keep stage workspaces on disk after the run finishes
    pub keep_workspaces: bool,

    /// Stage retries used when a stage does not declare its own
    pub default_retries: u32,

    /// Branch whose pushes start a run
    pub trigger_branch: String,

    /// Per-run values injected into every step environment
    /// (e.g. `KUBECONFIG=/etc/sluice/kubeconfig`)
    pub variables: BTreeMap<String, String>,
}

impl RunnerConfig {
    /// Creates a new configuration with defaults
    pub fn new(workspace_base: PathBuf) -> Self {
        Self {
            worker_limit: 1,
            step_timeout: Duration::from_secs(1800), // 30 minutes
            cancel_grace: Duration::from_secs(10),
            workspace_base,
            source_dir: None,
            keep_workspaces: false,
            default_retries: 0,
            trigger_branch: "main".to_string(),
            variables: BTreeMap::new(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - SLUICE_WORKSPACE_BASE (default: <tmp>/sluice)
    /// - SLUICE_SOURCE_DIR
    /// - SLUICE_WORKER_LIMIT (default: 1)
    /// - SLUICE_STEP_TIMEOUT (seconds, default: 1800)
    /// - SLUICE_CANCEL_GRACE (seconds, default: 10)
    /// - SLUICE_DEFAULT_RETRIES (default: 0)
    /// - SLUICE_TRIGGER_BRANCH (default: main)
    /// - SLUICE_KEEP_WORKSPACES (true/false, default: false)
    pub fn from_env() -> anyhow::Result<Self> {
        let workspace_base = std::env::var("SLUICE_WORKSPACE_BASE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("sluice"));

        let mut config = Self::new(workspace_base);

        config.source_dir = std::env::var("SLUICE_SOURCE_DIR").ok().map(PathBuf::from);

        if let Some(limit) = parse_env::<usize>("SLUICE_WORKER_LIMIT")? {
            config.worker_limit = limit;
        }
        if let Some(secs) = parse_env::<u64>("SLUICE_STEP_TIMEOUT")? {
            config.step_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>("SLUICE_CANCEL_GRACE")? {
            config.cancel_grace = Duration::from_secs(secs);
        }
        if let Some(retries) = parse_env::<u32>("SLUICE_DEFAULT_RETRIES")? {
            config.default_retries = retries;
        }
        if let Some(keep) = parse_env::<bool>("SLUICE_KEEP_WORKSPACES")? {
            config.keep_workspaces = keep;
        }
        if let Ok(branch) = std::env::var("SLUICE_TRIGGER_BRANCH") {
            config.trigger_branch = branch;
        }

        Ok(config)
    }

    /// Adds a per-run variable exposed to every step
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_limit == 0 {
            anyhow::bail!("worker_limit must be greater than 0");
        }

        if self.step_timeout.is_zero() {
            anyhow::bail!("step_timeout must be greater than 0");
        }

        if self.trigger_branch.trim().is_empty() {
            anyhow::bail!("trigger_branch cannot be empty");
        }

        if self.workspace_base.as_os_str().is_empty() {
            anyhow::bail!("workspace_base cannot be empty");
        }

        if let Some(source) = &self.source_dir {
            if !source.is_dir() {
                anyhow::bail!("source_dir {} is not a directory", source.display());
            }
        }

        Ok(())
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("sluice"))
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: '{}'", name, raw)),
        Err(_) => Ok(None),
    }
}
