//! Scripted command executor for unit tests
//!
//! Steps are written as `run` actions whose script is a tiny command language:
//! - `ok`, `fail`, `exit:<code>`
//! - `print:<text>` writes `<text>` to stdout
//! - `echo-env:<VAR>` writes the value of `VAR` to stdout
//! - `sleep:<ms>` honours timeout and cancellation
//! - `hang:<ms>` ignores cancellation (but not the timeout)

use async_trait::async_trait;
use sluice_core::domain::pipeline::{
    EnvValue, PipelineDefinition, StageDefinition, StepAction, StepDefinition,
};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::process::{CommandExecutor, CommandOutput, ExecutorError, Invocation, Termination};

#[derive(Debug, Clone)]
pub struct Record {
    pub script: String,
    pub env: BTreeMap<String, String>,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Default)]
pub struct ScriptedExecutor {
    records: Mutex<Vec<Record>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.script).collect()
    }

    /// Highest number of invocations observed in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn wait(
        duration: Duration,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Option<Termination> {
        let sleep = tokio::time::sleep(duration);
        let deadline = tokio::time::sleep(timeout);
        match cancel {
            Some(cancel) => tokio::select! {
                _ = sleep => None,
                _ = deadline => Some(Termination::TimedOut),
                _ = cancel.cancelled() => Some(Termination::Cancelled),
            },
            None => tokio::select! {
                _ = sleep => None,
                _ = deadline => Some(Termination::TimedOut),
            },
        }
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn invoke(
        &self,
        invocation: Invocation,
        cancel: CancellationToken,
    ) -> Result<CommandOutput, ExecutorError> {
        let script = invocation.args.last().cloned().unwrap_or_default();
        let started = Instant::now();
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let mut stdout = String::new();
        let termination = match script.split_once(':') {
            None if script == "ok" => Termination::Exited(0),
            None if script == "fail" => Termination::Exited(1),
            Some(("exit", code)) => Termination::Exited(code.parse().unwrap_or(1)),
            Some(("print", text)) => {
                stdout = format!("{}\n", text);
                Termination::Exited(0)
            }
            Some(("echo-env", var)) => {
                stdout = format!("{}\n", invocation.env.get(var).cloned().unwrap_or_default());
                Termination::Exited(0)
            }
            Some(("sleep", ms)) => {
                let ms = ms.parse().unwrap_or(0);
                Self::wait(Duration::from_millis(ms), invocation.timeout, Some(&cancel))
                    .await
                    .unwrap_or(Termination::Exited(0))
            }
            Some(("hang", ms)) => {
                let ms = ms.parse().unwrap_or(0);
                Self::wait(Duration::from_millis(ms), invocation.timeout, None)
                    .await
                    .unwrap_or(Termination::Exited(0))
            }
            _ => Termination::Exited(127),
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.records.lock().unwrap().push(Record {
            script,
            env: invocation.env,
            started,
            finished: Instant::now(),
        });

        Ok(CommandOutput {
            termination,
            stdout,
            stderr: String::new(),
        })
    }
}

pub fn step(name: &str, script: &str) -> StepDefinition {
    StepDefinition {
        name: name.to_string(),
        action: StepAction::Run(script.to_string()),
        env: BTreeMap::new(),
        timeout_seconds: None,
    }
}

pub fn secret_step(name: &str, script: &str, var: &str, secret: &str) -> StepDefinition {
    let mut step = step(name, script);
    step.env.insert(var.to_string(), EnvValue::secret(secret));
    step
}

pub fn stage(name: &str, needs: &[&str], steps: Vec<StepDefinition>) -> StageDefinition {
    StageDefinition {
        name: name.to_string(),
        needs: needs.iter().map(|s| s.to_string()).collect(),
        steps,
        retries: None,
    }
}

pub fn pipeline(stages: Vec<StageDefinition>) -> PipelineDefinition {
    PipelineDefinition {
        name: "node-app".to_string(),
        description: None,
        stages,
    }
}
