//! Stage execution service
//!
//! Runs one stage's steps strictly in order:
//! - Resolving each step's environment, fetching secrets just before the step
//! - Registering resolved secrets with the stage's redactor
//! - Invoking the command in the stage workspace
//! - Recording redacted output and the step result
//!
//! The first failing step ends the attempt. A stage with retries re-runs from
//! its first step.

use async_trait::async_trait;
use chrono::Utc;
use sluice_core::domain::log::LogLevel;
use sluice_core::domain::pipeline::{EnvValue, StageDefinition, StepAction, StepDefinition};
use sluice_core::domain::run::{StageResult, StageStatus, StepResult, StepStatus};
use sluice_core::error::StepError;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::StageContext;
use crate::process::{ActionRegistry, CommandExecutor, Invocation, Termination};
use crate::secrets::SecretStore;

/// Service trait for executing a single stage
#[async_trait]
pub trait StageService: Send + Sync {
    /// Executes `stage` to a terminal result
    ///
    /// Never returns a result in `pending` or `running`.
    async fn run(
        &self,
        stage: &StageDefinition,
        ctx: &StageContext,
        cancel: CancellationToken,
    ) -> StageResult;
}

/// Standard implementation of StageService
pub struct StageRunner {
    executor: Arc<dyn CommandExecutor>,
    secrets: Arc<dyn SecretStore>,
    actions: Arc<ActionRegistry>,
    default_timeout: Duration,
    default_retries: u32,
}

impl StageRunner {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        secrets: Arc<dyn SecretStore>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            secrets,
            actions: Arc::new(ActionRegistry::new()),
            default_timeout,
            default_retries: 0,
        }
    }

    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = Arc::new(actions);
        self
    }

    pub fn with_default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    /// Runs every step once; stops at the first failure
    async fn run_attempt(
        &self,
        stage: &StageDefinition,
        ctx: &StageContext,
        cancel: &CancellationToken,
        steps: &mut Vec<StepResult>,
    ) -> Result<(), StepError> {
        for step in &stage.steps {
            let (result, outcome) = self.run_step(step, ctx, cancel).await;
            steps.push(result);
            outcome?;
        }
        Ok(())
    }

    async fn run_step(
        &self,
        step: &StepDefinition,
        ctx: &StageContext,
        cancel: &CancellationToken,
    ) -> (StepResult, Result<(), StepError>) {
        let started_at = Utc::now();
        let finish = |status, exit_code, output_lines, outcome: Result<(), StepError>| {
            let reason = outcome
                .as_ref()
                .err()
                .map(|e| ctx.redactor().redact(&e.to_string()));
            let result = StepResult {
                name: step.name.clone(),
                status,
                exit_code,
                started_at,
                finished_at: Utc::now(),
                output_lines,
                reason,
            };
            (result, outcome)
        };

        if cancel.is_cancelled() {
            return finish(
                StepStatus::Cancelled,
                None,
                0,
                Err(StepError::Cancelled {
                    step: step.name.clone(),
                }),
            );
        }

        let invocation = match self.prepare(step, ctx).await {
            Ok(invocation) => invocation,
            Err(e) => {
                ctx.log(LogLevel::Error, Some(&step.name), &e.to_string());
                return finish(StepStatus::Failed, None, 0, Err(e));
            }
        };

        let timeout = invocation.timeout;
        let action = ctx.redactor().redact(&step.action.to_string());
        info!(
            run_id = %ctx.run_id,
            stage = %ctx.stage,
            step = %step.name,
            "Running step ({})",
            action
        );
        ctx.log(LogLevel::Info, Some(&step.name), &format!("$ {}", action));

        let output = match self.executor.invoke(invocation, cancel.clone()).await {
            Ok(output) => output,
            Err(e) => {
                let err = StepError::Spawn {
                    step: step.name.clone(),
                    message: ctx.redactor().redact(&e.to_string()),
                };
                error!(run_id = %ctx.run_id, stage = %ctx.stage, "{}", err);
                ctx.log(LogLevel::Error, Some(&step.name), &err.to_string());
                return finish(StepStatus::Failed, None, 0, Err(err));
            }
        };

        let lines = ctx.log_output(&step.name, LogLevel::Info, &output.stdout)
            + ctx.log_output(&step.name, LogLevel::Info, &output.stderr);

        let name = step.name.clone();
        let (status, exit_code, outcome) = match output.termination {
            Termination::Exited(0) => (StepStatus::Succeeded, Some(0), Ok(())),
            Termination::Exited(code) => (
                StepStatus::Failed,
                Some(code),
                Err(StepError::NonZeroExit { step: name, code }),
            ),
            Termination::Signalled => (
                StepStatus::Failed,
                None,
                Err(StepError::NonZeroExit {
                    step: name,
                    code: -1,
                }),
            ),
            Termination::TimedOut => (
                StepStatus::TimedOut,
                None,
                Err(StepError::Timeout {
                    step: name,
                    seconds: timeout.as_secs(),
                }),
            ),
            Termination::Cancelled => (
                StepStatus::Cancelled,
                None,
                Err(StepError::Cancelled { step: name }),
            ),
        };

        match &outcome {
            Ok(()) => debug!(
                run_id = %ctx.run_id,
                stage = %ctx.stage,
                step = %step.name,
                "Step succeeded"
            ),
            Err(e) => {
                warn!(run_id = %ctx.run_id, stage = %ctx.stage, "{}", e);
                ctx.log(LogLevel::Error, Some(&step.name), &e.to_string());
            }
        }

        finish(status, exit_code, lines, outcome)
    }

    /// Builds the invocation for `step`, resolving its secrets
    async fn prepare(&self, step: &StepDefinition, ctx: &StageContext) -> Result<Invocation, StepError> {
        let timeout = step
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let mut invocation = match &step.action {
            StepAction::Run(script) => Invocation::new("sh", ctx.workspace.clone(), timeout)
                .args(["-c", script.as_str()]),
            StepAction::Exec { program, args } => {
                Invocation::new(program.clone(), ctx.workspace.clone(), timeout)
                    .args(args.iter().cloned())
            }
            StepAction::Uses { action, with } => {
                let (program, args) =
                    self.actions
                        .resolve(action)
                        .ok_or_else(|| StepError::UnknownAction {
                            step: step.name.clone(),
                            action: action.clone(),
                        })?;
                let mut invocation = Invocation::new(program, ctx.workspace.clone(), timeout)
                    .args(args.iter().cloned());
                for (key, value) in with {
                    invocation
                        .env
                        .insert(ActionRegistry::input_variable(key), value.clone());
                }
                invocation
            }
        };

        invocation.env.extend(ctx.variables.clone());
        invocation
            .env
            .insert("SLUICE_STAGE".to_string(), ctx.stage.clone());
        invocation
            .env
            .insert("SLUICE_STEP".to_string(), step.name.clone());

        for (key, value) in &step.env {
            let value = match value {
                EnvValue::Literal(literal) => literal.clone(),
                EnvValue::Secret { secret } => {
                    let resolved =
                        self.secrets
                            .resolve(secret)
                            .await
                            .map_err(|source| StepError::Secret {
                                step: step.name.clone(),
                                source,
                            })?;
                    ctx.redactor().register(&resolved);
                    debug!(stage = %ctx.stage, step = %step.name, "Resolved secret {}", secret);
                    resolved.expose().to_string()
                }
            };
            invocation.env.insert(key.clone(), value);
        }

        Ok(invocation)
    }
}

#[async_trait]
impl StageService for StageRunner {
    async fn run(
        &self,
        stage: &StageDefinition,
        ctx: &StageContext,
        cancel: CancellationToken,
    ) -> StageResult {
        let mut result = StageResult::pending();
        // pending -> running is always valid
        let _ = result.transition(StageStatus::Running);

        let max_attempts = stage.retries.unwrap_or(self.default_retries) + 1;
        info!(run_id = %ctx.run_id, stage = %stage.name, "Starting stage");
        ctx.log_info(&format!("Starting stage '{}'", stage.name));

        loop {
            result.attempts += 1;
            result.steps.clear();

            let outcome = self
                .run_attempt(stage, ctx, &cancel, &mut result.steps)
                .await;

            let err = match outcome {
                Ok(()) => {
                    info!(run_id = %ctx.run_id, stage = %stage.name, "Stage succeeded");
                    ctx.log_info(&format!("Stage '{}' succeeded", stage.name));
                    let _ = result.conclude(
                        StageStatus::Succeeded,
                        None,
                        format!("{} step(s) succeeded", stage.steps.len()),
                    );
                    return result;
                }
                Err(err) => err,
            };

            let retry = err.is_retryable()
                && !cancel.is_cancelled()
                && result.attempts < max_attempts;
            if retry {
                warn!(
                    run_id = %ctx.run_id,
                    stage = %stage.name,
                    attempt = result.attempts,
                    "Stage attempt failed, retrying"
                );
                ctx.log_warning(&format!(
                    "Attempt {}/{} failed: {}; retrying",
                    result.attempts, max_attempts, err
                ));
                continue;
            }

            let status = if matches!(err, StepError::Cancelled { .. }) {
                StageStatus::Cancelled
            } else {
                StageStatus::Failed
            };
            let reason = ctx.redactor().redact(&err.to_string());
            ctx.log_error(&format!("Stage '{}' {}: {}", stage.name, status, reason));
            let _ = result.conclude(status, Some(err.kind()), reason);
            return result;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::InMemorySecretStore;
    use crate::service::{InMemoryLogBuffer, LogBufferService};
    use crate::test_support::{ScriptedExecutor, secret_step, stage, step};
    use sluice_core::domain::run::FailureKind;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    struct Harness {
        executor: Arc<ScriptedExecutor>,
        runner: StageRunner,
        logs: InMemoryLogBuffer,
    }

    fn harness(secrets: InMemorySecretStore) -> Harness {
        let executor = Arc::new(ScriptedExecutor::new());
        let runner = StageRunner::new(
            executor.clone(),
            Arc::new(secrets),
            Duration::from_secs(30),
        );
        Harness {
            executor,
            runner,
            logs: InMemoryLogBuffer::new(),
        }
    }

    fn context(h: &Harness, stage: &str) -> StageContext {
        let mut variables = BTreeMap::new();
        variables.insert("SLUICE_BRANCH".to_string(), "main".to_string());
        StageContext::new(
            Uuid::new_v4(),
            stage,
            std::env::temp_dir(),
            variables,
            Arc::new(h.logs.clone()),
        )
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let h = harness(InMemorySecretStore::new());
        let def = stage(
            "test",
            &[],
            vec![step("install", "print:installed"), step("test", "ok")],
        );

        let result = h
            .runner
            .run(&def, &context(&h, "test"), CancellationToken::new())
            .await;

        assert_eq!(result.status, StageStatus::Succeeded);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[0].output_lines, 1);
        assert!(result.started_at.is_some() && result.finished_at.is_some());
        assert_eq!(h.executor.scripts(), vec!["print:installed", "ok"]);
    }

    #[tokio::test]
    async fn test_first_failure_aborts_remaining_steps() {
        let h = harness(InMemorySecretStore::new());
        let def = stage(
            "test",
            &[],
            vec![step("a", "ok"), step("b", "exit:2"), step("c", "ok")],
        );

        let result = h
            .runner
            .run(&def, &context(&h, "test"), CancellationToken::new())
            .await;

        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(result.failure, Some(FailureKind::StepExecution));
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[1].exit_code, Some(2));
        assert!(result.reason.unwrap().contains("exited with status 2"));
        assert_eq!(h.executor.scripts(), vec!["ok", "exit:2"]);
    }

    #[tokio::test]
    async fn test_missing_secret_fails_before_invocation() {
        let h = harness(InMemorySecretStore::new());
        let mut def = stage(
            "deploy",
            &[],
            vec![secret_step("apply", "ok", "KUBECONFIG_DATA", "KUBE_CONFIG")],
        );
        def.retries = Some(3);

        let result = h
            .runner
            .run(&def, &context(&h, "deploy"), CancellationToken::new())
            .await;

        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(result.failure, Some(FailureKind::SecretNotFound));
        assert_eq!(result.attempts, 1);
        assert!(result.reason.unwrap().contains("KUBE_CONFIG"));
        assert!(h.executor.scripts().is_empty());
    }

    #[tokio::test]
    async fn test_secrets_reach_the_step_but_never_the_logs() {
        let h = harness(InMemorySecretStore::new().with_secret("DOCKER_PASSWORD", "hunter2-xyz"));
        let def = stage(
            "build-and-push",
            &[],
            vec![
                step("build", "print:building"),
                secret_step("push", "echo-env:PASS", "PASS", "DOCKER_PASSWORD"),
            ],
        );

        let result = h
            .runner
            .run(&def, &context(&h, "build-and-push"), CancellationToken::new())
            .await;
        assert_eq!(result.status, StageStatus::Succeeded);

        // The first step never sees the secret
        let records = h.executor.records();
        assert!(!records[0].env.contains_key("PASS"));
        assert_eq!(records[1].env.get("PASS").map(String::as_str), Some("hunter2-xyz"));
        assert_eq!(records[1].env.get("SLUICE_BRANCH").map(String::as_str), Some("main"));
        assert_eq!(
            records[1].env.get("SLUICE_STAGE").map(String::as_str),
            Some("build-and-push")
        );

        let logs = h.logs.drain();
        assert!(logs.iter().any(|e| e.message == "***"));
        assert!(logs.iter().all(|e| !e.message.contains("hunter2-xyz")));
    }

    #[tokio::test]
    async fn test_retry_reruns_whole_stage() {
        let h = harness(InMemorySecretStore::new());
        let mut def = stage("flaky", &[], vec![step("a", "ok"), step("b", "fail")]);
        def.retries = Some(2);

        let result = h
            .runner
            .run(&def, &context(&h, "flaky"), CancellationToken::new())
            .await;

        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(h.executor.scripts(), vec!["ok", "fail", "ok", "fail", "ok", "fail"]);
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let h = harness(InMemorySecretStore::new());
        let mut slow = step("slow", "sleep:5000");
        slow.timeout_seconds = Some(0);
        let def = stage("test", &[], vec![slow]);

        let result = h
            .runner
            .run(&def, &context(&h, "test"), CancellationToken::new())
            .await;

        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(result.failure, Some(FailureKind::Timeout));
        assert_eq!(result.steps[0].status, StepStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_cancellation_marks_stage_cancelled() {
        let h = harness(InMemorySecretStore::new());
        let mut def = stage("build", &[], vec![step("long", "sleep:10000"), step("next", "ok")]);
        def.retries = Some(5);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = h.runner.run(&def, &context(&h, "build"), cancel).await;

        assert_eq!(result.status, StageStatus::Cancelled);
        assert_eq!(result.failure, Some(FailureKind::Cancelled));
        assert_eq!(result.attempts, 1);
        assert_eq!(h.executor.scripts(), vec!["sleep:10000"]);
    }

    #[tokio::test]
    async fn test_uses_action_resolves_through_registry() {
        let h = harness(InMemorySecretStore::new());
        let runner = StageRunner::new(
            h.executor.clone(),
            Arc::new(InMemorySecretStore::new()),
            Duration::from_secs(30),
        )
        .with_actions(ActionRegistry::new().with_action("greet", ["sh", "-c", "echo-env:INPUT_WHO"]));

        let mut with = BTreeMap::new();
        with.insert("who".to_string(), "world".to_string());
        let mut uses = step("greet", "unused");
        uses.action = StepAction::Uses {
            action: "greet".to_string(),
            with,
        };
        let mut missing = step("missing", "unused");
        missing.action = StepAction::Uses {
            action: "nope".to_string(),
            with: BTreeMap::new(),
        };

        let ok = runner
            .run(&stage("a", &[], vec![uses]), &context(&h, "a"), CancellationToken::new())
            .await;
        assert_eq!(ok.status, StageStatus::Succeeded);
        assert_eq!(
            h.executor.records()[0].env.get("INPUT_WHO").map(String::as_str),
            Some("world")
        );

        let failed = runner
            .run(&stage("b", &[], vec![missing]), &context(&h, "b"), CancellationToken::new())
            .await;
        assert_eq!(failed.status, StageStatus::Failed);
        assert!(failed.reason.unwrap().contains("unknown action 'nope'"));
    }
}
