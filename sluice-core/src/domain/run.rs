//! Run domain types
//!
//! A run is one execution of a pipeline definition. The orchestrator owns the
//! run exclusively while it executes; the record is persisted after every stage
//! transition so it can be queried for audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::pipeline::PipelineDefinition;
use crate::error::InvalidTransition;

/// Event that caused a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub branch: String,
    pub commit_ref: String,
    pub triggered_at: DateTime<Utc>,
}

impl Trigger {
    pub fn push(branch: impl Into<String>, commit_ref: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            commit_ref: commit_ref.into(),
            triggered_at: Utc::now(),
        }
    }
}

/// Run execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub pipeline: String,
    pub trigger: Trigger,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set once an external cancel request has been received
    pub cancel_requested: bool,
    pub stages: BTreeMap<String, StageResult>,
}

impl Run {
    /// Creates a pending run with one pending result per stage
    pub fn new(pipeline: &PipelineDefinition, trigger: Trigger) -> Self {
        let stages = pipeline
            .stages
            .iter()
            .map(|s| (s.name.clone(), StageResult::pending()))
            .collect();

        Self {
            id: Uuid::new_v4(),
            pipeline: pipeline.name.clone(),
            trigger,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cancel_requested: false,
            stages,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.get(name)
    }

    pub fn stage_mut(&mut self, name: &str) -> Option<&mut StageResult> {
        self.stages.get_mut(name)
    }

    /// Outcome of a finished run, `None` while it is still executing
    pub fn outcome(&self) -> Option<RunOutcome> {
        match self.status {
            RunStatus::Succeeded => Some(RunOutcome::Succeeded),
            RunStatus::Failed => Some(RunOutcome::Failed),
            RunStatus::Cancelled => Some(RunOutcome::Cancelled),
            RunStatus::Pending | RunStatus::Running => None,
        }
    }

    /// Derives the final outcome from the stage results and closes the run
    pub fn conclude(&mut self) -> RunOutcome {
        let outcome = if self.cancel_requested
            && self
                .stages
                .values()
                .any(|s| s.status == StageStatus::Cancelled)
        {
            RunOutcome::Cancelled
        } else if self
            .stages
            .values()
            .all(|s| s.status == StageStatus::Succeeded)
        {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Failed
        };

        self.status = outcome.into();
        self.finished_at = Some(Utc::now());
        outcome
    }
}

/// Run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// Final result of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl RunOutcome {
    pub fn is_success(self) -> bool {
        self == RunOutcome::Succeeded
    }
}

impl From<RunOutcome> for RunStatus {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Succeeded => RunStatus::Succeeded,
            RunOutcome::Failed => RunStatus::Failed,
            RunOutcome::Cancelled => RunStatus::Cancelled,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        RunStatus::from(*self).fmt(f)
    }
}

/// Stage lifecycle status
///
/// `Pending -> Running -> {Succeeded | Failed | Cancelled}`,
/// `Pending -> Skipped`, `Pending -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StageStatus::Pending | StageStatus::Running)
    }

    pub fn can_transition_to(self, next: StageStatus) -> bool {
        use StageStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StageStatus::Pending),
            "running" => Ok(StageStatus::Running),
            "succeeded" => Ok(StageStatus::Succeeded),
            "failed" => Ok(StageStatus::Failed),
            "skipped" => Ok(StageStatus::Skipped),
            "cancelled" => Ok(StageStatus::Cancelled),
            other => Err(format!("unknown stage status '{}'", other)),
        }
    }
}

/// Why a stage did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SecretNotFound,
    StepExecution,
    Timeout,
    Cancelled,
    DependencyFailed,
    Workspace,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::SecretNotFound => "secret_not_found",
            FailureKind::StepExecution => "step_execution",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::DependencyFailed => "dependency_failed",
            FailureKind::Workspace => "workspace",
        }
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "secret_not_found" => Ok(FailureKind::SecretNotFound),
            "step_execution" => Ok(FailureKind::StepExecution),
            "timeout" => Ok(FailureKind::Timeout),
            "cancelled" => Ok(FailureKind::Cancelled),
            "dependency_failed" => Ok(FailureKind::DependencyFailed),
            "workspace" => Ok(FailureKind::Workspace),
            other => Err(format!("unknown failure kind '{}'", other)),
        }
    }
}

/// Result of one stage within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of times the stage was executed from its first step
    pub attempts: u32,
    pub failure: Option<FailureKind>,
    /// Human readable explanation of the terminal state
    pub reason: Option<String>,
    /// Step results of the last attempt
    pub steps: Vec<StepResult>,
}

impl StageResult {
    pub fn pending() -> Self {
        Self {
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
            attempts: 0,
            failure: None,
            reason: None,
            steps: Vec::new(),
        }
    }

    /// Moves the stage to `next`, stamping start/end times
    pub fn transition(&mut self, next: StageStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        if next == StageStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Terminal transition with an attributed reason
    pub fn conclude(
        &mut self,
        next: StageStatus,
        failure: Option<FailureKind>,
        reason: impl Into<String>,
    ) -> Result<(), InvalidTransition> {
        self.transition(next)?;
        self.failure = failure;
        self.reason = Some(reason.into());
        Ok(())
    }
}

/// Step execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

/// Result of one step invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Number of captured log lines attributed to this step in the run logs
    pub output_lines: usize,
    pub reason: Option<String>,
}
