//! Error types shared across Sluice crates

use thiserror::Error;

use crate::domain::run::{FailureKind, StageStatus};

/// A pipeline definition that must be rejected before any run starts
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    /// The `needs` relation contains a cycle; `path` starts and ends on the same stage
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("stage '{stage}' needs unknown stage '{missing}'")]
    UnknownDependency { stage: String, missing: String },

    #[error("stage '{0}' is defined more than once")]
    DuplicateStage(String),

    #[error("pipeline '{0}' defines no stages")]
    EmptyPipeline(String),

    #[error("stage '{0}' defines no steps")]
    EmptyStage(String),

    /// Empty, blank, `.` or `..`
    #[error("invalid stage name '{0}'")]
    InvalidStageName(String),

    #[error("malformed pipeline definition: {0}")]
    Malformed(String),
}

/// Secret resolution failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretError {
    #[error("secret '{0}' not found")]
    NotFound(String),

    #[error("secret backend error: {0}")]
    Backend(String),
}

/// Why a step did not complete successfully
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("step '{step}' exited with status {code}")]
    NonZeroExit { step: String, code: i32 },

    #[error("step '{step}' exceeded its timeout of {seconds}s")]
    Timeout { step: String, seconds: u64 },

    #[error("step '{step}' was cancelled")]
    Cancelled { step: String },

    #[error("step '{step}' could not be started: {message}")]
    Spawn { step: String, message: String },

    #[error("step '{step}' uses unknown action '{action}'")]
    UnknownAction { step: String, action: String },

    #[error("step '{step}': {source}")]
    Secret {
        step: String,
        #[source]
        source: SecretError,
    },
}

impl StepError {
    /// Classification recorded on the stage result
    pub fn kind(&self) -> FailureKind {
        match self {
            StepError::NonZeroExit { .. }
            | StepError::Spawn { .. }
            | StepError::UnknownAction { .. } => FailureKind::StepExecution,
            StepError::Timeout { .. } => FailureKind::Timeout,
            StepError::Cancelled { .. } => FailureKind::Cancelled,
            StepError::Secret {
                source: SecretError::NotFound(_),
                ..
            } => FailureKind::SecretNotFound,
            StepError::Secret { .. } => FailureKind::StepExecution,
        }
    }

    /// Whether a stage-level retry may re-run the stage after this error
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StepError::Cancelled { .. }
                | StepError::UnknownAction { .. }
                | StepError::Secret {
                    source: SecretError::NotFound(_),
                    ..
                }
        )
    }
}

/// Rejected stage state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid stage transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: StageStatus,
    pub to: StageStatus,
}
