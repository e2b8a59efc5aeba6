//! Pipeline domain types
//!
//! A pipeline definition is plain data: stages, their `needs`, and the ordered
//! steps each stage executes. Definitions are immutable once loaded and are
//! shared between runs behind an `Arc`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::secret::SecretRef;
use crate::error::DefinitionError;

/// Pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub stages: Vec<StageDefinition>,
}

impl PipelineDefinition {
    /// Parses a definition from its JSON document form
    pub fn from_json(source: &str) -> Result<Self, DefinitionError> {
        serde_json::from_str(source).map_err(|e| DefinitionError::Malformed(e.to_string()))
    }

    /// Looks up a stage by name
    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Stage names in definition order
    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.name.as_str())
    }

    /// Every secret referenced anywhere in the pipeline, deduplicated
    pub fn secret_refs(&self) -> Vec<&SecretRef> {
        let mut refs: Vec<&SecretRef> = self
            .stages
            .iter()
            .flat_map(|stage| stage.steps.iter())
            .flat_map(|step| step.env.values())
            .filter_map(EnvValue::as_secret)
            .collect();
        refs.sort();
        refs.dedup();
        refs
    }
}

/// One named unit of pipeline work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    /// Stages that must succeed before this one starts
    #[serde(default)]
    pub needs: Vec<String>,
    pub steps: Vec<StepDefinition>,
    /// Whole-stage re-executions allowed after a failed attempt.
    /// `None` falls back to the runner's configured default.
    #[serde(default)]
    pub retries: Option<u32>,
}

/// A single command execution within a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default)]
    pub env: BTreeMap<String, EnvValue>,
    /// Overrides the runner's default step timeout
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// What a step executes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// A shell command line, run with `sh -c`
    Run(String),
    /// A program invoked directly with an argument vector
    Exec {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// A symbolic action resolved by the runner's action registry
    Uses {
        action: String,
        #[serde(default)]
        with: BTreeMap<String, String>,
    },
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepAction::Run(script) => write!(f, "run: {}", script),
            StepAction::Exec { program, args } => {
                write!(f, "exec: {}", program)?;
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                Ok(())
            }
            StepAction::Uses { action, .. } => write!(f, "uses: {}", action),
        }
    }
}

/// Value bound to a step environment variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    /// `{ "secret": "NAME" }`
    Secret { secret: SecretRef },
    /// A plain string
    Literal(String),
}

impl EnvValue {
    pub fn literal(value: impl Into<String>) -> Self {
        EnvValue::Literal(value.into())
    }

    pub fn secret(name: impl Into<String>) -> Self {
        EnvValue::Secret {
            secret: SecretRef::new(name),
        }
    }

    pub fn as_secret(&self) -> Option<&SecretRef> {
        match self {
            EnvValue::Secret { secret } => Some(secret),
            EnvValue::Literal(_) => None,
        }
    }
}
