//! Secret store adapters
//!
//! The stage runner resolves every secret reference just before the step that
//! declares it runs. Stores hand out an owned value per request and never log
//! or cache what they return.

use async_trait::async_trait;
use sluice_core::domain::secret::{SecretRef, SecretValue};
use sluice_core::error::SecretError;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Narrow interface to a credential backend
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Resolves a secret by name
    ///
    /// # Errors
    /// `SecretError::NotFound` if the backend has no such secret.
    async fn resolve(&self, secret: &SecretRef) -> Result<SecretValue, SecretError>;
}

/// Secrets held in process memory
///
/// Used by tests and by the CLI's `--secret NAME=VALUE` flag.
#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<String, SecretValue>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a secret
    pub fn insert(&self, name: impl Into<String>, value: impl Into<String>) {
        let mut secrets = self.secrets.write().unwrap_or_else(|e| e.into_inner());
        secrets.insert(name.into(), SecretValue::new(value));
    }

    pub fn with_secret(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn resolve(&self, secret: &SecretRef) -> Result<SecretValue, SecretError> {
        let secrets = self.secrets.read().unwrap_or_else(|e| e.into_inner());
        secrets
            .get(secret.name())
            .cloned()
            .ok_or_else(|| SecretError::NotFound(secret.name().to_string()))
    }
}

/// Secrets read from the orchestrator's own environment
///
/// `KUBE_CONFIG` resolves from `<prefix>KUBE_CONFIG`, so only variables that
/// were deliberately exported for pipelines are reachable.
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub const DEFAULT_PREFIX: &'static str = "SLUICE_SECRET_";

    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn variable_name(&self, secret: &SecretRef) -> String {
        format!("{}{}", self.prefix, secret.name())
    }
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PREFIX)
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn resolve(&self, secret: &SecretRef) -> Result<SecretValue, SecretError> {
        let variable = self.variable_name(secret);
        match std::env::var(&variable) {
            Ok(value) => Ok(SecretValue::new(value)),
            Err(std::env::VarError::NotPresent) => {
                debug!("Secret {} not found (looked up {})", secret, variable);
                Err(SecretError::NotFound(secret.name().to_string()))
            }
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::Backend(format!(
                "{} is not valid unicode",
                variable
            ))),
        }
    }
}
