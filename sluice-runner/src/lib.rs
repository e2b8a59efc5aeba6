//! Sluice pipeline runner
//!
//! Executes pipeline definitions: dependency resolution, stage dispatch,
//! just-in-time secrets, process supervision and run history.

pub mod config;
pub mod context;
pub mod graph;
pub mod process;
pub mod redact;
pub mod scheduler;
pub mod secrets;
pub mod service;
pub mod workspace;

#[cfg(test)]
mod test_support;

pub use config::RunnerConfig;
pub use graph::DependencyGraph;
pub use process::{ActionRegistry, CommandExecutor, LocalExecutor};
pub use scheduler::{PipelineOrchestrator, TriggerListener};
pub use secrets::{EnvSecretStore, InMemorySecretStore, SecretStore};
pub use service::{InMemoryRunHistory, RunHistory, StageRunner};
