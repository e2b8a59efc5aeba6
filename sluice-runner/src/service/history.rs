//! Run history
//!
//! Persists run records and their redacted logs. The orchestrator saves the
//! run after every stage transition so that observers always see current state.

use async_trait::async_trait;
use sluice_core::domain::log::LogEntry;
use sluice_core::domain::run::{Run, RunStatus};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("run history backend error: {0}")]
    Backend(String),
}

/// Storage for runs and their logs
#[async_trait]
pub trait RunHistory: Send + Sync {
    /// Inserts or replaces the stored record of `run`
    async fn save(&self, run: &Run) -> Result<(), HistoryError>;

    async fn get(&self, id: Uuid) -> Result<Option<Run>, HistoryError>;

    /// Most recent runs first, optionally filtered by status
    async fn list(&self, status: Option<RunStatus>, limit: usize)
    -> Result<Vec<Run>, HistoryError>;

    async fn append_logs(&self, run_id: Uuid, entries: &[LogEntry]) -> Result<(), HistoryError>;

    /// All log entries of a run in the order they were appended
    async fn logs(&self, run_id: Uuid) -> Result<Vec<LogEntry>, HistoryError>;
}

/// Run history held in process memory
#[derive(Default)]
pub struct InMemoryRunHistory {
    runs: RwLock<HashMap<Uuid, Run>>,
    logs: RwLock<HashMap<Uuid, Vec<LogEntry>>>,
}

impl InMemoryRunHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunHistory for InMemoryRunHistory {
    async fn save(&self, run: &Run) -> Result<(), HistoryError> {
        let mut runs = self.runs.write().unwrap_or_else(|e| e.into_inner());
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Run>, HistoryError> {
        let runs = self.runs.read().unwrap_or_else(|e| e.into_inner());
        Ok(runs.get(&id).cloned())
    }

    async fn list(
        &self,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<Vec<Run>, HistoryError> {
        let runs = self.runs.read().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<Run> = runs
            .values()
            .filter(|run| status.is_none_or(|s| run.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn append_logs(&self, run_id: Uuid, entries: &[LogEntry]) -> Result<(), HistoryError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        logs.entry(run_id).or_default().extend_from_slice(entries);
        Ok(())
    }

    async fn logs(&self, run_id: Uuid) -> Result<Vec<LogEntry>, HistoryError> {
        let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
        Ok(logs.get(&run_id).cloned().unwrap_or_default())
    }
}
