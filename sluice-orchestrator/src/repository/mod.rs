//! Repository Module
//!
//! Data access layer for the orchestrator.
//! Each repository handles database operations for a specific domain entity.

pub mod log;
pub mod run;

// Re-export for convenience
pub use log as log_repository;
pub use run as run_repository;

use async_trait::async_trait;
use sluice_core::domain::log::LogEntry;
use sluice_core::domain::run::{Run, RunStatus};
use sluice_runner::service::{HistoryError, RunHistory};
use sqlx::PgPool;
use uuid::Uuid;

/// Run history stored in PostgreSQL
#[derive(Clone)]
pub struct PgRunHistory {
    pool: PgPool,
}

impl PgRunHistory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn backend(err: sqlx::Error) -> HistoryError {
    HistoryError::Backend(err.to_string())
}

/// Parses a stored text column, reporting unknown values as decode errors
pub(crate) fn decode_column<T>(column: &str, value: &str) -> Result<T, sqlx::Error>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| sqlx::Error::Decode(format!("column '{}': {}", column, e).into()))
}

#[async_trait]
impl RunHistory for PgRunHistory {
    async fn save(&self, run: &Run) -> Result<(), HistoryError> {
        run_repository::upsert(&self.pool, run).await.map_err(backend)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Run>, HistoryError> {
        run_repository::find_by_id(&self.pool, id)
            .await
            .map_err(backend)
    }

    async fn list(
        &self,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<Vec<Run>, HistoryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        run_repository::list(&self.pool, status, limit)
            .await
            .map_err(backend)
    }

    async fn append_logs(&self, run_id: Uuid, entries: &[LogEntry]) -> Result<(), HistoryError> {
        if entries.is_empty() {
            return Ok(());
        }
        log_repository::add_entries(&self.pool, run_id, entries)
            .await
            .map_err(backend)
    }

    async fn logs(&self, run_id: Uuid) -> Result<Vec<LogEntry>, HistoryError> {
        log_repository::find_by_run(&self.pool, run_id)
            .await
            .map_err(backend)
    }
}
