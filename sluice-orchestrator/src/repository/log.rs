//! Log Repository
//!
//! Handles all database operations related to run logs. Entries arrive
//! already redacted.

use sluice_core::domain::log::LogEntry;
use sqlx::PgPool;
use uuid::Uuid;

use super::decode_column;

/// Add log entries for a run
pub async fn add_entries(
    pool: &PgPool,
    run_id: Uuid,
    entries: &[LogEntry],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for entry in entries {
        sqlx::query(
            r#"
            INSERT INTO run_logs (run_id, timestamp, level, stage, step, message)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run_id)
        .bind(entry.timestamp)
        .bind(entry.level.to_string())
        .bind(&entry.stage)
        .bind(&entry.step)
        .bind(&entry.message)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}

/// Get all log entries for a run in insertion order
pub async fn find_by_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<LogEntry>, sqlx::Error> {
    let rows = sqlx::query_as::<_, LogRow>(
        r#"
        SELECT timestamp, level, stage, step, message
        FROM run_logs
        WHERE run_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(LogRow::into_entry).collect()
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct LogRow {
    timestamp: chrono::DateTime<chrono::Utc>,
    level: String,
    stage: Option<String>,
    step: Option<String>,
    message: String,
}

impl LogRow {
    fn into_entry(self) -> Result<LogEntry, sqlx::Error> {
        Ok(LogEntry {
            timestamp: self.timestamp,
            level: decode_column("run_logs.level", &self.level)?,
            stage: self.stage,
            step: self.step,
            message: self.message,
        })
    }
}
