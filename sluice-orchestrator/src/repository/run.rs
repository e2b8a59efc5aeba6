//! Run Repository
//!
//! Handles all database operations related to runs and their stage results.

use sluice_core::domain::run::{
    FailureKind, Run, RunStatus, StageResult, StageStatus, StepResult, Trigger,
};
use sqlx::PgPool;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::decode_column;

/// Insert or replace a run together with all of its stage results
pub async fn upsert(pool: &PgPool, run: &Run) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO runs (id, pipeline, branch, commit_ref, triggered_at, status,
                          created_at, started_at, finished_at, cancel_requested)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (id) DO UPDATE
        SET status = EXCLUDED.status,
            started_at = EXCLUDED.started_at,
            finished_at = EXCLUDED.finished_at,
            cancel_requested = EXCLUDED.cancel_requested
        "#,
    )
    .bind(run.id)
    .bind(&run.pipeline)
    .bind(&run.trigger.branch)
    .bind(&run.trigger.commit_ref)
    .bind(run.trigger.triggered_at)
    .bind(run.status.as_str())
    .bind(run.created_at)
    .bind(run.started_at)
    .bind(run.finished_at)
    .bind(run.cancel_requested)
    .execute(&mut *tx)
    .await?;

    for (name, stage) in &run.stages {
        sqlx::query(
            r#"
            INSERT INTO stage_results (run_id, name, status, started_at, finished_at,
                                       attempts, failure, reason, steps)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (run_id, name) DO UPDATE
            SET status = EXCLUDED.status,
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at,
                attempts = EXCLUDED.attempts,
                failure = EXCLUDED.failure,
                reason = EXCLUDED.reason,
                steps = EXCLUDED.steps
            "#,
        )
        .bind(run.id)
        .bind(name)
        .bind(stage.status.as_str())
        .bind(stage.started_at)
        .bind(stage.finished_at)
        .bind(stage.attempts as i32)
        .bind(stage.failure.map(FailureKind::as_str))
        .bind(&stage.reason)
        .bind(sqlx::types::Json(&stage.steps))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}

/// Find a run by ID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Run>, sqlx::Error> {
    let row = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT id, pipeline, branch, commit_ref, triggered_at, status,
               created_at, started_at, finished_at, cancel_requested
        FROM runs
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let stages = find_stages(pool, id).await?;
    Ok(Some(row.into_run(stages)?))
}

/// List the most recent runs, optionally filtered by status
pub async fn list(
    pool: &PgPool,
    status: Option<RunStatus>,
    limit: i64,
) -> Result<Vec<Run>, sqlx::Error> {
    let rows = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT id, pipeline, branch, commit_ref, triggered_at, status,
               created_at, started_at, finished_at, cancel_requested
        FROM runs
        WHERE ($1::VARCHAR IS NULL OR status = $1)
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(status.map(RunStatus::as_str))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut runs = Vec::with_capacity(rows.len());
    for row in rows {
        let stages = find_stages(pool, row.id).await?;
        runs.push(row.into_run(stages)?);
    }
    Ok(runs)
}

async fn find_stages(
    pool: &PgPool,
    run_id: Uuid,
) -> Result<BTreeMap<String, StageResult>, sqlx::Error> {
    let rows = sqlx::query_as::<_, StageRow>(
        r#"
        SELECT name, status, started_at, finished_at, attempts, failure, reason, steps
        FROM stage_results
        WHERE run_id = $1
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(StageRow::into_entry).collect()
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    pipeline: String,
    branch: String,
    commit_ref: String,
    triggered_at: chrono::DateTime<chrono::Utc>,
    status: String,
    created_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
    cancel_requested: bool,
}

impl RunRow {
    fn into_run(self, stages: BTreeMap<String, StageResult>) -> Result<Run, sqlx::Error> {
        Ok(Run {
            id: self.id,
            pipeline: self.pipeline,
            trigger: Trigger {
                branch: self.branch,
                commit_ref: self.commit_ref,
                triggered_at: self.triggered_at,
            },
            status: decode_column("runs.status", &self.status)?,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            cancel_requested: self.cancel_requested,
            stages,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StageRow {
    name: String,
    status: String,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
    attempts: i32,
    failure: Option<String>,
    reason: Option<String>,
    steps: serde_json::Value,
}

impl StageRow {
    fn into_entry(self) -> Result<(String, StageResult), sqlx::Error> {
        let steps: Vec<StepResult> =
            serde_json::from_value(self.steps).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let failure: Option<FailureKind> = self
            .failure
            .as_deref()
            .map(|f| decode_column("stage_results.failure", f))
            .transpose()?;
        let attempts = u32::try_from(self.attempts).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        let result = StageResult {
            status: decode_column::<StageStatus>("stage_results.status", &self.status)?,
            started_at: self.started_at,
            finished_at: self.finished_at,
            attempts,
            failure,
            reason: self.reason,
            steps,
        };
        Ok((self.name, result))
    }
}
