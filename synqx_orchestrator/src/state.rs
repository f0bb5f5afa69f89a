// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # State Manager
//!
//! Lifecycle persistence for pipeline runs and step runs, plus telemetry
//! publication. Two surfaces share the same write rules:
//!
//! - [`apply_step_update`] / [`apply_job_status`]: free functions driven by
//!   the dispatcher and telemetry ingress for remotely executed jobs
//! - [`SqlxStateManager`]: the engine [`StateSink`] implementation used
//!   when a run executes in-process
//!
//! ## Write Rules
//!
//! Step creation is idempotent per `(run, node_id)` (unique index plus
//! `INSERT OR IGNORE`). Terminal step statuses are sticky: an update that
//! would move a terminal step back to `Running` is ignored. Run aggregates
//! (`total_extracted`, `total_loaded`, `total_failed`, `bytes_processed`)
//! are recomputed from step rows whenever a step reaches a terminal state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use synqx_domain::schemas::{JobStatusUpdate, StepUpdate};
use synqx_domain::{
    JobStatus, OperatorType, PipelineRunStatus, StepStatus, SynqxError, TelemetryEvent,
};
use synqx_engine::{ExecutionMetrics, StateSink, StepProgress};

use crate::store::db_err;
use crate::telemetry::{StepUpdateWriter, TelemetryBus};

const TERMINAL_STEP_GUARD: &str = "status NOT IN ('success', 'failed', 'skipped')";

/// Resolves `(run_id, version_id)` for a job; `NotFound` when the run was
/// never initialized (protocol breach).
async fn run_of_job(pool: &SqlitePool, job_id: i64) -> Result<(i64, i64), SynqxError> {
    let row = sqlx::query("SELECT id, pipeline_version_id FROM pipeline_runs WHERE job_id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| SynqxError::NotFound(format!("Pipeline run for job {} not initialized", job_id)))?;
    Ok((row.get("id"), row.get("pipeline_version_id")))
}

/// Idempotently creates a step row.
async fn ensure_step_row(
    pool: &SqlitePool,
    run_id: i64,
    node_id: &str,
    operator_type: OperatorType,
    order_index: i32,
) -> Result<(), SynqxError> {
    sqlx::query(
        "INSERT OR IGNORE INTO step_runs (pipeline_run_id, node_id, operator_type, order_index, status) VALUES (?, ?, ?, ?, 'pending')",
    )
    .bind(run_id)
    .bind(node_id)
    .bind(operator_type.to_string())
    .bind(order_index as i64)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Applies one step progress write with the sticky-terminal rule, then
/// refreshes run aggregates on terminal transitions.
async fn write_step(
    pool: &SqlitePool,
    run_id: i64,
    update: &StepUpdate,
    retry_count: Option<u32>,
) -> Result<(), SynqxError> {
    let now = Utc::now().to_rfc3339();
    let terminal = update.status.is_terminal();

    // Sticky terminal: non-terminal writes only apply to non-terminal rows
    let guard = if terminal { "1 = 1" } else { TERMINAL_STEP_GUARD };
    let sql = format!(
        r#"
        UPDATE step_runs SET
            status = ?,
            records_in = MAX(records_in, ?), records_out = MAX(records_out, ?),
            records_filtered = MAX(records_filtered, ?), records_error = MAX(records_error, ?),
            bytes_processed = MAX(bytes_processed, ?),
            cpu_percent = COALESCE(?, cpu_percent),
            memory_mb = COALESCE(?, memory_mb),
            sample_data = COALESCE(?, sample_data),
            quality_profile = COALESCE(?, quality_profile),
            error_message = COALESCE(?, error_message),
            retry_count = COALESCE(?, retry_count),
            started_at = COALESCE(started_at, ?),
            completed_at = CASE WHEN ? THEN ? ELSE completed_at END,
            duration_seconds = CASE
                WHEN ? AND started_at IS NOT NULL
                THEN (julianday(?) - julianday(started_at)) * 86400.0
                ELSE duration_seconds
            END
        WHERE pipeline_run_id = ? AND node_id = ? AND {}
        "#,
        guard
    );

    sqlx::query(&sql)
        .bind(update.status.as_str())
        .bind(update.counters.records_in as i64)
        .bind(update.counters.records_out as i64)
        .bind(update.counters.records_filtered as i64)
        .bind(update.counters.records_error as i64)
        .bind(update.counters.bytes_processed as i64)
        .bind(update.cpu_percent)
        .bind(update.memory_mb)
        .bind(update.sample_data.as_ref().map(|v| v.to_string()))
        .bind(update.quality_profile.as_ref().map(|v| v.to_string()))
        .bind(update.error_message.as_deref())
        .bind(retry_count.map(|c| c as i64))
        .bind(&now)
        .bind(terminal)
        .bind(&now)
        .bind(terminal)
        .bind(&now)
        .bind(run_id)
        .bind(&update.node_id)
        .execute(pool)
        .await
        .map_err(db_err)?;

    if terminal {
        refresh_run_aggregates(pool, run_id).await?;
        if update.status == StepStatus::Failed {
            sqlx::query(
                r#"
                UPDATE pipeline_runs SET failed_step_id = (
                    SELECT id FROM step_runs WHERE pipeline_run_id = ? AND node_id = ?
                ) WHERE id = ? AND failed_step_id IS NULL
                "#,
            )
            .bind(run_id)
            .bind(&update.node_id)
            .bind(run_id)
            .execute(pool)
            .await
            .map_err(db_err)?;
        }
    }

    Ok(())
}

/// Recomputes run aggregates from the step rows.
async fn refresh_run_aggregates(pool: &SqlitePool, run_id: i64) -> Result<(), SynqxError> {
    sqlx::query(
        r#"
        UPDATE pipeline_runs SET
            total_extracted = COALESCE((
                SELECT SUM(records_out) FROM step_runs
                WHERE pipeline_run_id = ? AND operator_type = 'extract' AND status = 'success'
            ), 0),
            total_loaded = COALESCE((
                SELECT SUM(records_out) FROM step_runs
                WHERE pipeline_run_id = ? AND operator_type = 'load' AND status = 'success'
            ), 0),
            total_failed = COALESCE((
                SELECT COUNT(*) FROM step_runs WHERE pipeline_run_id = ? AND status = 'failed'
            ), 0),
            bytes_processed = COALESCE((
                SELECT SUM(bytes_processed) FROM step_runs WHERE pipeline_run_id = ?
            ), 0)
        WHERE id = ?
        "#,
    )
    .bind(run_id)
    .bind(run_id)
    .bind(run_id)
    .bind(run_id)
    .bind(run_id)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Applies a step update reported over the agent protocol.
///
/// Creates the step row on demand (operator type resolved from the run's
/// version definition), applies the sticky-terminal write, refreshes
/// aggregates, and publishes a [`TelemetryEvent::StepUpdated`].
pub async fn apply_step_update(
    pool: &SqlitePool,
    bus: &TelemetryBus,
    job_id: i64,
    update: &StepUpdate,
) -> Result<i64, SynqxError> {
    let (run_id, version_id) = run_of_job(pool, job_id).await?;

    let node_row = sqlx::query(
        "SELECT operator_type, order_index FROM pipeline_nodes WHERE pipeline_version_id = ? AND node_id = ?",
    )
    .bind(version_id)
    .bind(&update.node_id)
    .fetch_optional(pool)
    .await
    .map_err(db_err)?;
    let (operator_type, order_index) = match node_row {
        Some(row) => (
            row.get::<String, _>("operator_type").parse::<OperatorType>()?,
            row.get::<i64, _>("order_index") as i32,
        ),
        None => (OperatorType::Noop, 0),
    };

    ensure_step_row(pool, run_id, &update.node_id, operator_type, order_index).await?;
    write_step(pool, run_id, update, None).await?;

    bus.publish(TelemetryEvent::StepUpdated {
        job_id,
        run_id,
        node_id: update.node_id.clone(),
        status: update.status,
        counters: update.counters,
        error_message: update.error_message.clone(),
        timestamp: Utc::now(),
    });

    Ok(run_id)
}

/// Applies an agent's terminal (or running) job status callback, mirroring
/// the status onto the owned run.
pub async fn apply_job_status(
    pool: &SqlitePool,
    bus: &TelemetryBus,
    job_id: i64,
    update: &JobStatusUpdate,
) -> Result<(), SynqxError> {
    let status: JobStatus = update.status.parse()?;
    let now = Utc::now();
    let terminal = status.is_terminal();

    sqlx::query(
        r#"
        UPDATE jobs SET
            status = ?,
            execution_time_ms = CASE WHEN ? THEN ? ELSE execution_time_ms END,
            completed_at = CASE WHEN ? THEN ? ELSE completed_at END,
            infra_error = CASE WHEN ? THEN ? ELSE infra_error END
        WHERE id = ?
        "#,
    )
    .bind(status.as_str())
    .bind(terminal)
    .bind(update.execution_time_ms)
    .bind(terminal)
    .bind(now.to_rfc3339())
    .bind(status == JobStatus::Failed)
    .bind(&update.message)
    .bind(job_id)
    .execute(pool)
    .await
    .map_err(db_err)?;

    let run_status = match status {
        JobStatus::Running => Some(PipelineRunStatus::Running),
        JobStatus::Success => Some(PipelineRunStatus::Completed),
        JobStatus::Failed => Some(PipelineRunStatus::Failed),
        JobStatus::Cancelled => Some(PipelineRunStatus::Cancelled),
        _ => None,
    };
    if let Some(run_status) = run_status {
        sqlx::query(
            r#"
            UPDATE pipeline_runs SET
                status = ?,
                error_message = CASE WHEN ? THEN ? ELSE error_message END,
                completed_at = CASE WHEN ? THEN ? ELSE completed_at END,
                duration_seconds = CASE WHEN ? THEN ? ELSE duration_seconds END,
                total_loaded = CASE WHEN ? > 0 AND total_loaded = 0 THEN ? ELSE total_loaded END,
                bytes_processed = CASE WHEN ? IS NOT NULL AND bytes_processed = 0 THEN ? ELSE bytes_processed END
            WHERE job_id = ?
            "#,
        )
        .bind(run_status.as_str())
        .bind(status == JobStatus::Failed)
        .bind(&update.message)
        .bind(run_status.is_terminal())
        .bind(now.to_rfc3339())
        .bind(run_status.is_terminal())
        .bind(update.execution_time_ms as f64 / 1000.0)
        .bind(update.total_records)
        .bind(update.total_records)
        .bind(update.total_bytes)
        .bind(update.total_bytes)
        .bind(job_id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    }

    bus.publish(TelemetryEvent::JobUpdated {
        job_id,
        status,
        completed_at: terminal.then_some(now),
        timestamp: now,
    });

    Ok(())
}

/// Database-backed [`StateSink`] for runs executed inside the orchestrator
/// process. Bound to one `(job, run)` pair.
pub struct SqlxStateManager {
    pool: SqlitePool,
    bus: Arc<TelemetryBus>,
    job_id: i64,
    run_id: i64,
    cancelled: Arc<AtomicBool>,
}

impl SqlxStateManager {
    pub fn new(pool: SqlitePool, bus: Arc<TelemetryBus>, job_id: i64, run_id: i64) -> Self {
        Self {
            pool,
            bus,
            job_id,
            run_id,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    /// Spawns a watcher that flips the cooperative cancellation flag when
    /// the job row transitions to `cancelled`.
    pub fn spawn_cancellation_watcher(&self) {
        let pool = self.pool.clone();
        let job_id = self.job_id;
        let flag = Arc::clone(&self.cancelled);
        tokio::spawn(async move {
            loop {
                if flag.load(Ordering::SeqCst) {
                    return;
                }
                let status: Option<String> = sqlx::query("SELECT status FROM jobs WHERE id = ?")
                    .bind(job_id)
                    .fetch_optional(&pool)
                    .await
                    .ok()
                    .flatten()
                    .map(|row| row.get("status"));
                match status.as_deref() {
                    Some("cancelled") => {
                        warn!(job_id, "cancellation requested, raising flag");
                        flag.store(true, Ordering::SeqCst);
                        return;
                    }
                    Some(s) if s == "success" || s == "failed" => return,
                    None => return,
                    _ => {}
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        });
    }

    fn progress_as_update(progress: &StepProgress) -> StepUpdate {
        StepUpdate {
            node_id: progress.node_id.clone(),
            status: progress.status,
            counters: progress.counters,
            cpu_percent: progress.cpu_percent,
            memory_mb: progress.memory_mb,
            sample_data: progress.sample_data.clone(),
            quality_profile: progress.quality_profile.clone(),
            error_message: progress.error.as_ref().map(|(_, msg)| msg.clone()),
        }
    }
}

#[async_trait]
impl StateSink for SqlxStateManager {
    async fn run_started(&self, total_nodes: u32) -> Result<(), SynqxError> {
        sqlx::query(
            "UPDATE pipeline_runs SET status = 'running', total_nodes = ?, started_at = COALESCE(started_at, ?) WHERE id = ?",
        )
        .bind(total_nodes as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(self.run_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.bus.publish(TelemetryEvent::RunUpdated {
            job_id: self.job_id,
            run_id: self.run_id,
            status: PipelineRunStatus::Running,
            error_message: None,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn ensure_step(
        &self,
        node_id: &str,
        operator_type: OperatorType,
        order_index: i32,
    ) -> Result<(), SynqxError> {
        ensure_step_row(&self.pool, self.run_id, node_id, operator_type, order_index).await
    }

    async fn update_step(&self, progress: StepProgress) -> Result<(), SynqxError> {
        let update = Self::progress_as_update(&progress);
        if let Some((error_type, _)) = &progress.error {
            sqlx::query("UPDATE step_runs SET error_type = ? WHERE pipeline_run_id = ? AND node_id = ?")
                .bind(error_type)
                .bind(self.run_id)
                .bind(&progress.node_id)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        write_step(&self.pool, self.run_id, &update, Some(progress.retry_count)).await?;

        self.bus.publish(TelemetryEvent::StepUpdated {
            job_id: self.job_id,
            run_id: self.run_id,
            node_id: update.node_id,
            status: update.status,
            counters: update.counters,
            error_message: update.error_message,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn mark_step_skipped(&self, node_id: &str, reason: &str) -> Result<(), SynqxError> {
        debug!(node_id, reason, "marking step skipped");
        sqlx::query(
            &format!(
                "UPDATE step_runs SET status = 'skipped', completed_at = ? WHERE pipeline_run_id = ? AND node_id = ? AND {}",
                TERMINAL_STEP_GUARD
            ),
        )
        .bind(Utc::now().to_rfc3339())
        .bind(self.run_id)
        .bind(node_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn complete_run(&self, metrics: &ExecutionMetrics) -> Result<(), SynqxError> {
        let now = Utc::now();
        refresh_run_aggregates(&self.pool, self.run_id).await?;
        sqlx::query(
            "UPDATE pipeline_runs SET status = 'completed', completed_at = ?, duration_seconds = ? WHERE id = ?",
        )
        .bind(now.to_rfc3339())
        .bind(metrics.duration_seconds())
        .bind(self.run_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query("UPDATE jobs SET status = 'success', completed_at = ?, execution_time_ms = ? WHERE id = ?")
            .bind(now.to_rfc3339())
            .bind((metrics.duration_seconds() * 1000.0) as i64)
            .bind(self.job_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        self.bus.publish(TelemetryEvent::RunUpdated {
            job_id: self.job_id,
            run_id: self.run_id,
            status: PipelineRunStatus::Completed,
            error_message: None,
            timestamp: now,
        });
        Ok(())
    }

    async fn fail_run(&self, error: &SynqxError, failed_node: Option<&str>) -> Result<(), SynqxError> {
        let now = Utc::now();
        let cancelled = matches!(error, SynqxError::Cancellation(_));
        let run_status = if cancelled {
            PipelineRunStatus::Cancelled
        } else {
            PipelineRunStatus::Failed
        };

        refresh_run_aggregates(&self.pool, self.run_id).await?;
        sqlx::query(
            r#"
            UPDATE pipeline_runs SET
                status = ?, error_message = ?, completed_at = ?,
                failed_step_id = COALESCE(failed_step_id, (
                    SELECT id FROM step_runs WHERE pipeline_run_id = ? AND node_id = ?
                ))
            WHERE id = ?
            "#,
        )
        .bind(run_status.as_str())
        .bind(error.to_string())
        .bind(now.to_rfc3339())
        .bind(self.run_id)
        .bind(failed_node)
        .bind(self.run_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let job_status = if cancelled { JobStatus::Cancelled } else { JobStatus::Failed };
        let infra = error.is_infrastructure();
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = ?, completed_at = ?,
                infra_error = CASE WHEN ? THEN ? ELSE infra_error END
            WHERE id = ?
            "#,
        )
        .bind(job_status.as_str())
        .bind(now.to_rfc3339())
        .bind(infra)
        .bind(error.to_string())
        .bind(self.job_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.bus.publish(TelemetryEvent::RunUpdated {
            job_id: self.job_id,
            run_id: self.run_id,
            status: run_status,
            error_message: Some(error.to_string()),
            timestamp: now,
        });
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The ingress-facing writer backed by the shared pool and bus.
pub struct SqlxStepUpdateWriter {
    pool: SqlitePool,
    bus: Arc<TelemetryBus>,
}

impl SqlxStepUpdateWriter {
    pub fn new(pool: SqlitePool, bus: Arc<TelemetryBus>) -> Self {
        Self { pool, bus }
    }
}

#[async_trait]
impl StepUpdateWriter for SqlxStepUpdateWriter {
    async fn apply_step_update(&self, job_id: i64, update: &StepUpdate) -> Result<i64, SynqxError> {
        apply_step_update(&self.pool, &self.bus, job_id, update).await
    }
}
