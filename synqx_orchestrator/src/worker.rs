// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Internal Worker
//!
//! Direct execution for jobs targeting the reserved `internal` agent
//! group: instead of waiting for a remote agent to poll, the orchestrator
//! claims these jobs itself and runs them through the engine in-process,
//! persisting lifecycle state straight into the store.
//!
//! The claim uses the same atomic `UPDATE … (SELECT … LIMIT 1) RETURNING`
//! shape as the dispatcher, so internal workers and remote agents can
//! never double-lease a job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{error, info, warn};

use synqx_domain::SynqxError;
use synqx_engine::{
    ConnectorRegistry, DataCache, ExecutionEnvironment, ParallelRunner, RunnerOptions, TransformRegistry,
};

use crate::dispatcher::ConnectionResolver;
use crate::state::SqlxStateManager;
use crate::store::{self, db_err};
use crate::telemetry::TelemetryBus;
use crate::watermark_store::SqlxWatermarkStore;

/// Lease holder recorded for in-process executions.
const INTERNAL_WORKER_ID: &str = "__orchestrator__";
/// Queue name that routes a job to direct execution.
const INTERNAL_QUEUE: &str = "internal";
/// Default cache budget for in-process runs, in MB.
const CACHE_BUDGET_MB: u64 = 2048;

/// In-process executor for `internal`-queue jobs.
pub struct InternalWorker {
    pool: SqlitePool,
    bus: Arc<TelemetryBus>,
    resolver: Arc<dyn ConnectionResolver>,
    connector_registry: Arc<ConnectorRegistry>,
    transform_registry: Arc<TransformRegistry>,
    forensic_base: Option<std::path::PathBuf>,
}

impl InternalWorker {
    pub fn new(pool: SqlitePool, bus: Arc<TelemetryBus>, resolver: Arc<dyn ConnectionResolver>) -> Self {
        Self {
            pool,
            bus,
            resolver,
            connector_registry: Arc::new(ConnectorRegistry::with_builtins()),
            transform_registry: Arc::new(TransformRegistry::with_builtins()),
            forensic_base: Some(std::path::PathBuf::from(synqx_engine::forensics::DEFAULT_FORENSIC_BASE)),
        }
    }

    /// Replaces the connector registry (external connectors register here).
    pub fn with_connector_registry(mut self, registry: Arc<ConnectorRegistry>) -> Self {
        self.connector_registry = registry;
        self
    }

    /// Disables forensic capture for in-process runs.
    pub fn without_forensics(mut self) -> Self {
        self.forensic_base = None;
        self
    }

    /// Polls for internal jobs until the process stops.
    pub async fn run_loop(self: Arc<Self>) {
        loop {
            match self.process_next().await {
                Ok(true) => {} // immediately look for more work
                Ok(false) => tokio::time::sleep(Duration::from_secs(2)).await,
                Err(e) => {
                    error!(error = %e, "internal worker iteration failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    /// Claims and executes at most one internal job. Returns whether a job
    /// was processed.
    pub async fn process_next(&self) -> Result<bool, SynqxError> {
        let Some((job_id, run_id, version_id, pipeline_id, timeout)) = self.claim().await? else {
            return Ok(false);
        };
        info!(job_id, run_id, "executing internal job in-process");

        let version = store::load_version(&self.pool, version_id).await?;
        let connections = match self.resolver.resolve(&version) {
            Ok(connections) => connections,
            Err(e) => {
                // Unlike the dispatcher path, the claim is already
                // committed; surface the failure as a failed run
                let sink = SqlxStateManager::new(self.pool.clone(), Arc::clone(&self.bus), job_id, run_id);
                synqx_engine::StateSink::fail_run(&sink, &e, None).await?;
                return Err(e);
            }
        };

        let env = Arc::new(ExecutionEnvironment {
            pipeline_id,
            run_id,
            connections,
            assets: HashMap::new(),
            connector_registry: Arc::clone(&self.connector_registry),
            transform_registry: Arc::clone(&self.transform_registry),
            watermarks: Arc::new(SqlxWatermarkStore::new(self.pool.clone())),
            forensic_base: self.forensic_base.clone(),
            runtime_envs: None,
        });

        let sink = Arc::new(SqlxStateManager::new(
            self.pool.clone(),
            Arc::clone(&self.bus),
            job_id,
            run_id,
        ));
        sink.spawn_cancellation_watcher();

        let cache = Arc::new(DataCache::new(CACHE_BUDGET_MB)?);
        let runner = ParallelRunner::new(
            env,
            sink,
            cache,
            RunnerOptions {
                max_parallel_nodes: 0,
                execution_timeout: timeout.map(Duration::from_secs),
                permissive_conditions: false,
            },
        );

        match runner.run(&version).await {
            Ok(metrics) => {
                info!(
                    job_id,
                    records = metrics.total_records_processed,
                    duration_s = metrics.duration_seconds(),
                    "internal job completed"
                );
            }
            Err(e) => {
                warn!(job_id, error = %e, "internal job failed");
            }
        }
        Ok(true)
    }

    /// Atomic claim of the next internal job, creating its run.
    async fn claim(&self) -> Result<Option<(i64, i64, i64, i64, Option<u64>)>, SynqxError> {
        let mut txn = self.pool.begin().await.map_err(db_err)?;

        let claimed = sqlx::query(
            r#"
            UPDATE jobs SET status = 'running', worker_id = ?, started_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'queued' AND queue_name = ?
                ORDER BY priority ASC, created_at ASC
                LIMIT 1
            )
            RETURNING id, pipeline_id, pipeline_version_id
            "#,
        )
        .bind(INTERNAL_WORKER_ID)
        .bind(Utc::now().to_rfc3339())
        .bind(INTERNAL_QUEUE)
        .fetch_optional(&mut *txn)
        .await
        .map_err(db_err)?;

        let Some(row) = claimed else {
            txn.rollback().await.map_err(db_err)?;
            return Ok(None);
        };
        let job_id: i64 = row.get("id");
        let pipeline_id: i64 = row.get("pipeline_id");
        let version_id: i64 = row.get("pipeline_version_id");

        let run_id: i64 = match sqlx::query("SELECT id FROM pipeline_runs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&mut *txn)
            .await
            .map_err(db_err)?
        {
            Some(row) => row.get("id"),
            None => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO pipeline_runs (job_id, pipeline_id, pipeline_version_id, run_number, status, started_at)
                    VALUES (?, ?, ?, (
                        SELECT COALESCE(MAX(run_number), 0) + 1 FROM pipeline_runs WHERE pipeline_id = ?
                    ), 'initializing', ?)
                    RETURNING id
                    "#,
                )
                .bind(job_id)
                .bind(pipeline_id)
                .bind(version_id)
                .bind(pipeline_id)
                .bind(Utc::now().to_rfc3339())
                .fetch_one(&mut *txn)
                .await
                .map_err(db_err)?;
                row.get("id")
            }
        };

        txn.commit().await.map_err(db_err)?;

        let timeout = store::get_pipeline(&self.pool, pipeline_id)
            .await?
            .and_then(|p| p.execution_timeout_seconds);

        Ok(Some((job_id, run_id, version_id, pipeline_id, timeout)))
    }
}
