// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Job Dispatcher
//!
//! Leases queued jobs to polling agents. The claim is a single atomic
//! `UPDATE … WHERE id = (SELECT … ORDER BY priority, created_at LIMIT 1)
//! RETURNING` statement inside a transaction, the SQLite equivalent of
//! `SELECT … FOR UPDATE SKIP LOCKED`: under concurrent polls every queued
//! job is leased to at most one agent.
//!
//! ## Lease Sequence
//!
//! 1. claim the next eligible job (tag ∩ queue, workspace match, priority
//!    then age ordering) and stamp `status=running`, `worker_id`,
//!    `started_at`
//! 2. create the owned pipeline run with the next monotonic `run_number`
//!    when none exists
//! 3. build the payload: serialized DAG plus resolved connection blobs
//! 4. commit; any payload failure rolls the transaction back, leaving the
//!    job queued for the next poll
//!
//! When no pipeline job is eligible the same algorithm runs over the
//! ephemeral queue.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use synqx_domain::schemas::{
    AgentHeartbeat, DispatchConfig, EphemeralAssignment, EphemeralResultUpdate, JobHandle, JobLogEntry, PollResponse,
    StepUpdate,
};
use synqx_domain::{AgentRecord, ConnectionPayload, PipelineVersion, SynqxError};

use crate::store::{self, db_err};
use crate::telemetry::{TelemetryBus, TelemetryIngress};

/// Resolves the decrypted connection blobs a pipeline version needs.
///
/// Secret storage is an external collaborator; the dispatcher only depends
/// on this seam. Failures here abort the lease transaction.
pub trait ConnectionResolver: Send + Sync {
    fn resolve(&self, version: &PipelineVersion) -> Result<HashMap<String, ConnectionPayload>, SynqxError>;
}

/// Resolver over a fixed in-memory map of connection blobs, registered at
/// process start. Nodes reference connections via their `connection_id`
/// config key or their asset records.
#[derive(Default)]
pub struct StaticConnectionResolver {
    connections: parking_lot::RwLock<HashMap<String, ConnectionPayload>>,
}

impl StaticConnectionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, payload: ConnectionPayload) {
        self.connections.write().insert(payload.id.to_string(), payload);
    }
}

impl ConnectionResolver for StaticConnectionResolver {
    fn resolve(&self, version: &PipelineVersion) -> Result<HashMap<String, ConnectionPayload>, SynqxError> {
        let known = self.connections.read();
        let mut resolved = HashMap::new();
        for node in &version.nodes {
            let Some(id) = node.config.get("connection_id").map(connection_key) else {
                continue;
            };
            let payload = known.get(&id).ok_or_else(|| {
                SynqxError::Configuration(format!(
                    "Connection {} required by node '{}' cannot be resolved",
                    id, node.node_id
                ))
            })?;
            resolved.insert(id, payload.clone());
        }
        Ok(resolved)
    }
}

fn connection_key(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Hex-encoded SHA-256 of an agent API key, the only form ever stored.
pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

/// The control-plane dispatcher shared by all HTTP handlers.
pub struct JobDispatcher {
    pool: SqlitePool,
    resolver: Arc<dyn ConnectionResolver>,
    bus: Arc<TelemetryBus>,
    ingress: TelemetryIngress,
}

impl JobDispatcher {
    pub fn new(
        pool: SqlitePool,
        resolver: Arc<dyn ConnectionResolver>,
        bus: Arc<TelemetryBus>,
        ingress: TelemetryIngress,
    ) -> Self {
        Self {
            pool,
            resolver,
            bus,
            ingress,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn bus(&self) -> &Arc<TelemetryBus> {
        &self.bus
    }

    /// Authenticates agent credentials. `None` means 401.
    pub async fn authenticate(&self, client_id: &str, api_key: &str) -> Result<Option<AgentRecord>, SynqxError> {
        let row = sqlx::query("SELECT * FROM agents WHERE client_id = ?")
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let agent = store::map_agent(&row)?;
        if agent.api_key_hash == hash_api_key(api_key) {
            Ok(Some(agent))
        } else {
            Ok(None)
        }
    }

    /// Records a heartbeat: liveness, status, and the resource snapshot.
    pub async fn record_heartbeat(
        &self,
        agent: &AgentRecord,
        heartbeat: &AgentHeartbeat,
    ) -> Result<AgentRecord, SynqxError> {
        sqlx::query(
            r#"
            UPDATE agents SET
                status = ?, last_heartbeat = ?, system_info = ?,
                ip_address = COALESCE(?, ip_address),
                version = COALESCE(?, version),
                hostname = COALESCE(?, hostname)
            WHERE id = ?
            "#,
        )
        .bind(heartbeat.status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(serde_json::to_string(&heartbeat.system_info).ok())
        .bind(&heartbeat.ip_address)
        .bind(&heartbeat.version)
        .bind(&heartbeat.hostname)
        .bind(agent.id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(agent.id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        store::map_agent(&row)
    }

    /// Flips agents with stale heartbeats to Offline. Invoked by the
    /// scheduler tick.
    pub async fn mark_stale_agents_offline(&self, stale_after_secs: i64) -> Result<u64, SynqxError> {
        let cutoff = (Utc::now() - chrono::Duration::seconds(stale_after_secs)).to_rfc3339();
        let result = sqlx::query(
            "UPDATE agents SET status = 'offline' WHERE status != 'offline' AND (last_heartbeat IS NULL OR last_heartbeat < ?)",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    /// The primary poll operation: lease the next eligible job, falling
    /// back to the ephemeral queue, else `{"job": null}`.
    pub async fn poll(&self, agent: &AgentRecord, tags: &[String]) -> Result<PollResponse, SynqxError> {
        if tags.is_empty() {
            return Ok(PollResponse::none());
        }

        if let Some(response) = self.try_lease_pipeline_job(agent, tags).await? {
            return Ok(response);
        }
        if let Some(response) = self.try_lease_ephemeral_job(agent, tags).await? {
            return Ok(response);
        }
        Ok(PollResponse::none())
    }

    async fn try_lease_pipeline_job(
        &self,
        agent: &AgentRecord,
        tags: &[String],
    ) -> Result<Option<PollResponse>, SynqxError> {
        let mut txn = self.pool.begin().await.map_err(db_err)?;

        // Atomic claim: the inner SELECT and the UPDATE are one statement,
        // so concurrent polls can never both observe the same queued job.
        let placeholders = vec!["?"; tags.len()].join(", ");
        let claim_sql = format!(
            r#"
            UPDATE jobs SET status = 'running', worker_id = ?, started_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'queued' AND queue_name IN ({}) AND workspace_id IS ?
                ORDER BY priority ASC, created_at ASC
                LIMIT 1
            )
            RETURNING *
            "#,
            placeholders
        );
        let mut claim = sqlx::query(&claim_sql)
            .bind(&agent.client_id)
            .bind(Utc::now().to_rfc3339());
        for tag in tags {
            claim = claim.bind(tag);
        }
        let claimed = claim
            .bind(agent.workspace_id)
            .fetch_optional(&mut *txn)
            .await
            .map_err(db_err)?;

        let Some(job_row) = claimed else {
            txn.rollback().await.map_err(db_err)?;
            return Ok(None);
        };
        let job = store::map_job(&job_row)?;
        info!(job_id = job.id, agent = %agent.client_id, "leasing job");

        // Ensure the owned run exists with the next monotonic run number
        let run_id: i64 = match sqlx::query("SELECT id FROM pipeline_runs WHERE job_id = ?")
            .bind(job.id)
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
                .bind(job.id)
                .bind(job.pipeline_id)
                .bind(job.pipeline_version_id)
                .bind(job.pipeline_id)
                .bind(Utc::now().to_rfc3339())
                .fetch_one(&mut *txn)
                .await
                .map_err(db_err)?;
                row.get("id")
            }
        };

        // Payload construction; any failure rolls the claim back
        let payload = async {
            let version = store::load_version(&self.pool, job.pipeline_version_id).await?;
            let connections = self.resolver.resolve(&version)?;
            let pipeline = store::get_pipeline(&self.pool, job.pipeline_id)
                .await?
                .ok_or_else(|| SynqxError::NotFound(format!("Pipeline {} not found", job.pipeline_id)))?;
            Ok::<_, SynqxError>((version, connections, pipeline))
        }
        .await;

        let (version, connections, pipeline) = match payload {
            Ok(parts) => parts,
            Err(e) => {
                warn!(job_id = job.id, error = %e, "payload construction failed, releasing lease");
                txn.rollback().await.map_err(db_err)?;
                return Err(e);
            }
        };

        txn.commit().await.map_err(db_err)?;

        Ok(Some(PollResponse::with_job(
            JobHandle {
                id: job.id,
                pipeline_id: job.pipeline_id,
                run_id,
                queue: job.queue_name.clone(),
            },
            version,
            connections,
            DispatchConfig {
                max_retries: job.max_retries,
                timeout_seconds: pipeline.execution_timeout_seconds,
            },
        )))
    }

    async fn try_lease_ephemeral_job(
        &self,
        agent: &AgentRecord,
        tags: &[String],
    ) -> Result<Option<PollResponse>, SynqxError> {
        let mut txn = self.pool.begin().await.map_err(db_err)?;

        let placeholders = vec!["?"; tags.len()].join(", ");
        let claim_sql = format!(
            r#"
            UPDATE ephemeral_jobs SET status = 'running', worker_id = ?, started_at = ?
            WHERE id = (
                SELECT id FROM ephemeral_jobs
                WHERE status = 'queued' AND agent_group IN ({}) AND workspace_id IS ?
                ORDER BY created_at ASC
                LIMIT 1
            )
            RETURNING id, job_type, payload, connection
            "#,
            placeholders
        );
        let mut claim = sqlx::query(&claim_sql)
            .bind(&agent.client_id)
            .bind(Utc::now().to_rfc3339());
        for tag in tags {
            claim = claim.bind(tag);
        }
        let claimed = claim
            .bind(agent.workspace_id)
            .fetch_optional(&mut *txn)
            .await
            .map_err(db_err)?;

        let Some(row) = claimed else {
            txn.rollback().await.map_err(db_err)?;
            return Ok(None);
        };

        let kind_raw: String = row.get("job_type");
        let assignment = EphemeralAssignment {
            id: row.get("id"),
            kind: serde_json::from_value(serde_json::Value::String(kind_raw))
                .map_err(|e| SynqxError::Serialization(format!("bad ephemeral job type: {}", e)))?,
            payload: row
                .get::<Option<String>, _>("payload")
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or(serde_json::Value::Null),
            connection: row
                .get::<Option<String>, _>("connection")
                .and_then(|raw| serde_json::from_str(&raw).ok()),
        };

        txn.commit().await.map_err(db_err)?;
        info!(ephemeral_id = assignment.id, agent = %agent.client_id, "leasing ephemeral job");
        Ok(Some(PollResponse::with_ephemeral(assignment)))
    }

    /// Enqueues a step update to the telemetry ingress. The agent gets an
    /// immediate acknowledgement; persistence happens on the worker.
    pub fn record_step_telemetry(&self, job_id: i64, update: StepUpdate) -> Result<(), SynqxError> {
        self.ingress.enqueue(job_id, update)
    }

    /// Persists a batch of agent log lines, attaching them to step runs
    /// when the entry names a node.
    pub async fn upload_job_logs(&self, job_id: i64, entries: &[JobLogEntry]) -> Result<usize, SynqxError> {
        let run_id: Option<i64> = sqlx::query("SELECT id FROM pipeline_runs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| row.get("id"));

        for entry in entries {
            let step_run_id: Option<i64> = match (&entry.node_id, run_id) {
                (Some(node_id), Some(run_id)) => {
                    sqlx::query("SELECT id FROM step_runs WHERE pipeline_run_id = ? AND node_id = ?")
                        .bind(run_id)
                        .bind(node_id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(db_err)?
                        .map(|row| row.get("id"))
                }
                _ => None,
            };

            sqlx::query(
                "INSERT INTO job_logs (job_id, step_run_id, level, message, source, node_id, timestamp) VALUES (?, ?, ?, ?, 'agent', ?, ?)",
            )
            .bind(job_id)
            .bind(step_run_id)
            .bind(&entry.level)
            .bind(&entry.message)
            .bind(&entry.node_id)
            .bind(entry.timestamp.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }

        Ok(entries.len())
    }

    /// Terminal callback for an ephemeral job.
    pub async fn update_ephemeral_job(&self, job_id: i64, update: &EphemeralResultUpdate) -> Result<(), SynqxError> {
        let result = sqlx::query(
            r#"
            UPDATE ephemeral_jobs SET
                status = ?, result_summary = ?, result_sample = ?, result_sample_arrow = ?,
                execution_time_ms = ?, error_message = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&update.status)
        .bind(update.result_summary.as_ref().map(|v| v.to_string()))
        .bind(update.result_sample.as_ref().map(|v| v.to_string()))
        .bind(&update.result_sample_arrow)
        .bind(update.execution_time_ms)
        .bind(&update.error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(SynqxError::NotFound(format!("Ephemeral job {} not found", job_id)));
        }
        Ok(())
    }

    /// The worker holding an ephemeral job's lease, for ownership checks.
    pub async fn ephemeral_job_worker(&self, job_id: i64) -> Result<Option<String>, SynqxError> {
        let row = sqlx::query("SELECT worker_id FROM ephemeral_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.and_then(|r| r.get("worker_id")))
    }

    /// Load balancing for group-targeted triggers: the Online agent in the
    /// workspace+group with the fewest in-flight jobs. This is a soft
    /// assignment; the actual claim still happens at poll time.
    pub async fn select_agent(&self, workspace_id: Option<i64>, group: &str) -> Result<Option<AgentRecord>, SynqxError> {
        let rows = sqlx::query(
            r#"
            SELECT a.*, (
                SELECT COUNT(*) FROM jobs j WHERE j.worker_id = a.client_id AND j.status = 'running'
            ) AS in_flight
            FROM agents a
            WHERE a.status = 'online' AND a.workspace_id IS ?
            ORDER BY in_flight ASC, a.last_heartbeat DESC
            "#,
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        for row in &rows {
            let agent = store::map_agent(row)?;
            if agent.groups.iter().any(|g| g == group) {
                debug!(agent = %agent.client_id, group, "soft-assigned agent for group trigger");
                return Ok(Some(agent));
            }
        }
        Ok(None)
    }
}
