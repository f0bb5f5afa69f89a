// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Dispatcher and control-plane integration: atomic lease under
//! concurrency, payload rollback, workspace scoping, heartbeats, job
//! status mirroring, telemetry flow-through, and scheduler caps.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use sqlx::{Row, SqlitePool};

use synqx_domain::schemas::{AgentHeartbeat, JobStatusUpdate, StepUpdate, SystemInfo};
use synqx_domain::{
    AgentStatus, ConnectionPayload, EdgeDefinition, JobStatus, NodeDefinition, OperatorType, Pipeline,
    PipelineStatus, PipelineVersion, RetryStrategy, StepCounters, StepStatus, SynqxError,
};
use synqx_orchestrator::{
    hash_api_key, ConnectionResolver, JobDispatcher, Scheduler, SqlxStepUpdateWriter, StaticConnectionResolver,
    TelemetryBus, TelemetryIngress,
};
use synqx_orchestrator::store;

struct Harness {
    pool: SqlitePool,
    dispatcher: Arc<JobDispatcher>,
    bus: Arc<TelemetryBus>,
    _dir: tempfile::TempDir,
}

struct FailingResolver;

impl ConnectionResolver for FailingResolver {
    fn resolve(&self, _version: &PipelineVersion) -> Result<HashMap<String, ConnectionPayload>, SynqxError> {
        Err(SynqxError::Configuration("secret resolution failed".to_string()))
    }
}

async fn harness_with_resolver(resolver: Arc<dyn ConnectionResolver>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/orchestrator.db?mode=rwc", dir.path().display());
    let pool = store::connect(&url).await.unwrap();

    let bus = Arc::new(TelemetryBus::new());
    let writer = Arc::new(SqlxStepUpdateWriter::new(pool.clone(), Arc::clone(&bus)));
    let ingress = TelemetryIngress::spawn(writer);
    let dispatcher = Arc::new(JobDispatcher::new(pool.clone(), resolver, Arc::clone(&bus), ingress));

    Harness {
        pool,
        dispatcher,
        bus,
        _dir: dir,
    }
}

async fn harness() -> Harness {
    let resolver = StaticConnectionResolver::new();
    resolver.register(ConnectionPayload {
        id: 1,
        connector_type: "memory".into(),
        config: serde_json::Map::new(),
    });
    harness_with_resolver(Arc::new(resolver)).await
}

fn sample_pipeline(workspace: Option<i64>) -> Pipeline {
    Pipeline {
        id: 0,
        name: "orders_sync".into(),
        description: None,
        schedule_cron: None,
        schedule_enabled: false,
        schedule_timezone: "UTC".into(),
        status: PipelineStatus::Active,
        published_version_id: None,
        max_parallel_runs: 1,
        max_retries: 3,
        retry_strategy: RetryStrategy::Fixed,
        retry_delay_seconds: 60,
        execution_timeout_seconds: Some(3600),
        agent_group: "default".into(),
        priority: 5,
        sla_config: None,
        workspace_id: workspace,
    }
}

/// Seeds a pipeline + version whose nodes resolve against connection 1.
async fn seed_pipeline(pool: &SqlitePool, workspace: Option<i64>) -> (Pipeline, i64) {
    let mut pipeline = sample_pipeline(workspace);
    pipeline.id = store::insert_pipeline(pool, &pipeline).await.unwrap();

    let mut extract = NodeDefinition::new("ext", OperatorType::Extract, "memory_read");
    extract.config.insert("table".into(), json!("orders"));
    extract.config.insert("connection_id".into(), json!(1));
    let mut load = NodeDefinition::new("load", OperatorType::Load, "memory_write");
    load.config.insert("table".into(), json!("orders_copy"));
    load.config.insert("connection_id".into(), json!(1));
    load.order_index = 1;

    let version = PipelineVersion::new(
        pipeline.id,
        1,
        vec![extract, load],
        vec![EdgeDefinition::new("ext", "load")],
    );
    let version_id = store::insert_version(pool, &version).await.unwrap();
    (pipeline, version_id)
}

async fn seed_agent(pool: &SqlitePool, client_id: &str, workspace: Option<i64>) -> synqx_domain::AgentRecord {
    store::insert_agent(
        pool,
        client_id,
        client_id,
        &hash_api_key("secret"),
        workspace,
        &["default".to_string()],
    )
    .await
    .unwrap();
    let row = sqlx::query("SELECT * FROM agents WHERE client_id = ?")
        .bind(client_id)
        .fetch_one(pool)
        .await
        .unwrap();
    store::map_agent(&row).unwrap()
}

#[tokio::test]
async fn authentication_validates_hashed_key() {
    let h = harness().await;
    seed_agent(&h.pool, "agent-1", Some(1)).await;

    assert!(h.dispatcher.authenticate("agent-1", "secret").await.unwrap().is_some());
    assert!(h.dispatcher.authenticate("agent-1", "wrong").await.unwrap().is_none());
    assert!(h.dispatcher.authenticate("ghost", "secret").await.unwrap().is_none());
}

#[tokio::test]
async fn lease_hands_over_dag_and_connections() {
    let h = harness().await;
    let (pipeline, version_id) = seed_pipeline(&h.pool, Some(1)).await;
    let agent = seed_agent(&h.pool, "agent-1", Some(1)).await;
    let job_id = store::enqueue_job(&h.pool, &pipeline, version_id, None).await.unwrap();

    let response = h.dispatcher.poll(&agent, &["default".to_string()]).await.unwrap();
    let handle = response.job.expect("job leased");
    assert_eq!(handle.id, job_id);
    assert_eq!(handle.run_id, 1);

    let dag = response.dag.expect("dag payload");
    assert_eq!(dag.nodes.len(), 2);
    let connections = response.connections.expect("connections");
    assert!(connections.contains_key("1"));
    let config = response.config.expect("dispatch config");
    assert_eq!(config.timeout_seconds, Some(3600));

    // Lease stamped on the job
    let job = store::get_job(&h.pool, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.worker_id.as_deref(), Some("agent-1"));
    assert!(job.started_at.is_some());

    // Second poll finds nothing
    let response = h.dispatcher.poll(&agent, &["default".to_string()]).await.unwrap();
    assert!(response.job.is_none() && response.ephemeral.is_none());
}

#[tokio::test]
async fn concurrent_polls_lease_exactly_once() {
    let h = harness().await;
    let (pipeline, version_id) = seed_pipeline(&h.pool, Some(1)).await;
    store::enqueue_job(&h.pool, &pipeline, version_id, None).await.unwrap();

    let mut agents = Vec::new();
    for i in 0..10 {
        agents.push(seed_agent(&h.pool, &format!("agent-{}", i), Some(1)).await);
    }

    let mut handles = Vec::new();
    for agent in agents {
        let dispatcher = Arc::clone(&h.dispatcher);
        handles.push(tokio::spawn(async move {
            dispatcher.poll(&agent, &["default".to_string()]).await
        }));
    }

    let mut winners = 0;
    let mut empties = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(response) if response.job.is_some() => winners += 1,
            Ok(_) => empties += 1,
            Err(e) => panic!("poll errored: {}", e),
        }
    }
    assert_eq!(winners, 1, "exactly one agent must win the lease");
    assert_eq!(empties, 9);
}

#[tokio::test]
async fn payload_failure_rolls_back_lease() {
    let h = harness_with_resolver(Arc::new(FailingResolver)).await;
    let (pipeline, version_id) = seed_pipeline(&h.pool, Some(1)).await;
    let agent = seed_agent(&h.pool, "agent-1", Some(1)).await;
    let job_id = store::enqueue_job(&h.pool, &pipeline, version_id, None).await.unwrap();

    let err = h.dispatcher.poll(&agent, &["default".to_string()]).await.unwrap_err();
    assert!(matches!(err, SynqxError::Configuration(_)));

    // The job is back to queued with no lease and no run
    let job = store::get_job(&h.pool, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert!(job.worker_id.is_none());
    let runs: i64 = sqlx::query("SELECT COUNT(*) AS n FROM pipeline_runs WHERE job_id = ?")
        .bind(job_id)
        .fetch_one(&h.pool)
        .await
        .unwrap()
        .get("n");
    assert_eq!(runs, 0);
}

#[tokio::test]
async fn workspace_and_queue_scoping() {
    let h = harness().await;
    let (pipeline, version_id) = seed_pipeline(&h.pool, Some(1)).await;
    store::enqueue_job(&h.pool, &pipeline, version_id, None).await.unwrap();

    // Wrong workspace
    let outsider = seed_agent(&h.pool, "outsider", Some(2)).await;
    let response = h.dispatcher.poll(&outsider, &["default".to_string()]).await.unwrap();
    assert!(response.job.is_none());

    // Right workspace, wrong tags
    let insider = seed_agent(&h.pool, "insider", Some(1)).await;
    let response = h.dispatcher.poll(&insider, &["gpu".to_string()]).await.unwrap();
    assert!(response.job.is_none());

    // Right workspace and tag
    let response = h.dispatcher.poll(&insider, &["default".to_string()]).await.unwrap();
    assert!(response.job.is_some());
}

#[tokio::test]
async fn priority_then_age_ordering() {
    let h = harness().await;
    let (mut pipeline, version_id) = seed_pipeline(&h.pool, Some(1)).await;
    pipeline.max_parallel_runs = 10;

    let low = store::enqueue_job(&h.pool, &pipeline, version_id, None).await.unwrap();
    sqlx::query("UPDATE jobs SET priority = 9 WHERE id = ?")
        .bind(low)
        .execute(&h.pool)
        .await
        .unwrap();
    let high = store::enqueue_job(&h.pool, &pipeline, version_id, None).await.unwrap();
    sqlx::query("UPDATE jobs SET priority = 1 WHERE id = ?")
        .bind(high)
        .execute(&h.pool)
        .await
        .unwrap();

    let agent = seed_agent(&h.pool, "agent-1", Some(1)).await;
    let first = h.dispatcher.poll(&agent, &["default".to_string()]).await.unwrap();
    assert_eq!(first.job.unwrap().id, high, "lower priority value leases first");
}

#[tokio::test]
async fn heartbeat_updates_agent_row() {
    let h = harness().await;
    let agent = seed_agent(&h.pool, "agent-1", Some(1)).await;
    assert_eq!(agent.status, AgentStatus::Offline);

    let updated = h
        .dispatcher
        .record_heartbeat(
            &agent,
            &AgentHeartbeat {
                status: AgentStatus::Online,
                system_info: SystemInfo {
                    os: "linux".into(),
                    runtime: "rust-agent/1.0.0".into(),
                    cpu_usage: 12.5,
                    memory_usage: 40.0,
                    arch: "x86_64".into(),
                },
                ip_address: Some("10.0.0.9".into()),
                version: Some("1.0.0".into()),
                hostname: Some("worker-1".into()),
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.status, AgentStatus::Online);
    assert!(updated.last_heartbeat.is_some());
    assert_eq!(updated.hostname.as_deref(), Some("worker-1"));

    // Stale expiry flips it back offline
    sqlx::query("UPDATE agents SET last_heartbeat = '2000-01-01T00:00:00Z' WHERE client_id = 'agent-1'")
        .execute(&h.pool)
        .await
        .unwrap();
    let expired = h.dispatcher.mark_stale_agents_offline(90).await.unwrap();
    assert_eq!(expired, 1);
}

#[tokio::test]
async fn step_telemetry_persists_and_broadcasts() {
    let h = harness().await;
    let (pipeline, version_id) = seed_pipeline(&h.pool, Some(1)).await;
    let agent = seed_agent(&h.pool, "agent-1", Some(1)).await;
    let job_id = store::enqueue_job(&h.pool, &pipeline, version_id, None).await.unwrap();
    let leased = h.dispatcher.poll(&agent, &["default".to_string()]).await.unwrap();
    let run_id = leased.job.unwrap().run_id;

    let mut rx = h.bus.subscribe(&synqx_domain::TelemetryEvent::job_topic(job_id));

    h.dispatcher
        .record_step_telemetry(
            job_id,
            StepUpdate {
                node_id: "ext".into(),
                status: StepStatus::Success,
                counters: StepCounters {
                    records_out: 42,
                    ..Default::default()
                },
                cpu_percent: Some(10.0),
                memory_mb: Some(128.0),
                sample_data: None,
                quality_profile: None,
                error_message: None,
            },
        )
        .unwrap();

    // Worker drains asynchronously
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let row = sqlx::query("SELECT status, records_out FROM step_runs WHERE pipeline_run_id = ? AND node_id = 'ext'")
        .bind(run_id)
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("status"), "success");
    assert_eq!(row.get::<i64, _>("records_out"), 42);

    // Extract success rolls up into run aggregates
    let agg = sqlx::query("SELECT total_extracted FROM pipeline_runs WHERE id = ?")
        .bind(run_id)
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(agg.get::<i64, _>("total_extracted"), 42);

    assert!(rx.try_recv().is_ok(), "subscriber received the step event");
}

#[tokio::test]
async fn job_status_callback_mirrors_run() {
    let h = harness().await;
    let (pipeline, version_id) = seed_pipeline(&h.pool, Some(1)).await;
    let agent = seed_agent(&h.pool, "agent-1", Some(1)).await;
    let job_id = store::enqueue_job(&h.pool, &pipeline, version_id, None).await.unwrap();
    let leased = h.dispatcher.poll(&agent, &["default".to_string()]).await.unwrap();
    let run_id = leased.job.unwrap().run_id;

    synqx_orchestrator::state::apply_job_status(
        &h.pool,
        &h.bus,
        job_id,
        &JobStatusUpdate {
            status: "success".into(),
            message: "Finalized in 1200ms".into(),
            execution_time_ms: 1200,
            total_records: 42,
            total_bytes: None,
            timestamp: chrono::Utc::now(),
        },
    )
    .await
    .unwrap();

    let job = store::get_job(&h.pool, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.execution_time_ms, Some(1200));
    assert!(job.completed_at.is_some());

    let run = sqlx::query("SELECT status, total_loaded, duration_seconds FROM pipeline_runs WHERE id = ?")
        .bind(run_id)
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(run.get::<String, _>("status"), "completed");
    assert_eq!(run.get::<i64, _>("total_loaded"), 42);
    assert!((run.get::<f64, _>("duration_seconds") - 1.2).abs() < 1e-9);
}

#[tokio::test]
async fn run_numbers_are_monotonic_per_pipeline() {
    let h = harness().await;
    let (mut pipeline, version_id) = seed_pipeline(&h.pool, Some(1)).await;
    pipeline.max_parallel_runs = 10;
    let agent = seed_agent(&h.pool, "agent-1", Some(1)).await;

    for expected_run in 1..=3 {
        let job_id = store::enqueue_job(&h.pool, &pipeline, version_id, None).await.unwrap();
        let leased = h.dispatcher.poll(&agent, &["default".to_string()]).await.unwrap();
        let handle = leased.job.unwrap();
        assert_eq!(handle.id, job_id);
        assert_eq!(handle.run_id, expected_run);

        let run_number: i64 = sqlx::query("SELECT run_number FROM pipeline_runs WHERE job_id = ?")
            .bind(job_id)
            .fetch_one(&h.pool)
            .await
            .unwrap()
            .get("run_number");
        assert_eq!(run_number, expected_run);

        // Finish the job so the next lease is clean
        sqlx::query("UPDATE jobs SET status = 'success' WHERE id = ?")
            .bind(job_id)
            .execute(&h.pool)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn ephemeral_queue_is_the_fallback() {
    let h = harness().await;
    let agent = seed_agent(&h.pool, "agent-1", Some(1)).await;

    sqlx::query(
        r#"
        INSERT INTO ephemeral_jobs (job_type, payload, connection, agent_group, workspace_id, status)
        VALUES ('explorer', '{"query": "orders", "limit": 10}', '{"id": 1, "type": "memory", "config": {}}', 'default', 1, 'queued')
        "#,
    )
    .execute(&h.pool)
    .await
    .unwrap();

    let response = h.dispatcher.poll(&agent, &["default".to_string()]).await.unwrap();
    assert!(response.job.is_none());
    let assignment = response.ephemeral.expect("ephemeral lease");
    assert_eq!(assignment.payload["limit"], 10);
    assert_eq!(assignment.connection.as_ref().unwrap().connector_type, "memory");

    // Terminal callback lands
    h.dispatcher
        .update_ephemeral_job(
            assignment.id,
            &synqx_domain::schemas::EphemeralResultUpdate {
                status: "success".into(),
                result_summary: Some(json!({"count": 10})),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let status: String = sqlx::query("SELECT status FROM ephemeral_jobs WHERE id = ?")
        .bind(assignment.id)
        .fetch_one(&h.pool)
        .await
        .unwrap()
        .get("status");
    assert_eq!(status, "success");
}

#[tokio::test]
async fn scheduler_respects_parallel_run_cap() {
    let h = harness().await;
    let (pipeline, version_id) = seed_pipeline(&h.pool, Some(1)).await;
    sqlx::query(
        "UPDATE pipelines SET schedule_enabled = 1, schedule_cron = '* * * * *', published_version_id = ?, status = 'active' WHERE id = ?",
    )
    .bind(version_id)
    .bind(pipeline.id)
    .execute(&h.pool)
    .await
    .unwrap();

    let scheduler = Scheduler::new(h.pool.clone(), Arc::clone(&h.dispatcher), Arc::clone(&h.bus));

    // First tick fires (cron matches every minute)
    let now = chrono::Utc::now();
    let triggered = scheduler.tick(now + chrono::Duration::seconds(61)).await.unwrap();
    assert_eq!(triggered, 1);
    assert_eq!(store::live_job_count(&h.pool, pipeline.id).await.unwrap(), 1);

    // Cap of 1 is reached; the next tick skips the pipeline
    let triggered = scheduler.tick(now + chrono::Duration::seconds(122)).await.unwrap();
    assert_eq!(triggered, 0);
    assert_eq!(store::live_job_count(&h.pool, pipeline.id).await.unwrap(), 1);
}

#[tokio::test]
async fn sla_duration_breach_raises_event() {
    let h = harness().await;
    let (pipeline, version_id) = seed_pipeline(&h.pool, Some(1)).await;
    sqlx::query("UPDATE pipelines SET sla_config = '{\"max_duration_seconds\": 60}' WHERE id = ?")
        .bind(pipeline.id)
        .execute(&h.pool)
        .await
        .unwrap();

    let job_id = store::enqueue_job(&h.pool, &pipeline, version_id, None).await.unwrap();
    sqlx::query("UPDATE jobs SET status = 'running', started_at = ? WHERE id = ?")
        .bind((chrono::Utc::now() - chrono::Duration::seconds(300)).to_rfc3339())
        .bind(job_id)
        .execute(&h.pool)
        .await
        .unwrap();

    let mut rx = h.bus.subscribe(&synqx_domain::TelemetryEvent::job_topic(job_id));
    let scheduler = Scheduler::new(h.pool.clone(), Arc::clone(&h.dispatcher), Arc::clone(&h.bus));
    let breaches = scheduler.check_sla_breaches(chrono::Utc::now()).await.unwrap();
    assert_eq!(breaches, 1);
    assert!(matches!(
        rx.try_recv(),
        Ok(synqx_domain::TelemetryEvent::SlaBreach { .. })
    ));
}
