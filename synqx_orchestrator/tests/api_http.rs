// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Wire-level protocol tests: a real axum server on an ephemeral port,
//! exercised with a plain HTTP client the way an agent would.

use std::sync::Arc;

use serde_json::json;

use synqx_domain::{
    EdgeDefinition, NodeDefinition, OperatorType, Pipeline, PipelineStatus, PipelineVersion, RetryStrategy,
};
use synqx_orchestrator::store;
use synqx_orchestrator::{
    hash_api_key, router, AppState, JobDispatcher, SqlxStepUpdateWriter, StaticConnectionResolver, TelemetryBus,
    TelemetryIngress,
};

async fn spawn_server() -> (String, sqlx::SqlitePool, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/api.db?mode=rwc", dir.path().display());
    let pool = store::connect(&url).await.unwrap();

    let bus = Arc::new(TelemetryBus::new());
    let writer = Arc::new(SqlxStepUpdateWriter::new(pool.clone(), Arc::clone(&bus)));
    let ingress = TelemetryIngress::spawn(writer);
    let resolver = StaticConnectionResolver::new();
    resolver.register(synqx_domain::ConnectionPayload {
        id: 1,
        connector_type: "memory".into(),
        config: serde_json::Map::new(),
    });
    let dispatcher = Arc::new(JobDispatcher::new(pool.clone(), Arc::new(resolver), bus, ingress));

    let app = router(AppState { dispatcher });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), pool, dir)
}

async fn seed_agent(pool: &sqlx::SqlitePool, client_id: &str) {
    store::insert_agent(pool, client_id, client_id, &hash_api_key("secret"), Some(1), &["default".to_string()])
        .await
        .unwrap();
}

async fn seed_queued_job(pool: &sqlx::SqlitePool) -> i64 {
    let mut pipeline = Pipeline {
        id: 0,
        name: "api_pipeline".into(),
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
        workspace_id: Some(1),
    };
    pipeline.id = store::insert_pipeline(pool, &pipeline).await.unwrap();

    let mut extract = NodeDefinition::new("ext", OperatorType::Extract, "memory_read");
    extract.config.insert("table".into(), json!("orders"));
    extract.config.insert("connection_id".into(), json!(1));
    let load = NodeDefinition::new("load", OperatorType::Load, "memory_write");
    let version = PipelineVersion::new(
        pipeline.id,
        1,
        vec![extract, load],
        vec![EdgeDefinition::new("ext", "load")],
    );
    let version_id = store::insert_version(pool, &version).await.unwrap();
    store::enqueue_job(pool, &pipeline, version_id, None).await.unwrap()
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

#[tokio::test]
async fn missing_or_bad_credentials_are_401() {
    let (base, _pool, _dir) = spawn_server().await;

    // No headers at all
    let response = client()
        .post(format!("{}/agents/poll", base))
        .json(&json!(["default"]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Wrong key
    let response = client()
        .post(format!("{}/agents/poll", base))
        .header("X-SynqX-Client-ID", "nobody")
        .header("X-SynqX-API-Key", "wrong")
        .json(&json!(["default"]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn poll_round_trip_over_http() {
    let (base, pool, _dir) = spawn_server().await;
    seed_agent(&pool, "agent-1").await;
    let job_id = seed_queued_job(&pool).await;

    let response = client()
        .post(format!("{}/agents/poll", base))
        .header("X-SynqX-Client-ID", "agent-1")
        .header("X-SynqX-API-Key", "secret")
        .json(&json!(["default"]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["job"]["id"], job_id);
    assert!(body["dag"]["nodes"].is_array());
    assert!(body["connections"]["1"].is_object());

    // Second poll: nothing left, body is {"job": null}
    let response = client()
        .post(format!("{}/agents/poll", base))
        .header("X-SynqX-Client-ID", "agent-1")
        .header("X-SynqX-API-Key", "secret")
        .json(&json!(["default"]))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["job"].is_null());
}

#[tokio::test]
async fn foreign_agent_cannot_report_on_job() {
    let (base, pool, _dir) = spawn_server().await;
    seed_agent(&pool, "owner").await;
    seed_agent(&pool, "intruder").await;
    let job_id = seed_queued_job(&pool).await;

    // Owner takes the lease
    let response = client()
        .post(format!("{}/agents/poll", base))
        .header("X-SynqX-Client-ID", "owner")
        .header("X-SynqX-API-Key", "secret")
        .json(&json!(["default"]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Intruder tries to report status on it
    let response = client()
        .post(format!("{}/agents/jobs/{}/status", base, job_id))
        .header("X-SynqX-Client-ID", "intruder")
        .header("X-SynqX-API-Key", "secret")
        .json(&json!({
            "status": "failed",
            "message": "hijack",
            "execution_time_ms": 0,
            "total_records": 0,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // Owner's report is accepted
    let response = client()
        .post(format!("{}/agents/jobs/{}/status", base, job_id))
        .header("X-SynqX-Client-ID", "owner")
        .header("X-SynqX-API-Key", "secret")
        .json(&json!({
            "status": "success",
            "message": "done",
            "execution_time_ms": 500,
            "total_records": 10,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "updated");
}

#[tokio::test]
async fn steps_and_logs_endpoints_acknowledge() {
    let (base, pool, _dir) = spawn_server().await;
    seed_agent(&pool, "agent-1").await;
    let job_id = seed_queued_job(&pool).await;

    // Lease first so ownership checks pass
    client()
        .post(format!("{}/agents/poll", base))
        .header("X-SynqX-Client-ID", "agent-1")
        .header("X-SynqX-API-Key", "secret")
        .json(&json!(["default"]))
        .send()
        .await
        .unwrap();

    let response = client()
        .post(format!("{}/agents/jobs/{}/steps", base, job_id))
        .header("X-SynqX-Client-ID", "agent-1")
        .header("X-SynqX-API-Key", "secret")
        .json(&json!({
            "node_id": "ext",
            "status": "running",
            "records_in": 0,
            "records_out": 5,
            "records_filtered": 0,
            "records_error": 0,
            "bytes_processed": 512,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "queued");

    let response = client()
        .post(format!("{}/agents/jobs/{}/logs", base, job_id))
        .header("X-SynqX-Client-ID", "agent-1")
        .header("X-SynqX-API-Key", "secret")
        .json(&json!([
            {"level": "INFO", "message": "stage 1 started", "timestamp": chrono::Utc::now().to_rfc3339(), "node_id": "ext"},
            {"level": "INFO", "message": "stage 1 done", "timestamp": chrono::Utc::now().to_rfc3339()}
        ]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["count"], 2);
}
