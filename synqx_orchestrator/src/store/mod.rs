// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # State Store
//!
//! SQLite-backed persistence for the control plane: schema management, row
//! mapping, and the write helpers shared by the dispatcher, scheduler, and
//! state manager. All queries are parameterized `sqlx` statements; entity
//! JSON columns (`config`, `sla_config`, sample payloads) round-trip
//! through `serde_json`.

pub mod schema;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use synqx_domain::{
    AgentRecord, AgentStatus, EdgeDefinition, Job, JobStatus, NodeDefinition, Pipeline, PipelineVersion, SynqxError,
};

pub use schema::ensure_schema;

/// Opens a pool against `database_url` and ensures the schema exists.
pub async fn connect(database_url: &str) -> Result<SqlitePool, SynqxError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect(database_url)
        .await
        .map_err(|e| SynqxError::Database(format!("Failed to connect to {}: {}", database_url, e)))?;
    ensure_schema(&pool).await?;
    Ok(pool)
}

pub(crate) fn db_err(e: sqlx::Error) -> SynqxError {
    SynqxError::Database(e.to_string())
}

fn parse_datetime(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|dt| dt.with_timezone(&Utc)))
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn json_column<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Option<T> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

/// Maps a `pipelines` row.
pub fn map_pipeline(row: &sqlx::sqlite::SqliteRow) -> Result<Pipeline, SynqxError> {
    Ok(Pipeline {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        schedule_cron: row.get("schedule_cron"),
        schedule_enabled: row.get::<i64, _>("schedule_enabled") != 0,
        schedule_timezone: row.get("schedule_timezone"),
        status: serde_json::from_value(serde_json::Value::String(row.get::<String, _>("status")))
            .map_err(|e| SynqxError::Serialization(format!("bad pipeline status: {}", e)))?,
        published_version_id: row.get("published_version_id"),
        max_parallel_runs: row.get::<i64, _>("max_parallel_runs") as u32,
        max_retries: row.get::<i64, _>("max_retries") as u32,
        retry_strategy: serde_json::from_value(serde_json::Value::String(row.get::<String, _>("retry_strategy")))
            .map_err(|e| SynqxError::Serialization(format!("bad retry strategy: {}", e)))?,
        retry_delay_seconds: row.get::<i64, _>("retry_delay_seconds") as u64,
        execution_timeout_seconds: row.get::<Option<i64>, _>("execution_timeout_seconds").map(|v| v as u64),
        agent_group: row.get("agent_group"),
        priority: row.get::<i64, _>("priority") as i32,
        sla_config: json_column(row.get("sla_config")),
        workspace_id: row.get("workspace_id"),
    })
}

/// Maps a `jobs` row.
pub fn map_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job, SynqxError> {
    let status: String = row.get("status");
    Ok(Job {
        id: row.get("id"),
        pipeline_id: row.get("pipeline_id"),
        pipeline_version_id: row.get("pipeline_version_id"),
        correlation_id: row.get("correlation_id"),
        status: status.parse()?,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        max_retries: row.get::<i64, _>("max_retries") as u32,
        retry_strategy: serde_json::from_value(serde_json::Value::String(row.get::<String, _>("retry_strategy")))
            .map_err(|e| SynqxError::Serialization(format!("bad retry strategy: {}", e)))?,
        retry_delay_seconds: row.get::<i64, _>("retry_delay_seconds") as u64,
        priority: row.get::<i64, _>("priority") as i32,
        queue_name: row.get("queue_name"),
        worker_id: row.get("worker_id"),
        is_backfill: row.get::<i64, _>("is_backfill") != 0,
        backfill_config: json_column(row.get("backfill_config")),
        infra_error: row.get("infra_error"),
        execution_time_ms: row.get("execution_time_ms"),
        workspace_id: row.get("workspace_id"),
        created_at: parse_datetime(row.get("created_at")).unwrap_or_else(Utc::now),
        started_at: parse_datetime(row.get("started_at")),
        completed_at: parse_datetime(row.get("completed_at")),
    })
}

/// Maps an `agents` row.
pub fn map_agent(row: &sqlx::sqlite::SqliteRow) -> Result<AgentRecord, SynqxError> {
    let status: String = row.get("status");
    Ok(AgentRecord {
        id: row.get("id"),
        name: row.get("name"),
        client_id: row.get("client_id"),
        api_key_hash: row.get("api_key_hash"),
        workspace_id: row.get("workspace_id"),
        groups: json_column(row.get("groups")).unwrap_or_default(),
        status: status.parse::<AgentStatus>()?,
        last_heartbeat: parse_datetime(row.get("last_heartbeat")),
        system_info: json_column(row.get("system_info")),
        ip_address: row.get("ip_address"),
        version: row.get("version"),
        hostname: row.get("hostname"),
    })
}

/// Loads a full pipeline version with its nodes and edges.
pub async fn load_version(pool: &SqlitePool, version_id: i64) -> Result<PipelineVersion, SynqxError> {
    let version_row = sqlx::query("SELECT id, pipeline_id, version FROM pipeline_versions WHERE id = ?")
        .bind(version_id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| SynqxError::NotFound(format!("Pipeline version {} not found", version_id)))?;

    let node_rows = sqlx::query("SELECT * FROM pipeline_nodes WHERE pipeline_version_id = ? ORDER BY order_index")
        .bind(version_id)
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    let mut nodes = Vec::with_capacity(node_rows.len());
    for row in &node_rows {
        nodes.push(map_node(row)?);
    }

    let edge_rows = sqlx::query(
        "SELECT from_node_id, to_node_id, edge_type, condition FROM pipeline_edges WHERE pipeline_version_id = ?",
    )
    .bind(version_id)
    .fetch_all(pool)
    .await
    .map_err(db_err)?;
    let edges = edge_rows
        .iter()
        .map(|row| EdgeDefinition {
            from_node_id: row.get("from_node_id"),
            to_node_id: row.get("to_node_id"),
            edge_type: row.get("edge_type"),
            condition: row.get("condition"),
        })
        .collect();

    Ok(PipelineVersion {
        id: version_row.get("id"),
        pipeline_id: version_row.get("pipeline_id"),
        version: version_row.get::<i64, _>("version") as i32,
        nodes,
        edges,
    })
}

fn map_node(row: &sqlx::sqlite::SqliteRow) -> Result<NodeDefinition, SynqxError> {
    let operator_type: String = row.get("operator_type");
    let mut node = NodeDefinition::new(
        row.get::<String, _>("node_id"),
        operator_type.parse()?,
        row.get::<String, _>("operator_class"),
    );
    node.name = row.get("name");
    node.config = json_column(row.get("config")).unwrap_or_default();
    node.order_index = row.get::<i64, _>("order_index") as i32;
    node.source_asset_id = row.get("source_asset_id");
    node.destination_asset_id = row.get("destination_asset_id");
    node.sync_mode = parse_enum(row.get::<String, _>("sync_mode"))?;
    node.write_strategy = parse_enum(row.get::<String, _>("write_strategy"))?;
    node.schema_evolution_policy = parse_enum(row.get::<String, _>("schema_evolution_policy"))?;
    node.data_contract = json_column(row.get("data_contract"));
    node.guardrails = json_column(row.get("guardrails"));
    node.quarantine_asset_id = row.get("quarantine_asset_id");
    node.column_mapping = json_column(row.get("column_mapping"));
    node.is_dynamic = row.get::<i64, _>("is_dynamic") != 0;
    node.mapping_expr = row.get("mapping_expr");
    node.sub_pipeline_id = row.get("sub_pipeline_id");
    node.worker_tag = row.get("worker_tag");
    node.max_retries = row.get::<i64, _>("max_retries") as u32;
    node.retry_strategy = parse_enum(row.get::<String, _>("retry_strategy"))?;
    node.retry_delay_seconds = row.get::<i64, _>("retry_delay_seconds") as u64;
    node.timeout_seconds = row.get::<Option<i64>, _>("timeout_seconds").map(|v| v as u64);
    Ok(node)
}

fn parse_enum<T: serde::de::DeserializeOwned>(raw: String) -> Result<T, SynqxError> {
    serde_json::from_value(serde_json::Value::String(raw))
        .map_err(|e| SynqxError::Serialization(format!("bad enum value: {}", e)))
}

fn enum_str<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

/// Inserts a pipeline. Test and bootstrap helper; pipeline CRUD itself is
/// outside the core.
pub async fn insert_pipeline(pool: &SqlitePool, pipeline: &Pipeline) -> Result<i64, SynqxError> {
    let result = sqlx::query(
        r#"
        INSERT INTO pipelines (
            name, description, schedule_cron, schedule_enabled, schedule_timezone, status,
            max_parallel_runs, max_retries, retry_strategy, retry_delay_seconds,
            execution_timeout_seconds, agent_group, priority, sla_config, workspace_id
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&pipeline.name)
    .bind(&pipeline.description)
    .bind(&pipeline.schedule_cron)
    .bind(pipeline.schedule_enabled as i64)
    .bind(&pipeline.schedule_timezone)
    .bind(enum_str(&pipeline.status))
    .bind(pipeline.max_parallel_runs as i64)
    .bind(pipeline.max_retries as i64)
    .bind(enum_str(&pipeline.retry_strategy))
    .bind(pipeline.retry_delay_seconds as i64)
    .bind(pipeline.execution_timeout_seconds.map(|v| v as i64))
    .bind(&pipeline.agent_group)
    .bind(pipeline.priority as i64)
    .bind(
        pipeline
            .sla_config
            .as_ref()
            .map(|c| serde_json::to_string(c).unwrap_or_default()),
    )
    .bind(pipeline.workspace_id)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(result.last_insert_rowid())
}

/// Inserts a version with its nodes and edges, returning the version id.
pub async fn insert_version(pool: &SqlitePool, version: &PipelineVersion) -> Result<i64, SynqxError> {
    version.validate()?;

    let result = sqlx::query("INSERT INTO pipeline_versions (pipeline_id, version, is_published) VALUES (?, ?, 1)")
        .bind(version.pipeline_id)
        .bind(version.version as i64)
        .execute(pool)
        .await
        .map_err(db_err)?;
    let version_id = result.last_insert_rowid();

    for node in &version.nodes {
        sqlx::query(
            r#"
            INSERT INTO pipeline_nodes (
                pipeline_version_id, node_id, name, operator_type, operator_class, config,
                order_index, source_asset_id, destination_asset_id, sync_mode, write_strategy,
                schema_evolution_policy, data_contract, guardrails, quarantine_asset_id,
                column_mapping, is_dynamic, mapping_expr, sub_pipeline_id, worker_tag,
                max_retries, retry_strategy, retry_delay_seconds, timeout_seconds
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(version_id)
        .bind(&node.node_id)
        .bind(&node.name)
        .bind(node.operator_type.to_string())
        .bind(&node.operator_class)
        .bind(serde_json::to_string(&node.config).unwrap_or_else(|_| "{}".to_string()))
        .bind(node.order_index as i64)
        .bind(node.source_asset_id)
        .bind(node.destination_asset_id)
        .bind(enum_str(&node.sync_mode))
        .bind(enum_str(&node.write_strategy))
        .bind(enum_str(&node.schema_evolution_policy))
        .bind(
            node.data_contract
                .as_ref()
                .map(|c| serde_json::to_string(c).unwrap_or_default()),
        )
        .bind(
            node.guardrails
                .as_ref()
                .map(|g| serde_json::to_string(g).unwrap_or_default()),
        )
        .bind(node.quarantine_asset_id)
        .bind(
            node.column_mapping
                .as_ref()
                .map(|m| serde_json::to_string(m).unwrap_or_default()),
        )
        .bind(node.is_dynamic as i64)
        .bind(&node.mapping_expr)
        .bind(node.sub_pipeline_id)
        .bind(&node.worker_tag)
        .bind(node.max_retries as i64)
        .bind(enum_str(&node.retry_strategy))
        .bind(node.retry_delay_seconds as i64)
        .bind(node.timeout_seconds.map(|v| v as i64))
        .execute(pool)
        .await
        .map_err(db_err)?;
    }

    for edge in &version.edges {
        sqlx::query(
            "INSERT INTO pipeline_edges (pipeline_version_id, from_node_id, to_node_id, edge_type, condition) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(version_id)
        .bind(&edge.from_node_id)
        .bind(&edge.to_node_id)
        .bind(&edge.edge_type)
        .bind(&edge.condition)
        .execute(pool)
        .await
        .map_err(db_err)?;
    }

    Ok(version_id)
}

/// Registers an agent with a pre-hashed API key. Returns the agent id.
pub async fn insert_agent(
    pool: &SqlitePool,
    name: &str,
    client_id: &str,
    api_key_hash: &str,
    workspace_id: Option<i64>,
    groups: &[String],
) -> Result<i64, SynqxError> {
    let result = sqlx::query(
        "INSERT INTO agents (name, client_id, api_key_hash, workspace_id, groups, status) VALUES (?, ?, ?, ?, ?, 'offline')",
    )
    .bind(name)
    .bind(client_id)
    .bind(api_key_hash)
    .bind(workspace_id)
    .bind(serde_json::to_string(groups).unwrap_or_else(|_| "[]".to_string()))
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(result.last_insert_rowid())
}

/// Enqueues a job for a pipeline version, status `queued`, ready to lease.
pub async fn enqueue_job(
    pool: &SqlitePool,
    pipeline: &Pipeline,
    version_id: i64,
    backfill: Option<serde_json::Value>,
) -> Result<i64, SynqxError> {
    let correlation_id = uuid::Uuid::new_v4().to_string();
    let result = sqlx::query(
        r#"
        INSERT INTO jobs (
            pipeline_id, pipeline_version_id, correlation_id, status, max_retries,
            retry_strategy, retry_delay_seconds, priority, queue_name, is_backfill,
            backfill_config, workspace_id
        ) VALUES (?, ?, ?, 'queued', ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(pipeline.id)
    .bind(version_id)
    .bind(&correlation_id)
    .bind(pipeline.max_retries as i64)
    .bind(enum_str(&pipeline.retry_strategy))
    .bind(pipeline.retry_delay_seconds as i64)
    .bind(pipeline.priority as i64)
    .bind(&pipeline.agent_group)
    .bind(backfill.is_some() as i64)
    .bind(backfill.map(|b| b.to_string()))
    .bind(pipeline.workspace_id)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(result.last_insert_rowid())
}

/// Fetches a job by id.
pub async fn get_job(pool: &SqlitePool, job_id: i64) -> Result<Option<Job>, SynqxError> {
    let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?;
    row.as_ref().map(map_job).transpose()
}

/// Fetches a pipeline by id.
pub async fn get_pipeline(pool: &SqlitePool, pipeline_id: i64) -> Result<Option<Pipeline>, SynqxError> {
    let row = sqlx::query("SELECT * FROM pipelines WHERE id = ?")
        .bind(pipeline_id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?;
    row.as_ref().map(map_pipeline).transpose()
}

/// Count of live (non-terminal) jobs for a pipeline; gates `max_parallel_runs`.
pub async fn live_job_count(pool: &SqlitePool, pipeline_id: i64) -> Result<i64, SynqxError> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS n FROM jobs WHERE pipeline_id = ? AND status IN ('pending', 'queued', 'running')",
    )
    .bind(pipeline_id)
    .fetch_one(pool)
    .await
    .map_err(db_err)?;
    Ok(row.get("n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use synqx_domain::{NodeDefinition, OperatorType, PipelineStatus, RetryStrategy};

    async fn test_pool() -> (SqlitePool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/test.db?mode=rwc", dir.path().display());
        let pool = connect(&url).await.unwrap();
        (pool, dir)
    }

    fn sample_pipeline() -> Pipeline {
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
            workspace_id: Some(1),
        }
    }

    #[tokio::test]
    async fn test_version_round_trip() {
        let (pool, _dir) = test_pool().await;
        let mut pipeline = sample_pipeline();
        pipeline.id = insert_pipeline(&pool, &pipeline).await.unwrap();

        let mut extract = NodeDefinition::new("ext", OperatorType::Extract, "memory_read");
        extract.config.insert("table".into(), serde_json::json!("orders"));
        extract.timeout_seconds = Some(120);
        let version = PipelineVersion::new(
            pipeline.id,
            1,
            vec![extract, NodeDefinition::new("load", OperatorType::Load, "memory_write")],
            vec![EdgeDefinition::new("ext", "load").with_condition("inputs['ext'].count > 0")],
        );
        let version_id = insert_version(&pool, &version).await.unwrap();

        let loaded = load_version(&pool, version_id).await.unwrap();
        assert_eq!(loaded.nodes.len(), 2);
        assert_eq!(loaded.edges.len(), 1);
        assert_eq!(loaded.nodes[0].node_id, "ext");
        assert_eq!(loaded.nodes[0].timeout_seconds, Some(120));
        assert_eq!(
            loaded.edges[0].condition.as_deref(),
            Some("inputs['ext'].count > 0")
        );
    }

    #[tokio::test]
    async fn test_enqueue_and_fetch_job() {
        let (pool, _dir) = test_pool().await;
        let mut pipeline = sample_pipeline();
        pipeline.id = insert_pipeline(&pool, &pipeline).await.unwrap();
        let version = PipelineVersion::new(
            pipeline.id,
            1,
            vec![NodeDefinition::new("n", OperatorType::Noop, "noop")],
            vec![],
        );
        let version_id = insert_version(&pool, &version).await.unwrap();

        let job_id = enqueue_job(&pool, &pipeline, version_id, None).await.unwrap();
        let job = get_job(&pool, job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.queue_name.as_deref(), Some("default"));
        assert_eq!(live_job_count(&pool, pipeline.id).await.unwrap(), 1);
    }
}
