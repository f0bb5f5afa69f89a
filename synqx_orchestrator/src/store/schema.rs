// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Persisted State Schema
//!
//! Hand-written DDL for the control plane's SQLite store: one table each
//! for pipelines, pipeline versions, nodes, edges, jobs, pipeline runs,
//! step runs, watermarks, agents, ephemeral jobs, and job logs, with the
//! indexes the dispatcher's hot paths rely on.
//!
//! Statements are idempotent (`IF NOT EXISTS`) and applied in order at
//! startup.

use sqlx::SqlitePool;

use synqx_domain::SynqxError;

/// All DDL statements, in dependency order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS pipelines (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        description TEXT,
        schedule_cron TEXT,
        schedule_enabled INTEGER NOT NULL DEFAULT 0,
        schedule_timezone TEXT NOT NULL DEFAULT 'UTC',
        status TEXT NOT NULL DEFAULT 'draft',
        published_version_id INTEGER,
        max_parallel_runs INTEGER NOT NULL DEFAULT 1,
        max_retries INTEGER NOT NULL DEFAULT 3,
        retry_strategy TEXT NOT NULL DEFAULT 'fixed',
        retry_delay_seconds INTEGER NOT NULL DEFAULT 60,
        execution_timeout_seconds INTEGER DEFAULT 3600,
        agent_group TEXT NOT NULL DEFAULT 'internal',
        priority INTEGER NOT NULL DEFAULT 5,
        sla_config TEXT,
        workspace_id INTEGER,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_pipeline_schedule ON pipelines(schedule_enabled, schedule_cron)",
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_versions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        pipeline_id INTEGER NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
        version INTEGER NOT NULL,
        is_published INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        UNIQUE(pipeline_id, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        pipeline_version_id INTEGER NOT NULL REFERENCES pipeline_versions(id) ON DELETE CASCADE,
        node_id TEXT NOT NULL,
        name TEXT NOT NULL,
        operator_type TEXT NOT NULL,
        operator_class TEXT NOT NULL,
        config TEXT NOT NULL DEFAULT '{}',
        order_index INTEGER NOT NULL DEFAULT 0,
        source_asset_id INTEGER,
        destination_asset_id INTEGER,
        sync_mode TEXT NOT NULL DEFAULT 'full_load',
        write_strategy TEXT NOT NULL DEFAULT 'append',
        schema_evolution_policy TEXT NOT NULL DEFAULT 'strict',
        data_contract TEXT,
        guardrails TEXT,
        quarantine_asset_id INTEGER,
        column_mapping TEXT,
        is_dynamic INTEGER NOT NULL DEFAULT 0,
        mapping_expr TEXT,
        sub_pipeline_id INTEGER,
        worker_tag TEXT,
        max_retries INTEGER NOT NULL DEFAULT 3,
        retry_strategy TEXT NOT NULL DEFAULT 'fixed',
        retry_delay_seconds INTEGER NOT NULL DEFAULT 60,
        timeout_seconds INTEGER,
        UNIQUE(pipeline_version_id, node_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_node_operator_type ON pipeline_nodes(operator_type)",
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_edges (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        pipeline_version_id INTEGER NOT NULL REFERENCES pipeline_versions(id) ON DELETE CASCADE,
        from_node_id TEXT NOT NULL,
        to_node_id TEXT NOT NULL,
        edge_type TEXT NOT NULL DEFAULT 'data_flow',
        condition TEXT,
        UNIQUE(pipeline_version_id, from_node_id, to_node_id),
        CHECK(from_node_id != to_node_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        pipeline_id INTEGER NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
        pipeline_version_id INTEGER NOT NULL,
        correlation_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        retry_strategy TEXT NOT NULL DEFAULT 'fixed',
        retry_delay_seconds INTEGER NOT NULL DEFAULT 60,
        priority INTEGER NOT NULL DEFAULT 5,
        queue_name TEXT,
        worker_id TEXT,
        is_backfill INTEGER NOT NULL DEFAULT 0,
        backfill_config TEXT,
        infra_error TEXT,
        execution_time_ms INTEGER,
        workspace_id INTEGER,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        started_at TEXT,
        completed_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_job_status_created ON jobs(status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_job_pipeline_status ON jobs(pipeline_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_job_correlation ON jobs(correlation_id)",
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL UNIQUE REFERENCES jobs(id) ON DELETE CASCADE,
        pipeline_id INTEGER NOT NULL,
        pipeline_version_id INTEGER NOT NULL,
        run_number INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        total_nodes INTEGER NOT NULL DEFAULT 0,
        total_extracted INTEGER NOT NULL DEFAULT 0,
        total_loaded INTEGER NOT NULL DEFAULT 0,
        total_failed INTEGER NOT NULL DEFAULT 0,
        bytes_processed INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        failed_step_id INTEGER,
        started_at TEXT,
        completed_at TEXT,
        duration_seconds REAL,
        UNIQUE(pipeline_id, run_number)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_run_status_started ON pipeline_runs(status, started_at)",
    r#"
    CREATE TABLE IF NOT EXISTS step_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        pipeline_run_id INTEGER NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
        node_id TEXT NOT NULL,
        operator_type TEXT NOT NULL,
        order_index INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        retry_count INTEGER NOT NULL DEFAULT 0,
        records_in INTEGER NOT NULL DEFAULT 0,
        records_out INTEGER NOT NULL DEFAULT 0,
        records_filtered INTEGER NOT NULL DEFAULT 0,
        records_error INTEGER NOT NULL DEFAULT 0,
        bytes_processed INTEGER NOT NULL DEFAULT 0,
        duration_seconds REAL,
        cpu_percent REAL,
        memory_mb REAL,
        sample_data TEXT,
        quality_profile TEXT,
        error_message TEXT,
        error_type TEXT,
        started_at TEXT,
        completed_at TEXT,
        UNIQUE(pipeline_run_id, node_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_step_run_status ON step_runs(pipeline_run_id, status)",
    r#"
    CREATE TABLE IF NOT EXISTS watermarks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        pipeline_id INTEGER NOT NULL,
        asset_id INTEGER NOT NULL,
        column_name TEXT NOT NULL,
        last_value TEXT NOT NULL,
        last_updated TEXT NOT NULL,
        UNIQUE(pipeline_id, asset_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS agents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        client_id TEXT NOT NULL UNIQUE,
        api_key_hash TEXT NOT NULL,
        workspace_id INTEGER,
        groups TEXT NOT NULL DEFAULT '["default"]',
        status TEXT NOT NULL DEFAULT 'offline',
        last_heartbeat TEXT,
        system_info TEXT,
        ip_address TEXT,
        version TEXT,
        hostname TEXT,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ephemeral_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_type TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT '{}',
        connection TEXT,
        agent_group TEXT NOT NULL DEFAULT 'default',
        workspace_id INTEGER,
        status TEXT NOT NULL DEFAULT 'queued',
        worker_id TEXT,
        result_summary TEXT,
        result_sample TEXT,
        result_sample_arrow TEXT,
        execution_time_ms INTEGER,
        error_message TEXT,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        started_at TEXT,
        completed_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_ephemeral_status ON ephemeral_jobs(status, agent_group)",
    r#"
    CREATE TABLE IF NOT EXISTS job_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL,
        step_run_id INTEGER,
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        source TEXT NOT NULL DEFAULT 'agent',
        node_id TEXT,
        timestamp TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs(job_id, timestamp)",
];

/// Applies the schema to a pool. Idempotent.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<(), SynqxError> {
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| SynqxError::Database(format!("Failed to apply schema: {}", e)))?;
    }
    Ok(())
}
