// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Execution Entities
//!
//! Entities tracking the lifecycle of pipeline execution: [`Job`] (one
//! requested execution), [`PipelineRun`] (the in-flight execution a job
//! exclusively owns), [`StepRun`] (one node inside a run), [`Watermark`]
//! (incremental checkpoint per pipeline/asset pair), and [`AgentRecord`]
//! (remote worker identity).
//!
//! ## Lifecycle
//!
//! ```text
//! Job:         Pending → (Queued | Running) → Success | Failed | Cancelled
//! PipelineRun: Pending → Initializing → Running → Completed | Failed | Cancelled
//! StepRun:     Pending → Running → Success | Failed | Skipped
//! ```
//!
//! Terminal statuses are sticky; the state manager ignores attempts to move
//! a terminal step back to `Running`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::pipeline::{OperatorType, RetryStrategy};
use crate::value_objects::{StepCounters, WatermarkValue};

/// Queue/lease status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::SynqxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(crate::SynqxError::Validation(format!("Unknown job status: {}", s))),
        }
    }
}

/// One requested execution of a pipeline version.
///
/// A job is the unit the dispatcher leases: `queue_name` scopes it to an
/// agent group, `worker_id` records the lease holder, and exactly one live
/// [`PipelineRun`] belongs to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub pipeline_id: i64,
    pub pipeline_version_id: i64,
    pub correlation_id: String,

    pub status: JobStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_strategy: RetryStrategy,
    #[serde(default)]
    pub retry_delay_seconds: u64,

    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    #[serde(default)]
    pub is_backfill: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backfill_config: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infra_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<i64>,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Lifecycle status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineRunStatus {
    #[default]
    Pending,
    Initializing,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineRunStatus::Completed | PipelineRunStatus::Failed | PipelineRunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineRunStatus::Pending => "pending",
            PipelineRunStatus::Initializing => "initializing",
            PipelineRunStatus::Running => "running",
            PipelineRunStatus::Completed => "completed",
            PipelineRunStatus::Failed => "failed",
            PipelineRunStatus::Cancelled => "cancelled",
        }
    }
}

/// The actual in-flight execution a job owns.
///
/// `run_number` is monotonic per pipeline; the aggregate counters roll up
/// the per-step counters as telemetry arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: i64,
    pub job_id: i64,
    pub pipeline_id: i64,
    pub pipeline_version_id: i64,
    pub run_number: i64,

    pub status: PipelineRunStatus,
    #[serde(default)]
    pub total_nodes: u32,

    #[serde(default)]
    pub total_extracted: i64,
    #[serde(default)]
    pub total_loaded: i64,
    #[serde(default)]
    pub total_failed: i64,
    #[serde(default)]
    pub bytes_processed: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

/// Status of one node execution within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Failed | StepStatus::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = crate::SynqxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "success" => Ok(StepStatus::Success),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            _ => Err(crate::SynqxError::Validation(format!("Unknown step status: {}", s))),
        }
    }
}

/// Execution record of one node within a pipeline run.
///
/// Keyed `(pipeline_run_id, node_id)` with a unique index, which makes step
/// creation idempotent under concurrent telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: i64,
    pub pipeline_run_id: i64,
    pub node_id: String,
    pub operator_type: OperatorType,
    pub order_index: i32,

    pub status: StepStatus,
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub counters: StepCounters,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_profile: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Incremental checkpoint for a `(pipeline, asset)` pair.
///
/// Uniquely keyed; `advance` semantics (strictly-greater writes only) are
/// enforced by the watermark store, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watermark {
    pub pipeline_id: i64,
    pub asset_id: i64,
    pub column_name: String,
    pub last_value: WatermarkValue,
    pub last_updated: DateTime<Utc>,
}

/// Liveness status of a remote agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Busy,
    #[default]
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Busy => "busy",
            AgentStatus::Offline => "offline",
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = crate::SynqxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "online" => Ok(AgentStatus::Online),
            "busy" => Ok(AgentStatus::Busy),
            "offline" => Ok(AgentStatus::Offline),
            _ => Err(crate::SynqxError::Validation(format!("Unknown agent status: {}", s))),
        }
    }
}

/// Remote worker identity as the control plane sees it.
///
/// The raw API key is never stored; only its SHA-256 digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: i64,
    pub name: String,
    pub client_id: String,
    #[serde(skip_serializing)]
    #[serde(default)]
    pub api_key_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<i64>,
    #[serde(default)]
    pub groups: Vec<String>,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_info: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_terminality() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_step_status_parse() {
        let status: StepStatus = "SUCCESS".parse().unwrap();
        assert_eq!(status, StepStatus::Success);
        assert!("bogus".parse::<StepStatus>().is_err());
    }

    #[test]
    fn test_step_status_wire_names() {
        assert_eq!(serde_json::to_value(StepStatus::Skipped).unwrap(), "skipped");
        assert_eq!(serde_json::to_value(PipelineRunStatus::Initializing).unwrap(), "initializing");
    }
}
