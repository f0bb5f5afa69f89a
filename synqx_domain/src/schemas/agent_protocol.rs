// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Agent ↔ Dispatcher Wire Schemas
//!
//! Request and response bodies of the HTTP/JSON protocol between remote
//! agents and the dispatcher. These types are shared by both sides so the
//! wire format has exactly one definition.
//!
//! Credentials travel in headers (`X-SynqX-Client-ID`, `X-SynqX-API-Key`),
//! never in these bodies.
//!
//! ## Poll Response Shape
//!
//! A poll returns one of three shapes, all expressed by [`PollResponse`]:
//!
//! - a pipeline job lease: `{job, dag, connections, config}`
//! - an ephemeral task: `{ephemeral: {...}}`
//! - nothing available: `{"job": null}`

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::{AgentStatus, ConnectionPayload, PipelineVersion, StepStatus};
use crate::services::datetime_serde;
use crate::value_objects::StepCounters;

/// Resource snapshot attached to heartbeats.
///
/// `runtime` serializes under the legacy wire name `python` so older
/// control planes keep accepting heartbeats from this agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SystemInfo {
    #[serde(default)]
    pub os: String,
    #[serde(default, rename = "python")]
    pub runtime: String,
    #[serde(default)]
    pub cpu_usage: f32,
    #[serde(default)]
    pub memory_usage: f32,
    #[serde(default)]
    pub arch: String,
}

/// `POST /agents/heartbeat` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    pub status: AgentStatus,
    #[serde(default)]
    pub system_info: SystemInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// Identity of a leased job inside a poll response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: i64,
    pub pipeline_id: i64,
    pub run_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

/// Execution limits accompanying a lease.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DispatchConfig {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Kind of short interactive task handed to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EphemeralJobKind {
    Explorer,
    Metadata,
    Test,
    File,
    System,
}

/// An ephemeral task lease inside a poll response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeralAssignment {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: EphemeralJobKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionPayload>,
}

/// `POST /agents/poll` response.
///
/// `job` is always present on the wire (`null` when nothing was leased) so
/// agents can distinguish "no work" from a malformed body.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PollResponse {
    pub job: Option<JobHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dag: Option<PipelineVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<HashMap<String, ConnectionPayload>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<DispatchConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<EphemeralAssignment>,
}

impl PollResponse {
    /// The "nothing available" response: `{"job": null}`.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_job(
        job: JobHandle,
        dag: PipelineVersion,
        connections: HashMap<String, ConnectionPayload>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            job: Some(job),
            dag: Some(dag),
            connections: Some(connections),
            config: Some(config),
            ephemeral: None,
        }
    }

    pub fn with_ephemeral(assignment: EphemeralAssignment) -> Self {
        Self {
            ephemeral: Some(assignment),
            ..Self::default()
        }
    }
}

/// `POST /agents/jobs/{id}/status` body (terminal callback).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusUpdate {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub execution_time_ms: i64,
    #[serde(default)]
    pub total_records: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<i64>,
    #[serde(with = "datetime_serde")]
    pub timestamp: DateTime<Utc>,
}

/// `POST /agents/jobs/{id}/steps` body (step telemetry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepUpdate {
    pub node_id: String,
    pub status: StepStatus,
    #[serde(flatten)]
    pub counters: StepCounters,
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
}

impl StepUpdate {
    /// The deduplication identity of this update: everything except
    /// transient resource samples. Two updates with equal identity are
    /// duplicates regardless of when they were sent.
    pub fn dedup_identity(&self) -> (String, StepStatus, StepCounters, Option<String>) {
        (
            self.node_id.clone(),
            self.status,
            self.counters,
            self.error_message.clone(),
        )
    }
}

/// One entry of a `POST /agents/jobs/{id}/logs` batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub level: String,
    pub message: String,
    #[serde(with = "datetime_serde")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// `POST /agents/jobs/ephemeral/{id}/status` body.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EphemeralResultUpdate {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_sample: Option<Value>,
    /// Base64-encoded Arrow IPC stream of the sample rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_sample_arrow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_poll_serializes_job_null() {
        let json = serde_json::to_value(PollResponse::none()).unwrap();
        assert!(json.get("job").is_some());
        assert!(json["job"].is_null());
        assert!(json.get("dag").is_none());
    }

    #[test]
    fn test_step_update_flattens_counters() {
        let update = StepUpdate {
            node_id: "extract".into(),
            status: StepStatus::Running,
            counters: StepCounters {
                records_out: 7,
                ..Default::default()
            },
            cpu_percent: None,
            memory_mb: None,
            sample_data: None,
            quality_profile: None,
            error_message: None,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["records_out"], 7);
        assert_eq!(json["status"], "running");
    }

    #[test]
    fn test_dedup_identity_ignores_resource_samples() {
        let mut a = StepUpdate {
            node_id: "n".into(),
            status: StepStatus::Running,
            counters: StepCounters::default(),
            cpu_percent: Some(10.0),
            memory_mb: Some(100.0),
            sample_data: None,
            quality_profile: None,
            error_message: None,
        };
        let mut b = a.clone();
        b.cpu_percent = Some(90.0);
        b.memory_mb = Some(900.0);
        assert_eq!(a.dedup_identity(), b.dedup_identity());

        b.counters.records_out = 1;
        assert_ne!(a.dedup_identity(), b.dedup_identity());
        a.counters.records_out = 1;
        assert_eq!(a.dedup_identity(), b.dedup_identity());
    }

    #[test]
    fn test_ephemeral_kind_wire_names() {
        assert_eq!(serde_json::to_value(EphemeralJobKind::Explorer).unwrap(), "explorer");
        let parsed: EphemeralJobKind = serde_json::from_value(serde_json::json!("system")).unwrap();
        assert_eq!(parsed, EphemeralJobKind::System);
    }
}
