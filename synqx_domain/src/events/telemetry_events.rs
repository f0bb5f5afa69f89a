// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Telemetry Events
//!
//! Events published by the state manager and telemetry ingress. Subscribers
//! receive them on two kinds of topics: `job_telemetry:<job_id>` for
//! per-job streams and the global [`JOBS_LIST_TOPIC`] for coarse list
//! invalidation.
//!
//! Events are immutable, timestamped at creation, and delivered to
//! subscribers in producer order per `(run, step)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::{JobStatus, PipelineRunStatus, StepStatus};
use crate::value_objects::StepCounters;

/// Global topic carrying coarse job-list change notifications.
pub const JOBS_LIST_TOPIC: &str = "jobs_list";

/// A telemetry occurrence broadcast to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// A step's status or counters changed.
    StepUpdated {
        job_id: i64,
        run_id: i64,
        node_id: String,
        status: StepStatus,
        counters: StepCounters,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A run transitioned or refreshed its aggregates.
    RunUpdated {
        job_id: i64,
        run_id: i64,
        status: PipelineRunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A job changed status; the jobs list should refresh.
    JobUpdated {
        job_id: i64,
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        completed_at: Option<DateTime<Utc>>,
        timestamp: DateTime<Utc>,
    },
    /// An SLA threshold was crossed for a running or missing job.
    SlaBreach {
        pipeline_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<i64>,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// Free-form event payload for forward compatibility.
    Raw { payload: Value, timestamp: DateTime<Utc> },
}

impl TelemetryEvent {
    /// The per-job topic name for a given job id.
    pub fn job_topic(job_id: i64) -> String {
        format!("job_telemetry:{}", job_id)
    }

    /// The job id this event belongs to, when it has one.
    pub fn job_id(&self) -> Option<i64> {
        match self {
            TelemetryEvent::StepUpdated { job_id, .. }
            | TelemetryEvent::RunUpdated { job_id, .. }
            | TelemetryEvent::JobUpdated { job_id, .. } => Some(*job_id),
            TelemetryEvent::SlaBreach { job_id, .. } => *job_id,
            TelemetryEvent::Raw { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_topic_format() {
        assert_eq!(TelemetryEvent::job_topic(42), "job_telemetry:42");
    }

    #[test]
    fn test_event_serialization_tags() {
        let event = TelemetryEvent::JobUpdated {
            job_id: 1,
            status: JobStatus::Success,
            completed_at: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_updated");
        assert_eq!(json["status"], "success");
    }
}
