// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # State Sink
//!
//! The seam between the execution engine and lifecycle persistence. A
//! [`StateSink`] is bound to one pipeline run; the executor and runner
//! report progress through it without knowing whether the other side is a
//! database (orchestrator), an HTTP client with telemetry throttling
//! (remote agent), or a test recorder.
//!
//! ## Semantics
//!
//! - `ensure_step` is idempotent per node; concurrent calls for the same
//!   node must resolve to one step record.
//! - Terminal step statuses (Success/Failed/Skipped) are sticky: a later
//!   `Running` update for a terminal step is ignored.
//! - `is_cancelled` is the cooperative cancellation flag the runner checks
//!   between chunks, retries, and layer transitions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use synqx_domain::{OperatorType, StepCounters, StepStatus, SynqxError};

use crate::metrics::ExecutionMetrics;

/// One progress report for a step.
#[derive(Debug, Clone, Default)]
pub struct StepProgress {
    pub node_id: String,
    pub status: StepStatus,
    pub counters: StepCounters,
    pub retry_count: u32,
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
    pub sample_data: Option<Value>,
    pub quality_profile: Option<Value>,
    /// `(error_type, error_message)` when the step failed.
    pub error: Option<(String, String)>,
}

impl StepProgress {
    pub fn running(node_id: &str, counters: StepCounters) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: StepStatus::Running,
            counters,
            ..Default::default()
        }
    }
}

/// Lifecycle reporting seam bound to one pipeline run.
#[async_trait]
pub trait StateSink: Send + Sync {
    /// Marks the run as actually executing with its node count.
    async fn run_started(&self, total_nodes: u32) -> Result<(), SynqxError>;

    /// Creates the step record if it does not exist yet. Idempotent per
    /// `(run, node_id)`.
    async fn ensure_step(&self, node_id: &str, operator_type: OperatorType, order_index: i32)
        -> Result<(), SynqxError>;

    /// Persists a progress report and publishes telemetry.
    async fn update_step(&self, progress: StepProgress) -> Result<(), SynqxError>;

    /// Marks a node skipped by branch filtering.
    async fn mark_step_skipped(&self, node_id: &str, reason: &str) -> Result<(), SynqxError>;

    /// Terminal success for the whole run.
    async fn complete_run(&self, metrics: &ExecutionMetrics) -> Result<(), SynqxError>;

    /// Terminal failure for the whole run.
    async fn fail_run(&self, error: &SynqxError, failed_node: Option<&str>) -> Result<(), SynqxError>;

    /// Cooperative cancellation flag, checked between chunks, retry waits,
    /// and layer transitions.
    fn is_cancelled(&self) -> bool;
}

/// Recorded step state inside [`MemoryStateSink`].
#[derive(Debug, Clone, Default)]
pub struct RecordedStep {
    pub operator_type: Option<OperatorType>,
    pub order_index: i32,
    pub status: StepStatus,
    pub counters: StepCounters,
    pub retry_count: u32,
    pub sample_data: Option<Value>,
    pub quality_profile: Option<Value>,
    pub error: Option<(String, String)>,
    pub updates_seen: u32,
}

/// Recorded run outcome inside [`MemoryStateSink`].
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RecordedRunOutcome {
    #[default]
    InFlight,
    Completed,
    Failed {
        error: String,
        failed_node: Option<String>,
    },
}

#[derive(Default)]
struct MemoryStateInner {
    total_nodes: u32,
    steps: HashMap<String, RecordedStep>,
    outcome: RecordedRunOutcome,
}

/// In-process state sink used by engine tests and in-process execution.
#[derive(Default)]
pub struct MemoryStateSink {
    inner: Mutex<MemoryStateInner>,
    cancelled: AtomicBool,
}

impl MemoryStateSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the cooperative cancellation flag.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn step(&self, node_id: &str) -> Option<RecordedStep> {
        self.inner.lock().steps.get(node_id).cloned()
    }

    pub fn steps(&self) -> HashMap<String, RecordedStep> {
        self.inner.lock().steps.clone()
    }

    pub fn outcome(&self) -> RecordedRunOutcome {
        self.inner.lock().outcome.clone()
    }

    pub fn total_nodes(&self) -> u32 {
        self.inner.lock().total_nodes
    }
}

#[async_trait]
impl StateSink for MemoryStateSink {
    async fn run_started(&self, total_nodes: u32) -> Result<(), SynqxError> {
        self.inner.lock().total_nodes = total_nodes;
        Ok(())
    }

    async fn ensure_step(
        &self,
        node_id: &str,
        operator_type: OperatorType,
        order_index: i32,
    ) -> Result<(), SynqxError> {
        let mut inner = self.inner.lock();
        let entry = inner.steps.entry(node_id.to_string()).or_default();
        if entry.operator_type.is_none() {
            entry.operator_type = Some(operator_type);
            entry.order_index = order_index;
        }
        Ok(())
    }

    async fn update_step(&self, progress: StepProgress) -> Result<(), SynqxError> {
        let mut inner = self.inner.lock();
        let entry = inner.steps.entry(progress.node_id.clone()).or_default();
        entry.updates_seen += 1;

        // Terminal statuses are sticky
        if entry.status.is_terminal() && !progress.status.is_terminal() {
            return Ok(());
        }

        entry.status = progress.status;
        // Counters are cumulative: a terminal report with lower values
        // (e.g. a failure before any chunk) never erases observed progress
        entry.counters = StepCounters {
            records_in: entry.counters.records_in.max(progress.counters.records_in),
            records_out: entry.counters.records_out.max(progress.counters.records_out),
            records_filtered: entry.counters.records_filtered.max(progress.counters.records_filtered),
            records_error: entry.counters.records_error.max(progress.counters.records_error),
            bytes_processed: entry.counters.bytes_processed.max(progress.counters.bytes_processed),
        };
        entry.retry_count = entry.retry_count.max(progress.retry_count);
        if progress.sample_data.is_some() {
            entry.sample_data = progress.sample_data;
        }
        if progress.quality_profile.is_some() {
            entry.quality_profile = progress.quality_profile;
        }
        if progress.error.is_some() {
            entry.error = progress.error;
        }
        Ok(())
    }

    async fn mark_step_skipped(&self, node_id: &str, _reason: &str) -> Result<(), SynqxError> {
        let mut inner = self.inner.lock();
        let entry = inner.steps.entry(node_id.to_string()).or_default();
        if !entry.status.is_terminal() {
            entry.status = StepStatus::Skipped;
        }
        Ok(())
    }

    async fn complete_run(&self, _metrics: &ExecutionMetrics) -> Result<(), SynqxError> {
        self.inner.lock().outcome = RecordedRunOutcome::Completed;
        Ok(())
    }

    async fn fail_run(&self, error: &SynqxError, failed_node: Option<&str>) -> Result<(), SynqxError> {
        self.inner.lock().outcome = RecordedRunOutcome::Failed {
            error: error.to_string(),
            failed_node: failed_node.map(str::to_string),
        };
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_terminal_status_is_sticky() {
        let sink = MemoryStateSink::new();
        sink.ensure_step("n", OperatorType::Transform, 0).await.unwrap();
        sink.update_step(StepProgress {
            node_id: "n".into(),
            status: StepStatus::Success,
            ..Default::default()
        })
        .await
        .unwrap();
        sink.update_step(StepProgress::running("n", StepCounters::default()))
            .await
            .unwrap();
        assert_eq!(sink.step("n").unwrap().status, StepStatus::Success);
    }

    #[tokio::test]
    async fn test_ensure_step_is_idempotent() {
        let sink = MemoryStateSink::new();
        sink.ensure_step("n", OperatorType::Extract, 3).await.unwrap();
        sink.ensure_step("n", OperatorType::Load, 9).await.unwrap();
        let step = sink.step("n").unwrap();
        assert_eq!(step.operator_type, Some(OperatorType::Extract));
        assert_eq!(step.order_index, 3);
        assert_eq!(sink.steps().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_flag() {
        let sink = MemoryStateSink::new();
        assert!(!sink.is_cancelled());
        sink.cancel();
        assert!(sink.is_cancelled());
    }
}
