// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Run-level execution metrics accumulated by the parallel runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate counters for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionMetrics {
    pub total_nodes: u32,
    pub completed_nodes: u32,
    pub failed_nodes: u32,
    pub skipped_nodes: u32,
    pub total_records_processed: u64,
    pub bytes_processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_end: Option<DateTime<Utc>>,
}

impl ExecutionMetrics {
    pub fn started(total_nodes: u32) -> Self {
        Self {
            total_nodes,
            execution_start: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn finish(&mut self) {
        self.execution_end = Some(Utc::now());
    }

    /// Wall-clock duration, zero until the run both started and ended.
    pub fn duration_seconds(&self) -> f64 {
        match (self.execution_start, self.execution_end) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as f64 / 1000.0,
            _ => 0.0,
        }
    }

    /// Records per second over the run's duration.
    pub fn throughput_records_per_sec(&self) -> f64 {
        let secs = self.duration_seconds();
        if secs > 0.0 {
            self.total_records_processed as f64 / secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_requires_both_endpoints() {
        let mut metrics = ExecutionMetrics::started(3);
        assert_eq!(metrics.duration_seconds(), 0.0);
        metrics.finish();
        assert!(metrics.duration_seconds() >= 0.0);
    }

    #[test]
    fn test_throughput_zero_when_instantaneous() {
        let metrics = ExecutionMetrics::default();
        assert_eq!(metrics.throughput_records_per_sec(), 0.0);
    }
}
