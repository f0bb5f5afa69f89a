// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Running record counters for a single step execution.

use serde::{Deserialize, Serialize};

/// Counters accumulated while a node streams chunks.
///
/// These travel with every telemetry update and are summed across dynamic
/// fan-out instances sharing one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StepCounters {
    #[serde(default)]
    pub records_in: u64,
    #[serde(default)]
    pub records_out: u64,
    #[serde(default)]
    pub records_filtered: u64,
    #[serde(default)]
    pub records_error: u64,
    #[serde(default)]
    pub bytes_processed: u64,
}

impl StepCounters {
    /// Adds another counter set into this one (fan-out aggregation).
    pub fn merge(&mut self, other: &StepCounters) {
        self.records_in += other.records_in;
        self.records_out += other.records_out;
        self.records_filtered += other.records_filtered;
        self.records_error += other.records_error;
        self.bytes_processed += other.bytes_processed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_sums_all_fields() {
        let mut a = StepCounters {
            records_in: 1,
            records_out: 2,
            records_filtered: 3,
            records_error: 4,
            bytes_processed: 5,
        };
        let b = StepCounters {
            records_in: 10,
            records_out: 20,
            records_filtered: 30,
            records_error: 40,
            bytes_processed: 50,
        };
        a.merge(&b);
        assert_eq!(a.records_in, 11);
        assert_eq!(a.records_out, 22);
        assert_eq!(a.records_filtered, 33);
        assert_eq!(a.records_error, 44);
        assert_eq!(a.bytes_processed, 55);
    }
}
