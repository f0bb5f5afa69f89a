// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Data Profiler
//!
//! Per-column statistics captured while chunks stream through a node:
//! null counts and, for numeric columns, min/max/mean. Chunk profiles merge
//! into a step-level quality profile attached to telemetry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use synqx_domain::Chunk;

/// Statistics for one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ColumnProfile {
    pub null_count: u64,
    pub dtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    /// Values the mean was computed over; needed to merge means exactly.
    #[serde(default)]
    pub numeric_count: u64,
}

/// A step-level quality profile: column name to statistics.
pub type QualityProfile = BTreeMap<String, ColumnProfile>;

/// Profiles a single chunk.
pub fn profile_chunk(chunk: &Chunk) -> QualityProfile {
    let mut profile = QualityProfile::new();
    if chunk.is_empty() {
        return profile;
    }

    for row in chunk.rows() {
        for (column, value) in row {
            let entry = profile.entry(column.clone()).or_default();
            if value.is_null() {
                entry.null_count += 1;
            }
            if entry.dtype.is_empty() && !value.is_null() {
                entry.dtype = dtype_of(value).to_string();
            }
            if let Some(number) = value.as_f64() {
                if number.is_finite() {
                    entry.min = Some(entry.min.map_or(number, |m| m.min(number)));
                    entry.max = Some(entry.max.map_or(number, |m| m.max(number)));
                    let total = entry.mean.unwrap_or(0.0) * entry.numeric_count as f64 + number;
                    entry.numeric_count += 1;
                    entry.mean = Some(total / entry.numeric_count as f64);
                }
            }
        }
    }

    profile
}

/// Merges a chunk profile into the running step profile.
pub fn merge_profiles(into: &mut QualityProfile, from: QualityProfile) {
    for (column, incoming) in from {
        let entry = into.entry(column).or_default();
        entry.null_count += incoming.null_count;
        if entry.dtype.is_empty() {
            entry.dtype = incoming.dtype;
        }
        entry.min = match (entry.min, incoming.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        entry.max = match (entry.max, incoming.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let combined_count = entry.numeric_count + incoming.numeric_count;
        if combined_count > 0 {
            let total = entry.mean.unwrap_or(0.0) * entry.numeric_count as f64
                + incoming.mean.unwrap_or(0.0) * incoming.numeric_count as f64;
            entry.mean = Some(total / combined_count as f64);
        }
        entry.numeric_count = combined_count;
    }
}

fn dtype_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use synqx_domain::row;

    #[test]
    fn test_profile_numeric_column() {
        let chunk = Chunk::new(vec![
            row(&[("v", json!(1))]),
            row(&[("v", json!(3))]),
            row(&[("v", json!(null))]),
        ]);
        let profile = profile_chunk(&chunk);
        let v = &profile["v"];
        assert_eq!(v.null_count, 1);
        assert_eq!(v.min, Some(1.0));
        assert_eq!(v.max, Some(3.0));
        assert_eq!(v.mean, Some(2.0));
        assert_eq!(v.dtype, "integer");
    }

    #[test]
    fn test_merge_keeps_extremes_and_exact_mean() {
        let a = profile_chunk(&Chunk::new(vec![row(&[("v", json!(1))]), row(&[("v", json!(2))])]));
        let b = profile_chunk(&Chunk::new(vec![row(&[("v", json!(10))])]));
        let mut merged = QualityProfile::new();
        merge_profiles(&mut merged, a);
        merge_profiles(&mut merged, b);
        let v = &merged["v"];
        assert_eq!(v.min, Some(1.0));
        assert_eq!(v.max, Some(10.0));
        assert!((v.mean.unwrap() - 13.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_chunk_profiles_empty() {
        assert!(profile_chunk(&Chunk::empty()).is_empty());
    }
}
