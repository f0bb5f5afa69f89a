// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Chunk Value Object
//!
//! This module provides the [`Chunk`] value object, the bounded tabular unit
//! that flows between pipeline nodes. A chunk is an ordered list of rows,
//! each row a JSON object. Chunks are immutable values: transformations
//! produce new chunks rather than mutating in place.
//!
//! ## Overview
//!
//! The chunk value object provides:
//!
//! - **Immutable Data**: once created, a chunk's rows cannot be modified
//! - **Row Accounting**: `row_count()` for telemetry counters
//! - **Size Accounting**: `estimated_bytes()` for the data cache's RAM budget
//! - **Column View**: union of column names across rows, first-seen order
//!
//! ## Ownership
//!
//! Chunks are owned by the data cache while they are an upstream's output
//! and not yet consumed. Downstream executors borrow them; spilled chunks
//! are owned by the spill directory and loading back materializes a fresh
//! in-memory copy.
//!
//! ## Thread Safety
//!
//! Chunks are `Send + Sync` and safe to share behind `Arc`; there is no
//! interior mutability.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A row of tabular data: column name to JSON value.
pub type Row = Map<String, Value>;

/// A bounded tabular unit flowing between pipeline nodes.
///
/// This is a Value Object: it has no identity, is compared by value, and is
/// never mutated after construction. The byte estimate is computed once at
/// construction so cache accounting stays cheap and stable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Chunk {
    rows: Vec<Row>,
    #[serde(default)]
    estimated_bytes: u64,
}

impl Chunk {
    /// Creates a chunk from rows.
    pub fn new(rows: Vec<Row>) -> Self {
        let estimated_bytes = rows.iter().map(estimate_row_bytes).sum();
        Self { rows, estimated_bytes }
    }

    /// Creates an empty chunk.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a chunk from arbitrary JSON values, keeping only objects.
    ///
    /// Non-object values are wrapped as `{"value": <v>}` so scalar row
    /// streams (e.g. dynamic fan-out items) stay representable.
    pub fn from_values(values: Vec<Value>) -> Self {
        let rows = values
            .into_iter()
            .map(|v| match v {
                Value::Object(map) => map,
                other => {
                    let mut map = Map::new();
                    map.insert("value".to_string(), other);
                    map
                }
            })
            .collect();
        Self::new(rows)
    }

    /// Gets the rows (immutable view).
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Consumes the chunk, yielding its rows.
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Number of rows in the chunk.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Estimated in-memory footprint in bytes.
    pub fn estimated_bytes(&self) -> u64 {
        self.estimated_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Union of column names across all rows, in first-seen order.
    pub fn columns(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut columns = Vec::new();
        for row in &self.rows {
            for key in row.keys() {
                if seen.insert(key.clone()) {
                    columns.push(key.clone());
                }
            }
        }
        columns
    }

    /// Returns the first `n` rows as a new chunk (sample capture).
    pub fn head(&self, n: usize) -> Chunk {
        Chunk::new(self.rows.iter().take(n).cloned().collect())
    }

    /// Concatenates chunks into one, preserving order.
    pub fn concat(chunks: &[Chunk]) -> Chunk {
        let rows = chunks.iter().flat_map(|c| c.rows.iter().cloned()).collect();
        Chunk::new(rows)
    }
}

/// Rough per-row byte estimate: JSON value payloads plus per-entry overhead.
///
/// Not exact by design; the cache budget only needs a stable, monotone
/// approximation of memory pressure.
fn estimate_row_bytes(row: &Row) -> u64 {
    row.iter()
        .map(|(key, value)| key.len() as u64 + estimate_value_bytes(value) + 16)
        .sum()
}

fn estimate_value_bytes(value: &Value) -> u64 {
    match value {
        Value::Null => 8,
        Value::Bool(_) => 8,
        Value::Number(_) => 16,
        Value::String(s) => s.len() as u64 + 24,
        Value::Array(items) => items.iter().map(estimate_value_bytes).sum::<u64>() + 24,
        Value::Object(map) => map.iter().map(|(k, v)| k.len() as u64 + estimate_value_bytes(v) + 16).sum::<u64>() + 24,
    }
}

/// Builds a row from `(column, value)` pairs. Test and connector helper.
pub fn row(pairs: &[(&str, Value)]) -> Row {
    let mut map = Map::new();
    for (key, value) in pairs {
        map.insert((*key).to_string(), value.clone());
    }
    map
}
