// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Watermark Store
//!
//! Per-`(pipeline, asset)` incremental checkpoint storage. `advance` is
//! monotonic: a new value persists only when it is strictly greater than
//! the stored one under the typed ordering of
//! [`synqx_domain::WatermarkValue`].
//!
//! The store is a trait so the orchestrator can back it with the database
//! while the engine tests and the in-process runner use the memory
//! implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use synqx_domain::{SynqxError, Watermark, WatermarkValue};

/// Incremental checkpoint storage keyed by `(pipeline_id, asset_id)`.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Current checkpoint, if one exists.
    async fn get(&self, pipeline_id: i64, asset_id: i64) -> Result<Option<Watermark>, SynqxError>;

    /// Monotonic advance: persists `value` only if it is strictly greater
    /// than the stored value (or no value exists yet). Returns whether the
    /// store changed.
    async fn advance(
        &self,
        pipeline_id: i64,
        asset_id: i64,
        column: &str,
        value: WatermarkValue,
    ) -> Result<bool, SynqxError>;
}

/// In-memory watermark store.
#[derive(Default)]
pub struct MemoryWatermarkStore {
    entries: Mutex<HashMap<(i64, i64), Watermark>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self, pipeline_id: i64, asset_id: i64) -> Result<Option<Watermark>, SynqxError> {
        Ok(self.entries.lock().get(&(pipeline_id, asset_id)).cloned())
    }

    async fn advance(
        &self,
        pipeline_id: i64,
        asset_id: i64,
        column: &str,
        value: WatermarkValue,
    ) -> Result<bool, SynqxError> {
        let mut entries = self.entries.lock();
        let key = (pipeline_id, asset_id);

        let current = entries.get(&key).map(|wm| wm.last_value.clone());
        if let Some(current) = current {
            if !value.is_after(&current) {
                debug!(
                    pipeline_id,
                    asset_id,
                    new = %value,
                    current = %current,
                    "watermark advance skipped, value not greater"
                );
                return Ok(false);
            }
        }

        debug!(pipeline_id, asset_id, column, value = %value, "watermark advanced");
        entries.insert(
            key,
            Watermark {
                pipeline_id,
                asset_id,
                column_name: column.to_string(),
                last_value: value,
                last_updated: Utc::now(),
            },
        );
        Ok(true)
    }
}
