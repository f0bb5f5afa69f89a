// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Persistent Watermark Store
//!
//! Database-backed implementation of the engine's watermark seam. Rows are
//! uniquely keyed on `(pipeline_id, asset_id)`; the monotonic guard runs
//! in Rust against the typed ordering before any write, and the upsert
//! keeps concurrent advances consistent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use synqx_domain::{SynqxError, Watermark, WatermarkValue};
use synqx_engine::WatermarkStore;

use crate::store::db_err;

/// `watermarks`-table-backed store.
pub struct SqlxWatermarkStore {
    pool: SqlitePool,
}

impl SqlxWatermarkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WatermarkStore for SqlxWatermarkStore {
    async fn get(&self, pipeline_id: i64, asset_id: i64) -> Result<Option<Watermark>, SynqxError> {
        let row = sqlx::query(
            "SELECT column_name, last_value, last_updated FROM watermarks WHERE pipeline_id = ? AND asset_id = ?",
        )
        .bind(pipeline_id)
        .bind(asset_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.get("last_value");
        let last_value: WatermarkValue = serde_json::from_str(&raw)?;
        let last_updated = row
            .get::<Option<String>, _>("last_updated")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Some(Watermark {
            pipeline_id,
            asset_id,
            column_name: row.get("column_name"),
            last_value,
            last_updated,
        }))
    }

    async fn advance(
        &self,
        pipeline_id: i64,
        asset_id: i64,
        column: &str,
        value: WatermarkValue,
    ) -> Result<bool, SynqxError> {
        if let Some(existing) = self.get(pipeline_id, asset_id).await? {
            if !value.is_after(&existing.last_value) {
                return Ok(false);
            }
        }

        sqlx::query(
            r#"
            INSERT INTO watermarks (pipeline_id, asset_id, column_name, last_value, last_updated)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(pipeline_id, asset_id) DO UPDATE SET
                column_name = excluded.column_name,
                last_value = excluded.last_value,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(pipeline_id)
        .bind(asset_id)
        .bind(column)
        .bind(serde_json::to_string(&value)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_pool() -> (SqlitePool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/wm.db?mode=rwc", dir.path().display());
        let pool = crate::store::connect(&url).await.unwrap();
        (pool, dir)
    }

    #[tokio::test]
    async fn test_monotonic_advance_persists() {
        let (pool, _dir) = test_pool().await;
        let store = SqlxWatermarkStore::new(pool);

        assert!(store
            .advance(1, 2, "updated_at", WatermarkValue::new(json!("2024-01-02")))
            .await
            .unwrap());
        assert!(!store
            .advance(1, 2, "updated_at", WatermarkValue::new(json!("2024-01-01")))
            .await
            .unwrap());
        assert!(store
            .advance(1, 2, "updated_at", WatermarkValue::new(json!("2024-01-03")))
            .await
            .unwrap());

        let wm = store.get(1, 2).await.unwrap().unwrap();
        assert_eq!(wm.last_value.as_value(), &json!("2024-01-03"));
        assert_eq!(wm.column_name, "updated_at");
    }

    #[tokio::test]
    async fn test_numeric_watermark_round_trip() {
        let (pool, _dir) = test_pool().await;
        let store = SqlxWatermarkStore::new(pool);
        store.advance(5, 6, "id", WatermarkValue::new(json!(1000))).await.unwrap();
        let wm = store.get(5, 6).await.unwrap().unwrap();
        assert_eq!(wm.last_value.as_value(), &json!(1000));
        assert!(!store.advance(5, 6, "id", WatermarkValue::new(json!(999))).await.unwrap());
    }
}
