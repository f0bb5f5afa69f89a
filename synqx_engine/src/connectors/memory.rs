// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # In-Memory Connector
//!
//! The one connector the core ships. Tables live in process memory, keyed
//! by a `namespace` from the connection config, so independent tests and
//! quarantine destinations do not interfere. Namespaces are shared
//! process-wide: two connectors built with the same namespace observe each
//! other's writes, matching how two sessions of a real database would.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use synqx_domain::{Chunk, Row, SynqxError, WriteStrategy};

use super::{ColumnSchema, Connector, ConnectorSession, ReadRequest};

const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Table storage for one namespace.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Vec<Row>>>,
}

impl MemoryStore {
    /// Replaces the contents of an asset. Test setup helper.
    pub fn seed(&self, asset: &str, rows: Vec<Row>) {
        self.tables.lock().insert(asset.to_string(), rows);
    }

    /// Snapshot of an asset's rows.
    pub fn snapshot(&self, asset: &str) -> Vec<Row> {
        self.tables.lock().get(asset).cloned().unwrap_or_default()
    }

    pub fn row_count(&self, asset: &str) -> usize {
        self.tables.lock().get(asset).map(Vec::len).unwrap_or(0)
    }

    fn asset_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

fn global_stores() -> &'static Mutex<HashMap<String, Arc<MemoryStore>>> {
    static STORES: OnceLock<Mutex<HashMap<String, Arc<MemoryStore>>>> = OnceLock::new();
    STORES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// In-memory connector over a namespaced table store.
pub struct MemoryConnector {
    namespace: String,
    store: Arc<MemoryStore>,
}

impl MemoryConnector {
    /// Builds a connector from a connection config blob. Recognized keys:
    /// `namespace` (defaults to `"default"`).
    pub fn from_config(config: &Map<String, Value>) -> Result<Arc<dyn Connector>, SynqxError> {
        let namespace = config
            .get("namespace")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        Ok(Arc::new(Self {
            store: Self::store_for(&namespace),
            namespace,
        }))
    }

    /// The shared store backing a namespace. Tests use this to seed source
    /// tables and assert on destination tables.
    pub fn store_for(namespace: &str) -> Arc<MemoryStore> {
        global_stores()
            .lock()
            .entry(namespace.to_string())
            .or_default()
            .clone()
    }

    /// Drops a namespace entirely. Test teardown helper.
    pub fn reset_namespace(namespace: &str) {
        global_stores().lock().remove(namespace);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn connector_type(&self) -> &str {
        "memory"
    }

    async fn session(&self) -> Result<Arc<dyn ConnectorSession>, SynqxError> {
        Ok(Arc::new(MemorySession {
            namespace: self.namespace.clone(),
            store: Arc::clone(&self.store),
        }))
    }
}

struct MemorySession {
    #[allow(dead_code)]
    namespace: String,
    store: Arc<MemoryStore>,
}

impl MemorySession {
    fn require_asset(&self, asset: &str) -> Result<Vec<Row>, SynqxError> {
        let tables = self.store.tables.lock();
        tables
            .get(asset)
            .cloned()
            .ok_or_else(|| SynqxError::NotFound(format!("Asset '{}' does not exist in memory store", asset)))
    }
}

#[async_trait]
impl ConnectorSession for MemorySession {
    async fn read_batch(&self, request: &ReadRequest) -> Result<Vec<Chunk>, SynqxError> {
        let rows = self.require_asset(&request.asset)?;
        let chunk_size = if request.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            request.chunk_size
        };
        // The watermark filter is not pushed down here; the executor
        // re-applies it row-by-row.
        Ok(rows
            .chunks(chunk_size)
            .map(|window| Chunk::new(window.to_vec()))
            .collect())
    }

    async fn write_batch(
        &self,
        chunks: Vec<Chunk>,
        asset: &str,
        mode: WriteStrategy,
        params: &Map<String, Value>,
    ) -> Result<u64, SynqxError> {
        let incoming: Vec<Row> = chunks.into_iter().flat_map(Chunk::into_rows).collect();
        let written = incoming.len() as u64;
        let mut tables = self.store.tables.lock();
        let table = tables.entry(asset.to_string()).or_default();

        match mode {
            WriteStrategy::Overwrite => {
                *table = incoming;
            }
            WriteStrategy::Append => {
                table.extend(incoming);
            }
            WriteStrategy::Upsert => {
                let key = params
                    .get("upsert_key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        SynqxError::Configuration("Upsert strategy requires an 'upsert_key' parameter".to_string())
                    })?;
                for row in incoming {
                    let position = row.get(key).and_then(|row_key| {
                        table.iter().position(|existing| existing.get(key) == Some(row_key))
                    });
                    match position {
                        Some(index) => table[index] = row,
                        None => table.push(row),
                    }
                }
            }
        }

        Ok(written)
    }

    async fn execute_query(&self, query: &str, limit: usize, offset: usize) -> Result<Vec<Row>, SynqxError> {
        // The memory connector has no SQL surface; a "query" is an asset name.
        self.fetch_sample(query.trim(), limit, offset).await
    }

    async fn fetch_sample(&self, asset: &str, limit: usize, offset: usize) -> Result<Vec<Row>, SynqxError> {
        let rows = self.require_asset(asset)?;
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn discover_assets(&self, pattern: Option<&str>) -> Result<Vec<String>, SynqxError> {
        let names = self.store.asset_names();
        Ok(match pattern {
            Some(pattern) if !pattern.is_empty() => {
                names.into_iter().filter(|name| name.contains(pattern)).collect()
            }
            _ => names,
        })
    }

    async fn infer_schema(&self, asset: &str) -> Result<Vec<ColumnSchema>, SynqxError> {
        let rows = self.require_asset(asset)?;
        let mut seen = std::collections::HashSet::new();
        let mut schema = Vec::new();
        for row in rows.iter().take(100) {
            for (name, value) in row {
                if seen.insert(name.clone()) {
                    let data_type = match value {
                        Value::Null => "unknown",
                        Value::Bool(_) => "boolean",
                        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
                        Value::Number(_) => "float",
                        Value::String(_) => "string",
                        Value::Array(_) => "array",
                        Value::Object(_) => "object",
                    };
                    schema.push(ColumnSchema {
                        name: name.clone(),
                        data_type: data_type.to_string(),
                    });
                }
            }
        }
        Ok(schema)
    }

    async fn current_columns(&self, asset: &str) -> Result<Vec<String>, SynqxError> {
        let tables = self.store.tables.lock();
        let Some(rows) = tables.get(asset) else {
            // A destination that does not exist yet accepts any shape.
            return Ok(Vec::new());
        };
        let mut seen = std::collections::HashSet::new();
        let mut columns = Vec::new();
        for row in rows {
            for name in row.keys() {
                if seen.insert(name.clone()) {
                    columns.push(name.clone());
                }
            }
        }
        Ok(columns)
    }

    async fn alter_add_columns(&self, asset: &str, columns: &[String]) -> Result<(), SynqxError> {
        // Rows are schemaless maps; materialize the new columns as nulls so
        // current_columns reflects the alteration.
        let mut tables = self.store.tables.lock();
        let table = tables.entry(asset.to_string()).or_default();
        for row in table.iter_mut() {
            for column in columns {
                row.entry(column.clone()).or_insert(Value::Null);
            }
        }
        Ok(())
    }

    async fn test_connection(&self) -> Result<(), SynqxError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use synqx_domain::row;

    fn connector(namespace: &str) -> Arc<dyn Connector> {
        let mut config = Map::new();
        config.insert("namespace".into(), Value::String(namespace.into()));
        MemoryConnector::from_config(&config).unwrap()
    }

    #[tokio::test]
    async fn test_read_batch_chunks_rows() {
        let store = MemoryConnector::store_for("mem_read");
        store.seed("events", (0..25).map(|i| row(&[("i", json!(i))])).collect());

        let session = connector("mem_read").session().await.unwrap();
        let mut request = ReadRequest::new("events");
        request.chunk_size = 10;
        let chunks = session.read_batch(&request).await.unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(Chunk::row_count).sum::<usize>(), 25);
        MemoryConnector::reset_namespace("mem_read");
    }

    #[tokio::test]
    async fn test_missing_asset_errors() {
        let session = connector("mem_missing").session().await.unwrap();
        let err = session.read_batch(&ReadRequest::new("ghost")).await.unwrap_err();
        assert!(matches!(err, SynqxError::NotFound(_)));
        MemoryConnector::reset_namespace("mem_missing");
    }

    #[tokio::test]
    async fn test_write_strategies() {
        let session = connector("mem_write").session().await.unwrap();
        let chunk = |vals: &[i64]| {
            vec![Chunk::new(
                vals.iter().map(|v| row(&[("id", json!(v)), ("v", json!(v * 10))])).collect(),
            )]
        };

        let written = session
            .write_batch(chunk(&[1, 2]), "t", WriteStrategy::Append, &Map::new())
            .await
            .unwrap();
        assert_eq!(written, 2);
        session
            .write_batch(chunk(&[3]), "t", WriteStrategy::Append, &Map::new())
            .await
            .unwrap();
        assert_eq!(MemoryConnector::store_for("mem_write").row_count("t"), 3);

        session
            .write_batch(chunk(&[9]), "t", WriteStrategy::Overwrite, &Map::new())
            .await
            .unwrap();
        assert_eq!(MemoryConnector::store_for("mem_write").row_count("t"), 1);

        let mut params = Map::new();
        params.insert("upsert_key".into(), Value::String("id".into()));
        session
            .write_batch(chunk(&[9, 10]), "t", WriteStrategy::Upsert, &params)
            .await
            .unwrap();
        assert_eq!(MemoryConnector::store_for("mem_write").row_count("t"), 2);
        MemoryConnector::reset_namespace("mem_write");
    }

    #[tokio::test]
    async fn test_discover_and_schema() {
        let store = MemoryConnector::store_for("mem_meta");
        store.seed("orders", vec![row(&[("id", json!(1)), ("total", json!(9.5))])]);
        store.seed("users", vec![row(&[("name", json!("sam"))])]);

        let session = connector("mem_meta").session().await.unwrap();
        assert_eq!(session.discover_assets(None).await.unwrap(), vec!["orders", "users"]);
        assert_eq!(session.discover_assets(Some("ord")).await.unwrap(), vec!["orders"]);

        let schema = session.infer_schema("orders").await.unwrap();
        assert!(schema.contains(&ColumnSchema {
            name: "id".into(),
            data_type: "integer".into()
        }));
        assert!(schema.contains(&ColumnSchema {
            name: "total".into(),
            data_type: "float".into()
        }));
        MemoryConnector::reset_namespace("mem_meta");
    }

    #[tokio::test]
    async fn test_alter_add_columns_visible() {
        let store = MemoryConnector::store_for("mem_alter");
        store.seed("t", vec![row(&[("a", json!(1))])]);
        let session = connector("mem_alter").session().await.unwrap();
        session.alter_add_columns("t", &["b".to_string()]).await.unwrap();
        let columns = session.current_columns("t").await.unwrap();
        assert!(columns.contains(&"a".to_string()) && columns.contains(&"b".to_string()));
        MemoryConnector::reset_namespace("mem_alter");
    }
}
