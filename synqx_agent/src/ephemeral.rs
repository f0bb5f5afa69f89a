// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Ephemeral Job Handlers
//!
//! Short interactive tasks executed synchronously between polls:
//!
//! - `explorer`: ad-hoc query or sample, result shipped as base64 Arrow
//!   IPC with a JSON fallback
//! - `metadata`: asset discovery and schema inference
//! - `test`: connection verification
//! - `file`: list/mkdir/read/write/delete strictly under the sandbox
//! - `system`: runtime-environment initialize/install with the package
//!   allow-list
//!
//! Handlers never panic the loop: every failure folds into a `failed`
//! result update with the error message attached.

use std::sync::Arc;

use base64::Engine as _;
use serde_json::{json, Value};
use tracing::info;

use synqx_domain::schemas::{EphemeralAssignment, EphemeralJobKind, EphemeralResultUpdate};
use synqx_domain::{Row, SynqxError};
use synqx_engine::connectors::ConnectorSession;
use synqx_engine::ConnectorRegistry;

use crate::config::AgentSettings;
use crate::sandbox::{resolve_sandboxed, validate_package_name};
use crate::system::DirRuntimeEnvironments;

/// Executes ephemeral assignments against the agent's sandbox and
/// connector registry.
pub struct EphemeralProcessor {
    settings: AgentSettings,
    registry: Arc<ConnectorRegistry>,
}

impl EphemeralProcessor {
    pub fn new(settings: AgentSettings, registry: Arc<ConnectorRegistry>) -> Self {
        Self { settings, registry }
    }

    /// Runs one assignment to a terminal result update.
    pub async fn process(&self, assignment: &EphemeralAssignment) -> EphemeralResultUpdate {
        let started = std::time::Instant::now();
        info!(id = assignment.id, kind = ?assignment.kind, "processing ephemeral job");

        let mut update = match self.dispatch(assignment).await {
            Ok(update) => update,
            Err(e) => EphemeralResultUpdate {
                status: "failed".to_string(),
                error_message: Some(e.to_string()),
                ..Default::default()
            },
        };
        update.execution_time_ms = Some(started.elapsed().as_millis() as i64);
        update
    }

    async fn dispatch(&self, assignment: &EphemeralAssignment) -> Result<EphemeralResultUpdate, SynqxError> {
        match assignment.kind {
            EphemeralJobKind::Explorer => self.explorer(assignment).await,
            EphemeralJobKind::Metadata => self.metadata(assignment).await,
            EphemeralJobKind::Test => self.test(assignment).await,
            EphemeralJobKind::File => self.file(assignment),
            EphemeralJobKind::System => self.system(assignment),
        }
    }

    async fn session(&self, assignment: &EphemeralAssignment) -> Result<Arc<dyn ConnectorSession>, SynqxError> {
        let connection = assignment
            .connection
            .as_ref()
            .ok_or_else(|| SynqxError::Configuration("Connection metadata missing".to_string()))?;
        let connector = self.registry.create(&connection.connector_type, &connection.config)?;
        connector.session().await
    }

    async fn explorer(&self, assignment: &EphemeralAssignment) -> Result<EphemeralResultUpdate, SynqxError> {
        let session = self.session(assignment).await?;
        let payload = &assignment.payload;
        let query = payload
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| SynqxError::Configuration("Explorer payload has no query".to_string()))?;
        let limit = payload.get("limit").and_then(Value::as_u64).unwrap_or(100) as usize;
        let offset = payload.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;

        let rows = match session.execute_query(query, limit, offset).await {
            Ok(rows) => rows,
            // Connectors without a query surface fall back to sampling
            Err(SynqxError::NotFound(_)) => session.fetch_sample(query, limit, offset).await?,
            Err(e) => return Err(e),
        };

        let mut update = EphemeralResultUpdate {
            status: "success".to_string(),
            result_summary: Some(json!({ "count": rows.len() })),
            ..Default::default()
        };
        if !rows.is_empty() {
            match encode_arrow_ipc(&rows) {
                Ok(encoded) => update.result_sample_arrow = Some(encoded),
                Err(_) => {
                    let sample: Vec<Value> = rows.iter().take(1000).cloned().map(Value::Object).collect();
                    update.result_sample = Some(json!({ "rows": sample }));
                }
            }
        }
        Ok(update)
    }

    async fn metadata(&self, assignment: &EphemeralAssignment) -> Result<EphemeralResultUpdate, SynqxError> {
        let session = self.session(assignment).await?;
        let payload = &assignment.payload;

        let sample = match payload.get("task_type").and_then(Value::as_str) {
            Some("discover_assets") => {
                let pattern = payload.get("pattern").and_then(Value::as_str);
                json!({ "assets": session.discover_assets(pattern).await? })
            }
            _ => {
                let asset = payload
                    .get("asset")
                    .and_then(Value::as_str)
                    .ok_or_else(|| SynqxError::Configuration("Metadata payload has no asset".to_string()))?;
                json!({ "schema": session.infer_schema(asset).await? })
            }
        };

        Ok(EphemeralResultUpdate {
            status: "success".to_string(),
            result_sample: Some(sample),
            ..Default::default()
        })
    }

    async fn test(&self, assignment: &EphemeralAssignment) -> Result<EphemeralResultUpdate, SynqxError> {
        let session = self.session(assignment).await?;
        session.test_connection().await?;
        Ok(EphemeralResultUpdate {
            status: "success".to_string(),
            result_summary: Some(json!({ "message": "Verification Successful" })),
            ..Default::default()
        })
    }

    fn file(&self, assignment: &EphemeralAssignment) -> Result<EphemeralResultUpdate, SynqxError> {
        let payload = &assignment.payload;
        let action = payload
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| SynqxError::Configuration("File payload has no action".to_string()))?;
        let requested = payload.get("path").and_then(Value::as_str).unwrap_or("");
        let path = resolve_sandboxed(&self.settings.sandbox_dir(), requested)?;

        let mut update = EphemeralResultUpdate {
            status: "success".to_string(),
            ..Default::default()
        };

        match action {
            "list" => {
                let mut files = Vec::new();
                if path.is_dir() {
                    for entry in std::fs::read_dir(&path).map_err(SynqxError::from)? {
                        let entry = entry.map_err(SynqxError::from)?;
                        files.push(entry.file_name().to_string_lossy().to_string());
                    }
                    files.sort();
                }
                update.result_sample = Some(json!({ "files": files }));
            }
            "mkdir" => {
                std::fs::create_dir_all(&path).map_err(SynqxError::from)?;
            }
            "read" => {
                let content = std::fs::read(&path).map_err(SynqxError::from)?;
                update.result_sample = Some(json!({
                    "content": base64::engine::general_purpose::STANDARD.encode(content)
                }));
            }
            "write" => {
                let encoded = payload
                    .get("content")
                    .and_then(Value::as_str)
                    .ok_or_else(|| SynqxError::Configuration("File write has no content".to_string()))?;
                let content = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| SynqxError::Validation(format!("Invalid base64 content: {}", e)))?;
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(SynqxError::from)?;
                }
                std::fs::write(&path, content).map_err(SynqxError::from)?;
            }
            "delete" => {
                if path.is_dir() {
                    std::fs::remove_dir_all(&path).map_err(SynqxError::from)?;
                } else {
                    std::fs::remove_file(&path).map_err(SynqxError::from)?;
                }
            }
            other => {
                return Err(SynqxError::Configuration(format!("Unknown file action '{}'", other)));
            }
        }

        Ok(update)
    }

    fn system(&self, assignment: &EphemeralAssignment) -> Result<EphemeralResultUpdate, SynqxError> {
        let payload = &assignment.payload;
        let action = payload
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| SynqxError::Configuration("System payload has no action".to_string()))?;
        let language = payload
            .get("language")
            .and_then(Value::as_str)
            .ok_or_else(|| SynqxError::Configuration("System payload has no language".to_string()))?;
        let connection_id = assignment.connection.as_ref().map(|c| c.id).unwrap_or(0);

        let envs = DirRuntimeEnvironments::new(&self.settings);
        let mut update = EphemeralResultUpdate {
            status: "success".to_string(),
            ..Default::default()
        };

        match action {
            "initialize" => {
                let dir = envs.initialize(connection_id, language)?;
                update.result_summary = Some(json!({ "environment": dir.display().to_string() }));
            }
            "install" => {
                let package = payload
                    .get("package")
                    .and_then(Value::as_str)
                    .ok_or_else(|| SynqxError::Configuration("System install has no package".to_string()))?;
                validate_package_name(package)?;
                envs.record_install(connection_id, language, package)?;
                update.result_summary = Some(json!({ "output": format!("recorded {}", package) }));
            }
            other => {
                return Err(SynqxError::Configuration(format!("Unknown system action '{}'", other)));
            }
        }

        Ok(update)
    }
}

/// Encodes rows as a base64 Arrow IPC stream for the explorer response.
fn encode_arrow_ipc(rows: &[Row]) -> Result<String, SynqxError> {
    use arrow::json::reader::infer_json_schema_from_iterator;
    use arrow::json::ReaderBuilder;

    let values = rows.iter().map(|row| Ok(Value::Object(row.clone())));
    let schema = infer_json_schema_from_iterator(values)
        .map_err(|e| SynqxError::Serialization(format!("Arrow schema inference failed: {}", e)))?;
    let schema = std::sync::Arc::new(schema);

    let mut decoder = ReaderBuilder::new(std::sync::Arc::clone(&schema))
        .build_decoder()
        .map_err(|e| SynqxError::Serialization(format!("Arrow decoder failed: {}", e)))?;
    decoder
        .serialize(rows)
        .map_err(|e| SynqxError::Serialization(format!("Arrow serialization failed: {}", e)))?;
    let batch = decoder
        .flush()
        .map_err(|e| SynqxError::Serialization(format!("Arrow flush failed: {}", e)))?
        .ok_or_else(|| SynqxError::Serialization("Arrow produced no batch".to_string()))?;

    let mut buffer = Vec::new();
    {
        let mut writer = arrow::ipc::writer::StreamWriter::try_new(&mut buffer, &schema)
            .map_err(|e| SynqxError::Serialization(format!("Arrow IPC writer failed: {}", e)))?;
        writer
            .write(&batch)
            .map_err(|e| SynqxError::Serialization(format!("Arrow IPC write failed: {}", e)))?;
        writer
            .finish()
            .map_err(|e| SynqxError::Serialization(format!("Arrow IPC finish failed: {}", e)))?;
    }
    Ok(base64::engine::general_purpose::STANDARD.encode(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use synqx_domain::ConnectionPayload;
    use synqx_engine::connectors::memory::MemoryConnector;

    fn processor(home: &std::path::Path) -> EphemeralProcessor {
        let settings = AgentSettings {
            api_url: "http://localhost:8000".into(),
            client_id: "agent".into(),
            api_key: "key".into(),
            tags: vec!["default".into()],
            max_workers: 0,
            home_dir: home.to_path_buf(),
        };
        EphemeralProcessor::new(settings, Arc::new(ConnectorRegistry::with_builtins()))
    }

    fn memory_connection(namespace: &str) -> ConnectionPayload {
        let mut config = Map::new();
        config.insert("namespace".into(), json!(namespace));
        ConnectionPayload {
            id: 1,
            connector_type: "memory".into(),
            config,
        }
    }

    fn assignment(kind: EphemeralJobKind, payload: Value, connection: Option<ConnectionPayload>) -> EphemeralAssignment {
        EphemeralAssignment {
            id: 1,
            kind,
            payload,
            connection,
        }
    }

    #[tokio::test]
    async fn test_explorer_returns_sample() {
        let home = tempfile::tempdir().unwrap();
        MemoryConnector::store_for("eph_explorer").seed(
            "orders",
            (0..5).map(|i| synqx_domain::row(&[("id", json!(i))])).collect(),
        );

        let update = processor(home.path())
            .process(&assignment(
                EphemeralJobKind::Explorer,
                json!({"query": "orders", "limit": 3}),
                Some(memory_connection("eph_explorer")),
            ))
            .await;

        assert_eq!(update.status, "success");
        assert_eq!(update.result_summary, Some(json!({"count": 3})));
        assert!(update.result_sample_arrow.is_some() || update.result_sample.is_some());
        MemoryConnector::reset_namespace("eph_explorer");
    }

    #[tokio::test]
    async fn test_missing_connection_fails_cleanly() {
        let home = tempfile::tempdir().unwrap();
        let update = processor(home.path())
            .process(&assignment(EphemeralJobKind::Test, json!({}), None))
            .await;
        assert_eq!(update.status, "failed");
        assert!(update.error_message.unwrap().contains("Connection metadata missing"));
    }

    #[tokio::test]
    async fn test_file_write_read_list_delete_under_sandbox() {
        let home = tempfile::tempdir().unwrap();
        let processor = processor(home.path());
        let content = base64::engine::general_purpose::STANDARD.encode("hello");

        let write = processor
            .process(&assignment(
                EphemeralJobKind::File,
                json!({"action": "write", "path": "reports/a.txt", "content": content}),
                None,
            ))
            .await;
        assert_eq!(write.status, "success");

        let read = processor
            .process(&assignment(
                EphemeralJobKind::File,
                json!({"action": "read", "path": "reports/a.txt"}),
                None,
            ))
            .await;
        assert_eq!(read.status, "success");
        let encoded = read.result_sample.unwrap()["content"].as_str().unwrap().to_string();
        assert_eq!(
            base64::engine::general_purpose::STANDARD.decode(encoded).unwrap(),
            b"hello"
        );

        let list = processor
            .process(&assignment(
                EphemeralJobKind::File,
                json!({"action": "list", "path": "reports"}),
                None,
            ))
            .await;
        assert_eq!(list.result_sample.unwrap()["files"], json!(["a.txt"]));

        let delete = processor
            .process(&assignment(
                EphemeralJobKind::File,
                json!({"action": "delete", "path": "reports/a.txt"}),
                None,
            ))
            .await;
        assert_eq!(delete.status, "success");
    }

    #[tokio::test]
    async fn test_system_install_rejects_shell_metacharacters() {
        let home = tempfile::tempdir().unwrap();
        let processor = processor(home.path());

        processor
            .process(&assignment(
                EphemeralJobKind::System,
                json!({"action": "initialize", "language": "python"}),
                Some(memory_connection("eph_system")),
            ))
            .await;

        let update = processor
            .process(&assignment(
                EphemeralJobKind::System,
                json!({"action": "install", "language": "python", "package": "evil; rm -rf /"}),
                Some(memory_connection("eph_system")),
            ))
            .await;
        assert_eq!(update.status, "failed");
        assert!(update.error_message.unwrap().contains("Invalid package name"));
        MemoryConnector::reset_namespace("eph_system");
    }

    #[test]
    fn test_arrow_ipc_encoding_round_trippable() {
        let rows: Vec<Row> = (0..3).map(|i| synqx_domain::row(&[("x", json!(i))])).collect();
        let encoded = encode_arrow_ipc(&rows).unwrap();
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        let reader = arrow::ipc::reader::StreamReader::try_new(std::io::Cursor::new(bytes), None).unwrap();
        let batches: Vec<_> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 3);
    }
}
