// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Node Executor
//!
//! Runs a single node under a fresh per-run connector session: extracts
//! stream from sources with watermark-driven incrementality, loads commit
//! to destinations under a schema-evolution policy, and transform operators
//! dispatch through the transform registry with contract validation and
//! quarantine routing on their outputs.
//!
//! ## Telemetry Side Effects
//!
//! Every chunk updates the running counters, captures a first-seen sample
//! per direction, feeds the data profiler, lands in the forensic capture,
//! and publishes a `Running` progress report through the state sink. On
//! success the executor publishes the terminal `Success` report; failures
//! propagate as errors and the runner decides between retry and terminal
//! `Failed`.
//!
//! ## Watermarks
//!
//! The new high watermark is tracked across the whole extract stream and
//! advanced in the store strictly after the stream is drained. A failed
//! extract therefore never moves the watermark.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use synqx_domain::{
    Asset, Chunk, ConnectionPayload, NodeDefinition, OperatorType, Row, StepCounters, StepStatus, SyncMode,
    SchemaEvolutionPolicy, SynqxError, WatermarkValue,
};

use crate::connectors::{Connector, ConnectorRegistry, ReadRequest, WatermarkFilter};
use crate::contract::ContractValidator;
use crate::forensics::ForensicSniffer;
use crate::profiler::{self, QualityProfile};
use crate::state::{StateSink, StepProgress};
use crate::transforms::TransformRegistry;
use crate::watermark::WatermarkStore;

/// Rows captured per direction for the step's sample snapshot.
const SAMPLE_ROWS: usize = 100;

/// Probe for isolated runtime environments required by script operators.
pub trait RuntimeEnvironments: Send + Sync {
    /// Whether the environment for `(connection, language)` exists and is
    /// ready to execute.
    fn is_ready(&self, connection_id: i64, language: &str) -> bool;
}

/// Shared, per-run immutable execution context handed to every node.
pub struct ExecutionEnvironment {
    pub pipeline_id: i64,
    pub run_id: i64,
    /// Resolved connection blobs keyed by connection id (stringified).
    pub connections: HashMap<String, ConnectionPayload>,
    /// Asset metadata keyed by asset id. May be sparse on remote agents;
    /// missing assets are synthesized from node config.
    pub assets: HashMap<i64, Asset>,
    pub connector_registry: Arc<ConnectorRegistry>,
    pub transform_registry: Arc<TransformRegistry>,
    pub watermarks: Arc<dyn WatermarkStore>,
    /// Forensic capture base directory; `None` disables capture.
    pub forensic_base: Option<PathBuf>,
    pub runtime_envs: Option<Arc<dyn RuntimeEnvironments>>,
}

impl ExecutionEnvironment {
    fn sniffer(&self) -> ForensicSniffer {
        match &self.forensic_base {
            Some(base) => ForensicSniffer::new(base, self.run_id),
            None => ForensicSniffer::disabled(),
        }
    }

    fn connection(&self, connection_id: i64) -> Result<&ConnectionPayload, SynqxError> {
        self.connections
            .get(&connection_id.to_string())
            .ok_or_else(|| {
                SynqxError::Configuration(format!(
                    "Connection {} missing from run payload",
                    connection_id
                ))
            })
    }

    fn connector_for(&self, connection: &ConnectionPayload) -> Result<Arc<dyn Connector>, SynqxError> {
        self.connector_registry.create(&connection.connector_type, &connection.config)
    }

    /// Resolves the asset a node reads or writes. Falls back to
    /// synthesizing one from node config when the payload carries no asset
    /// record, the way remote agents operate.
    fn resolve_asset(&self, node: &NodeDefinition, asset_id: Option<i64>, config: &Map<String, Value>) -> Result<Asset, SynqxError> {
        if let Some(id) = asset_id {
            if let Some(asset) = self.assets.get(&id) {
                return Ok(asset.clone());
            }
        }

        let name = config
            .get("table")
            .or_else(|| config.get("asset"))
            .or_else(|| config.get("query"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                SynqxError::Configuration(format!(
                    "Node '{}' names no asset: no asset record and no table/asset/query in config",
                    node.node_id
                ))
            })?;
        let connection_id = config
            .get("connection_id")
            .and_then(value_as_i64)
            .ok_or_else(|| {
                SynqxError::Configuration(format!("Node '{}' has no connection_id in config", node.node_id))
            })?;

        let mut asset_config = Map::new();
        if let Some(wm) = config.get("watermark_column") {
            asset_config.insert("watermark_column".to_string(), wm.clone());
        }

        Ok(Asset {
            id: asset_id.unwrap_or(0),
            connection_id,
            name: name.to_string(),
            fully_qualified_name: None,
            is_incremental_capable: node.sync_mode == SyncMode::Incremental,
            config: asset_config,
        })
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Output of one node execution.
#[derive(Debug, Default)]
pub struct NodeOutput {
    pub chunks: Vec<Chunk>,
    pub counters: StepCounters,
    pub quality_profile: Option<QualityProfile>,
}

/// Chunk flow direction for telemetry and forensics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    In,
    Out,
    Quarantine,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
            Direction::Quarantine => "quarantine",
        }
    }
}

/// Per-execution telemetry accumulator.
struct ChunkObserver<'a> {
    node_id: &'a str,
    retry_count: u32,
    sink: &'a dyn StateSink,
    sniffer: &'a ForensicSniffer,
    counters: StepCounters,
    samples: Map<String, Value>,
    profile: QualityProfile,
}

impl<'a> ChunkObserver<'a> {
    fn new(node_id: &'a str, retry_count: u32, sink: &'a dyn StateSink, sniffer: &'a ForensicSniffer) -> Self {
        Self {
            node_id,
            retry_count,
            sink,
            sniffer,
            counters: StepCounters::default(),
            samples: Map::new(),
            profile: QualityProfile::new(),
        }
    }

    async fn observe(
        &mut self,
        chunk: &Chunk,
        direction: Direction,
        error_count: u64,
        filtered_count: u64,
    ) -> Result<(), SynqxError> {
        // Cooperative cancellation point between chunks
        if self.sink.is_cancelled() {
            return Err(SynqxError::Cancellation(format!(
                "node '{}' observed cancellation between chunks",
                self.node_id
            )));
        }

        if chunk.is_empty() && error_count == 0 && filtered_count == 0 {
            return Ok(());
        }

        // First-seen sample per direction
        if !chunk.is_empty() && !self.samples.contains_key(direction.as_str()) {
            self.samples
                .insert(direction.as_str().to_string(), sniff_sample(chunk));
        }

        if !chunk.is_empty() {
            self.sniffer.capture_chunk(self.node_id, chunk, direction.as_str());
        }

        match direction {
            Direction::Out => {
                self.counters.records_out += chunk.row_count() as u64;
                self.counters.bytes_processed += chunk.estimated_bytes();
                profiler::merge_profiles(&mut self.profile, profiler::profile_chunk(chunk));
            }
            Direction::In => {
                self.counters.records_in += chunk.row_count() as u64;
            }
            Direction::Quarantine => {}
        }
        self.counters.records_error += error_count;
        self.counters.records_filtered += filtered_count;

        self.sink
            .update_step(StepProgress {
                node_id: self.node_id.to_string(),
                status: StepStatus::Running,
                counters: self.counters,
                retry_count: self.retry_count,
                sample_data: Some(Value::Object(self.samples.clone())),
                ..Default::default()
            })
            .await
    }
}

/// Captures a bounded sample of a chunk with column and dtype metadata.
fn sniff_sample(chunk: &Chunk) -> Value {
    let head = chunk.head(SAMPLE_ROWS);
    let mut dtypes = Map::new();
    if let Some(first) = head.rows().first() {
        for (column, value) in first {
            let dtype = match value {
                Value::Null => "null",
                Value::Bool(_) => "boolean",
                Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
                Value::Number(_) => "float",
                Value::String(_) => "string",
                Value::Array(_) => "array",
                Value::Object(_) => "object",
            };
            dtypes.insert(column.clone(), Value::String(dtype.to_string()));
        }
    }
    let mut sample = Map::new();
    sample.insert(
        "rows".to_string(),
        Value::Array(head.rows().iter().cloned().map(Value::Object).collect()),
    );
    sample.insert(
        "columns".to_string(),
        Value::Array(chunk.columns().into_iter().map(Value::String).collect()),
    );
    sample.insert("dtypes".to_string(), Value::Object(dtypes));
    sample.insert("total_rows".to_string(), Value::from(chunk.row_count()));
    Value::Object(sample)
}

/// Executes single nodes against a shared [`ExecutionEnvironment`].
pub struct NodeExecutor {
    env: Arc<ExecutionEnvironment>,
    sink: Arc<dyn StateSink>,
}

impl NodeExecutor {
    pub fn new(env: Arc<ExecutionEnvironment>, sink: Arc<dyn StateSink>) -> Self {
        Self { env, sink }
    }

    /// Executes one node.
    ///
    /// `inputs` maps upstream node ids to their materialized chunks;
    /// `config_override` carries the `_dynamic_item` merge for fan-out
    /// instances; `retry_count` tags telemetry with the current attempt.
    ///
    /// # Errors
    /// Classified `SynqxError`s; the caller maps them to retry or terminal
    /// failure.
    pub async fn execute(
        &self,
        node: &NodeDefinition,
        inputs: HashMap<String, Vec<Chunk>>,
        config_override: Option<Map<String, Value>>,
        retry_count: u32,
    ) -> Result<NodeOutput, SynqxError> {
        let mut config = node.config.clone();
        if let Some(overrides) = config_override {
            for (key, value) in overrides {
                config.insert(key, value);
            }
        }
        // Routing/UI metadata never reaches connectors
        let mut connector_params = config.clone();
        connector_params.remove("ui");

        self.sink
            .ensure_step(&node.node_id, node.operator_type, node.order_index)
            .await?;
        self.sink
            .update_step(StepProgress {
                node_id: node.node_id.clone(),
                status: StepStatus::Running,
                retry_count,
                ..Default::default()
            })
            .await?;

        self.preflight(node, &config)?;

        let sniffer = self.env.sniffer();
        let mut observer = ChunkObserver::new(&node.node_id, retry_count, self.sink.as_ref(), &sniffer);

        info!(
            node_id = %node.node_id,
            operator = %node.operator_type,
            class = %node.operator_class,
            attempt = retry_count + 1,
            "executing node"
        );

        let result = match node.operator_type {
            OperatorType::Extract => self.execute_extract(node, &config, &connector_params, &mut observer).await,
            OperatorType::Load => self.execute_load(node, &config, &connector_params, inputs, &mut observer).await,
            _ => self.execute_transform(node, &config, inputs, &mut observer, &sniffer).await,
        };

        match result {
            Ok(chunks) => {
                let counters = observer.counters;
                let quality = if observer.profile.is_empty() {
                    None
                } else {
                    Some(observer.profile.clone())
                };
                self.sink
                    .update_step(StepProgress {
                        node_id: node.node_id.clone(),
                        status: StepStatus::Success,
                        counters,
                        retry_count,
                        sample_data: Some(Value::Object(observer.samples.clone())),
                        quality_profile: quality
                            .as_ref()
                            .map(|p| serde_json::to_value(p).unwrap_or(Value::Null)),
                        ..Default::default()
                    })
                    .await?;
                sniffer.finalize();
                info!(
                    node_id = %node.node_id,
                    records_in = counters.records_in,
                    records_out = counters.records_out,
                    quarantined = counters.records_error,
                    "node completed"
                );
                Ok(NodeOutput {
                    chunks,
                    counters,
                    quality_profile: quality,
                })
            }
            Err(e) => {
                sniffer.finalize();
                warn!(node_id = %node.node_id, error = %e, "node execution failed");
                Err(e)
            }
        }
    }

    /// Pre-flight: script operators require a ready runtime environment.
    fn preflight(&self, node: &NodeDefinition, config: &Map<String, Value>) -> Result<(), SynqxError> {
        if node.operator_class != "custom_script" {
            return Ok(());
        }
        let language = config
            .get("language")
            .and_then(Value::as_str)
            .unwrap_or("python")
            .to_string();
        let connection_id = config.get("connection_id").and_then(value_as_i64).unwrap_or(0);

        let Some(envs) = &self.env.runtime_envs else {
            return Err(SynqxError::Configuration(format!(
                "Node '{}' requires a {} runtime environment but no environment manager is available",
                node.node_id, language
            )));
        };
        if !envs.is_ready(connection_id, &language) {
            return Err(SynqxError::Configuration(format!(
                "Runtime environment '{}' is not ready for node '{}'; initialize it in connection settings",
                language, node.node_id
            )));
        }
        Ok(())
    }

    async fn execute_extract(
        &self,
        node: &NodeDefinition,
        config: &Map<String, Value>,
        connector_params: &Map<String, Value>,
        observer: &mut ChunkObserver<'_>,
    ) -> Result<Vec<Chunk>, SynqxError> {
        let asset = self.env.resolve_asset(node, node.source_asset_id, config)?;
        let connection = self.env.connection(asset.connection_id)?;
        let connector = self.env.connector_for(connection)?;

        // Incremental state
        let incremental = node.sync_mode == SyncMode::Incremental && asset.is_incremental_capable;
        let wm_column = asset
            .watermark_column()
            .map(str::to_string)
            .or_else(|| config.get("watermark_column").and_then(Value::as_str).map(str::to_string));
        let current_wm = if incremental {
            self.env
                .watermarks
                .get(self.env.pipeline_id, asset.id)
                .await?
                .map(|wm| wm.last_value)
        } else {
            None
        };
        if let Some(wm) = &current_wm {
            debug!(node_id = %node.node_id, watermark = %wm, "resuming incremental extraction");
        }

        let mut request = ReadRequest::new(asset.identifier());
        for (key, value) in asset.config.iter().chain(connector_params.iter()) {
            request.params.insert(key.clone(), value.clone());
        }
        request.chunk_size = config.get("chunk_size").and_then(value_as_i64).unwrap_or(0).max(0) as usize;
        if let (Some(column), Some(value)) = (&wm_column, &current_wm) {
            request.watermark = Some(WatermarkFilter {
                column: column.clone(),
                value: value.clone(),
            });
        }

        let session = connector.session().await?;
        let chunks = session.read_batch(&request).await?;

        let mut results = Vec::new();
        let mut max_seen: Option<WatermarkValue> = None;
        for chunk in chunks {
            observer.observe(&chunk, Direction::Out, 0, 0).await?;

            let chunk = match (&wm_column, &current_wm) {
                (Some(column), Some(wm)) => {
                    let before = chunk.row_count() as u64;
                    let filtered = filter_after_watermark(&chunk, column, wm);
                    let dropped = before - filtered.row_count() as u64;
                    if dropped > 0 {
                        observer.observe(&Chunk::empty(), Direction::Out, 0, dropped).await?;
                    }
                    filtered
                }
                _ => chunk,
            };
            if chunk.is_empty() {
                continue;
            }

            if let Some(column) = &wm_column {
                max_seen = track_high_watermark(&chunk, column, max_seen);
            }
            results.push(chunk);
        }

        // Advance strictly after the stream is fully drained
        if let (Some(column), Some(max)) = (&wm_column, max_seen) {
            let advanced = self
                .env
                .watermarks
                .advance(self.env.pipeline_id, asset.id, column, max.clone())
                .await?;
            if advanced {
                info!(node_id = %node.node_id, watermark = %max, "high watermark persisted");
            }
        }

        Ok(results)
    }

    async fn execute_load(
        &self,
        node: &NodeDefinition,
        config: &Map<String, Value>,
        connector_params: &Map<String, Value>,
        inputs: HashMap<String, Vec<Chunk>>,
        observer: &mut ChunkObserver<'_>,
    ) -> Result<Vec<Chunk>, SynqxError> {
        let asset = self.env.resolve_asset(node, node.destination_asset_id, config)?;
        let connection = self.env.connection(asset.connection_id)?;
        let connector = self.env.connector_for(connection)?;
        let session = connector.session().await?;

        // Concatenate inputs in upstream-id order
        let ordered: BTreeMap<String, Vec<Chunk>> = inputs.into_iter().collect();
        let mut pending = Vec::new();
        for chunks in ordered.into_values() {
            for chunk in chunks {
                observer.observe(&chunk, Direction::In, 0, 0).await?;
                pending.push(chunk);
            }
        }

        // Column mapping before the stream hits the destination
        if let Some(mapping) = &node.column_mapping {
            if !mapping.is_empty() {
                pending = pending.iter().map(|chunk| rename_columns(chunk, mapping)).collect();
            }
        }

        pending = self.apply_schema_evolution(node, &asset, session.as_ref(), pending).await?;

        let mut write_params = connector_params.clone();
        write_params.remove("write_strategy");
        write_params.remove("connection_id");

        let written = session
            .write_batch(pending, asset.identifier(), node.write_strategy, &write_params)
            .await?;
        observer.counters.records_out = written;

        info!(
            node_id = %node.node_id,
            records = written,
            strategy = %node.write_strategy,
            "load committed"
        );

        // Load is a sink; nothing flows downstream
        Ok(Vec::new())
    }

    /// Applies the node's schema-evolution policy against the destination's
    /// current columns.
    async fn apply_schema_evolution(
        &self,
        node: &NodeDefinition,
        asset: &Asset,
        session: &dyn crate::connectors::ConnectorSession,
        chunks: Vec<Chunk>,
    ) -> Result<Vec<Chunk>, SynqxError> {
        let current = session.current_columns(asset.identifier()).await?;
        if current.is_empty() {
            // Brand-new destination accepts any shape
            return Ok(chunks);
        }

        let mut incoming = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for chunk in &chunks {
            for column in chunk.columns() {
                if seen.insert(column.clone()) {
                    incoming.push(column);
                }
            }
        }
        let unknown: Vec<String> = incoming
            .into_iter()
            .filter(|column| !current.contains(column))
            .collect();
        if unknown.is_empty() {
            return Ok(chunks);
        }

        match node.schema_evolution_policy {
            SchemaEvolutionPolicy::Strict => Err(SynqxError::SchemaEvolutionViolation(format!(
                "Destination '{}' does not know columns [{}]",
                asset.identifier(),
                unknown.join(", ")
            ))),
            SchemaEvolutionPolicy::Evolve => {
                info!(node_id = %node.node_id, columns = ?unknown, "evolving destination schema");
                session.alter_add_columns(asset.identifier(), &unknown).await?;
                Ok(chunks)
            }
            SchemaEvolutionPolicy::Ignore => {
                debug!(node_id = %node.node_id, columns = ?unknown, "dropping unknown columns");
                Ok(chunks
                    .iter()
                    .map(|chunk| drop_columns(chunk, &unknown))
                    .collect())
            }
        }
    }

    async fn execute_transform(
        &self,
        node: &NodeDefinition,
        config: &Map<String, Value>,
        inputs: HashMap<String, Vec<Chunk>>,
        observer: &mut ChunkObserver<'_>,
        sniffer: &ForensicSniffer,
    ) -> Result<Vec<Chunk>, SynqxError> {
        let transform = self.env.transform_registry.create(&node.operator_class, config)?;

        for chunks in inputs.values() {
            for chunk in chunks {
                observer.observe(chunk, Direction::In, 0, 0).await?;
            }
        }

        let produced = if node.operator_type.is_multi_input() {
            transform.transform_multi(inputs).await?
        } else {
            // Single-input operators consume the first upstream in id order
            let ordered: BTreeMap<String, Vec<Chunk>> = inputs.into_iter().collect();
            let first = ordered.into_values().next().unwrap_or_default();
            transform.transform(first).await?
        };

        let validator = node.data_contract.clone().map(ContractValidator::new);

        let mut results = Vec::new();
        for chunk in produced {
            let (valid, quarantined) = match &validator {
                Some(validator) if validator.has_rules() => validator.validate(&chunk),
                _ => (chunk, Chunk::empty()),
            };

            if !quarantined.is_empty() {
                if let Some(validator) = &validator {
                    if validator.is_strict() {
                        return Err(SynqxError::ContractViolation(format!(
                            "Strict contract on node '{}' rejected {} rows",
                            node.node_id,
                            quarantined.row_count()
                        )));
                    }
                }
                self.route_quarantine(node, &quarantined, sniffer).await;
                observer
                    .observe(&quarantined, Direction::Quarantine, quarantined.row_count() as u64, 0)
                    .await?;
            }

            if !valid.is_empty() {
                observer.observe(&valid, Direction::Out, 0, 0).await?;
                results.push(valid);
            }
        }

        Ok(results)
    }

    /// Routes quarantined rows to the configured quarantine asset, falling
    /// back to forensic capture when the native write is impossible or
    /// fails. Quarantine routing never fails the step.
    async fn route_quarantine(&self, node: &NodeDefinition, quarantined: &Chunk, sniffer: &ForensicSniffer) {
        if let Some(asset_id) = node.quarantine_asset_id {
            match self.write_quarantine_native(node, asset_id, quarantined).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        node_id = %node.node_id,
                        error = %e,
                        "native quarantine write failed, falling back to forensic capture"
                    );
                }
            }
        }
        sniffer.capture_chunk(&node.node_id, quarantined, "quarantine");
    }

    async fn write_quarantine_native(
        &self,
        node: &NodeDefinition,
        asset_id: i64,
        quarantined: &Chunk,
    ) -> Result<(), SynqxError> {
        let asset = self
            .env
            .assets
            .get(&asset_id)
            .cloned()
            .ok_or_else(|| SynqxError::Configuration(format!("Quarantine asset {} not in payload", asset_id)))?;
        let connection = self.env.connection(asset.connection_id)?;
        let connector = self.env.connector_for(connection)?;
        let session = connector.session().await?;
        let written = session
            .write_batch(
                vec![quarantined.clone()],
                asset.identifier(),
                synqx_domain::WriteStrategy::Append,
                &Map::new(),
            )
            .await?;
        info!(node_id = %node.node_id, rows = written, asset = %asset.identifier(), "quarantined rows diverted");
        Ok(())
    }
}

/// Keeps rows whose watermark column value is strictly greater than the
/// current watermark. Rows without the column (or with an absent value)
/// pass through, matching the resilient behavior of the original filter.
fn filter_after_watermark(chunk: &Chunk, column: &str, watermark: &WatermarkValue) -> Chunk {
    let actual = match resolve_column(chunk, column) {
        Some(name) => name,
        None => {
            warn!(column, "watermark column not found in chunk, passing rows through");
            return chunk.clone();
        }
    };
    let rows = chunk
        .rows()
        .iter()
        .filter(|row| match row.get(&actual) {
            Some(value) if !value.is_null() => WatermarkValue::new(value.clone()).is_after(watermark),
            _ => true,
        })
        .cloned()
        .collect();
    Chunk::new(rows)
}

/// Tracks the maximum watermark value across chunks.
fn track_high_watermark(chunk: &Chunk, column: &str, current: Option<WatermarkValue>) -> Option<WatermarkValue> {
    let Some(actual) = resolve_column(chunk, column) else {
        return current;
    };
    let mut max = current;
    for row in chunk.rows() {
        let Some(value) = row.get(&actual) else { continue };
        if value.is_null() {
            continue;
        }
        let candidate = WatermarkValue::new(value.clone());
        max = match max {
            Some(existing) if !candidate.is_after(&existing) => Some(existing),
            _ => Some(candidate),
        };
    }
    max
}

/// Case-insensitive column resolution.
fn resolve_column(chunk: &Chunk, column: &str) -> Option<String> {
    let lowered = column.to_lowercase();
    chunk
        .rows()
        .first()?
        .keys()
        .find(|name| name.to_lowercase() == lowered)
        .cloned()
}

fn rename_columns(chunk: &Chunk, mapping: &HashMap<String, String>) -> Chunk {
    let rows = chunk
        .rows()
        .iter()
        .map(|row| {
            let mut renamed = Row::new();
            for (column, value) in row {
                let name = mapping.get(column).cloned().unwrap_or_else(|| column.clone());
                renamed.insert(name, value.clone());
            }
            renamed
        })
        .collect();
    Chunk::new(rows)
}

fn drop_columns(chunk: &Chunk, columns: &[String]) -> Chunk {
    let rows = chunk
        .rows()
        .iter()
        .map(|row| {
            let mut kept = Row::new();
            for (column, value) in row {
                if !columns.contains(column) {
                    kept.insert(column.clone(), value.clone());
                }
            }
            kept
        })
        .collect();
    Chunk::new(rows)
}
