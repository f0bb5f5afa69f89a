// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Entities
//!
//! Core entities describing a pipeline template: the [`Pipeline`] aggregate
//! root, its immutable [`PipelineVersion`] snapshots, and the
//! [`NodeDefinition`] / [`EdgeDefinition`] pairs that make up a version's
//! directed acyclic graph.
//!
//! ## Entity Characteristics
//!
//! - **Pipeline**: mutable configuration holder (schedule, retry defaults,
//!   agent routing, SLA). Identity persists across versions.
//! - **PipelineVersion**: an immutable, serializable snapshot of the graph.
//!   This is exactly the DAG payload handed to remote agents at lease time,
//!   so every field here is `serde`-stable wire format.
//! - **NodeDefinition / EdgeDefinition**: owned exclusively by their version.
//!
//! ## Structural Invariants
//!
//! [`PipelineVersion::validate`] enforces the invariants that can be checked
//! without a full topological pass:
//!
//! - every edge references nodes of the same version
//! - no self-loops
//! - a node with more than one inbound edge must be a Merge, Union, or Join
//!
//! Acyclicity is enforced when the execution engine builds the DAG.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::value_objects::DataContract;
use crate::SynqxError;

/// Represents the kind of operation a pipeline node performs.
///
/// The operator type selects the execution path inside the node executor:
/// extracts stream from a source connector, loads commit to a destination
/// connector, and the remaining variants dispatch to a registered transform
/// implementation (single-input or multi-input).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorType {
    /// Reads chunks from a source asset
    Extract,
    /// Writes chunks to a destination asset
    Load,
    /// Single-input data transformation
    Transform,
    /// Multi-input join
    Join,
    /// Multi-input union
    Union,
    /// Multi-input merge
    Merge,
    /// Contract-driven validation stage
    Validate,
    /// Pass-through stage that does not modify data
    Noop,
}

impl OperatorType {
    /// Whether the operator consumes more than one upstream input.
    pub fn is_multi_input(&self) -> bool {
        matches!(self, OperatorType::Join | OperatorType::Union | OperatorType::Merge)
    }
}

impl std::fmt::Display for OperatorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatorType::Extract => write!(f, "extract"),
            OperatorType::Load => write!(f, "load"),
            OperatorType::Transform => write!(f, "transform"),
            OperatorType::Join => write!(f, "join"),
            OperatorType::Union => write!(f, "union"),
            OperatorType::Merge => write!(f, "merge"),
            OperatorType::Validate => write!(f, "validate"),
            OperatorType::Noop => write!(f, "noop"),
        }
    }
}

impl std::str::FromStr for OperatorType {
    type Err = SynqxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "extract" => Ok(OperatorType::Extract),
            "load" => Ok(OperatorType::Load),
            "transform" => Ok(OperatorType::Transform),
            "join" => Ok(OperatorType::Join),
            "union" => Ok(OperatorType::Union),
            "merge" => Ok(OperatorType::Merge),
            "validate" => Ok(OperatorType::Validate),
            "noop" => Ok(OperatorType::Noop),
            _ => Err(SynqxError::Configuration(format!("Unknown operator type: {}", s))),
        }
    }
}

/// Synchronization mode for extract nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Full reload of the source asset
    #[default]
    FullLoad,
    /// Watermark-bounded incremental extraction
    Incremental,
    /// Change-data-capture stream
    Cdc,
}

/// Write strategy applied by load nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    #[default]
    Append,
    Overwrite,
    Upsert,
}

impl std::fmt::Display for WriteStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteStrategy::Append => write!(f, "append"),
            WriteStrategy::Overwrite => write!(f, "overwrite"),
            WriteStrategy::Upsert => write!(f, "upsert"),
        }
    }
}

/// Destination schema-evolution policy applied by load nodes.
///
/// - `Strict`: unknown columns fail the node
/// - `Evolve`: unknown columns are added to the destination
/// - `Ignore`: unknown columns are dropped from the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchemaEvolutionPolicy {
    #[default]
    Strict,
    Evolve,
    Ignore,
}

/// Delay strategy applied between node retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    #[default]
    Fixed,
    LinearBackoff,
    ExponentialBackoff,
}

impl RetryStrategy {
    /// Maximum retry delay, in seconds. Exponential growth is capped here.
    pub const MAX_DELAY_SECS: u64 = 3600;

    /// Computes the delay before retry attempt `attempt` (1-based).
    ///
    /// Fixed: `base`; Linear: `base * attempt`;
    /// Exponential: `base * 2^(attempt - 1)`, capped at
    /// [`Self::MAX_DELAY_SECS`].
    pub fn delay_secs(&self, base_secs: u64, attempt: u32) -> u64 {
        let attempt = attempt.max(1);
        let raw = match self {
            RetryStrategy::Fixed => base_secs,
            RetryStrategy::LinearBackoff => base_secs.saturating_mul(attempt as u64),
            RetryStrategy::ExponentialBackoff => {
                base_secs.saturating_mul(1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX))
            }
        };
        raw.min(Self::MAX_DELAY_SECS)
    }
}

/// Lifecycle status of a pipeline template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    #[default]
    Draft,
    Active,
    Paused,
    Archived,
}

/// Service-level agreement configuration attached to a pipeline.
///
/// `max_duration_seconds` bounds a single run's wall-clock time;
/// `finish_by` names a wall-clock deadline (`"HH:MM"`) by which a successful
/// run must exist for the current day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SlaConfig {
    #[serde(default, alias = "max_duration", skip_serializing_if = "Option::is_none")]
    pub max_duration_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_by: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    60
}

fn default_edge_type() -> String {
    "data_flow".to_string()
}

/// A single node of a pipeline version.
///
/// `node_id` is the stable, human-assigned identifier unique within the
/// version; it is the key used by edges, the data cache, step telemetry, and
/// the wire protocol. `config` is an opaque bag interpreted by the concrete
/// operator implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub node_id: String,
    #[serde(default)]
    pub name: String,
    pub operator_type: OperatorType,
    pub operator_class: String,
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
    #[serde(default)]
    pub order_index: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_asset_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_asset_id: Option<i64>,

    #[serde(default)]
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub write_strategy: WriteStrategy,
    #[serde(default)]
    pub schema_evolution_policy: SchemaEvolutionPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_contract: Option<DataContract>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrails: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine_asset_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_mapping: Option<HashMap<String, String>>,

    // Dynamic fan-out
    #[serde(default)]
    pub is_dynamic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_expr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_pipeline_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_tag: Option<String>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_strategy: RetryStrategy,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl NodeDefinition {
    /// Creates a minimal node definition; richer fields use their defaults.
    pub fn new(node_id: impl Into<String>, operator_type: OperatorType, operator_class: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            name: node_id.clone(),
            node_id,
            operator_type,
            operator_class: operator_class.into(),
            config: serde_json::Map::new(),
            order_index: 0,
            source_asset_id: None,
            destination_asset_id: None,
            sync_mode: SyncMode::default(),
            write_strategy: WriteStrategy::default(),
            schema_evolution_policy: SchemaEvolutionPolicy::default(),
            data_contract: None,
            guardrails: None,
            quarantine_asset_id: None,
            column_mapping: None,
            is_dynamic: false,
            mapping_expr: None,
            sub_pipeline_id: None,
            worker_tag: None,
            max_retries: default_max_retries(),
            retry_strategy: RetryStrategy::default(),
            retry_delay_seconds: default_retry_delay(),
            timeout_seconds: None,
        }
    }

    /// Reads a string value out of the opaque node config.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// A directed edge between two nodes of the same version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub from_node_id: String,
    pub to_node_id: String,
    #[serde(default = "default_edge_type")]
    pub edge_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl EdgeDefinition {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from_node_id: from.into(),
            to_node_id: to.into(),
            edge_type: default_edge_type(),
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// An immutable snapshot of a pipeline graph.
///
/// This is the exact serialized form shipped to agents inside the lease
/// payload, so field names are wire-stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineVersion {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub pipeline_id: i64,
    #[serde(default)]
    pub version: i32,
    pub nodes: Vec<NodeDefinition>,
    pub edges: Vec<EdgeDefinition>,
}

impl PipelineVersion {
    pub fn new(pipeline_id: i64, version: i32, nodes: Vec<NodeDefinition>, edges: Vec<EdgeDefinition>) -> Self {
        Self {
            id: 0,
            pipeline_id,
            version,
            nodes,
            edges,
        }
    }

    /// Looks up a node by its stable identifier.
    pub fn node(&self, node_id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Validates the structural invariants of the graph.
    ///
    /// Checks edge references, self-loops, and the multi-input rule. Cycle
    /// detection is deferred to DAG construction, which has the full
    /// topological picture.
    ///
    /// # Errors
    /// Returns `SynqxError::Validation` on the first violated invariant.
    pub fn validate(&self) -> Result<(), SynqxError> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.node_id.as_str()) {
                return Err(SynqxError::Validation(format!(
                    "Duplicate node_id '{}' in version {}",
                    node.node_id, self.version
                )));
            }
        }

        let mut inbound: HashMap<&str, usize> = HashMap::new();
        for edge in &self.edges {
            if edge.from_node_id == edge.to_node_id {
                return Err(SynqxError::Validation(format!(
                    "Self-loop detected: node '{}' cannot connect to itself",
                    edge.from_node_id
                )));
            }
            if !seen.contains(edge.from_node_id.as_str()) || !seen.contains(edge.to_node_id.as_str()) {
                return Err(SynqxError::Validation(format!(
                    "Invalid edge: references non-existent node ({} -> {})",
                    edge.from_node_id, edge.to_node_id
                )));
            }
            *inbound.entry(edge.to_node_id.as_str()).or_insert(0) += 1;
        }

        for node in &self.nodes {
            let fan_in = inbound.get(node.node_id.as_str()).copied().unwrap_or(0);
            if fan_in > 1 && !node.operator_type.is_multi_input() {
                return Err(SynqxError::Validation(format!(
                    "Node '{}' has {} incoming edges but operator type '{}' accepts a single input",
                    node.node_id, fan_in, node.operator_type
                )));
            }
        }

        Ok(())
    }
}

/// The pipeline aggregate root.
///
/// Holds scheduling, routing, retry, and SLA configuration shared by all
/// versions. The execution engine never touches this entity directly; the
/// control plane reads it when enqueuing jobs and evaluating schedules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_cron: Option<String>,
    #[serde(default)]
    pub schedule_enabled: bool,
    #[serde(default = "Pipeline::default_timezone")]
    pub schedule_timezone: String,

    #[serde(default)]
    pub status: PipelineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_version_id: Option<i64>,

    #[serde(default = "Pipeline::default_max_parallel_runs")]
    pub max_parallel_runs: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_strategy: RetryStrategy,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,

    #[serde(default = "Pipeline::default_execution_timeout")]
    pub execution_timeout_seconds: Option<u64>,
    #[serde(default = "Pipeline::default_agent_group")]
    pub agent_group: String,
    #[serde(default = "Pipeline::default_priority")]
    pub priority: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla_config: Option<SlaConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<i64>,
}

impl Pipeline {
    fn default_timezone() -> String {
        "UTC".to_string()
    }

    fn default_max_parallel_runs() -> u32 {
        1
    }

    fn default_execution_timeout() -> Option<u64> {
        Some(3600)
    }

    fn default_agent_group() -> String {
        "internal".to_string()
    }

    fn default_priority() -> i32 {
        5
    }

    /// Whether jobs for this pipeline are dispatched to remote agents.
    /// The reserved group name `internal` executes in-process.
    pub fn is_remote_group(&self) -> bool {
        self.agent_group != "internal"
    }
}
