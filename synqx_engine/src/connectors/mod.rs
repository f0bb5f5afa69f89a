// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Connector Capability Seam
//!
//! Connectors are external collaborators; the core consumes the narrow
//! capability set defined here and nothing else. A [`Connector`] is built
//! from a type string plus an opaque config blob via the
//! [`ConnectorRegistry`]; every run opens a fresh [`ConnectorSession`] and
//! streams chunks through it.
//!
//! The crate ships exactly one implementation, the [`memory`] connector,
//! which backs tests, quarantine writes, and ephemeral handlers. Real
//! database/file/API connectors live outside the core and register their
//! constructors at process start.

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use synqx_domain::{Chunk, Row, SynqxError, WatermarkValue, WriteStrategy};

/// Incremental bound passed to readers so they can push the filter down to
/// the source. Readers may ignore it; the executor re-applies the filter
/// row-by-row regardless.
#[derive(Debug, Clone)]
pub struct WatermarkFilter {
    pub column: String,
    pub value: WatermarkValue,
}

/// Parameters of one batched read.
#[derive(Debug, Clone, Default)]
pub struct ReadRequest {
    /// Asset identifier (fully qualified name preferred).
    pub asset: String,
    /// Merged asset + node config.
    pub params: Map<String, Value>,
    /// Incremental pushdown bound, when the node syncs incrementally.
    pub watermark: Option<WatermarkFilter>,
    /// Target rows per emitted chunk; 0 means connector default.
    pub chunk_size: usize,
}

impl ReadRequest {
    pub fn new(asset: impl Into<String>) -> Self {
        Self {
            asset: asset.into(),
            ..Default::default()
        }
    }
}

/// One column of an inferred schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
}

/// A live session against an external system. Sessions are per-run and
/// never shared across concurrently executing nodes.
#[async_trait]
pub trait ConnectorSession: Send + Sync {
    /// Streams the asset as a sequence of chunks.
    async fn read_batch(&self, request: &ReadRequest) -> Result<Vec<Chunk>, SynqxError>;

    /// Writes a sequence of chunks with the given strategy, returning the
    /// number of rows committed.
    async fn write_batch(
        &self,
        chunks: Vec<Chunk>,
        asset: &str,
        mode: WriteStrategy,
        params: &Map<String, Value>,
    ) -> Result<u64, SynqxError>;

    /// Executes an ad-hoc query. Used by the explorer ephemeral handler.
    async fn execute_query(&self, query: &str, limit: usize, offset: usize) -> Result<Vec<Row>, SynqxError>;

    /// Fetches a bounded sample of an asset without a query surface.
    async fn fetch_sample(&self, asset: &str, limit: usize, offset: usize) -> Result<Vec<Row>, SynqxError>;

    /// Names of assets visible through this connection.
    async fn discover_assets(&self, pattern: Option<&str>) -> Result<Vec<String>, SynqxError>;

    /// Best-effort schema of an asset.
    async fn infer_schema(&self, asset: &str) -> Result<Vec<ColumnSchema>, SynqxError>;

    /// Current destination columns, consulted by schema-evolution policy.
    async fn current_columns(&self, asset: &str) -> Result<Vec<String>, SynqxError>;

    /// Adds columns to the destination (Evolve policy).
    async fn alter_add_columns(&self, asset: &str, columns: &[String]) -> Result<(), SynqxError>;

    /// Cheap liveness probe.
    async fn test_connection(&self) -> Result<(), SynqxError>;
}

/// A configured connector able to open sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// The registry type string this connector was built from.
    fn connector_type(&self) -> &str;

    /// Opens a fresh session. Each executing node owns its own session.
    async fn session(&self) -> Result<Arc<dyn ConnectorSession>, SynqxError>;
}

/// Constructor signature stored in the registry.
pub type ConnectorCtor =
    Arc<dyn Fn(&Map<String, Value>) -> Result<Arc<dyn Connector>, SynqxError> + Send + Sync>;

/// Registry mapping connector type strings to constructors.
///
/// The registry replaces the original factory keyed by type string: the
/// lookup stays dynamic, construction stays type-safe behind the trait.
pub struct ConnectorRegistry {
    ctors: parking_lot::RwLock<HashMap<String, ConnectorCtor>>,
}

impl ConnectorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            ctors: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    /// A registry with the built-in `memory` connector registered.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("memory", Arc::new(|config| memory::MemoryConnector::from_config(config)));
        registry
    }

    /// Registers (or replaces) a constructor for a type string.
    pub fn register(&self, connector_type: &str, ctor: ConnectorCtor) {
        self.ctors.write().insert(connector_type.to_string(), ctor);
    }

    /// Builds a connector for `connector_type` from its config blob.
    ///
    /// # Errors
    /// `SynqxError::Configuration` for unknown types, plus whatever the
    /// constructor itself raises on bad config.
    pub fn create(
        &self,
        connector_type: &str,
        config: &Map<String, Value>,
    ) -> Result<Arc<dyn Connector>, SynqxError> {
        let ctor = self
            .ctors
            .read()
            .get(connector_type)
            .cloned()
            .ok_or_else(|| SynqxError::Configuration(format!("Unknown connector type: '{}'", connector_type)))?;
        ctor(config)
    }

    pub fn known_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.ctors.read().keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
