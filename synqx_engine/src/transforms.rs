// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Transform Seam
//!
//! Operators of type Transform/Validate/Noop consume one upstream; Join,
//! Union, and Merge consume the full input map via `transform_multi`.
//! Concrete implementations are instantiated by `operator_class` through
//! the [`TransformRegistry`]; an unknown class degrades to the pass-through
//! transform with a warning, mirroring the original engine's fallback.
//!
//! ## Built-ins
//!
//! - `noop` / `passthrough`: identity
//! - `projection`: keeps only the columns named in `config.columns`
//! - `union` / `merge`: concatenates all inputs in upstream-id order
//! - `join`: inner hash join of exactly two inputs on `config.on`

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use synqx_domain::{Chunk, Row, SynqxError};

/// A data transformation instantiated per node execution.
#[async_trait]
pub trait Transform: Send + Sync {
    /// Transforms the single upstream stream.
    async fn transform(&self, input: Vec<Chunk>) -> Result<Vec<Chunk>, SynqxError>;

    /// Transforms the full input map (Join/Union/Merge). The default
    /// concatenates inputs in upstream-id order and delegates to
    /// [`Transform::transform`].
    async fn transform_multi(&self, inputs: HashMap<String, Vec<Chunk>>) -> Result<Vec<Chunk>, SynqxError> {
        let ordered: BTreeMap<String, Vec<Chunk>> = inputs.into_iter().collect();
        let merged: Vec<Chunk> = ordered.into_values().flatten().collect();
        self.transform(merged).await
    }
}

/// Identity transform.
pub struct NoopTransform;

#[async_trait]
impl Transform for NoopTransform {
    async fn transform(&self, input: Vec<Chunk>) -> Result<Vec<Chunk>, SynqxError> {
        Ok(input)
    }
}

/// Keeps only the configured columns.
pub struct ProjectionTransform {
    columns: Vec<String>,
}

impl ProjectionTransform {
    pub fn from_config(config: &Map<String, Value>) -> Result<Self, SynqxError> {
        let columns = config
            .get("columns")
            .and_then(Value::as_array)
            .ok_or_else(|| SynqxError::Configuration("projection transform requires a 'columns' list".to_string()))?
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect::<Vec<_>>();
        if columns.is_empty() {
            return Err(SynqxError::Configuration(
                "projection transform 'columns' list is empty".to_string(),
            ));
        }
        Ok(Self { columns })
    }
}

#[async_trait]
impl Transform for ProjectionTransform {
    async fn transform(&self, input: Vec<Chunk>) -> Result<Vec<Chunk>, SynqxError> {
        Ok(input
            .into_iter()
            .map(|chunk| {
                let rows = chunk
                    .into_rows()
                    .into_iter()
                    .map(|row| {
                        let mut projected = Row::new();
                        for column in &self.columns {
                            if let Some(value) = row.get(column) {
                                projected.insert(column.clone(), value.clone());
                            }
                        }
                        projected
                    })
                    .collect();
                Chunk::new(rows)
            })
            .collect())
    }
}

/// Concatenates all inputs in upstream-id order.
pub struct UnionTransform;

#[async_trait]
impl Transform for UnionTransform {
    async fn transform(&self, input: Vec<Chunk>) -> Result<Vec<Chunk>, SynqxError> {
        Ok(input)
    }
}

/// Inner hash join of exactly two inputs on a shared key column.
pub struct JoinTransform {
    on: String,
}

impl JoinTransform {
    pub fn from_config(config: &Map<String, Value>) -> Result<Self, SynqxError> {
        let on = config
            .get("on")
            .and_then(Value::as_str)
            .ok_or_else(|| SynqxError::Configuration("join transform requires an 'on' key column".to_string()))?;
        Ok(Self { on: on.to_string() })
    }
}

#[async_trait]
impl Transform for JoinTransform {
    async fn transform(&self, input: Vec<Chunk>) -> Result<Vec<Chunk>, SynqxError> {
        // A join with a single input degenerates to identity.
        Ok(input)
    }

    async fn transform_multi(&self, inputs: HashMap<String, Vec<Chunk>>) -> Result<Vec<Chunk>, SynqxError> {
        if inputs.len() != 2 {
            return Err(SynqxError::Configuration(format!(
                "join transform expects exactly 2 inputs, got {}",
                inputs.len()
            )));
        }
        let ordered: BTreeMap<String, Vec<Chunk>> = inputs.into_iter().collect();
        let mut sides = ordered.into_values();
        let left: Vec<Row> = sides.next().unwrap_or_default().into_iter().flat_map(Chunk::into_rows).collect();
        let right: Vec<Row> = sides.next().unwrap_or_default().into_iter().flat_map(Chunk::into_rows).collect();

        let mut index: HashMap<String, Vec<&Row>> = HashMap::new();
        for row in &right {
            if let Some(key) = row.get(&self.on) {
                index.entry(key.to_string()).or_default().push(row);
            }
        }

        let mut joined = Vec::new();
        for row in &left {
            let Some(key) = row.get(&self.on) else { continue };
            if let Some(matches) = index.get(&key.to_string()) {
                for other in matches {
                    let mut merged = row.clone();
                    for (column, value) in other.iter() {
                        merged.entry(column.clone()).or_insert_with(|| value.clone());
                    }
                    joined.push(merged);
                }
            }
        }

        Ok(vec![Chunk::new(joined)])
    }
}

/// Constructor signature stored in the registry.
pub type TransformCtor = Arc<dyn Fn(&Map<String, Value>) -> Result<Arc<dyn Transform>, SynqxError> + Send + Sync>;

/// Registry mapping `operator_class` strings to transform constructors.
pub struct TransformRegistry {
    ctors: parking_lot::RwLock<HashMap<String, TransformCtor>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self {
            ctors: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    /// A registry with the built-in transforms registered.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("noop", Arc::new(|_| Ok(Arc::new(NoopTransform) as Arc<dyn Transform>)));
        registry.register("passthrough", Arc::new(|_| Ok(Arc::new(NoopTransform) as Arc<dyn Transform>)));
        registry.register(
            "projection",
            Arc::new(|config| Ok(Arc::new(ProjectionTransform::from_config(config)?) as Arc<dyn Transform>)),
        );
        registry.register("union", Arc::new(|_| Ok(Arc::new(UnionTransform) as Arc<dyn Transform>)));
        registry.register("merge", Arc::new(|_| Ok(Arc::new(UnionTransform) as Arc<dyn Transform>)));
        registry.register(
            "join",
            Arc::new(|config| Ok(Arc::new(JoinTransform::from_config(config)?) as Arc<dyn Transform>)),
        );
        registry
    }

    pub fn register(&self, operator_class: &str, ctor: TransformCtor) {
        self.ctors.write().insert(operator_class.to_string(), ctor);
    }

    /// Instantiates the transform for an operator class. Unknown classes
    /// degrade to pass-through with a warning rather than failing the node.
    pub fn create(&self, operator_class: &str, config: &Map<String, Value>) -> Result<Arc<dyn Transform>, SynqxError> {
        match self.ctors.read().get(operator_class) {
            Some(ctor) => ctor(config),
            None => {
                warn!(operator_class, "transform not registered, using pass-through");
                Ok(Arc::new(NoopTransform))
            }
        }
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use synqx_domain::row;

    #[tokio::test]
    async fn test_projection_keeps_named_columns() {
        let mut config = Map::new();
        config.insert("columns".into(), json!(["id"]));
        let transform = ProjectionTransform::from_config(&config).unwrap();
        let output = transform
            .transform(vec![Chunk::new(vec![row(&[("id", json!(1)), ("secret", json!("x"))])])])
            .await
            .unwrap();
        assert_eq!(output[0].rows()[0].len(), 1);
        assert!(output[0].rows()[0].contains_key("id"));
    }

    #[tokio::test]
    async fn test_union_concatenates_in_upstream_order() {
        let transform = UnionTransform;
        let mut inputs = HashMap::new();
        inputs.insert("b_second".to_string(), vec![Chunk::new(vec![row(&[("v", json!(2))])])]);
        inputs.insert("a_first".to_string(), vec![Chunk::new(vec![row(&[("v", json!(1))])])]);
        let output = transform.transform_multi(inputs).await.unwrap();
        let rows: Vec<_> = output.iter().flat_map(|c| c.rows().iter()).collect();
        assert_eq!(rows[0].get("v"), Some(&json!(1)));
        assert_eq!(rows[1].get("v"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_join_on_key() {
        let mut config = Map::new();
        config.insert("on".into(), json!("id"));
        let transform = JoinTransform::from_config(&config).unwrap();

        let mut inputs = HashMap::new();
        inputs.insert(
            "a_users".to_string(),
            vec![Chunk::new(vec![
                row(&[("id", json!(1)), ("name", json!("sam"))]),
                row(&[("id", json!(2)), ("name", json!("kim"))]),
            ])],
        );
        inputs.insert(
            "b_orders".to_string(),
            vec![Chunk::new(vec![row(&[("id", json!(2)), ("total", json!(40))])])],
        );

        let output = transform.transform_multi(inputs).await.unwrap();
        assert_eq!(output[0].row_count(), 1);
        let joined = &output[0].rows()[0];
        assert_eq!(joined.get("name"), Some(&json!("kim")));
        assert_eq!(joined.get("total"), Some(&json!(40)));
    }

    #[tokio::test]
    async fn test_registry_falls_back_to_noop() {
        let registry = TransformRegistry::with_builtins();
        let transform = registry.create("not_a_real_class", &Map::new()).unwrap();
        let input = vec![Chunk::new(vec![row(&[("x", json!(1))])])];
        let output = transform.transform(input.clone()).await.unwrap();
        assert_eq!(output, input);
    }

    #[tokio::test]
    async fn test_registry_propagates_bad_config() {
        let registry = TransformRegistry::with_builtins();
        assert!(matches!(
            registry.create("projection", &Map::new()),
            Err(SynqxError::Configuration(_))
        ));
    }
}
