// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # DAG Model
//!
//! Graph construction, cycle detection, topological ordering, and execution
//! layering for pipeline versions.
//!
//! ## Layering
//!
//! [`Dag::execution_layers`] partitions nodes into ordered layers
//! L₀, L₁, …, Lₖ such that every edge (u → v) has u in a layer strictly
//! below v. Nodes inside a layer are ordered by `(order_index, node_id)`
//! ascending, which makes the layering a pure function of the node and edge
//! *sets*: permuting edge insertion order cannot change the result.
//!
//! ## Failure Modes
//!
//! Any cycle surfaces as `SynqxError::Cycle` naming the nodes that could
//! not be placed. Edges referencing unknown nodes are rejected at
//! `add_edge` time.

use std::collections::{BTreeMap, HashMap, HashSet};

use synqx_domain::{PipelineVersion, SynqxError};

/// Metadata carried on a directed edge, consulted when the runner filters a
/// layer by edge conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeMeta {
    pub from_node_id: String,
    pub to_node_id: String,
    pub edge_type: String,
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct NodeEntry {
    order_index: i32,
    outgoing: Vec<usize>,
    incoming: Vec<usize>,
}

/// Directed acyclic graph over stable node identifiers.
///
/// The graph stores only topology and edge metadata; node payloads stay in
/// the owning [`PipelineVersion`]. `BTreeMap` keeps iteration order
/// deterministic independent of insertion order.
#[derive(Debug, Clone, Default)]
pub struct Dag {
    nodes: BTreeMap<String, NodeEntry>,
    edges: Vec<EdgeMeta>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds and validates a DAG from a pipeline version.
    ///
    /// Runs the version's structural validation first, then proves
    /// acyclicity by computing the execution layers once.
    ///
    /// # Errors
    /// `SynqxError::Validation` for structural breaches,
    /// `SynqxError::Cycle` when a cycle exists.
    pub fn from_version(version: &PipelineVersion) -> Result<Self, SynqxError> {
        version.validate()?;

        let mut dag = Dag::new();
        for node in &version.nodes {
            dag.add_node(&node.node_id, node.order_index);
        }
        for edge in &version.edges {
            dag.add_edge(
                &edge.from_node_id,
                &edge.to_node_id,
                &edge.edge_type,
                edge.condition.clone(),
            )?;
        }

        dag.execution_layers()?;
        Ok(dag)
    }

    /// Adds a node. Re-adding an existing node updates its order index.
    pub fn add_node(&mut self, node_id: &str, order_index: i32) {
        self.nodes.entry(node_id.to_string()).or_default().order_index = order_index;
    }

    /// Adds a directed edge with metadata.
    ///
    /// # Errors
    /// `SynqxError::Validation` when either endpoint is unknown or the edge
    /// is a self-loop.
    pub fn add_edge(
        &mut self,
        from: &str,
        to: &str,
        edge_type: &str,
        condition: Option<String>,
    ) -> Result<(), SynqxError> {
        if from == to {
            return Err(SynqxError::Validation(format!(
                "Self-loop detected: node '{}' cannot connect to itself",
                from
            )));
        }
        if !self.nodes.contains_key(from) || !self.nodes.contains_key(to) {
            return Err(SynqxError::Validation(format!(
                "Invalid edge: references non-existent node ({} -> {})",
                from, to
            )));
        }

        let idx = self.edges.len();
        self.edges.push(EdgeMeta {
            from_node_id: from.to_string(),
            to_node_id: to.to_string(),
            edge_type: edge_type.to_string(),
            condition,
        });
        if let Some(entry) = self.nodes.get_mut(from) {
            entry.outgoing.push(idx);
        }
        if let Some(entry) = self.nodes.get_mut(to) {
            entry.incoming.push(idx);
        }
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Direct upstream neighbors of `node_id`, deduplicated, sorted.
    pub fn upstream(&self, node_id: &str) -> Vec<String> {
        let Some(entry) = self.nodes.get(node_id) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = entry
            .incoming
            .iter()
            .map(|&i| self.edges[i].from_node_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Direct downstream neighbors of `node_id`, deduplicated, sorted.
    pub fn downstream(&self, node_id: &str) -> Vec<String> {
        let Some(entry) = self.nodes.get(node_id) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = entry
            .outgoing
            .iter()
            .map(|&i| self.edges[i].to_node_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Every node reachable downstream of `node_id` (transitive closure).
    pub fn downstream_closure(&self, node_id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = self.downstream(node_id);
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.downstream(&next));
            }
        }
        seen
    }

    /// Metadata of all inbound edges of `node_id`.
    pub fn incoming_edge_metadata(&self, node_id: &str) -> Vec<&EdgeMeta> {
        match self.nodes.get(node_id) {
            Some(entry) => entry.incoming.iter().map(|&i| &self.edges[i]).collect(),
            None => Vec::new(),
        }
    }

    /// A flat topological ordering: the concatenation of the execution
    /// layers.
    ///
    /// # Errors
    /// `SynqxError::Cycle` if any cycle exists.
    pub fn topological_sort(&self) -> Result<Vec<String>, SynqxError> {
        Ok(self.execution_layers()?.into_iter().flatten().collect())
    }

    /// Partitions nodes into execution layers.
    ///
    /// Layer k holds every node whose upstream set is fully contained in
    /// layers 0..k. Within a layer, nodes are sorted by
    /// `(order_index, node_id)` ascending.
    ///
    /// # Errors
    /// `SynqxError::Cycle` naming the unplaceable nodes when a cycle
    /// prevents completion.
    pub fn execution_layers(&self) -> Result<Vec<Vec<String>>, SynqxError> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|(id, entry)| (id.as_str(), entry.incoming.len()))
            .collect();

        let mut layers: Vec<Vec<String>> = Vec::new();
        let mut placed: HashSet<&str> = HashSet::new();

        while placed.len() < self.nodes.len() {
            let mut ready: Vec<&str> = in_degree
                .iter()
                .filter(|(id, deg)| **deg == 0 && !placed.contains(**id))
                .map(|(id, _)| *id)
                .collect();

            if ready.is_empty() {
                let mut stuck: Vec<&str> = self
                    .nodes
                    .keys()
                    .map(String::as_str)
                    .filter(|id| !placed.contains(id))
                    .collect();
                stuck.sort();
                return Err(SynqxError::Cycle(format!(
                    "cannot schedule nodes [{}]",
                    stuck.join(", ")
                )));
            }

            ready.sort_by_key(|id| (self.nodes[*id].order_index, *id));

            for id in &ready {
                placed.insert(*id);
                for &edge_idx in &self.nodes[*id].outgoing {
                    let to = self.edges[edge_idx].to_node_id.as_str();
                    if let Some(deg) = in_degree.get_mut(to) {
                        *deg = deg.saturating_sub(1);
                    }
                }
            }

            layers.push(ready.into_iter().map(str::to_string).collect());
        }

        Ok(layers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use synqx_domain::{EdgeDefinition, NodeDefinition, OperatorType};

    fn dag_from(nodes: &[(&str, i32)], edges: &[(&str, &str)]) -> Dag {
        let mut dag = Dag::new();
        for (id, order) in nodes {
            dag.add_node(id, *order);
        }
        for (from, to) in edges {
            dag.add_edge(from, to, "data_flow", None).unwrap();
        }
        dag
    }

    #[test]
    fn test_linear_layers() {
        let dag = dag_from(&[("a", 0), ("b", 1), ("c", 2)], &[("a", "b"), ("b", "c")]);
        let layers = dag.execution_layers().unwrap();
        assert_eq!(layers, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_diamond_layers() {
        let dag = dag_from(
            &[("a", 0), ("b", 1), ("c", 2), ("d", 3)],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );
        let layers = dag.execution_layers().unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[1], vec!["b", "c"]);
    }

    #[test]
    fn test_layer_tie_break_by_order_index() {
        let dag = dag_from(&[("zeta", 0), ("alpha", 1)], &[]);
        let layers = dag.execution_layers().unwrap();
        // zeta has the lower order_index, so it precedes alpha despite the name
        assert_eq!(layers, vec![vec!["zeta", "alpha"]]);
    }

    #[test]
    fn test_cycle_detection() {
        let dag = dag_from(&[("a", 0), ("b", 1)], &[("a", "b"), ("b", "a")]);
        let err = dag.execution_layers().unwrap_err();
        assert!(matches!(err, SynqxError::Cycle(_)));
        assert!(err.to_string().contains('a'));
    }

    #[test]
    fn test_self_loop_rejected_at_add() {
        let mut dag = dag_from(&[("a", 0)], &[]);
        assert!(dag.add_edge("a", "a", "data_flow", None).is_err());
    }

    #[test]
    fn test_unknown_endpoint_rejected() {
        let mut dag = dag_from(&[("a", 0)], &[]);
        assert!(dag.add_edge("a", "ghost", "data_flow", None).is_err());
    }

    #[test]
    fn test_upstream_downstream_queries() {
        let dag = dag_from(&[("a", 0), ("b", 1), ("c", 2)], &[("a", "b"), ("a", "c"), ("b", "c")]);
        assert_eq!(dag.upstream("c"), vec!["a", "b"]);
        assert_eq!(dag.downstream("a"), vec!["b", "c"]);
        assert!(dag.upstream("a").is_empty());
        let closure = dag.downstream_closure("a");
        assert!(closure.contains("b") && closure.contains("c"));
    }

    #[test]
    fn test_incoming_edge_metadata_carries_condition() {
        let mut dag = dag_from(&[("a", 0), ("b", 1)], &[]);
        dag.add_edge("a", "b", "data_flow", Some("inputs['a'].count > 0".into()))
            .unwrap();
        let meta = dag.incoming_edge_metadata("b");
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0].condition.as_deref(), Some("inputs['a'].count > 0"));
    }

    #[test]
    fn test_from_version_detects_cycle() {
        let version = synqx_domain::PipelineVersion::new(
            1,
            1,
            vec![
                NodeDefinition::new("a", OperatorType::Transform, "noop"),
                NodeDefinition::new("b", OperatorType::Transform, "noop"),
            ],
            vec![EdgeDefinition::new("a", "b"), EdgeDefinition::new("b", "a")],
        );
        // b has fan-in 1 and a has fan-in 1, so structural validation passes;
        // the cycle is caught by layering
        assert!(matches!(Dag::from_version(&version), Err(SynqxError::Cycle(_))));
    }

    proptest! {
        /// Every edge (u → v) has u strictly before v in the topological order.
        #[test]
        fn prop_topological_order_respects_edges(edge_bits in proptest::collection::vec(any::<bool>(), 15)) {
            // Build a random DAG over 6 nodes from the upper-triangular edge set
            let ids: Vec<String> = (0..6).map(|i| format!("n{}", i)).collect();
            let mut dag = Dag::new();
            for (i, id) in ids.iter().enumerate() {
                dag.add_node(id, i as i32);
            }
            let mut bit = 0;
            let mut edges = Vec::new();
            for i in 0..6 {
                for j in (i + 1)..6 {
                    if edge_bits[bit] {
                        dag.add_edge(&ids[i], &ids[j], "data_flow", None).unwrap();
                        edges.push((ids[i].clone(), ids[j].clone()));
                    }
                    bit += 1;
                }
            }

            let order = dag.topological_sort().unwrap();
            let position: std::collections::HashMap<&str, usize> =
                order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
            for (from, to) in &edges {
                prop_assert!(position[from.as_str()] < position[to.as_str()]);
            }
        }

        /// Layering is identical for any permutation of edge insertion order.
        #[test]
        fn prop_layering_independent_of_edge_order(seed in 0usize..1000) {
            let nodes = [("a", 0), ("b", 1), ("c", 2), ("d", 3), ("e", 4)];
            let mut edges = vec![("a", "b"), ("a", "c"), ("b", "d"), ("c", "d"), ("d", "e")];

            let reference = dag_from(&nodes, &edges).execution_layers().unwrap();

            // Deterministic pseudo-shuffle driven by the seed
            let len = edges.len();
            for i in 0..len {
                let j = (seed + i * 7) % len;
                edges.swap(i, j);
            }
            let shuffled = dag_from(&nodes, &edges).execution_layers().unwrap();
            prop_assert_eq!(reference, shuffled);
        }
    }
}
