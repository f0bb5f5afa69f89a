// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! End-to-end runner scenarios: linear pipelines, conditional branch
//! skipping, retry classification, dynamic fan-out, and cancellation,
//! all executed through the full runner/executor/cache stack against the
//! in-memory connector.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use synqx_domain::{
    row, Asset, ConnectionPayload, DataContract, ColumnRule, EdgeDefinition, NodeDefinition, OperatorType,
    PipelineVersion, StepStatus, SynqxError,
};
use synqx_engine::connectors::memory::MemoryConnector;
use synqx_engine::state::RecordedRunOutcome;
use synqx_engine::{
    ConnectorRegistry, DataCache, ExecutionEnvironment, MemoryStateSink, MemoryWatermarkStore, ParallelRunner,
    RunnerOptions, TransformRegistry,
};

fn environment(namespace: &str) -> Arc<ExecutionEnvironment> {
    let mut config = Map::new();
    config.insert("namespace".into(), Value::String(namespace.into()));
    let mut connections = HashMap::new();
    connections.insert(
        "1".to_string(),
        ConnectionPayload {
            id: 1,
            connector_type: "memory".into(),
            config,
        },
    );

    let mut assets = HashMap::new();
    assets.insert(
        10,
        Asset {
            id: 10,
            connection_id: 1,
            name: "source".into(),
            fully_qualified_name: None,
            is_incremental_capable: false,
            config: Map::new(),
        },
    );
    assets.insert(
        20,
        Asset {
            id: 20,
            connection_id: 1,
            name: "dest".into(),
            fully_qualified_name: None,
            is_incremental_capable: false,
            config: Map::new(),
        },
    );

    Arc::new(ExecutionEnvironment {
        pipeline_id: 1,
        run_id: 1,
        connections,
        assets,
        connector_registry: Arc::new(ConnectorRegistry::with_builtins()),
        transform_registry: Arc::new(TransformRegistry::with_builtins()),
        watermarks: Arc::new(MemoryWatermarkStore::new()),
        forensic_base: None,
        runtime_envs: None,
    })
}

fn runner(env: Arc<ExecutionEnvironment>, sink: Arc<MemoryStateSink>) -> ParallelRunner {
    ParallelRunner::new(env, sink, Arc::new(DataCache::new(64).unwrap()), RunnerOptions::default())
}

fn extract_node(id: &str, order: i32) -> NodeDefinition {
    let mut node = NodeDefinition::new(id, OperatorType::Extract, "memory_read");
    node.source_asset_id = Some(10);
    node.order_index = order;
    node
}

fn load_node(id: &str, order: i32) -> NodeDefinition {
    let mut node = NodeDefinition::new(id, OperatorType::Load, "memory_write");
    node.destination_asset_id = Some(20);
    node.order_index = order;
    node
}

#[tokio::test]
async fn two_node_linear_pipeline_moves_rows() {
    let namespace = "it_linear";
    MemoryConnector::store_for(namespace).seed("source", vec![row(&[("x", json!(1))]), row(&[("x", json!(2))])]);

    let version = PipelineVersion::new(
        1,
        1,
        vec![extract_node("a", 0), load_node("b", 1)],
        vec![EdgeDefinition::new("a", "b")],
    );

    let env = environment(namespace);
    let sink = Arc::new(MemoryStateSink::new());
    let metrics = runner(env, sink.clone()).run(&version).await.unwrap();

    assert_eq!(sink.outcome(), RecordedRunOutcome::Completed);
    assert_eq!(sink.step("a").unwrap().counters.records_out, 2);
    assert_eq!(sink.step("b").unwrap().counters.records_in, 2);
    assert_eq!(sink.step("b").unwrap().counters.records_out, 2);
    assert_eq!(MemoryConnector::store_for(namespace).row_count("dest"), 2);
    assert_eq!(metrics.completed_nodes, 2);
    MemoryConnector::reset_namespace(namespace);
}

#[tokio::test]
async fn conditional_edge_skips_branch() {
    let namespace = "it_branch";
    MemoryConnector::store_for(namespace).seed(
        "source",
        (0..3).map(|i| row(&[("x", json!(i))])).collect(),
    );

    // A → {B, C}; edge A→C requires more than 5 rows, A emits 3
    let mut c = load_node("c", 2);
    c.destination_asset_id = Some(20);
    let version = PipelineVersion::new(
        1,
        1,
        vec![extract_node("a", 0), load_node("b", 1), c],
        vec![
            EdgeDefinition::new("a", "b"),
            EdgeDefinition::new("a", "c").with_condition("inputs['a'].count > 5"),
        ],
    );

    let env = environment(namespace);
    let sink = Arc::new(MemoryStateSink::new());
    runner(env, sink.clone()).run(&version).await.unwrap();

    assert_eq!(sink.outcome(), RecordedRunOutcome::Completed);
    assert_eq!(sink.step("b").unwrap().status, StepStatus::Success);
    assert_eq!(sink.step("b").unwrap().counters.records_in, 3);
    assert_eq!(sink.step("c").unwrap().status, StepStatus::Skipped);
    MemoryConnector::reset_namespace(namespace);
}

#[tokio::test]
async fn unevaluable_condition_fails_closed() {
    let namespace = "it_failclosed";
    MemoryConnector::store_for(namespace).seed("source", vec![row(&[("x", json!(1))])]);

    let version = PipelineVersion::new(
        1,
        1,
        vec![extract_node("a", 0), load_node("b", 1)],
        vec![EdgeDefinition::new("a", "b").with_condition("eval('2+2') == 4")],
    );

    let env = environment(namespace);
    let sink = Arc::new(MemoryStateSink::new());
    let err = runner(env, sink.clone()).run(&version).await.unwrap_err();
    assert!(matches!(err, SynqxError::Expression(_)));
    assert!(matches!(sink.outcome(), RecordedRunOutcome::Failed { .. }));
    MemoryConnector::reset_namespace(namespace);
}

#[tokio::test]
async fn permissive_mode_treats_unevaluable_condition_as_true() {
    let namespace = "it_permissive";
    MemoryConnector::store_for(namespace).seed("source", vec![row(&[("x", json!(1))])]);

    let version = PipelineVersion::new(
        1,
        1,
        vec![extract_node("a", 0), load_node("b", 1)],
        vec![EdgeDefinition::new("a", "b").with_condition("eval('2+2') == 4")],
    );

    let env = environment(namespace);
    let sink = Arc::new(MemoryStateSink::new());
    let runner = ParallelRunner::new(
        env,
        sink.clone(),
        Arc::new(DataCache::new(64).unwrap()),
        RunnerOptions {
            permissive_conditions: true,
            ..Default::default()
        },
    );
    runner.run(&version).await.unwrap();
    assert_eq!(sink.outcome(), RecordedRunOutcome::Completed);
    assert_eq!(sink.step("b").unwrap().status, StepStatus::Success);
    MemoryConnector::reset_namespace(namespace);
}

#[tokio::test]
async fn configuration_error_is_not_retried() {
    let namespace = "it_noretry";
    MemoryConnector::store_for(namespace).seed("source", vec![row(&[("x", json!(1))])]);

    // Transform with a broken projection config raises a configuration
    // error; with max_retries=5 it must still fail on the first attempt.
    let mut bad = NodeDefinition::new("t", OperatorType::Transform, "projection");
    bad.order_index = 1;
    bad.max_retries = 5;

    let version = PipelineVersion::new(
        1,
        1,
        vec![extract_node("a", 0), bad],
        vec![EdgeDefinition::new("a", "t")],
    );

    let env = environment(namespace);
    let sink = Arc::new(MemoryStateSink::new());
    let err = runner(env, sink.clone()).run(&version).await.unwrap_err();

    assert!(matches!(err, SynqxError::Configuration(_)));
    let step = sink.step("t").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    // attempts == 1: retry_count recorded as 0
    assert_eq!(step.retry_count, 0);
    match sink.outcome() {
        RecordedRunOutcome::Failed { failed_node, .. } => assert_eq!(failed_node.as_deref(), Some("t")),
        other => panic!("expected failed outcome, got {:?}", other),
    }
    MemoryConnector::reset_namespace(namespace);
}

#[tokio::test]
async fn contract_quarantine_flows_valid_rows_downstream() {
    let namespace = "it_contract";
    MemoryConnector::store_for(namespace).seed(
        "source",
        vec![
            row(&[("age", json!(5))]),
            row(&[("age", json!(-1))]),
            row(&[("age", json!("bad"))]),
        ],
    );

    let mut validate = NodeDefinition::new("v", OperatorType::Validate, "noop");
    validate.order_index = 1;
    validate.data_contract = Some(DataContract {
        columns: vec![ColumnRule {
            name: "age".into(),
            value_kind: Some(synqx_domain::ValueKind::Integer),
            min: Some(json!(0)),
            ..Default::default()
        }],
        strict: false,
    });

    let version = PipelineVersion::new(
        1,
        1,
        vec![extract_node("a", 0), validate, load_node("l", 2)],
        vec![EdgeDefinition::new("a", "v"), EdgeDefinition::new("v", "l")],
    );

    let env = environment(namespace);
    let sink = Arc::new(MemoryStateSink::new());
    runner(env, sink.clone()).run(&version).await.unwrap();

    assert_eq!(sink.outcome(), RecordedRunOutcome::Completed);
    assert_eq!(sink.step("v").unwrap().counters.records_error, 2);
    assert_eq!(MemoryConnector::store_for(namespace).row_count("dest"), 1);
    MemoryConnector::reset_namespace(namespace);
}

#[tokio::test]
async fn dynamic_fan_out_flattens_instances() {
    let namespace = "it_dynamic";
    MemoryConnector::store_for(namespace).seed("source", vec![row(&[("x", json!(0))])]);

    let mut fan = NodeDefinition::new("fan", OperatorType::Transform, "noop");
    fan.order_index = 1;
    fan.is_dynamic = true;
    fan.mapping_expr = Some(r#"[{"region": "eu"}, {"region": "us"}, {"region": "ap"}]"#.into());

    let version = PipelineVersion::new(
        1,
        1,
        vec![extract_node("a", 0), fan],
        vec![EdgeDefinition::new("a", "fan")],
    );

    let env = environment(namespace);
    let sink = Arc::new(MemoryStateSink::new());
    let metrics = runner(env, sink.clone()).run(&version).await.unwrap();

    assert_eq!(sink.outcome(), RecordedRunOutcome::Completed);
    // Three instances each pass the single upstream row through
    assert_eq!(sink.step("fan").unwrap().counters.records_out, 3);
    assert_eq!(metrics.completed_nodes, 2);
    MemoryConnector::reset_namespace(namespace);
}

#[tokio::test]
async fn cancellation_marks_run_failed_with_cancellation() {
    let namespace = "it_cancel";
    MemoryConnector::store_for(namespace).seed("source", vec![row(&[("x", json!(1))])]);

    let version = PipelineVersion::new(
        1,
        1,
        vec![extract_node("a", 0), load_node("b", 1)],
        vec![EdgeDefinition::new("a", "b")],
    );

    let env = environment(namespace);
    let sink = Arc::new(MemoryStateSink::new());
    sink.cancel();
    let err = runner(env, sink.clone()).run(&version).await.unwrap_err();
    assert!(matches!(err, SynqxError::Cancellation(_)));
    MemoryConnector::reset_namespace(namespace);
}

#[tokio::test]
async fn completed_run_counts_match_step_records() {
    let namespace = "it_counts";
    MemoryConnector::store_for(namespace).seed("source", (0..10).map(|i| row(&[("x", json!(i))])).collect());

    let mut t = NodeDefinition::new("t", OperatorType::Transform, "noop");
    t.order_index = 1;
    let version = PipelineVersion::new(
        1,
        1,
        vec![extract_node("a", 0), t, load_node("l", 2)],
        vec![EdgeDefinition::new("a", "t"), EdgeDefinition::new("t", "l")],
    );

    let env = environment(namespace);
    let sink = Arc::new(MemoryStateSink::new());
    runner(env, sink.clone()).run(&version).await.unwrap();

    let steps = sink.steps();
    let successes = steps.values().filter(|s| s.status == StepStatus::Success).count();
    assert_eq!(successes, 3);
    assert_eq!(sink.total_nodes(), 3);
    MemoryConnector::reset_namespace(namespace);
}
