// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Parallel Runner
//!
//! Executes a pipeline version layer by layer: all upstreams of a node are
//! fully materialized in the data cache before the node starts, and nodes
//! within a layer run concurrently on a bounded worker pool.
//!
//! ## Per-Layer Sequence
//!
//! 1. check the pipeline-wide timeout and the cancellation flag
//! 2. filter the layer by edge conditions; filtered nodes are marked
//!    Skipped and contribute no output
//! 3. run executable nodes concurrently (inline when the layer has one),
//!    expanding dynamic nodes into one task per mapping item
//! 4. store each successful node's chunks in the cache, then release
//!    entries whose downstream set is complete and evict further LRU
//!    entries above 75% utilization
//!
//! ## Failure Policy
//!
//! Retryable errors re-attempt under the node's retry strategy; errors in
//! the non-retryable set (configuration, validation, contract, invariant
//! classes) fail the node on the first attempt. A terminal node failure
//! cancels outstanding layer tasks cooperatively, marks the run Failed
//! with the failing node attached, and aborts. Completed step records
//! remain untouched.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use synqx_domain::{Chunk, NodeDefinition, PipelineVersion, StepCounters, StepStatus, SynqxError};

use crate::cache::DataCache;
use crate::dag::Dag;
use crate::executor::{ExecutionEnvironment, NodeExecutor, NodeOutput};
use crate::expression;
use crate::metrics::ExecutionMetrics;
use crate::state::{StateSink, StepProgress};

/// Cache utilization threshold that triggers proactive eviction.
const EVICTION_THRESHOLD_PCT: f64 = 75.0;

/// Runner tuning knobs.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Bounded pool size; 0 auto-scales to `2 × CPU count`.
    pub max_parallel_nodes: usize,
    /// Pipeline-wide wall-clock budget, checked at layer boundaries.
    pub execution_timeout: Option<Duration>,
    /// Restores the legacy behavior of treating unevaluable edge
    /// conditions as true instead of failing the run.
    pub permissive_conditions: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 0,
            execution_timeout: None,
            permissive_conditions: false,
        }
    }
}

impl RunnerOptions {
    fn resolved_pool_size(&self) -> usize {
        if self.max_parallel_nodes > 0 {
            return self.max_parallel_nodes;
        }
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
        cpus * 2
    }
}

struct RunContext {
    executor: NodeExecutor,
    sink: Arc<dyn StateSink>,
    cache: Arc<DataCache>,
    dag: Dag,
    pool: Arc<Semaphore>,
    aborted: AtomicBool,
}

impl RunContext {
    fn cancelled(&self) -> bool {
        self.aborted.load(Ordering::SeqCst) || self.sink.is_cancelled()
    }
}

/// Layer-parallel DAG executor.
pub struct ParallelRunner {
    env: Arc<ExecutionEnvironment>,
    sink: Arc<dyn StateSink>,
    cache: Arc<DataCache>,
    options: RunnerOptions,
}

impl ParallelRunner {
    pub fn new(
        env: Arc<ExecutionEnvironment>,
        sink: Arc<dyn StateSink>,
        cache: Arc<DataCache>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            env,
            sink,
            cache,
            options,
        }
    }

    /// Runs a pipeline version to completion.
    ///
    /// On success the run is marked Completed and the metrics returned; on
    /// any terminal failure the run is marked Failed (or Cancelled) before
    /// the error propagates.
    pub async fn run(&self, version: &PipelineVersion) -> Result<ExecutionMetrics, SynqxError> {
        let dag = match Dag::from_version(version) {
            Ok(dag) => dag,
            Err(e) => {
                self.sink.fail_run(&e, None).await?;
                return Err(e);
            }
        };
        let layers = dag.execution_layers()?;
        let total_nodes = version.nodes.len() as u32;
        let mut metrics = ExecutionMetrics::started(total_nodes);
        self.sink.run_started(total_nodes).await?;

        info!(
            pipeline_id = version.pipeline_id,
            nodes = total_nodes,
            layers = layers.len(),
            pool = self.options.resolved_pool_size(),
            "pipeline execution started"
        );

        let ctx = Arc::new(RunContext {
            executor: NodeExecutor::new(Arc::clone(&self.env), Arc::clone(&self.sink)),
            sink: Arc::clone(&self.sink),
            cache: Arc::clone(&self.cache),
            dag,
            pool: Arc::new(Semaphore::new(self.options.resolved_pool_size())),
            aborted: AtomicBool::new(false),
        });

        let mut finished: HashSet<String> = HashSet::new();

        for (layer_idx, layer) in layers.iter().enumerate() {
            if let Some(budget) = self.options.execution_timeout {
                let elapsed = metrics
                    .execution_start
                    .map(|start| (chrono::Utc::now() - start).num_seconds().max(0) as u64)
                    .unwrap_or(0);
                if elapsed > budget.as_secs() {
                    let e = SynqxError::ExecutionTimeout(format!(
                        "pipeline exceeded global timeout of {}s",
                        budget.as_secs()
                    ));
                    return self.abort(&mut metrics, e, None).await;
                }
            }
            if ctx.cancelled() {
                let e = SynqxError::Cancellation("run cancelled before layer start".to_string());
                return self.abort(&mut metrics, e, None).await;
            }

            let executable = match self.filter_by_conditions(version, &ctx.dag, layer, &mut metrics).await {
                Ok(nodes) => nodes,
                Err(e) => return self.abort(&mut metrics, e, None).await,
            };
            if executable.is_empty() {
                continue;
            }

            debug!(
                layer = layer_idx + 1,
                nodes = ?executable.iter().map(|n| n.node_id.as_str()).collect::<Vec<_>>(),
                "executing layer"
            );

            let results = if executable.len() == 1 {
                // Single node executes inline, skipping pool overhead
                let node = executable.into_iter().next().expect("one node");
                let node_id = node.node_id.clone();
                vec![(node_id, run_node(Arc::clone(&ctx), node).await)]
            } else {
                let mut join_set = JoinSet::new();
                for node in executable {
                    let ctx = Arc::clone(&ctx);
                    let node_id = node.node_id.clone();
                    join_set.spawn(async move { (node_id, run_node(ctx, node).await) });
                }
                let mut results = Vec::new();
                while let Some(joined) = join_set.join_next().await {
                    match joined {
                        Ok(result) => {
                            // First terminal failure cancels the rest cooperatively
                            if result.1.is_err() {
                                ctx.aborted.store(true, Ordering::SeqCst);
                            }
                            results.push(result);
                        }
                        Err(e) => {
                            ctx.aborted.store(true, Ordering::SeqCst);
                            results.push((
                                "<join>".to_string(),
                                Err(SynqxError::Internal(format!("worker task panicked: {}", e))),
                            ));
                        }
                    }
                }
                results
            };

            let mut layer_records: u64 = 0;
            let mut first_failure: Option<(String, SynqxError)> = None;
            for (node_id, result) in results {
                match result {
                    Ok(output) => {
                        layer_records += output.counters.records_out;
                        metrics.completed_nodes += 1;
                        metrics.total_records_processed += output.counters.records_out;
                        metrics.bytes_processed += output.counters.bytes_processed;
                        self.cache.store(&node_id, output.chunks);
                        finished.insert(node_id);
                    }
                    Err(e) => {
                        metrics.failed_nodes += 1;
                        if first_failure.is_none() {
                            first_failure = Some((node_id, e));
                        }
                    }
                }
            }
            if let Some((node_id, e)) = first_failure {
                return self.abort(&mut metrics, e, Some(node_id.as_str())).await;
            }

            // Memory management: release entries nothing still needs
            for node_id in self.cache.resident_nodes() {
                let downstream = ctx.dag.downstream(&node_id);
                if !downstream.is_empty() && downstream.iter().all(|d| finished.contains(d)) {
                    self.cache.clear_node(&node_id);
                    debug!(node_id = %node_id, "released cache entry, downstream complete");
                }
            }
            let stats = self.cache.stats();
            if stats.utilization_pct > EVICTION_THRESHOLD_PCT {
                warn!(utilization = stats.utilization_pct, "high cache utilization, evicting LRU entries");
                self.cache.evict_to_utilization(EVICTION_THRESHOLD_PCT);
            }

            info!(
                layer = layer_idx + 1,
                records = layer_records,
                cache_utilization = self.cache.stats().utilization_pct,
                "layer finalized"
            );
        }

        metrics.finish();
        self.sink.complete_run(&metrics).await?;
        info!(
            duration_s = metrics.duration_seconds(),
            records = metrics.total_records_processed,
            nodes = metrics.completed_nodes,
            "pipeline execution completed"
        );
        Ok(metrics)
    }

    /// Marks the run failed (or cancelled) and propagates the error.
    async fn abort(
        &self,
        metrics: &mut ExecutionMetrics,
        error: SynqxError,
        failed_node: Option<&str>,
    ) -> Result<ExecutionMetrics, SynqxError> {
        metrics.finish();
        self.sink.fail_run(&error, failed_node).await?;
        warn!(error = %error, failed_node, "pipeline execution aborted");
        Err(error)
    }

    /// Evaluates inbound edge conditions for a layer. Nodes whose
    /// conditions evaluate false are marked Skipped; evaluation errors fail
    /// closed unless `permissive_conditions` is set.
    async fn filter_by_conditions(
        &self,
        version: &PipelineVersion,
        dag: &Dag,
        layer: &[String],
        metrics: &mut ExecutionMetrics,
    ) -> Result<Vec<NodeDefinition>, SynqxError> {
        let cache = Arc::clone(&self.cache);
        let lookup = move |node_id: &str| cache.retrieve(node_id);

        let mut executable = Vec::new();
        for node_id in layer {
            let node = version
                .node(node_id)
                .ok_or_else(|| SynqxError::Internal(format!("layer references unknown node '{}'", node_id)))?;

            let mut active = true;
            for edge in dag.incoming_edge_metadata(node_id) {
                let Some(condition) = &edge.condition else { continue };
                match expression::evaluate_condition(condition, &lookup) {
                    Ok(result) => {
                        if !result {
                            active = false;
                            break;
                        }
                    }
                    Err(e) if self.options.permissive_conditions => {
                        warn!(node_id = %node_id, condition = %condition, error = %e, "condition evaluation failed, treating as true");
                    }
                    Err(e) => return Err(e),
                }
            }

            if active {
                executable.push(node.clone());
            } else {
                info!(node_id = %node_id, "branch condition false, skipping node");
                self.sink
                    .ensure_step(node_id, node.operator_type, node.order_index)
                    .await?;
                self.sink
                    .mark_step_skipped(node_id, "Branch condition evaluated to false")
                    .await?;
                metrics.skipped_nodes += 1;
            }
        }
        Ok(executable)
    }
}

/// Executes one node, expanding dynamic fan-out when configured.
async fn run_node(ctx: Arc<RunContext>, node: NodeDefinition) -> Result<NodeOutput, SynqxError> {
    if node.is_dynamic && node.mapping_expr.is_some() {
        run_dynamic_node(ctx, node).await
    } else {
        run_with_retry(ctx, node, None).await
    }
}

/// Dynamic fan-out: evaluates the mapping expression against the upstream
/// cache and spawns one instance per item with `_dynamic_item` merged into
/// the node config. Instances share the step record; counters are summed
/// and the flattened outputs become the node's output.
async fn run_dynamic_node(ctx: Arc<RunContext>, node: NodeDefinition) -> Result<NodeOutput, SynqxError> {
    let expr = node.mapping_expr.clone().unwrap_or_default();
    let cache = Arc::clone(&ctx.cache);
    let lookup = move |node_id: &str| cache.retrieve(node_id);
    let items = expression::evaluate_mapping(&expr, &lookup)?;

    if items.is_empty() {
        warn!(node_id = %node.node_id, "dynamic mapping evaluated to an empty list, skipping");
        return Ok(NodeOutput::default());
    }
    info!(node_id = %node.node_id, instances = items.len(), "dynamic fan-out");

    let mut join_set = JoinSet::new();
    for item in items {
        let ctx = Arc::clone(&ctx);
        let node = node.clone();
        let mut overrides = Map::new();
        overrides.insert("_dynamic_item".to_string(), item);
        join_set.spawn(async move { run_with_retry(ctx, node, Some(overrides)).await });
    }

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut counters = StepCounters::default();
    let mut failure: Option<SynqxError> = None;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(output)) => {
                counters.merge(&output.counters);
                chunks.extend(output.chunks);
            }
            Ok(Err(e)) => {
                ctx.aborted.store(true, Ordering::SeqCst);
                if failure.is_none() {
                    failure = Some(e);
                }
            }
            Err(e) => {
                ctx.aborted.store(true, Ordering::SeqCst);
                if failure.is_none() {
                    failure = Some(SynqxError::Internal(format!("fan-out instance panicked: {}", e)));
                }
            }
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }

    // One aggregate terminal update across all instances
    ctx.sink
        .update_step(StepProgress {
            node_id: node.node_id.clone(),
            status: StepStatus::Success,
            counters,
            ..Default::default()
        })
        .await?;

    Ok(NodeOutput {
        chunks,
        counters,
        quality_profile: None,
    })
}

/// Executes a node with its retry policy, per-node timeout, and the bounded
/// worker pool. Terminal failures mark the step Failed before propagating.
async fn run_with_retry(
    ctx: Arc<RunContext>,
    node: NodeDefinition,
    config_override: Option<Map<String, Value>>,
) -> Result<NodeOutput, SynqxError> {
    let max_retries = node.max_retries;
    let mut attempt: u32 = 0;

    loop {
        if ctx.cancelled() {
            let e = SynqxError::Cancellation(format!("node '{}' cancelled before attempt", node.node_id));
            fail_step(&ctx, &node, attempt, &e).await;
            return Err(e);
        }

        let result = attempt_once(&ctx, &node, config_override.clone(), attempt).await;

        match result {
            Ok(output) => return Ok(output),
            Err(e) => {
                attempt += 1;
                let non_retryable = !e.is_retryable() || e.is_run_terminal();
                if non_retryable || attempt > max_retries {
                    if non_retryable {
                        warn!(node_id = %node.node_id, error = %e, "non-retryable failure");
                    } else {
                        warn!(node_id = %node.node_id, attempts = attempt, error = %e, "retries exhausted");
                    }
                    fail_step(&ctx, &node, attempt, &e).await;
                    return Err(e);
                }

                let delay = node.retry_strategy.delay_secs(node.retry_delay_seconds, attempt);
                warn!(
                    node_id = %node.node_id,
                    attempt,
                    max_retries,
                    delay_s = delay,
                    error = %e,
                    "node failed, retrying"
                );
                if !sleep_cancellable(&ctx, Duration::from_secs(delay)).await {
                    let e = SynqxError::Cancellation(format!("node '{}' cancelled during retry wait", node.node_id));
                    fail_step(&ctx, &node, attempt, &e).await;
                    return Err(e);
                }
            }
        }
    }
}

/// One attempt: acquire a pool permit, gather inputs from the cache, run
/// the executor, all under the node's timeout when configured.
async fn attempt_once(
    ctx: &Arc<RunContext>,
    node: &NodeDefinition,
    config_override: Option<Map<String, Value>>,
    attempt: u32,
) -> Result<NodeOutput, SynqxError> {
    let work = async {
        let _permit = ctx
            .pool
            .acquire()
            .await
            .map_err(|_| SynqxError::Internal("worker pool closed".to_string()))?;

        let mut inputs = std::collections::HashMap::new();
        for upstream in ctx.dag.upstream(&node.node_id) {
            let chunks = ctx.cache.retrieve(&upstream);
            debug!(node_id = %node.node_id, upstream = %upstream, chunks = chunks.len(), "loaded upstream input");
            inputs.insert(upstream, chunks);
        }

        ctx.executor.execute(node, inputs, config_override, attempt).await
    };

    match node.timeout_seconds {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), work).await {
            Ok(result) => result,
            Err(_) => Err(SynqxError::NodeTimeout(format!(
                "node '{}' exceeded its {}s timeout",
                node.node_id, secs
            ))),
        },
        None => work.await,
    }
}

async fn fail_step(ctx: &Arc<RunContext>, node: &NodeDefinition, attempts: u32, error: &SynqxError) {
    let _ = ctx
        .sink
        .update_step(StepProgress {
            node_id: node.node_id.clone(),
            status: StepStatus::Failed,
            retry_count: attempts.saturating_sub(1),
            error: Some((error.category().to_string(), error.to_string())),
            ..Default::default()
        })
        .await;
}

/// Sleeps in short slices so cancellation interrupts retry waits. Returns
/// false when cancelled.
async fn sleep_cancellable(ctx: &Arc<RunContext>, duration: Duration) -> bool {
    let slice = Duration::from_millis(200);
    let mut remaining = duration;
    while remaining > Duration::ZERO {
        if ctx.cancelled() {
            return false;
        }
        let step = remaining.min(slice);
        tokio::time::sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }
    !ctx.cancelled()
}
