// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Pipeline Job Handler
//!
//! Turns a lease payload into an in-process execution: builds the
//! execution environment from the shipped DAG and connection blobs, runs
//! it through the engine's parallel runner, and streams step telemetry
//! back through the throttled reporting sink.
//!
//! Telemetry failures never interrupt execution: a dropped update costs
//! observability, not correctness, and the terminal job report retries on
//! the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use synqx_domain::schemas::{PollResponse, StepUpdate};
use synqx_domain::{OperatorType, StepStatus, SynqxError};
use synqx_engine::{
    ConnectorRegistry, DataCache, ExecutionEnvironment, ExecutionMetrics, MemoryWatermarkStore, ParallelRunner,
    RunnerOptions, StateSink, StepProgress, TransformRegistry,
};

use crate::api_client::ApiClient;
use crate::config::AgentSettings;
use crate::system::{DirRuntimeEnvironments, SystemProbe};
use crate::telemetry::StepTelemetryThrottle;

/// Step-reporting [`StateSink`] that forwards progress over the protocol
/// with the 2-second coalescing throttle.
pub struct ReportingStateSink {
    client: Arc<ApiClient>,
    probe: Arc<SystemProbe>,
    throttle: StepTelemetryThrottle,
    job_id: i64,
    shutdown: Arc<AtomicBool>,
}

impl ReportingStateSink {
    pub fn new(client: Arc<ApiClient>, probe: Arc<SystemProbe>, job_id: i64, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            client,
            probe,
            throttle: StepTelemetryThrottle::new(),
            job_id,
            shutdown,
        }
    }

    async fn send(&self, mut update: StepUpdate) {
        let (cpu, memory) = self.probe.process_metrics();
        update.cpu_percent = cpu;
        update.memory_mb = memory;
        if let Err(e) = self.client.report_step(self.job_id, &update).await {
            debug!(job_id = self.job_id, node_id = %update.node_id, error = %e, "step telemetry send failed");
        }
    }
}

#[async_trait]
impl StateSink for ReportingStateSink {
    async fn run_started(&self, total_nodes: u32) -> Result<(), SynqxError> {
        debug!(job_id = self.job_id, total_nodes, "run started");
        Ok(())
    }

    async fn ensure_step(
        &self,
        _node_id: &str,
        _operator_type: OperatorType,
        _order_index: i32,
    ) -> Result<(), SynqxError> {
        // Step records are created control-plane-side from telemetry
        Ok(())
    }

    async fn update_step(&self, progress: StepProgress) -> Result<(), SynqxError> {
        if !self.throttle.should_send(&progress.node_id, progress.status) {
            return Ok(());
        }
        self.send(StepUpdate {
            node_id: progress.node_id,
            status: progress.status,
            counters: progress.counters,
            cpu_percent: None,
            memory_mb: None,
            sample_data: progress.sample_data,
            quality_profile: progress.quality_profile,
            error_message: progress.error.map(|(_, msg)| msg),
        })
        .await;
        Ok(())
    }

    async fn mark_step_skipped(&self, node_id: &str, reason: &str) -> Result<(), SynqxError> {
        self.send(StepUpdate {
            node_id: node_id.to_string(),
            status: StepStatus::Skipped,
            counters: Default::default(),
            cpu_percent: None,
            memory_mb: None,
            sample_data: None,
            quality_profile: None,
            error_message: Some(reason.to_string()),
        })
        .await;
        Ok(())
    }

    async fn complete_run(&self, _metrics: &ExecutionMetrics) -> Result<(), SynqxError> {
        // Terminal job status is reported by the handler with full totals
        Ok(())
    }

    async fn fail_run(&self, error: &SynqxError, failed_node: Option<&str>) -> Result<(), SynqxError> {
        warn!(job_id = self.job_id, error = %error, failed_node, "run failed");
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Executes leased pipeline jobs on this agent.
pub struct PipelineJobHandler {
    settings: AgentSettings,
    client: Arc<ApiClient>,
    probe: Arc<SystemProbe>,
    connector_registry: Arc<ConnectorRegistry>,
    transform_registry: Arc<TransformRegistry>,
    /// Process-lifetime watermark state; authoritative watermarks live in
    /// the control plane and advance when telemetry lands.
    watermarks: Arc<MemoryWatermarkStore>,
    shutdown: Arc<AtomicBool>,
}

impl PipelineJobHandler {
    pub fn new(
        settings: AgentSettings,
        client: Arc<ApiClient>,
        probe: Arc<SystemProbe>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            settings,
            client,
            probe,
            connector_registry: Arc::new(ConnectorRegistry::with_builtins()),
            transform_registry: Arc::new(TransformRegistry::with_builtins()),
            watermarks: Arc::new(MemoryWatermarkStore::new()),
            shutdown,
        }
    }

    /// Runs one leased job end to end, reporting per-step telemetry and
    /// the terminal job status.
    pub async fn process(&self, payload: PollResponse) {
        let Some(job) = payload.job else {
            warn!("pipeline handler invoked without a job payload");
            return;
        };
        let Some(version) = payload.dag else {
            warn!(job_id = job.id, "lease payload carries no DAG, failing job");
            let _ = self
                .client
                .report_job_status(job.id, "failed", "Lease payload missing DAG", 0, 0)
                .await;
            return;
        };

        info!(job_id = job.id, pipeline_id = job.pipeline_id, "pipeline job started");
        let started = std::time::Instant::now();
        let _ = self
            .client
            .report_job_status(job.id, "running", "Orchestrating parallel execution plan", 0, 0)
            .await;

        let connections: HashMap<String, synqx_domain::ConnectionPayload> = payload.connections.unwrap_or_default();
        let config = payload.config.unwrap_or_default();

        let env = Arc::new(ExecutionEnvironment {
            pipeline_id: job.pipeline_id,
            run_id: job.run_id,
            connections,
            assets: HashMap::new(),
            connector_registry: Arc::clone(&self.connector_registry),
            transform_registry: Arc::clone(&self.transform_registry),
            watermarks: Arc::clone(&self.watermarks) as Arc<dyn synqx_engine::WatermarkStore>,
            forensic_base: Some(self.settings.forensic_dir()),
            runtime_envs: Some(Arc::new(DirRuntimeEnvironments::new(&self.settings))),
        });

        let sink = Arc::new(ReportingStateSink::new(
            Arc::clone(&self.client),
            Arc::clone(&self.probe),
            job.id,
            Arc::clone(&self.shutdown),
        ));

        let cache = match DataCache::new(2048) {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                let _ = self
                    .client
                    .report_job_status(job.id, "failed", &format!("Cache initialization failed: {}", e), 0, 0)
                    .await;
                return;
            }
        };

        let runner = ParallelRunner::new(
            env,
            sink,
            cache,
            RunnerOptions {
                max_parallel_nodes: self.settings.max_workers,
                execution_timeout: config.timeout_seconds.map(Duration::from_secs),
                permissive_conditions: false,
            },
        );

        let elapsed_ms = |started: std::time::Instant| started.elapsed().as_millis() as i64;
        match runner.run(&version).await {
            Ok(metrics) => {
                let duration_ms = elapsed_ms(started);
                info!(
                    job_id = job.id,
                    duration_ms,
                    records = metrics.total_records_processed,
                    "pipeline job completed"
                );
                let _ = self
                    .client
                    .report_job_status(
                        job.id,
                        "success",
                        &format!("Finalized in {}ms", duration_ms),
                        duration_ms,
                        metrics.total_records_processed as i64,
                    )
                    .await;
            }
            Err(e) => {
                let duration_ms = elapsed_ms(started);
                warn!(job_id = job.id, error = %e, "pipeline job failed");
                let _ = self
                    .client
                    .report_job_status(job.id, "failed", &e.to_string(), duration_ms, 0)
                    .await;
            }
        }
    }
}
