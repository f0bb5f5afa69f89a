// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # SynqX Execution Engine
//!
//! In-process DAG execution for the SynqX pipeline core: topological
//! layering, layer-parallel node execution on a bounded pool, inter-node
//! chunk caching with spill-to-disk, watermark-driven incrementality,
//! contract validation with quarantine, and best-effort forensic capture.
//!
//! ## Module Structure
//!
//! - [`dag`]: graph construction, cycle detection, execution layers
//! - [`cache`]: RAM-budgeted chunk store with LRU spill
//! - [`watermark`]: monotonic incremental checkpoint store
//! - [`contract`]: rule-based chunk splitting into valid + quarantined
//! - [`expression`]: minimal safe evaluator for conditions and mappings
//! - [`connectors`]: the external read/write capability seam + registry
//! - [`transforms`]: the operator-class seam + registry
//! - [`executor`]: single-node execution with telemetry side effects
//! - [`runner`]: layer-parallel orchestration with retry/timeout/cancel
//! - [`state`]: the lifecycle reporting seam bound to one run
//! - [`profiler`]: per-column quality profiles
//! - [`forensics`]: per-run parquet capture
//! - [`metrics`]: run-level execution metrics
//!
//! ## Execution Model
//!
//! The runner materializes execution layers and drives nodes through the
//! executor; each node owns a fresh connector session, reports progress
//! through a [`state::StateSink`], and hands its output chunks to the
//! shared [`cache::DataCache`] for downstream consumption. Concurrency is
//! bounded by a semaphore sized `max_parallel_nodes` (default twice the
//! CPU count); cancellation is cooperative between chunks, retries, and
//! layers.

pub mod cache;
pub mod connectors;
pub mod contract;
pub mod dag;
pub mod executor;
pub mod expression;
pub mod forensics;
pub mod metrics;
pub mod profiler;
pub mod runner;
pub mod state;
pub mod transforms;
pub mod watermark;

pub use cache::{CacheStats, DataCache};
pub use connectors::{Connector, ConnectorRegistry, ConnectorSession, ReadRequest, WatermarkFilter};
pub use contract::{ContractValidator, QUARANTINE_REASON_FIELD};
pub use dag::Dag;
pub use executor::{ExecutionEnvironment, NodeExecutor, NodeOutput, RuntimeEnvironments};
pub use metrics::ExecutionMetrics;
pub use runner::{ParallelRunner, RunnerOptions};
pub use state::{MemoryStateSink, StateSink, StepProgress};
pub use transforms::{Transform, TransformRegistry};
pub use watermark::{MemoryWatermarkStore, WatermarkStore};
