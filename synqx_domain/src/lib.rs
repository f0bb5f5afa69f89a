// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # SynqX Domain
//!
//! The domain layer of the SynqX distributed pipeline execution core. It
//! holds the business objects and rules shared by the execution engine, the
//! control plane, and the remote agent, and is independent of databases,
//! HTTP, and the async runtime.
//!
//! ## Module Structure
//!
//! - [`entities`]: objects with identity and lifecycle (pipelines and their
//!   versioned graphs, jobs, runs, steps, watermarks, agents)
//! - [`value_objects`]: immutable values (chunks, watermark ordering, data
//!   contracts, step counters)
//! - [`error`]: the [`SynqxError`] hierarchy whose classification drives
//!   retry and termination policy
//! - [`events`]: telemetry events fanned out to subscribers
//! - [`schemas`]: the agent ↔ dispatcher wire format
//! - [`services`]: serde helpers shared by entities and schemas
//!
//! ## Design Notes
//!
//! Entities here are plain serializable data plus invariant checks; all
//! I/O-bound behavior lives behind traits in the engine and infrastructure
//! crates. The [`PipelineVersion`] entity doubles as the DAG wire payload,
//! which keeps the persisted shape, the lease payload, and the in-memory
//! graph definition from drifting apart.

pub mod entities;
pub mod error;
pub mod events;
pub mod schemas;
pub mod services;
pub mod value_objects;

// Re-export the names the rest of the workspace uses constantly.
pub use entities::{
    AgentRecord, AgentStatus, Asset, ConnectionPayload, EdgeDefinition, Job, JobStatus, NodeDefinition, OperatorType,
    Pipeline, PipelineRun, PipelineRunStatus, PipelineStatus, PipelineVersion, RetryStrategy, SchemaEvolutionPolicy,
    SlaConfig, StepRun, StepStatus, SyncMode, Watermark, WriteStrategy,
};
pub use error::SynqxError;
pub use events::{TelemetryEvent, JOBS_LIST_TOPIC};
pub use value_objects::{row, Chunk, ColumnRule, DataContract, Row, StepCounters, ValueKind, WatermarkValue};
