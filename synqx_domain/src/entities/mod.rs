// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Domain Entities
//!
//! Entities with identity and lifecycle: pipeline templates and their
//! versioned graphs, execution records (jobs, runs, steps, watermarks,
//! agents), and the narrow asset/connection view the core consumes.

pub mod asset;
pub mod execution;
pub mod pipeline;

pub use asset::{Asset, ConnectionPayload};
pub use execution::{
    AgentRecord, AgentStatus, Job, JobStatus, PipelineRun, PipelineRunStatus, StepRun, StepStatus, Watermark,
};
pub use pipeline::{
    EdgeDefinition, NodeDefinition, OperatorType, Pipeline, PipelineStatus, PipelineVersion, RetryStrategy,
    SchemaEvolutionPolicy, SlaConfig, SyncMode, WriteStrategy,
};
