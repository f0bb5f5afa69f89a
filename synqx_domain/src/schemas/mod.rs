// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Wire Schemas
//!
//! Serialized request/response shapes shared between the dispatcher and
//! remote agents.

pub mod agent_protocol;

pub use agent_protocol::{
    AgentHeartbeat, DispatchConfig, EphemeralAssignment, EphemeralJobKind, EphemeralResultUpdate, JobHandle,
    JobLogEntry, JobStatusUpdate, PollResponse, StepUpdate, SystemInfo,
};
