// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Domain Value Objects
//!
//! Immutable, identity-free values: the tabular [`Chunk`] flowing between
//! nodes, the typed [`WatermarkValue`] ordering, declarative
//! [`DataContract`] rules, and the [`StepCounters`] telemetry bundle.

pub mod chunk;
pub mod data_contract;
pub mod step_counters;
pub mod watermark_value;

pub use chunk::{row, Chunk, Row};
pub use data_contract::{ColumnRule, DataContract, ValueKind};
pub use step_counters::StepCounters;
pub use watermark_value::WatermarkValue;
