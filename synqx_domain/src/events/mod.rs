// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Domain Events
//!
//! Telemetry events fanned out by the ingress to interested subscribers.

mod telemetry_events;

pub use telemetry_events::{TelemetryEvent, JOBS_LIST_TOPIC};
