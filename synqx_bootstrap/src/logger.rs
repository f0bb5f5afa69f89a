// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Bootstrap Logger
//!
//! One-shot tracing initialization for SynqX binaries. The filter accepts
//! anything `tracing_subscriber::EnvFilter` understands; `RUST_LOG`
//! overrides the passed default when set.

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber. Safe to call once per
/// process; later calls are no-ops.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
