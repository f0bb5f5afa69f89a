// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # SynqX Bootstrap
//!
//! Process bootstrap shared by the orchestrator and agent binaries:
//! tracing initialization, platform signal handling behind a testable
//! trait, and Unix-convention exit codes.

pub mod exit_code;
pub mod logger;
pub mod signals;

pub use exit_code::ExitCode;
