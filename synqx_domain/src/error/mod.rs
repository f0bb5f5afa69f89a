// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Domain Error Module
//!
//! Error types for the domain layer. Every failure observed at the core
//! boundary is a [`SynqxError`] variant; the variant classification drives
//! retry policy, run termination, and infrastructure-vs-execution
//! attribution on jobs.

mod synqx_error;

pub use synqx_error::SynqxError;
