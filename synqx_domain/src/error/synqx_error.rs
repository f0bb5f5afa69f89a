// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Domain Error System
//!
//! This module provides the hierarchical error system for the SynqX pipeline
//! execution core. Every failure observed at the core boundary is expressed as
//! a `SynqxError` variant, and the variant decides how the rest of the system
//! reacts to it.
//!
//! ## Error Architecture
//!
//! Errors fall into three behavioral classes:
//!
//! - **Non-retryable**: configuration, validation, contract, schema-evolution,
//!   cycle, sandbox, and expression errors. Retrying cannot fix these; the
//!   node (or run) fails terminally.
//! - **Retryable**: connection, data-transfer, and per-node timeout errors.
//!   The parallel runner re-attempts these according to the node's retry
//!   policy.
//! - **Terminal for the run**: pipeline-wide timeout and explicit
//!   cancellation. These abort the run regardless of node policy.
//!
//! The classification lives in [`SynqxError::is_retryable`] and is the single
//! source of truth consulted by the runner's retry loop.

use thiserror::Error;

/// Domain-specific errors for the distributed pipeline execution core.
///
/// Each variant carries a descriptive message. The variant itself is the
/// classification: `category()` names the failure class for telemetry and
/// persistence (`StepRun.error_type`), and `is_retryable()` drives the
/// runner's retry decision.
#[derive(Error, Debug, Clone)]
pub enum SynqxError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Data transfer failed: {0}")]
    DataTransfer(String),

    #[error("Schema discovery failed: {0}")]
    SchemaDiscovery(String),

    #[error("Data contract violation: {0}")]
    ContractViolation(String),

    #[error("Schema evolution violation: {0}")]
    SchemaEvolutionViolation(String),

    #[error("Node timed out: {0}")]
    NodeTimeout(String),

    #[error("Pipeline execution timed out: {0}")]
    ExecutionTimeout(String),

    #[error("Cancelled: {0}")]
    Cancellation(String),

    #[error("Cycle detected in DAG: {0}")]
    Cycle(String),

    #[error("Sandbox violation: {0}")]
    SandboxViolation(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SynqxError {
    /// Creates a new configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Creates a new connection error
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    /// Creates a new data transfer error
    pub fn data_transfer(msg: impl Into<String>) -> Self {
        Self::DataTransfer(msg.into())
    }

    /// Creates a new database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Creates a new serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Creates a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Creates a new not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Whether the node retry policy applies to this error.
    ///
    /// Configuration, validation, contract, and invariant breaches are never
    /// retried: repeating the attempt cannot change the outcome. Transport
    /// and timeout classes are transient and eligible for retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SynqxError::ConnectionFailed(_)
                | SynqxError::DataTransfer(_)
                | SynqxError::NodeTimeout(_)
                | SynqxError::Io(_)
                | SynqxError::Database(_)
        )
    }

    /// Whether the error terminates the whole run regardless of node policy.
    pub fn is_run_terminal(&self) -> bool {
        matches!(self, SynqxError::ExecutionTimeout(_) | SynqxError::Cancellation(_))
    }

    /// Whether the failure originates in infrastructure rather than in the
    /// data or the transform logic. Drives `Job.infra_error` attribution.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            SynqxError::ConnectionFailed(_)
                | SynqxError::Database(_)
                | SynqxError::Io(_)
                | SynqxError::Internal(_)
                | SynqxError::Authentication(_)
        )
    }

    /// Gets the error category
    pub fn category(&self) -> &'static str {
        match self {
            SynqxError::Configuration(_) => "configuration",
            SynqxError::Authentication(_) => "authentication",
            SynqxError::ConnectionFailed(_) => "connection",
            SynqxError::DataTransfer(_) => "data_transfer",
            SynqxError::SchemaDiscovery(_) => "schema_discovery",
            SynqxError::ContractViolation(_) => "contract",
            SynqxError::SchemaEvolutionViolation(_) => "schema_evolution",
            SynqxError::NodeTimeout(_) => "node_timeout",
            SynqxError::ExecutionTimeout(_) => "execution_timeout",
            SynqxError::Cancellation(_) => "cancellation",
            SynqxError::Cycle(_) => "cycle",
            SynqxError::SandboxViolation(_) => "sandbox",
            SynqxError::Expression(_) => "expression",
            SynqxError::Validation(_) => "validation",
            SynqxError::Serialization(_) => "serialization",
            SynqxError::Database(_) => "database",
            SynqxError::Io(_) => "io",
            SynqxError::NotFound(_) => "not_found",
            SynqxError::Internal(_) => "internal",
        }
    }
}

// Implement conversion from standard library errors
impl From<std::io::Error> for SynqxError {
    fn from(err: std::io::Error) -> Self {
        SynqxError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SynqxError {
    fn from(err: serde_json::Error) -> Self {
        SynqxError::Serialization(err.to_string())
    }
}
