// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Environment-driven orchestrator settings.

/// Control-plane settings, resolved once at startup.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// SQLite connection string.
    pub database_url: String,
    /// Listen address for the agent protocol surface.
    pub bind_addr: String,
}

impl OrchestratorSettings {
    pub const DEFAULT_DATABASE_URL: &'static str = "sqlite://synqx.db?mode=rwc";
    pub const DEFAULT_BIND_ADDR: &'static str = "0.0.0.0:8000";

    /// Reads settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or_else(|_| Self::DEFAULT_DATABASE_URL.to_string()),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| Self::DEFAULT_BIND_ADDR.to_string()),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            database_url: Self::DEFAULT_DATABASE_URL.to_string(),
            bind_addr: Self::DEFAULT_BIND_ADDR.to_string(),
        }
    }
}
