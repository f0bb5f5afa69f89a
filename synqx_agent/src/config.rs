// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Agent Settings
//!
//! Environment-driven configuration recognized by the agent:
//!
//! - `API_URL`: base URL of the dispatcher (default `http://localhost:8000`)
//! - `CLIENT_ID` / `API_KEY`: agent credentials (required)
//! - `TAGS`: comma-separated agent groups (default `default`)
//! - `MAX_WORKERS`: worker pool size; `0` auto-scales to `2 × CPU`
//!
//! The agent also owns a home directory (`~/.synqx-agent`) holding the PID
//! file, the sandbox root for file operations, and managed runtime
//! environments.

use std::path::PathBuf;

use synqx_domain::SynqxError;

/// Agent version reported in heartbeats.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Validated agent configuration.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub api_url: String,
    pub client_id: String,
    pub api_key: String,
    pub tags: Vec<String>,
    /// Worker pool size; 0 auto-scales to `2 × CPU`.
    pub max_workers: usize,
    /// Agent home directory (PID file, sandbox, runtime environments).
    pub home_dir: PathBuf,
}

impl AgentSettings {
    /// Reads and validates settings from the environment.
    ///
    /// # Errors
    /// `SynqxError::Configuration` when credentials are missing or
    /// `MAX_WORKERS` is not an integer.
    pub fn from_env() -> Result<Self, SynqxError> {
        let api_url = std::env::var("API_URL").unwrap_or_else(|_| "http://localhost:8000".to_string());
        let client_id = std::env::var("CLIENT_ID")
            .map_err(|_| SynqxError::Configuration("CLIENT_ID is not set".to_string()))?;
        let api_key =
            std::env::var("API_KEY").map_err(|_| SynqxError::Configuration("API_KEY is not set".to_string()))?;

        let tags = std::env::var("TAGS")
            .unwrap_or_else(|_| "default".to_string())
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();

        let max_workers = match std::env::var("MAX_WORKERS") {
            Ok(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| SynqxError::Configuration(format!("MAX_WORKERS is not an integer: '{}'", raw)))?,
            Err(_) => 0,
        };

        let home_dir = std::env::var("SYNQX_AGENT_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("HOME")
                    .map(|home| PathBuf::from(home).join(".synqx-agent"))
                    .unwrap_or_else(|_| PathBuf::from(".synqx-agent"))
            });

        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            client_id,
            api_key,
            tags,
            max_workers,
            home_dir,
        })
    }

    pub fn pid_file(&self) -> PathBuf {
        self.home_dir.join(".agent.pid")
    }

    pub fn sandbox_dir(&self) -> PathBuf {
        self.home_dir.join("sandbox")
    }

    pub fn envs_dir(&self) -> PathBuf {
        self.home_dir.join("envs")
    }

    pub fn forensic_dir(&self) -> PathBuf {
        self.home_dir.join("data").join("forensics")
    }
}
