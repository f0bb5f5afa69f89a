// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # System Introspection
//!
//! Heartbeat payload assembly (host identity plus resource snapshot) and
//! the directory-backed runtime-environment probe for script operators.

use std::net::UdpSocket;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde_json::json;
use sysinfo::System;

use synqx_domain::schemas::{AgentHeartbeat, SystemInfo};
use synqx_domain::{AgentStatus, SynqxError};
use synqx_engine::RuntimeEnvironments;

use crate::config::{AgentSettings, AGENT_VERSION};

/// Cached system handle; refreshing in place is cheaper than rebuilding.
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Builds a heartbeat with the current resource snapshot.
    pub fn heartbeat(&self, status: AgentStatus) -> AgentHeartbeat {
        let (cpu_usage, memory_usage) = {
            let mut system = self.system.lock();
            system.refresh_cpu();
            system.refresh_memory();
            let cpu = system.global_cpu_info().cpu_usage();
            let memory = if system.total_memory() > 0 {
                (system.used_memory() as f32 / system.total_memory() as f32) * 100.0
            } else {
                0.0
            };
            (cpu, memory)
        };

        AgentHeartbeat {
            status,
            system_info: SystemInfo {
                os: std::env::consts::OS.to_string(),
                runtime: format!("rust-agent/{}", AGENT_VERSION),
                cpu_usage,
                memory_usage,
                arch: std::env::consts::ARCH.to_string(),
            },
            ip_address: Some(local_ip()),
            version: Some(AGENT_VERSION.to_string()),
            hostname: hostname::get().ok().map(|h| h.to_string_lossy().to_string()),
        }
    }

    /// Current process CPU and memory usage, for step telemetry.
    pub fn process_metrics(&self) -> (Option<f64>, Option<f64>) {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => pid,
            Err(_) => return (None, None),
        };
        let mut system = self.system.lock();
        system.refresh_process(pid);
        match system.process(pid) {
            Some(process) => (
                Some(process.cpu_usage() as f64),
                Some(process.memory() as f64 / (1024.0 * 1024.0)),
            ),
            None => (None, None),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// The primary outbound interface address, falling back to loopback.
pub fn local_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// Directory-backed runtime-environment registry under
/// `<home>/envs/<connection_id>/<language>/`. An environment is ready when
/// its `env.json` marker says so; `initialize` writes the marker,
/// `record_install` appends to the package manifest.
pub struct DirRuntimeEnvironments {
    base: PathBuf,
}

impl DirRuntimeEnvironments {
    pub fn new(settings: &AgentSettings) -> Self {
        Self {
            base: settings.envs_dir(),
        }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    fn env_dir(&self, connection_id: i64, language: &str) -> PathBuf {
        self.base.join(connection_id.to_string()).join(language)
    }

    /// Creates the environment and marks it ready.
    pub fn initialize(&self, connection_id: i64, language: &str) -> Result<PathBuf, SynqxError> {
        let dir = self.env_dir(connection_id, language);
        std::fs::create_dir_all(&dir).map_err(|e| SynqxError::Io(format!("Failed to create environment: {}", e)))?;
        let marker = json!({
            "language": language,
            "status": "ready",
            "created_at": chrono::Utc::now().to_rfc3339(),
        });
        std::fs::write(dir.join("env.json"), marker.to_string())
            .map_err(|e| SynqxError::Io(format!("Failed to write environment marker: {}", e)))?;
        Ok(dir)
    }

    /// Records a validated package install into the environment manifest.
    pub fn record_install(&self, connection_id: i64, language: &str, package: &str) -> Result<(), SynqxError> {
        let dir = self.env_dir(connection_id, language);
        if !dir.join("env.json").exists() {
            return Err(SynqxError::Configuration(format!(
                "Environment '{}' for connection {} is not initialized",
                language, connection_id
            )));
        }
        let manifest = dir.join("packages.json");
        let mut packages: Vec<String> = std::fs::read_to_string(&manifest)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        packages.push(package.to_string());
        std::fs::write(&manifest, serde_json::to_string(&packages)?)
            .map_err(|e| SynqxError::Io(format!("Failed to write package manifest: {}", e)))?;
        Ok(())
    }
}

impl RuntimeEnvironments for DirRuntimeEnvironments {
    fn is_ready(&self, connection_id: i64, language: &str) -> bool {
        let marker = self.env_dir(connection_id, language).join("env.json");
        std::fs::read_to_string(marker)
            .ok()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            .map(|value| value["status"] == "ready")
            .unwrap_or(false)
    }
}
