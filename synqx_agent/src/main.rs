// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # SynqX Agent CLI
//!
//! Remote worker agent for the SynqX pipeline platform. `start` runs the
//! long-poll event loop; `status`, `stop`, `ping`, and `version` are local
//! management commands.
//!
//! Configuration is environment-driven: `API_URL`, `CLIENT_ID`, `API_KEY`,
//! `TAGS`, `MAX_WORKERS`.

mod api_client;
mod config;
mod ephemeral;
mod pipeline_handler;
mod runtime;
mod sandbox;
mod system;
mod telemetry;

use clap::{Parser, Subcommand};
use tracing::error;

use synqx_bootstrap::{logger, ExitCode};

use crate::api_client::{ApiClient, ClientError};
use crate::config::{AgentSettings, AGENT_VERSION};
use crate::runtime::{process_alive, AgentRuntime};

/// SynqX remote agent.
#[derive(Debug, Parser)]
#[command(name = "synqx-agent", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the agent event loop.
    Start {
        /// Log filter (tracing EnvFilter syntax).
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Check whether a local agent process is running.
    Status,
    /// Stop the running agent process.
    Stop,
    /// Verify connectivity and credentials against the dispatcher.
    Ping,
    /// Print the agent version.
    Version,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Command::Start { log_level } => {
            logger::init(&log_level);
            start().await
        }
        Command::Status => status(),
        Command::Stop => stop(),
        Command::Ping => {
            logger::init("warn");
            ping().await
        }
        Command::Version => {
            println!("synqx-agent v{}", AGENT_VERSION);
            ExitCode::Success
        }
    };

    code.exit();
}

async fn start() -> ExitCode {
    let settings = match AgentSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "configuration missing; set CLIENT_ID and API_KEY");
            return ExitCode::ConfigError;
        }
    };

    match AgentRuntime::new(settings) {
        Ok(runtime) => runtime.run().await,
        Err(code) => code,
    }
}

fn read_pid(settings: &AgentSettings) -> Option<u32> {
    std::fs::read_to_string(settings.pid_file())
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
}

fn status() -> ExitCode {
    let Ok(settings) = AgentSettings::from_env() else {
        println!("STOPPED (not configured)");
        return ExitCode::Success;
    };
    match read_pid(&settings) {
        Some(pid) if process_alive(pid) => {
            println!("RUNNING (PID: {})", pid);
            ExitCode::Success
        }
        Some(pid) => {
            println!("STALE (PID file references dead process {})", pid);
            ExitCode::Error
        }
        None => {
            println!("STOPPED");
            ExitCode::Success
        }
    }
}

fn stop() -> ExitCode {
    let Ok(settings) = AgentSettings::from_env() else {
        println!("Agent is not configured.");
        return ExitCode::ConfigError;
    };
    let Some(pid) = read_pid(&settings) else {
        println!("No PID file found; agent is likely not running.");
        return ExitCode::Success;
    };
    if !process_alive(pid) {
        println!("Agent is not running; removing stale PID file.");
        let _ = std::fs::remove_file(settings.pid_file());
        return ExitCode::Success;
    }

    #[cfg(unix)]
    {
        println!("Stopping agent (PID: {})...", pid);
        let result = std::process::Command::new("kill").arg(pid.to_string()).status();
        return match result {
            Ok(status) if status.success() => {
                println!("Termination signal sent.");
                ExitCode::Success
            }
            _ => {
                println!("Failed to signal agent process.");
                ExitCode::Error
            }
        };
    }
    #[cfg(not(unix))]
    {
        println!("Stop is not supported on this platform; terminate PID {} manually.", pid);
        ExitCode::Error
    }
}

async fn ping() -> ExitCode {
    let settings = match AgentSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            println!("✗ Not configured: {}", e);
            return ExitCode::ConfigError;
        }
    };
    let client = match ApiClient::new(&settings) {
        Ok(client) => client,
        Err(e) => {
            println!("✗ Client error: {}", e);
            return ExitCode::ConfigError;
        }
    };

    match client.poll(&[]).await {
        Ok(_) => {
            println!("✓ Connected to {}", settings.api_url);
            ExitCode::Success
        }
        Err(ClientError::Unauthorized) => {
            println!("✗ Authentication failed (401)");
            ExitCode::PermissionDenied
        }
        Err(e) => {
            println!("✗ {}", e);
            ExitCode::Unavailable
        }
    }
}
