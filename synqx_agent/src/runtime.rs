// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Agent Runtime
//!
//! The cooperative event loop: one task owns polling, heartbeats, and
//! telemetry pacing; leased pipeline work is handed to the engine's
//! bounded pool through a single in-flight slot, so the loop keeps
//! heartbeating while a job runs and never accepts a second lease
//! meanwhile.
//!
//! ## Loop Behavior
//!
//! - heartbeat every 30 s with a fresh system snapshot
//! - long-poll for work between heartbeats when idle
//! - `job` payloads run through the pipeline handler; `ephemeral` payloads
//!   run synchronously; empty polls sleep 2 s
//! - 401 logs and exits; HTTP ≥ 500 backs off exponentially up to 30 s;
//!   transport errors back off linearly up to 30 s
//! - SIGINT/SIGTERM send a final `offline` heartbeat, remove the PID file,
//!   and exit

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use synqx_bootstrap::signals::create_signal_handler;
use synqx_bootstrap::ExitCode;
use synqx_domain::AgentStatus;
use synqx_engine::ConnectorRegistry;

use crate::api_client::{ApiClient, ClientError};
use crate::config::{AgentSettings, AGENT_VERSION};
use crate::ephemeral::EphemeralProcessor;
use crate::pipeline_handler::PipelineJobHandler;
use crate::system::SystemProbe;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_SLEEP: Duration = Duration::from_secs(2);
const MAX_BACKOFF_SECS: u64 = 30;

/// The long-running agent process.
pub struct AgentRuntime {
    settings: AgentSettings,
    client: Arc<ApiClient>,
    probe: Arc<SystemProbe>,
    shutdown: Arc<AtomicBool>,
}

impl AgentRuntime {
    pub fn new(settings: AgentSettings) -> Result<Self, ExitCode> {
        let client = match ApiClient::new(&settings) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                error!(error = %e, "failed to build API client");
                return Err(ExitCode::ConfigError);
            }
        };
        Ok(Self {
            settings,
            client,
            probe: Arc::new(SystemProbe::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Runs the event loop until shutdown. Returns the process exit code.
    pub async fn run(self) -> ExitCode {
        if let Err(code) = self.register_pid() {
            return code;
        }

        // Signal handling: raise the shutdown flag, the loop drains out
        let shutdown_flag = Arc::clone(&self.shutdown);
        let signal_handler = create_signal_handler();
        tokio::spawn(async move {
            signal_handler
                .wait_for_signal(Box::new(move || {
                    shutdown_flag.store(true, Ordering::SeqCst);
                }))
                .await;
        });

        info!(client_id = %self.settings.client_id, version = AGENT_VERSION, "agent online");
        let _ = self.client.heartbeat(&self.probe.heartbeat(AgentStatus::Online)).await;
        let mut last_heartbeat = Instant::now();

        let handler = PipelineJobHandler::new(
            self.settings.clone(),
            Arc::clone(&self.client),
            Arc::clone(&self.probe),
            Arc::clone(&self.shutdown),
        );
        let ephemeral = EphemeralProcessor::new(self.settings.clone(), Arc::new(ConnectorRegistry::with_builtins()));

        // At most one pipeline job in flight; the loop keeps heartbeating
        let mut in_flight: Option<tokio::task::JoinHandle<()>> = None;
        let handler = Arc::new(handler);
        let mut consecutive_errors: u32 = 0;
        let mut exit_code = ExitCode::Success;

        while !self.shutdown.load(Ordering::SeqCst) {
            if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                let status = if in_flight.is_some() {
                    AgentStatus::Busy
                } else {
                    AgentStatus::Online
                };
                if let Err(e) = self.client.heartbeat(&self.probe.heartbeat(status)).await {
                    warn!(error = %e, "heartbeat failed");
                }
                last_heartbeat = Instant::now();
            }

            if in_flight.as_ref().is_some_and(|handle| handle.is_finished()) {
                in_flight = None;
            }
            if in_flight.is_some() {
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            }

            match self.client.poll(&self.settings.tags).await {
                Ok(response) => {
                    consecutive_errors = 0;
                    if response.job.is_some() {
                        let handler = Arc::clone(&handler);
                        in_flight = Some(tokio::spawn(async move {
                            handler.process(response).await;
                        }));
                    } else if let Some(assignment) = response.ephemeral {
                        let update = ephemeral.process(&assignment).await;
                        if let Err(e) = self.client.report_ephemeral(assignment.id, &update).await {
                            warn!(id = assignment.id, error = %e, "failed to report ephemeral result");
                        }
                    } else {
                        tokio::time::sleep(IDLE_SLEEP).await;
                    }
                }
                Err(ClientError::Unauthorized) => {
                    error!("authentication failed, check agent credentials");
                    exit_code = ExitCode::PermissionDenied;
                    break;
                }
                Err(e) if e.is_server_fault() => {
                    consecutive_errors += 1;
                    let delay = MAX_BACKOFF_SECS.min(5 * consecutive_errors as u64);
                    warn!(error = %e, delay_s = delay, "dispatcher error, backing off");
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
                Err(ClientError::Network(e)) => {
                    consecutive_errors += 1;
                    let delay = MAX_BACKOFF_SECS.min(2 * consecutive_errors as u64);
                    warn!(error = %e, delay_s = delay, "network error during poll");
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
                Err(e) => {
                    warn!(error = %e, "unexpected poll failure");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }

        // Drain the in-flight job cooperatively before going offline
        if let Some(handle) = in_flight {
            info!("waiting for in-flight job to observe shutdown");
            let _ = handle.await;
        }

        info!("sending final offline heartbeat");
        let _ = self.client.heartbeat(&self.probe.heartbeat(AgentStatus::Offline)).await;
        let _ = std::fs::remove_file(self.settings.pid_file());
        exit_code
    }

    /// Writes the PID file, refusing to start when another live agent owns
    /// it. Stale files from dead processes are replaced.
    fn register_pid(&self) -> Result<(), ExitCode> {
        let pid_file = self.settings.pid_file();
        if let Some(parent) = pid_file.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                error!(error = %e, "cannot create agent home directory");
                return Err(ExitCode::ConfigError);
            }
        }

        if let Ok(raw) = std::fs::read_to_string(&pid_file) {
            if let Ok(pid) = raw.trim().parse::<u32>() {
                if process_alive(pid) {
                    error!(pid, "agent already running");
                    return Err(ExitCode::Error);
                }
                info!(pid, "removing stale PID file");
            }
        }

        if let Err(e) = std::fs::write(&pid_file, std::process::id().to_string()) {
            error!(error = %e, "cannot write PID file");
            return Err(ExitCode::ConfigError);
        }
        Ok(())
    }
}

/// Whether a process with `pid` is currently alive.
pub fn process_alive(pid: u32) -> bool {
    let mut system = sysinfo::System::new();
    let pid = sysinfo::Pid::from_u32(pid);
    system.refresh_process(pid);
    system.process(pid).is_some()
}
