// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Orchestrator Entry Point
//!
//! Starts the control plane: ensures the schema, spawns the telemetry
//! ingress worker and the scheduler loop, and serves the agent protocol
//! until a shutdown signal arrives.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Parser;
use tracing::info;

use synqx_bootstrap::logger;
use synqx_bootstrap::signals::create_signal_handler;
use synqx_orchestrator::{
    router, AppState, JobDispatcher, OrchestratorSettings, Scheduler, SqlxStepUpdateWriter, StaticConnectionResolver,
    TelemetryBus, TelemetryIngress,
};

/// SynqX control plane: dispatcher, scheduler, and telemetry ingress.
#[derive(Debug, Parser)]
#[command(name = "synqx-orchestrator", version, about)]
struct Cli {
    /// Listen address for the agent protocol surface.
    #[arg(long, env = "BIND_ADDR")]
    bind: Option<String>,

    /// SQLite connection string.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Log filter (tracing EnvFilter syntax).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logger::init(&cli.log_level);

    let mut settings = OrchestratorSettings::from_env();
    if let Some(bind) = cli.bind {
        settings.bind_addr = bind;
    }
    if let Some(url) = cli.database_url {
        settings.database_url = url;
    }

    let pool = synqx_orchestrator::store::connect(&settings.database_url)
        .await
        .context("failed to open state store")?;
    info!(database = %settings.database_url, "state store ready");

    let bus = Arc::new(TelemetryBus::new());
    let writer = Arc::new(SqlxStepUpdateWriter::new(pool.clone(), Arc::clone(&bus)));
    let ingress = TelemetryIngress::spawn(writer);
    let resolver: Arc<StaticConnectionResolver> = Arc::new(StaticConnectionResolver::new());
    let dispatcher = Arc::new(JobDispatcher::new(
        pool.clone(),
        Arc::clone(&resolver) as Arc<dyn synqx_orchestrator::ConnectionResolver>,
        Arc::clone(&bus),
        ingress,
    ));

    let scheduler = Arc::new(Scheduler::new(pool.clone(), Arc::clone(&dispatcher), Arc::clone(&bus)));
    tokio::spawn(Arc::clone(&scheduler).run_loop());
    info!("scheduler loop started");

    let worker = Arc::new(synqx_orchestrator::InternalWorker::new(
        pool.clone(),
        Arc::clone(&bus),
        Arc::clone(&resolver) as Arc<dyn synqx_orchestrator::ConnectionResolver>,
    ));
    tokio::spawn(Arc::clone(&worker).run_loop());
    info!("internal worker started");

    let app = router(AppState {
        dispatcher: Arc::clone(&dispatcher),
    });
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    info!(bind = %settings.bind_addr, "agent protocol surface listening");

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let signal_handler = create_signal_handler();
    let shutdown_future = async move {
        signal_handler
            .wait_for_signal(Box::new(move || {
                shutdown_flag.store(true, Ordering::SeqCst);
            }))
            .await;
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_future)
        .await
        .context("server error")?;

    info!("orchestrator stopped");
    Ok(())
}
