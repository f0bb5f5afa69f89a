// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Agent Protocol HTTP Surface
//!
//! The six agent-facing endpoints from the wire contract, served by axum:
//!
//! | Method | Path | Purpose |
//! |---|---|---|
//! | POST | `/agents/heartbeat` | liveness + resource snapshot |
//! | POST | `/agents/poll` | job lease long-poll |
//! | POST | `/agents/jobs/{id}/status` | terminal job callback |
//! | POST | `/agents/jobs/{id}/steps` | step telemetry |
//! | POST | `/agents/jobs/{id}/logs` | log batch upload |
//! | POST | `/agents/jobs/ephemeral/{id}/status` | ephemeral result |
//!
//! Credentials travel as the `X-SynqX-Client-ID` / `X-SynqX-API-Key`
//! headers; bad credentials are 401, job-ownership mismatches are 403.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::debug;

use synqx_domain::schemas::{
    AgentHeartbeat, EphemeralResultUpdate, JobLogEntry, JobStatusUpdate, PollResponse, StepUpdate,
};
use synqx_domain::{AgentRecord, SynqxError};

use crate::dispatcher::JobDispatcher;
use crate::state::apply_job_status;
use crate::store;

/// Header carrying the agent's client id.
pub const CLIENT_ID_HEADER: &str = "X-SynqX-Client-ID";
/// Header carrying the agent's API key.
pub const API_KEY_HEADER: &str = "X-SynqX-API-Key";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<JobDispatcher>,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, detail: impl Into<String>) -> ApiError {
    (status, Json(json!({ "detail": detail.into() })))
}

fn internal_error(e: SynqxError) -> ApiError {
    match e {
        SynqxError::NotFound(msg) => api_error(StatusCode::NOT_FOUND, msg),
        other => api_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

/// Credential extractor: authenticates the two agent headers against the
/// agents table. Missing or invalid credentials reject with 401.
pub struct AgentAuth(pub AgentRecord);

impl FromRequestParts<AppState> for AgentAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let client_id = header_value(parts, CLIENT_ID_HEADER)?;
        let api_key = header_value(parts, API_KEY_HEADER)?;

        let agent = state
            .dispatcher
            .authenticate(&client_id, &api_key)
            .await
            .map_err(internal_error)?
            .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "Invalid Agent Credentials"))?;
        Ok(AgentAuth(agent))
    }
}

fn header_value(parts: &Parts, name: &str) -> Result<String, ApiError> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "Invalid Agent Credentials"))
}

/// Builds the agent-facing router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/agents/heartbeat", post(agent_heartbeat))
        .route("/agents/poll", post(poll_jobs))
        .route("/agents/jobs/{job_id}/status", post(update_job_status))
        .route("/agents/jobs/{job_id}/steps", post(update_step_status))
        .route("/agents/jobs/{job_id}/logs", post(upload_job_logs))
        .route("/agents/jobs/ephemeral/{job_id}/status", post(update_ephemeral_job))
        .with_state(state)
}

async fn agent_heartbeat(
    State(state): State<AppState>,
    AgentAuth(agent): AgentAuth,
    Json(heartbeat): Json<AgentHeartbeat>,
) -> Result<Json<AgentRecord>, ApiError> {
    let updated = state
        .dispatcher
        .record_heartbeat(&agent, &heartbeat)
        .await
        .map_err(internal_error)?;
    Ok(Json(updated))
}

async fn poll_jobs(
    State(state): State<AppState>,
    AgentAuth(agent): AgentAuth,
    Json(tags): Json<Vec<String>>,
) -> Result<Json<PollResponse>, ApiError> {
    debug!(agent = %agent.client_id, ?tags, "agent poll");
    let response = state.dispatcher.poll(&agent, &tags).await.map_err(internal_error)?;
    Ok(Json(response))
}

/// Loads a job and enforces lease ownership: 404 unknown, 403 not owned.
async fn owned_job(state: &AppState, agent: &AgentRecord, job_id: i64) -> Result<synqx_domain::Job, ApiError> {
    let job = store::get_job(state.dispatcher.pool(), job_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Job not found"))?;
    if job.worker_id.as_deref() != Some(agent.client_id.as_str()) {
        return Err(api_error(StatusCode::FORBIDDEN, "Job not assigned to this agent"));
    }
    Ok(job)
}

async fn update_job_status(
    State(state): State<AppState>,
    AgentAuth(agent): AgentAuth,
    Path(job_id): Path<i64>,
    Json(update): Json<JobStatusUpdate>,
) -> Result<Json<Value>, ApiError> {
    owned_job(&state, &agent, job_id).await?;
    apply_job_status(state.dispatcher.pool(), state.dispatcher.bus(), job_id, &update)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({ "status": "updated" })))
}

async fn update_step_status(
    State(state): State<AppState>,
    AgentAuth(agent): AgentAuth,
    Path(job_id): Path<i64>,
    Json(update): Json<StepUpdate>,
) -> Result<Json<Value>, ApiError> {
    owned_job(&state, &agent, job_id).await?;
    state
        .dispatcher
        .record_step_telemetry(job_id, update)
        .map_err(internal_error)?;
    Ok(Json(json!({ "status": "queued" })))
}

async fn upload_job_logs(
    State(state): State<AppState>,
    AgentAuth(agent): AgentAuth,
    Path(job_id): Path<i64>,
    Json(entries): Json<Vec<JobLogEntry>>,
) -> Result<Json<Value>, ApiError> {
    owned_job(&state, &agent, job_id).await?;
    let count = state
        .dispatcher
        .upload_job_logs(job_id, &entries)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({ "count": count })))
}

async fn update_ephemeral_job(
    State(state): State<AppState>,
    AgentAuth(agent): AgentAuth,
    Path(job_id): Path<i64>,
    Json(update): Json<EphemeralResultUpdate>,
) -> Result<Json<Value>, ApiError> {
    let worker = state
        .dispatcher
        .ephemeral_job_worker(job_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Job not found"))?;
    if worker != agent.client_id {
        return Err(api_error(StatusCode::FORBIDDEN, "Job not assigned to this agent"));
    }
    state
        .dispatcher
        .update_ephemeral_job(job_id, &update)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({ "status": "ok" })))
}
