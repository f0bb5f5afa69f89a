// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Dispatcher API Client
//!
//! Typed client for the agent ↔ dispatcher protocol. Credentials are
//! attached to every request as default headers; response classification
//! distinguishes auth rejection (agent exits), server faults (backoff),
//! and transport faults (shorter backoff).

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::debug;

use synqx_domain::schemas::{
    AgentHeartbeat, EphemeralResultUpdate, JobLogEntry, JobStatusUpdate, PollResponse, StepUpdate,
};

use crate::config::AgentSettings;

/// Client-side classification of a failed call.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// 401: credentials rejected; the agent must exit.
    #[error("authentication rejected by dispatcher")]
    Unauthorized,
    /// HTTP ≥ 500: dispatcher-side fault; back off exponentially.
    #[error("dispatcher error: HTTP {0}")]
    Server(u16),
    /// Any other unexpected status.
    #[error("unexpected response: HTTP {0}")]
    Status(u16),
    /// Transport-level failure (DNS, refused, timeout).
    #[error("network error: {0}")]
    Network(String),
    /// Body did not decode.
    #[error("protocol decode error: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn is_server_fault(&self) -> bool {
        matches!(self, ClientError::Server(_))
    }
}

/// HTTP client bound to one agent identity.
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    /// Long-poll timeout; the dispatcher may hold the request up to this.
    const POLL_TIMEOUT_SECS: u64 = 15;
    const DEFAULT_TIMEOUT_SECS: u64 = 10;

    pub fn new(settings: &AgentSettings) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "X-SynqX-Client-ID",
            HeaderValue::from_str(&settings.client_id).map_err(|e| ClientError::Decode(e.to_string()))?,
        );
        headers.insert(
            "X-SynqX-API-Key",
            HeaderValue::from_str(&settings.api_key).map_err(|e| ClientError::Decode(e.to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(Self::DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ClientError::Network(e.to_string()))?;

        Ok(Self {
            base_url: settings.api_url.clone(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: Result<reqwest::Response, reqwest::Error>) -> Result<reqwest::Response, ClientError> {
        let response = response.map_err(|e| ClientError::Network(e.to_string()))?;
        match response.status() {
            StatusCode::UNAUTHORIZED => Err(ClientError::Unauthorized),
            status if status.is_server_error() => Err(ClientError::Server(status.as_u16())),
            status if !status.is_success() => Err(ClientError::Status(status.as_u16())),
            _ => Ok(response),
        }
    }

    /// `POST /agents/heartbeat`.
    pub async fn heartbeat(&self, heartbeat: &AgentHeartbeat) -> Result<(), ClientError> {
        let response = self.http.post(self.url("/agents/heartbeat")).json(heartbeat).send().await;
        Self::check(response).await.map(|_| ())
    }

    /// `POST /agents/poll` with the agent's tags. Long-poll timeout.
    pub async fn poll(&self, tags: &[String]) -> Result<PollResponse, ClientError> {
        let response = self
            .http
            .post(self.url("/agents/poll"))
            .timeout(std::time::Duration::from_secs(Self::POLL_TIMEOUT_SECS))
            .json(tags)
            .send()
            .await;
        let response = Self::check(response).await?;
        response
            .json::<PollResponse>()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// `POST /agents/jobs/{id}/status`.
    pub async fn report_job_status(
        &self,
        job_id: i64,
        status: &str,
        message: &str,
        execution_time_ms: i64,
        total_records: i64,
    ) -> Result<(), ClientError> {
        let body = JobStatusUpdate {
            status: status.to_string(),
            message: message.to_string(),
            execution_time_ms,
            total_records,
            total_bytes: None,
            timestamp: Utc::now(),
        };
        debug!(job_id, status, "reporting job status");
        let response = self
            .http
            .post(self.url(&format!("/agents/jobs/{}/status", job_id)))
            .json(&body)
            .send()
            .await;
        Self::check(response).await.map(|_| ())
    }

    /// `POST /agents/jobs/{id}/steps`.
    pub async fn report_step(&self, job_id: i64, update: &StepUpdate) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url(&format!("/agents/jobs/{}/steps", job_id)))
            .json(update)
            .send()
            .await;
        Self::check(response).await.map(|_| ())
    }

    /// `POST /agents/jobs/{id}/logs`.
    pub async fn send_logs(&self, job_id: i64, entries: &[JobLogEntry]) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url(&format!("/agents/jobs/{}/logs", job_id)))
            .json(entries)
            .send()
            .await;
        Self::check(response).await.map(|_| ())
    }

    /// `POST /agents/jobs/ephemeral/{id}/status`.
    pub async fn report_ephemeral(&self, job_id: i64, update: &EphemeralResultUpdate) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url(&format!("/agents/jobs/ephemeral/{}/status", job_id)))
            .json(update)
            .send()
            .await;
        Self::check(response).await.map(|_| ())
    }
}
