// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Scheduler
//!
//! Cron-driven pipeline triggering and SLA evaluation, ticking every 60
//! seconds.
//!
//! ## Trigger Rule
//!
//! A pipeline with `schedule_enabled` fires when a cron occurrence (in the
//! pipeline's timezone) falls inside the window since the previous tick.
//! Pipelines at their `max_parallel_runs` cap are skipped for the tick and
//! re-evaluated on the next one.
//!
//! ## SLA Evaluation
//!
//! - `max_duration`: running jobs past the limit raise an `SLABreach`
//!   event with the observed duration
//! - `finish_by`: past the wall-clock deadline, pipelines without a
//!   successful run today raise a breach; so do jobs still running
//!
//! Breaches are published to the telemetry bus and recorded in job logs;
//! delivery channels are outside the core.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use sqlx::{Row, SqlitePool};
use tracing::{debug, error, info, warn};

use synqx_domain::{Pipeline, SynqxError, TelemetryEvent};

use crate::dispatcher::JobDispatcher;
use crate::store::{self, db_err};
use crate::telemetry::TelemetryBus;

/// Seconds between scheduler ticks.
pub const TICK_INTERVAL_SECS: u64 = 60;
/// Heartbeats older than this flip an agent Offline.
const AGENT_STALE_SECS: i64 = 90;

/// Cron evaluator and SLA monitor over the shared store.
pub struct Scheduler {
    pool: SqlitePool,
    dispatcher: Arc<JobDispatcher>,
    bus: Arc<TelemetryBus>,
    last_tick: parking_lot::Mutex<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(pool: SqlitePool, dispatcher: Arc<JobDispatcher>, bus: Arc<TelemetryBus>) -> Self {
        Self {
            pool,
            dispatcher,
            bus,
            last_tick: parking_lot::Mutex::new(Utc::now()),
        }
    }

    /// Runs the scheduler loop until the process stops.
    pub async fn run_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick(Utc::now()).await {
                error!(error = %e, "scheduler tick failed");
            }
        }
    }

    /// One evaluation pass: fire due schedules, check SLAs, expire stale
    /// agents. `now` is injectable for tests.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<u32, SynqxError> {
        let window_start = {
            let mut last = self.last_tick.lock();
            let start = *last;
            *last = now;
            start
        };

        let mut triggered = 0;
        for pipeline in self.due_pipelines(window_start, now).await? {
            match self.trigger(&pipeline).await {
                Ok(true) => triggered += 1,
                Ok(false) => {}
                Err(e) => warn!(pipeline_id = pipeline.id, error = %e, "failed to trigger scheduled pipeline"),
            }
        }

        let breaches = self.check_sla_breaches(now).await?;
        let expired = self.dispatcher.mark_stale_agents_offline(AGENT_STALE_SECS).await?;
        if expired > 0 {
            debug!(expired, "stale agents marked offline");
        }
        if triggered > 0 || breaches > 0 {
            info!(triggered, sla_breaches = breaches, "scheduler tick completed");
        }
        Ok(triggered)
    }

    /// Pipelines whose cron fires inside `(window_start, now]`.
    async fn due_pipelines(
        &self,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Pipeline>, SynqxError> {
        let rows = sqlx::query(
            "SELECT * FROM pipelines WHERE schedule_enabled = 1 AND schedule_cron IS NOT NULL AND status = 'active'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut due = Vec::new();
        for row in &rows {
            let pipeline = store::map_pipeline(row)?;
            let Some(expr) = &pipeline.schedule_cron else { continue };

            match next_fire_after(expr, &pipeline.schedule_timezone, window_start) {
                Ok(Some(next_fire)) if next_fire <= now => {
                    debug!(pipeline_id = pipeline.id, %next_fire, "schedule due");
                    due.push(pipeline);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(pipeline_id = pipeline.id, cron = %expr, error = %e, "invalid schedule, skipping")
                }
            }
        }
        Ok(due)
    }

    /// Triggers one pipeline unless its parallelism cap is reached.
    /// Returns whether a job was enqueued.
    async fn trigger(&self, pipeline: &Pipeline) -> Result<bool, SynqxError> {
        let live = store::live_job_count(&self.pool, pipeline.id).await?;
        if live >= pipeline.max_parallel_runs as i64 {
            debug!(
                pipeline_id = pipeline.id,
                live,
                cap = pipeline.max_parallel_runs,
                "parallel run cap reached, skipping this tick"
            );
            return Ok(false);
        }

        let version_id = match pipeline.published_version_id {
            Some(id) => id,
            None => {
                let row = sqlx::query(
                    "SELECT id FROM pipeline_versions WHERE pipeline_id = ? ORDER BY version DESC LIMIT 1",
                )
                .bind(pipeline.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
                match row {
                    Some(row) => row.get("id"),
                    None => {
                        warn!(pipeline_id = pipeline.id, "scheduled pipeline has no version, skipping");
                        return Ok(false);
                    }
                }
            }
        };

        let job_id = store::enqueue_job(&self.pool, pipeline, version_id, None).await?;
        info!(pipeline_id = pipeline.id, job_id, "scheduled job enqueued");

        // Group-targeted triggers pre-select the least-loaded online agent
        if pipeline.is_remote_group() {
            if let Some(agent) = self
                .dispatcher
                .select_agent(pipeline.workspace_id, &pipeline.agent_group)
                .await?
            {
                debug!(job_id, agent = %agent.client_id, "soft assignment recorded");
            }
        }
        Ok(true)
    }

    /// Evaluates SLA configuration for running jobs and daily deadlines.
    pub async fn check_sla_breaches(&self, now: DateTime<Utc>) -> Result<u32, SynqxError> {
        let mut breaches = 0;

        // Running jobs against max_duration and finish_by
        let rows = sqlx::query(
            r#"
            SELECT j.id AS job_id, j.started_at, p.id AS pipeline_id, p.name, p.sla_config
            FROM jobs j JOIN pipelines p ON p.id = j.pipeline_id
            WHERE j.status = 'running' AND j.started_at IS NOT NULL AND p.sla_config IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        for row in &rows {
            let Some(sla) = parse_sla(row.get::<Option<String>, _>("sla_config")) else { continue };
            let job_id: i64 = row.get("job_id");
            let pipeline_id: i64 = row.get("pipeline_id");
            let name: String = row.get("name");
            let started = row
                .get::<Option<String>, _>("started_at")
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc));

            if let (Some(limit), Some(started)) = (sla.max_duration_seconds, started) {
                let elapsed = (now - started).num_seconds().max(0) as u64;
                if elapsed > limit {
                    breaches += 1;
                    self.record_breach(
                        pipeline_id,
                        Some(job_id),
                        format!(
                            "SLA breach (duration): pipeline '{}' has been running for {}s (limit {}s)",
                            name, elapsed, limit
                        ),
                        now,
                    )
                    .await?;
                }
            }

            if let Some(finish_by) = &sla.finish_by {
                if let Some(deadline) = deadline_today(finish_by, now) {
                    if now > deadline {
                        breaches += 1;
                        self.record_breach(
                            pipeline_id,
                            Some(job_id),
                            format!(
                                "SLA breach (finish by): pipeline '{}' is still running after {} UTC",
                                name, finish_by
                            ),
                            now,
                        )
                        .await?;
                    }
                }
            }
        }

        // Pipelines that should have finished today but have no success
        let rows = sqlx::query(
            "SELECT id, name, sla_config FROM pipelines WHERE sla_config IS NOT NULL AND status = 'active'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        let start_of_day = now.date_naive().and_hms_opt(0, 0, 0).map(|n| n.and_utc()).unwrap_or(now);

        for row in &rows {
            let Some(sla) = parse_sla(row.get::<Option<String>, _>("sla_config")) else { continue };
            let Some(finish_by) = &sla.finish_by else { continue };
            let Some(deadline) = deadline_today(finish_by, now) else { continue };
            if now <= deadline {
                continue;
            }

            let pipeline_id: i64 = row.get("id");
            let recent_success = sqlx::query(
                "SELECT 1 FROM jobs WHERE pipeline_id = ? AND status = 'success' AND completed_at >= ? LIMIT 1",
            )
            .bind(pipeline_id)
            .bind(start_of_day.to_rfc3339())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            if recent_success.is_none() {
                breaches += 1;
                let name: String = row.get("name");
                self.record_breach(
                    pipeline_id,
                    None,
                    format!(
                        "SLA breach (missed): pipeline '{}' has not completed successfully by {} UTC",
                        name, finish_by
                    ),
                    now,
                )
                .await?;
            }
        }

        Ok(breaches)
    }

    async fn record_breach(
        &self,
        pipeline_id: i64,
        job_id: Option<i64>,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<(), SynqxError> {
        warn!(pipeline_id, job_id, "{}", message);
        if let Some(job_id) = job_id {
            sqlx::query(
                "INSERT INTO job_logs (job_id, level, message, source, timestamp) VALUES (?, 'WARNING', ?, 'scheduler', ?)",
            )
            .bind(job_id)
            .bind(&message)
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }
        self.bus.publish(TelemetryEvent::SlaBreach {
            pipeline_id,
            job_id,
            message,
            timestamp: now,
        });
        Ok(())
    }
}

fn parse_sla(raw: Option<String>) -> Option<synqx_domain::SlaConfig> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

/// Next cron occurrence strictly after `after`, evaluated in the pipeline's
/// timezone and returned in UTC.
fn next_fire_after(expr: &str, timezone: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, SynqxError> {
    let tz: Tz = timezone
        .parse()
        .map_err(|_| SynqxError::Configuration(format!("Unknown timezone '{}'", timezone)))?;
    // The cron crate expects a seconds field; pipeline schedules use the
    // classic five-field form.
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    let schedule = Schedule::from_str(&normalized)
        .map_err(|e| SynqxError::Configuration(format!("Invalid cron expression '{}': {}", expr, e)))?;

    let local_after = after.with_timezone(&tz);
    Ok(schedule.after(&local_after).next().map(|dt| dt.with_timezone(&Utc)))
}

/// Today's wall-clock deadline (`"HH:MM"`) as a UTC instant.
fn deadline_today(finish_by: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let time = NaiveTime::parse_from_str(finish_by, "%H:%M").ok()?;
    let naive = now.date_naive().and_time(time);
    Utc.from_local_datetime(&naive).single()
}
