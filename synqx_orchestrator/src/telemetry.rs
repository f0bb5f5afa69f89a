// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Telemetry Ingress
//!
//! Absorbs step-level updates reported by agents, deduplicates them, writes
//! them to the state store, and fans the resulting events out to
//! subscribers.
//!
//! ## Pipeline
//!
//! The dispatcher enqueues `(job_id, StepUpdate)` pairs onto an unbounded
//! channel and immediately acknowledges the agent; a persistent worker
//! drains the channel, suppresses duplicates (identical update for the same
//! `(run, node, status)` excluding timestamps and resource samples), and
//! persists survivors through the state manager, which publishes to the
//! [`TelemetryBus`].
//!
//! ## Topics
//!
//! Subscribers attach to `job_telemetry:<job_id>` for one job's stream or
//! to the global `jobs_list` topic for coarse change notifications. Events
//! for a single `(run, step)` are delivered in producer order because one
//! worker drains the queue.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use synqx_domain::schemas::StepUpdate;
use synqx_domain::{StepCounters, StepStatus, SynqxError, TelemetryEvent, JOBS_LIST_TOPIC};

const TOPIC_CAPACITY: usize = 256;

/// Topic-keyed broadcast fan-out for telemetry events.
pub struct TelemetryBus {
    topics: Mutex<HashMap<String, broadcast::Sender<TelemetryEvent>>>,
}

impl TelemetryBus {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes to a topic, creating it on first use.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<TelemetryEvent> {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Publishes an event to its job topic (when it has one) and mirrors a
    /// coarse notification onto the jobs-list topic.
    pub fn publish(&self, event: TelemetryEvent) {
        let topics = self.topics.lock();
        if let Some(job_id) = event.job_id() {
            if let Some(sender) = topics.get(&TelemetryEvent::job_topic(job_id)) {
                // A send error only means nobody is listening
                let _ = sender.send(event.clone());
            }
        }
        if let Some(sender) = topics.get(JOBS_LIST_TOPIC) {
            let _ = sender.send(event);
        }
    }
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Persistence callback the ingress worker drives. Implemented by the
/// state manager; split out as a trait so the worker is testable without a
/// database.
#[async_trait::async_trait]
pub trait StepUpdateWriter: Send + Sync {
    /// Applies one update for `job_id`, returning the run id it landed on.
    async fn apply_step_update(&self, job_id: i64, update: &StepUpdate) -> Result<i64, SynqxError>;
}

/// Dedup identity for the suppression window.
type DedupKey = (i64, String, StepStatus);
type DedupSeen = (StepCounters, Option<String>);

/// The ingress: an enqueue handle plus the draining worker.
pub struct TelemetryIngress {
    sender: mpsc::UnboundedSender<(i64, StepUpdate)>,
}

impl TelemetryIngress {
    /// Spawns the draining worker and returns the ingress handle.
    pub fn spawn(writer: Arc<dyn StepUpdateWriter>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(ingress_worker(receiver, writer));
        Self { sender }
    }

    /// Enqueues an update; returns immediately.
    pub fn enqueue(&self, job_id: i64, update: StepUpdate) -> Result<(), SynqxError> {
        self.sender
            .send((job_id, update))
            .map_err(|_| SynqxError::Internal("telemetry ingress worker stopped".to_string()))
    }
}

async fn ingress_worker(
    mut receiver: mpsc::UnboundedReceiver<(i64, StepUpdate)>,
    writer: Arc<dyn StepUpdateWriter>,
) {
    // Last persisted identity per (run, node, status)
    let mut last_seen: HashMap<DedupKey, DedupSeen> = HashMap::new();
    // job -> run resolution cache, populated as updates persist
    let mut run_of_job: HashMap<i64, i64> = HashMap::new();

    while let Some((job_id, update)) = receiver.recv().await {
        if let Some(run_id) = run_of_job.get(&job_id) {
            let key = (*run_id, update.node_id.clone(), update.status);
            let identity = (update.counters, update.error_message.clone());
            if last_seen.get(&key) == Some(&identity) {
                debug!(job_id, node_id = %update.node_id, "duplicate step update suppressed");
                continue;
            }
        }

        match writer.apply_step_update(job_id, &update).await {
            Ok(run_id) => {
                run_of_job.insert(job_id, run_id);
                last_seen.insert(
                    (run_id, update.node_id.clone(), update.status),
                    (update.counters, update.error_message.clone()),
                );
            }
            Err(SynqxError::NotFound(msg)) => {
                warn!(job_id, node_id = %update.node_id, "step update dropped: {}", msg);
            }
            Err(e) => {
                error!(job_id, node_id = %update.node_id, error = %e, "failed to persist step update");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWriter {
        applied: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl StepUpdateWriter for CountingWriter {
        async fn apply_step_update(&self, _job_id: i64, _update: &StepUpdate) -> Result<i64, SynqxError> {
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        }
    }

    fn update(records_out: u64, status: StepStatus) -> StepUpdate {
        StepUpdate {
            node_id: "n".into(),
            status,
            counters: StepCounters {
                records_out,
                ..Default::default()
            },
            cpu_percent: None,
            memory_mb: None,
            sample_data: None,
            quality_profile: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_updates_suppressed() {
        let writer = Arc::new(CountingWriter {
            applied: AtomicUsize::new(0),
        });
        let ingress = TelemetryIngress::spawn(Arc::clone(&writer) as Arc<dyn StepUpdateWriter>);

        // Same identity three times, then a progressed one
        ingress.enqueue(1, update(5, StepStatus::Running)).unwrap();
        ingress.enqueue(1, update(5, StepStatus::Running)).unwrap();
        ingress.enqueue(1, update(5, StepStatus::Running)).unwrap();
        ingress.enqueue(1, update(9, StepStatus::Running)).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(writer.applied.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_resource_samples_do_not_defeat_dedup() {
        let writer = Arc::new(CountingWriter {
            applied: AtomicUsize::new(0),
        });
        let ingress = TelemetryIngress::spawn(Arc::clone(&writer) as Arc<dyn StepUpdateWriter>);

        let mut a = update(5, StepStatus::Running);
        a.cpu_percent = Some(10.0);
        let mut b = update(5, StepStatus::Running);
        b.cpu_percent = Some(70.0);
        ingress.enqueue(1, a).unwrap();
        ingress.enqueue(1, b).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(writer.applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminal_updates_pass_through() {
        let writer = Arc::new(CountingWriter {
            applied: AtomicUsize::new(0),
        });
        let ingress = TelemetryIngress::spawn(Arc::clone(&writer) as Arc<dyn StepUpdateWriter>);

        ingress.enqueue(1, update(5, StepStatus::Running)).unwrap();
        ingress.enqueue(1, update(5, StepStatus::Success)).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(writer.applied.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_bus_routes_by_topic() {
        let bus = TelemetryBus::new();
        let mut job_rx = bus.subscribe(&TelemetryEvent::job_topic(7));
        let mut list_rx = bus.subscribe(JOBS_LIST_TOPIC);

        bus.publish(TelemetryEvent::JobUpdated {
            job_id: 7,
            status: synqx_domain::JobStatus::Success,
            completed_at: None,
            timestamp: chrono::Utc::now(),
        });

        assert!(matches!(job_rx.try_recv(), Ok(TelemetryEvent::JobUpdated { job_id: 7, .. })));
        assert!(list_rx.try_recv().is_ok());

        // A different job's event does not reach this job topic
        bus.publish(TelemetryEvent::JobUpdated {
            job_id: 8,
            status: synqx_domain::JobStatus::Failed,
            completed_at: None,
            timestamp: chrono::Utc::now(),
        });
        assert!(job_rx.try_recv().is_err());
    }
}
