// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Step Telemetry Throttle
//!
//! Non-terminal updates for a given step are coalesced to at most one per
//! two seconds; terminal updates (Success/Failed/Skipped) always pass and
//! take priority over anything queued. The decision is purely local so the
//! agent never blocks its execution path on telemetry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use synqx_domain::StepStatus;

/// Minimum interval between non-terminal updates per node.
pub const THROTTLE_INTERVAL: Duration = Duration::from_secs(2);

/// Per-node send-time tracker implementing the coalescing rule.
pub struct StepTelemetryThrottle {
    last_sent: Mutex<HashMap<String, Instant>>,
    interval: Duration,
}

impl StepTelemetryThrottle {
    pub fn new() -> Self {
        Self::with_interval(THROTTLE_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            last_sent: Mutex::new(HashMap::new()),
            interval,
        }
    }

    /// Whether an update with `status` for `node_id` should be sent now.
    /// Sending is recorded as a side effect when permitted.
    pub fn should_send(&self, node_id: &str, status: StepStatus) -> bool {
        let now = Instant::now();
        let mut last_sent = self.last_sent.lock();

        if status.is_terminal() {
            // Terminal updates are never suppressed
            last_sent.insert(node_id.to_string(), now);
            return true;
        }

        let due = match last_sent.get(node_id) {
            Some(last) => now.duration_since(*last) >= self.interval,
            None => true,
        };
        if due {
            last_sent.insert(node_id.to_string(), now);
        }
        due
    }
}

impl Default for StepTelemetryThrottle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_terminal_updates_coalesced() {
        let throttle = StepTelemetryThrottle::with_interval(Duration::from_millis(50));
        assert!(throttle.should_send("n", StepStatus::Running));
        assert!(!throttle.should_send("n", StepStatus::Running));
        assert!(!throttle.should_send("n", StepStatus::Running));
        std::thread::sleep(Duration::from_millis(60));
        assert!(throttle.should_send("n", StepStatus::Running));
    }

    #[test]
    fn test_terminal_updates_never_suppressed() {
        let throttle = StepTelemetryThrottle::with_interval(Duration::from_secs(60));
        assert!(throttle.should_send("n", StepStatus::Running));
        // Running is inside the window, but terminal must pass
        assert!(throttle.should_send("n", StepStatus::Success));
        assert!(throttle.should_send("n", StepStatus::Failed));
    }

    #[test]
    fn test_nodes_throttle_independently() {
        let throttle = StepTelemetryThrottle::with_interval(Duration::from_secs(60));
        assert!(throttle.should_send("a", StepStatus::Running));
        assert!(throttle.should_send("b", StepStatus::Running));
        assert!(!throttle.should_send("a", StepStatus::Running));
    }

    #[test]
    fn test_emitted_count_bounded_by_interval() {
        // For a burst of updates inside one window, at most
        // ceil(window / interval) + 1 pass through
        let interval = Duration::from_millis(20);
        let throttle = StepTelemetryThrottle::with_interval(interval);
        let window = Duration::from_millis(100);
        let deadline = Instant::now() + window;
        let mut sent = 0;
        while Instant::now() < deadline {
            if throttle.should_send("n", StepStatus::Running) {
                sent += 1;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let bound = (window.as_millis() / interval.as_millis()) as i32 + 1;
        assert!(sent <= bound, "sent {} > bound {}", sent, bound);
        assert!(sent >= 1);
    }
}
