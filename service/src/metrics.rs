//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Lock-free metrics for the polling scheduler

use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free scheduler metrics
///
/// Every update is also forwarded to the `metrics` facade so an installed
/// recorder sees the same numbers.
#[derive(Debug)]
pub struct SchedulerMetrics {
    // Session lifecycle
    sessions_started: AtomicU64,
    sessions_running: AtomicU64,
    sessions_succeeded: AtomicU64,
    sessions_retried: AtomicU64,
    sessions_exhausted: AtomicU64,

    // Problems
    sessions_wedged: AtomicU64,
    allocation_misses: AtomicU64,
    channels_refused: AtomicU64,
    escalations: AtomicU64,

    // Timing (stored as nanoseconds)
    total_session_duration_ns: AtomicU64,
    finished_sessions: AtomicU64,

    started_at: Instant,
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerMetrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        Self {
            sessions_started: AtomicU64::new(0),
            sessions_running: AtomicU64::new(0),
            sessions_succeeded: AtomicU64::new(0),
            sessions_retried: AtomicU64::new(0),
            sessions_exhausted: AtomicU64::new(0),
            sessions_wedged: AtomicU64::new(0),
            allocation_misses: AtomicU64::new(0),
            channels_refused: AtomicU64::new(0),
            escalations: AtomicU64::new(0),
            total_session_duration_ns: AtomicU64::new(0),
            finished_sessions: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Record a session attempt starting
    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        let running = self.sessions_running.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("fieldpoll.sessions.started").increment(1);
        gauge!("fieldpoll.sessions.running").set(running as f64);
    }

    /// Record a session attempt finishing, whatever the outcome
    pub fn session_finished(&self, duration: Duration) {
        let running = self
            .sessions_running
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .map(|n| n - 1)
            .unwrap_or(0);
        self.finished_sessions.fetch_add(1, Ordering::Relaxed);
        self.total_session_duration_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        gauge!("fieldpoll.sessions.running").set(running as f64);
    }

    /// Record a successful session
    pub fn session_succeeded(&self) {
        self.sessions_succeeded.fetch_add(1, Ordering::Relaxed);
        counter!("fieldpoll.sessions.succeeded").increment(1);
    }

    /// Record a failed attempt that will be retried
    pub fn session_retried(&self) {
        self.sessions_retried.fetch_add(1, Ordering::Relaxed);
        counter!("fieldpoll.sessions.retried").increment(1);
    }

    /// Record a target that used every attempt
    pub fn session_exhausted(&self) {
        self.sessions_exhausted.fetch_add(1, Ordering::Relaxed);
        counter!("fieldpoll.sessions.exhausted").increment(1);
    }

    /// Record a session killed for running too long
    pub fn session_wedged(&self) {
        self.sessions_wedged.fetch_add(1, Ordering::Relaxed);
        counter!("fieldpoll.sessions.wedged").increment(1);
    }

    /// Record a selected target that found no free channel
    pub fn allocation_miss(&self) {
        self.allocation_misses.fetch_add(1, Ordering::Relaxed);
        counter!("fieldpoll.channels.allocation_misses").increment(1);
    }

    /// Record an inbound channel turned away
    pub fn channel_refused(&self) {
        self.channels_refused.fetch_add(1, Ordering::Relaxed);
        counter!("fieldpoll.channels.refused").increment(1);
    }

    /// Record an escalation
    pub fn escalated(&self) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
        counter!("fieldpoll.sessions.escalations").increment(1);
    }

    /// Sessions currently running
    pub fn sessions_running(&self) -> u64 {
        self.sessions_running.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_running: self.sessions_running.load(Ordering::Relaxed),
            sessions_succeeded: self.sessions_succeeded.load(Ordering::Relaxed),
            sessions_retried: self.sessions_retried.load(Ordering::Relaxed),
            sessions_exhausted: self.sessions_exhausted.load(Ordering::Relaxed),
            sessions_wedged: self.sessions_wedged.load(Ordering::Relaxed),
            allocation_misses: self.allocation_misses.load(Ordering::Relaxed),
            channels_refused: self.channels_refused.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
            avg_session_duration: self.average_session_duration(),
        }
    }

    fn average_session_duration(&self) -> Duration {
        let finished = self.finished_sessions.load(Ordering::Relaxed);
        if finished == 0 {
            return Duration::ZERO;
        }
        let total_ns = self.total_session_duration_ns.load(Ordering::Relaxed);
        Duration::from_nanos(total_ns / finished)
    }
}

/// A snapshot of scheduler metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Session attempts started
    pub sessions_started: u64,
    /// Session attempts in progress
    pub sessions_running: u64,
    /// Successful sessions
    pub sessions_succeeded: u64,
    /// Failed attempts that were retried
    pub sessions_retried: u64,
    /// Targets that used every attempt
    pub sessions_exhausted: u64,
    /// Sessions killed as wedged
    pub sessions_wedged: u64,
    /// Selections that found no free channel
    pub allocation_misses: u64,
    /// Inbound channels turned away
    pub channels_refused: u64,
    /// Escalations raised
    pub escalations: u64,
    /// Time since the metrics were created
    pub uptime: Duration,
    /// Average duration of a finished attempt
    pub avg_session_duration: Duration,
}

impl MetricsSnapshot {
    /// Fraction of finished targets that succeeded
    pub fn success_rate(&self) -> f64 {
        let finished = self.sessions_succeeded + self.sessions_exhausted;
        if finished == 0 {
            return 1.0;
        }
        self.sessions_succeeded as f64 / finished as f64
    }
}
