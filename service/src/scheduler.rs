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

//! Outbound polling scheduler
//!
//! The [`Scheduler`] polls a fixed roster of targets once per run. Each pass
//! of its loop picks the next waiting target by priority round-robin, takes
//! a free channel from the pool and spawns a session task. Completions come
//! back over a channel; failed targets go back to waiting until they run out
//! of attempts, at which point the escalation is told exactly once.
//!
//! # Example
//!
//! ```no_run
//! use fieldpoll_channel::{DialOutConfig, DialOutPool};
//! use fieldpoll_service::{HandlerRegistry, Scheduler, SchedulerConfig, Sinks, Target};
//! use std::sync::Arc;
//!
//! # async fn example(targets: Vec<Target>, registry: HandlerRegistry) -> fieldpoll_service::Result<()> {
//! let pool = Arc::new(DialOutPool::new(DialOutConfig::default().with_capacity(4)));
//! let scheduler = Scheduler::new(
//!     SchedulerConfig::default(),
//!     targets,
//!     pool,
//!     Arc::new(registry),
//!     Sinks::in_memory(),
//! )?;
//! scheduler.start()?;
//! let summary = scheduler.wait().await?;
//! println!("{}", summary);
//! # Ok(())
//! # }
//! ```

use crate::metrics::SchedulerMetrics;
use crate::session::{self, SessionContext, SessionReport};
use crate::{
    Completion, HandlerRegistry, Priority, Result, RunState, RunSummary, SchedulerConfig,
    ServiceError, Session, SessionError, SessionState, Sinks, Target, TargetId,
};
use chrono::{NaiveDate, Utc};
use fieldpoll_channel::{ChannelPool, FinalState};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Pick the next waiting entry by priority round-robin
///
/// Scans `len` entries once, starting just after `last` (or at 0), and
/// remembers the first waiting entry of each priority tier. `tier_of`
/// returns the zero-based tier of a waiting entry and `None` for anything
/// else. The entry found in the highest-priority tier wins.
pub fn select_next<F>(len: usize, last: Option<usize>, mut tier_of: F) -> Option<usize>
where
    F: FnMut(usize) -> Option<usize>,
{
    if len == 0 {
        return None;
    }
    let start = last.map_or(0, |last| (last + 1) % len);
    let mut first_in_tier = [None; Priority::TIERS];
    for offset in 0..len {
        let index = (start + offset) % len;
        if let Some(tier) = tier_of(index) {
            let slot = &mut first_in_tier[tier.min(Priority::TIERS - 1)];
            if slot.is_none() {
                *slot = Some(index);
            }
        }
    }
    first_in_tier.into_iter().flatten().next()
}

/// Point-in-time view of one roster entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Target polled
    pub target: TargetId,
    /// Session state
    pub state: SessionState,
    /// Attempts started
    pub attempts: u32,
    /// Attempt limit
    pub max_attempts: u32,
    /// Polling priority
    pub priority: Priority,
}

struct Roster {
    sessions: Vec<Session>,
    cursor: Option<usize>,
}

impl Roster {
    fn select(&mut self) -> Option<usize> {
        let sessions = &self.sessions;
        let picked = select_next(sessions.len(), self.cursor, |index| {
            let session = &sessions[index];
            (session.state() == SessionState::Waiting).then(|| session.priority().tier())
        })?;
        self.cursor = Some(picked);
        Some(picked)
    }

    fn count(&self, state: SessionState) -> usize {
        self.sessions.iter().filter(|s| s.state() == state).count()
    }

    fn is_finished(&self) -> bool {
        self.sessions.iter().all(|s| s.state().is_terminal())
    }

    fn summary(&self, out_of_season: usize, elapsed: Duration) -> RunSummary {
        let succeeded = self.count(SessionState::Success);
        let failed = self.count(SessionState::Failed);
        RunSummary {
            succeeded,
            failed,
            unfinished: self.sessions.len() - succeeded - failed,
            out_of_season,
            elapsed,
        }
    }
}

type Done = (usize, SessionReport);

struct Inner {
    config: SchedulerConfig,
    pool: Arc<dyn ChannelPool>,
    registry: Arc<HandlerRegistry>,
    sinks: Sinks,
    roster: Mutex<Roster>,
    out_of_season: usize,
    state: watch::Sender<RunState>,
    summary: watch::Sender<Option<RunSummary>>,
    shutdown: CancellationToken,
    metrics: Arc<SchedulerMetrics>,
}

/// Polls a roster of targets through a channel pool
pub struct Scheduler {
    inner: Arc<Inner>,
    started: AtomicBool,
}

impl Scheduler {
    /// Create a scheduler for today's roster
    pub fn new(
        config: SchedulerConfig,
        targets: Vec<Target>,
        pool: Arc<dyn ChannelPool>,
        registry: Arc<HandlerRegistry>,
        sinks: Sinks,
    ) -> Result<Self> {
        Self::for_date(
            config,
            targets,
            pool,
            registry,
            sinks,
            Utc::now().date_naive(),
        )
    }

    /// Create a scheduler whose seasonal filtering uses `today`
    pub fn for_date(
        config: SchedulerConfig,
        targets: Vec<Target>,
        pool: Arc<dyn ChannelPool>,
        registry: Arc<HandlerRegistry>,
        sinks: Sinks,
        today: NaiveDate,
    ) -> Result<Self> {
        config.validate().map_err(ServiceError::InvalidConfig)?;

        let mut out_of_season = 0;
        let sessions: Vec<Session> = targets
            .into_iter()
            .filter(|target| {
                let enabled = target.is_in_season(today);
                if !enabled {
                    info!(target = %target.id, %today, "Target out of season, skipping");
                    out_of_season += 1;
                }
                enabled
            })
            .map(|target| Session::new(Arc::new(target), config.max_attempts))
            .collect();
        debug!(targets = sessions.len(), out_of_season, "Roster built");

        let (state, _) = watch::channel(RunState::Idle);
        let (summary, _) = watch::channel(None);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                pool,
                registry,
                sinks,
                roster: Mutex::new(Roster {
                    sessions,
                    cursor: None,
                }),
                out_of_season,
                state,
                summary,
                shutdown: CancellationToken::new(),
                metrics: Arc::new(SchedulerMetrics::new()),
            }),
            started: AtomicBool::new(false),
        })
    }

    /// Start the scheduling loop
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::AlreadyRunning);
        }
        self.inner.state.send_replace(RunState::Running);
        tokio::spawn(Arc::clone(&self.inner).run());
        Ok(())
    }

    /// Ask the loop to abort running sessions and stop
    pub fn shutdown(&self) {
        info!("Scheduler shutdown requested");
        self.inner.shutdown.cancel();
    }

    /// Wait for the run to finish
    pub async fn wait(&self) -> Result<RunSummary> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(ServiceError::NotRunning);
        }
        let mut rx = self.inner.summary.subscribe();
        let summary = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ServiceError::NotRunning)?;
        summary.clone().ok_or(ServiceError::NotRunning)
    }

    /// Current run state
    pub fn run_state(&self) -> RunState {
        *self.inner.state.borrow()
    }

    /// Watch run state changes
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.inner.state.subscribe()
    }

    /// Scheduler metrics
    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Targets excluded by their seasonal window
    pub fn out_of_season(&self) -> usize {
        self.inner.out_of_season
    }

    /// Snapshot of every roster entry
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let roster = self.inner.roster.lock().await;
        roster
            .sessions
            .iter()
            .map(|session| SessionInfo {
                target: session.target().id.clone(),
                state: session.state(),
                attempts: session.attempts(),
                max_attempts: session.max_attempts(),
                priority: session.priority(),
            })
            .collect()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.run_state())
            .field("out_of_season", &self.inner.out_of_season)
            .finish_non_exhaustive()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    #[instrument(skip_all)]
    async fn run(self: Arc<Self>) {
        let started = Instant::now();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Done>();
        let mut next_wedge_check = Instant::now() + self.config.wedge_check_interval;
        info!(capacity = self.pool.capacity(), "Polling run started");

        loop {
            while let Ok((index, report)) = done_rx.try_recv() {
                self.complete(index, report).await;
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            if self.roster.lock().await.is_finished() {
                info!("Every target finished");
                break;
            }

            self.schedule_one(&done_tx).await;

            if Instant::now() >= next_wedge_check {
                self.check_wedged().await;
                next_wedge_check = Instant::now() + self.config.wedge_check_interval;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.pause_interval) => {}
                Some((index, report)) = done_rx.recv() => self.complete(index, report).await,
                _ = self.shutdown.cancelled() => {}
            }
        }

        self.drain(&mut done_rx, started).await;
    }

    async fn schedule_one(&self, done_tx: &mpsc::UnboundedSender<Done>) {
        let mut roster = self.roster.lock().await;
        let previous = roster.cursor;
        let Some(index) = roster.select() else {
            return;
        };
        let Some(channel) = self.pool.allocate() else {
            roster.cursor = previous;
            self.metrics.allocation_miss();
            return;
        };

        let session = &mut roster.sessions[index];
        let (abort, kill) = session.begin(channel.id());
        let target = Arc::clone(session.target());
        debug!(
            target = %target.id,
            channel = %channel.id(),
            attempt = session.attempts(),
            priority = %target.priority,
            "Starting session"
        );
        let ctx = SessionContext {
            target,
            pool: Arc::clone(&self.pool),
            registry: Arc::clone(&self.registry),
            sinks: self.sinks.clone(),
            backlog: self.config.backlog.clone(),
            transcript_dir: self.config.transcript_dir.clone(),
            abort,
            kill,
            final_attempt: session.is_final_attempt(),
        };
        self.metrics.session_started();

        let done_tx = done_tx.clone();
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            let report = session::execute(ctx, channel).await;
            if let Err(mpsc::error::SendError((_, report))) = done_tx.send((index, report)) {
                // The loop is gone; give the channel back ourselves.
                pool.release(report.channel, FinalState::Failed, false);
            }
        });
    }

    async fn complete(&self, index: usize, report: SessionReport) {
        let SessionReport { channel, result } = report;
        let (final_state, connect_error) = match &result {
            Ok(()) => (FinalState::Success, false),
            Err(e) => (FinalState::Failed, e.is_connect_error()),
        };
        self.pool.release(channel, final_state, connect_error);

        let (target, attempts, max_attempts, elapsed, completion) = {
            let mut roster = self.roster.lock().await;
            let session = &mut roster.sessions[index];
            let elapsed = session.running_for().unwrap_or_default();
            let completion = session.finish(result);
            (
                Arc::clone(session.target()),
                session.attempts(),
                session.max_attempts(),
                elapsed,
                completion,
            )
        };
        self.metrics.session_finished(elapsed);

        match completion {
            Completion::Succeeded => {
                info!(target = %target.id, attempts, ?elapsed, "Target polled");
                self.metrics.session_succeeded();
            }
            Completion::Retry(e) => {
                warn!(
                    target = %target.id,
                    attempt = attempts,
                    max_attempts,
                    kind = %e.kind(),
                    error = %e,
                    "Session failed, will retry"
                );
                self.metrics.session_retried();
            }
            Completion::Exhausted(e) => {
                error!(
                    target = %target.id,
                    attempts,
                    kind = %e.kind(),
                    error = %e,
                    "Session failed, no attempts left"
                );
                self.metrics.session_exhausted();
                self.escalate(&target, &e).await;
            }
        }
    }

    async fn escalate(&self, target: &Target, error: &SessionError) {
        let status = self.sinks.status.load(target).await;
        let reason = format!("{}: {}", target, error);
        self.sinks.escalation.assert_failure(&reason, &status).await;
        self.metrics.escalated();
    }

    async fn check_wedged(&self) {
        let roster = self.roster.lock().await;
        for session in &roster.sessions {
            let Some(running_for) = session.running_for() else {
                continue;
            };
            if running_for > self.config.wedge_timeout && session.kill() {
                warn!(
                    target = %session.target().id,
                    channel = ?session.channel(),
                    ?running_for,
                    "Session wedged, killing"
                );
                self.metrics.session_wedged();
            }
        }
    }

    async fn drain(&self, done_rx: &mut mpsc::UnboundedReceiver<Done>, started: Instant) {
        self.state.send_replace(RunState::Draining);
        {
            let roster = self.roster.lock().await;
            let running: Vec<_> = roster
                .sessions
                .iter()
                .filter(|s| s.state() == SessionState::Running)
                .collect();
            if !running.is_empty() {
                info!(running = running.len(), "Aborting running sessions");
            }
            for session in running {
                session.abort();
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        loop {
            let running = self.roster.lock().await.count(SessionState::Running);
            if running == 0 {
                break;
            }
            match tokio::time::timeout_at(deadline, done_rx.recv()).await {
                Ok(Some((index, report))) => self.complete(index, report).await,
                Ok(None) => break,
                Err(_) => {
                    warn!(running, "Drain timed out with sessions still running");
                    break;
                }
            }
        }

        self.pool.close().await;
        let summary = self
            .roster
            .lock()
            .await
            .summary(self.out_of_season, started.elapsed());
        info!(%summary, "Polling run finished");
        self.state.send_replace(RunState::Stopped);
        self.summary.send_replace(Some(summary));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiers(entries: &[Option<usize>]) -> impl FnMut(usize) -> Option<usize> + '_ {
        move |index| entries[index]
    }

    #[test]
    fn test_select_prefers_highest_priority() {
        let entries = [Some(2), Some(0), Some(2), Some(0)];
        assert_eq!(select_next(4, None, tiers(&entries)), Some(1));
        assert_eq!(select_next(4, Some(1), tiers(&entries)), Some(3));
        assert_eq!(select_next(4, Some(3), tiers(&entries)), Some(1));
    }

    #[test]
    fn test_select_skips_non_waiting() {
        let entries = [None, Some(2), None];
        assert_eq!(select_next(3, Some(1), tiers(&entries)), Some(1));
        assert_eq!(select_next(3, None, tiers(&[None, None, None])), None);
        assert_eq!(select_next(0, None, |_| Some(0)), None);
    }

    #[test]
    fn test_select_round_robin_within_tier() {
        let entries = [Some(1); 3];
        let mut last = None;
        let mut order = Vec::new();
        for _ in 0..6 {
            last = select_next(3, last, tiers(&entries));
            order.push(last.unwrap());
        }
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2]);
    }
}
