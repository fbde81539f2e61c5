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

//! Scheduler for stations that call in
//!
//! Instead of walking a roster, the [`ListeningScheduler`] reacts to inbound
//! connections queued by a [`ListeningPool`]. Each connection is challenged
//! for a password, asked to identify itself and, if it names a known target
//! that is not already being polled, gets a single-attempt session. When
//! every slot is taken new connections are released straight away.

use crate::metrics::SchedulerMetrics;
use crate::session::{self, SessionContext, SessionReport};
use crate::{
    HandlerRegistry, ListenerAuth, Result, SchedulerConfig, ServiceError, Sinks, Target, TargetId,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fieldpoll_channel::{Channel, ChannelPool, CommParams, FinalState, ListeningPool};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

struct ActiveSession {
    started_at: Instant,
    abort: CancellationToken,
    kill: CancellationToken,
}

/// Holds one of the `active` slots until dropped, even if serving panics
struct ActiveSlot<'a>(&'a Inner);

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
        self.0.idle.notify_waiters();
    }
}

struct Inner {
    config: SchedulerConfig,
    auth: ListenerAuth,
    pool: Arc<ListeningPool>,
    targets: Vec<Arc<Target>>,
    registry: Arc<HandlerRegistry>,
    sinks: Sinks,
    active: AtomicUsize,
    idle: Notify,
    sessions: DashMap<TargetId, ActiveSession>,
    shutdown: CancellationToken,
    metrics: Arc<SchedulerMetrics>,
}

/// Runs sessions for stations that connect to a [`ListeningPool`]
pub struct ListeningScheduler {
    inner: Arc<Inner>,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ListeningScheduler {
    /// Create a listening scheduler
    ///
    /// Every inbound session is a single attempt; `config.max_attempts` is
    /// not used.
    pub fn new(
        config: SchedulerConfig,
        auth: ListenerAuth,
        pool: Arc<ListeningPool>,
        targets: Vec<Target>,
        registry: Arc<HandlerRegistry>,
        sinks: Sinks,
    ) -> Result<Self> {
        config.validate().map_err(ServiceError::InvalidConfig)?;
        auth.validate().map_err(ServiceError::InvalidConfig)?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                auth,
                pool,
                targets: targets.into_iter().map(Arc::new).collect(),
                registry,
                sinks,
                active: AtomicUsize::new(0),
                idle: Notify::new(),
                sessions: DashMap::new(),
                shutdown: CancellationToken::new(),
                metrics: Arc::new(SchedulerMetrics::new()),
            }),
            running: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    /// Start accepting and serving stations
    ///
    /// Starts the pool's acceptor if it is not running yet.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::AlreadyRunning);
        }
        if !self.inner.pool.is_running() {
            if let Err(e) = self.inner.pool.start() {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }

        let handle = tokio::spawn(Arc::clone(&self.inner).run());
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Abort active sessions, wait for them to drain and close the pool
    pub async fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(ServiceError::NotRunning);
        }
        info!("Listening scheduler shutdown requested");
        self.inner.shutdown.cancel();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Whether the scheduler is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address stations connect to
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.pool.local_addr()
    }

    /// Channels currently handshaking or running a session
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Targets with a session in progress
    pub fn active_targets(&self) -> Vec<TargetId> {
        self.inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Scheduler metrics
    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        Arc::clone(&self.inner.metrics)
    }
}

impl std::fmt::Debug for ListeningScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListeningScheduler")
            .field("address", &self.local_addr())
            .field("running", &self.is_running())
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

impl Drop for ListeningScheduler {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    #[instrument(skip_all, fields(address = %self.pool.local_addr()))]
    async fn run(self: Arc<Self>) {
        info!(capacity = self.pool.capacity(), "Listening for stations");
        let mut next_wedge_check = Instant::now() + self.config.wedge_check_interval;

        loop {
            tokio::select! {
                _ = self.pool.accepted(self.config.pause_interval) => {}
                _ = self.shutdown.cancelled() => break,
            }

            while let Some(channel) = self.pool.allocate() {
                if self.active.load(Ordering::Acquire) >= self.pool.capacity() {
                    debug!(channel = %channel.id(), peer = ?channel.peer(), "No free slot, refusing station");
                    self.metrics.channel_refused();
                    self.pool.release(channel, FinalState::Failed, false);
                    continue;
                }
                self.active.fetch_add(1, Ordering::AcqRel);
                tokio::spawn(Arc::clone(&self).serve(channel));
            }

            if Instant::now() >= next_wedge_check {
                self.check_wedged();
                next_wedge_check = Instant::now() + self.config.wedge_check_interval;
            }
        }

        self.drain().await;
    }

    async fn serve(self: Arc<Self>, mut channel: Channel) {
        let _slot = ActiveSlot(&self);
        match self.handshake(&mut channel).await {
            Ok(target) => self.run_session(target, channel).await,
            Err(reason) => self.refuse(channel, &reason),
        }
    }

    fn refuse(&self, channel: Channel, reason: &str) {
        info!(channel = %channel.id(), peer = ?channel.peer(), reason, "Refusing station");
        self.metrics.channel_refused();
        self.pool.release(channel, FinalState::Failed, false);
    }

    async fn handshake(&self, channel: &mut Channel) -> std::result::Result<Arc<Target>, String> {
        self.pool
            .connect(channel, &CommParams::default())
            .await
            .map_err(|e| e.to_string())?;
        let io = channel
            .io_mut()
            .ok_or_else(|| "channel has no stream".to_string())?;
        let timeout = self.auth.response_timeout;

        if let Some(password) = &self.auth.password {
            io.send(self.auth.password_prompt.as_bytes())
                .await
                .map_err(|e| e.to_string())?;
            let answer = io
                .reader()
                .read_line(timeout)
                .await
                .ok_or_else(|| "no password given".to_string())?;
            if answer.trim() != password {
                return Err("wrong password".to_string());
            }
        }
        if self.shutdown.is_cancelled() {
            return Err("shutting down".to_string());
        }

        if let Some(prompt) = &self.auth.identify_prompt {
            io.send(prompt.as_bytes()).await.map_err(|e| e.to_string())?;
        }
        let identity = io
            .reader()
            .read_line(timeout)
            .await
            .ok_or_else(|| "no identification given".to_string())?;
        self.targets
            .iter()
            .find(|target| target.is_identified_by(&identity))
            .cloned()
            .ok_or_else(|| format!("unknown station '{}'", identity.trim()))
    }

    async fn run_session(&self, target: Arc<Target>, channel: Channel) {
        let abort = CancellationToken::new();
        let kill = CancellationToken::new();
        match self.sessions.entry(target.id.clone()) {
            Entry::Occupied(_) => {
                self.refuse(channel, "session already running");
                return;
            }
            Entry::Vacant(entry) => {
                entry.insert(ActiveSession {
                    started_at: Instant::now(),
                    abort: abort.clone(),
                    kill: kill.clone(),
                });
            }
        }
        // Shutdown may have started while the entry was being added.
        if self.shutdown.is_cancelled() {
            abort.cancel();
        }

        info!(target = %target.id, channel = %channel.id(), "Station identified");
        self.metrics.session_started();
        let ctx = SessionContext {
            target: Arc::clone(&target),
            pool: Arc::clone(&self.pool) as Arc<dyn ChannelPool>,
            registry: Arc::clone(&self.registry),
            sinks: self.sinks.clone(),
            backlog: self.config.backlog.clone(),
            transcript_dir: self.config.transcript_dir.clone(),
            abort,
            kill,
            final_attempt: true,
        };
        let started = Instant::now();
        let SessionReport { channel, result } = session::execute(ctx, channel).await;
        self.sessions.remove(&target.id);
        self.metrics.session_finished(started.elapsed());

        match result {
            Ok(()) => {
                self.pool.release(channel, FinalState::Success, false);
                info!(target = %target.id, elapsed = ?started.elapsed(), "Target polled");
                self.metrics.session_succeeded();
            }
            Err(e) => {
                self.pool
                    .release(channel, FinalState::Failed, e.is_connect_error());
                error!(target = %target.id, kind = %e.kind(), error = %e, "Inbound session failed");
                self.metrics.session_exhausted();
                let status = self.sinks.status.load(&target).await;
                let reason = format!("{}: {}", target, e);
                self.sinks.escalation.assert_failure(&reason, &status).await;
                self.metrics.escalated();
            }
        }
    }

    fn check_wedged(&self) {
        for entry in self.sessions.iter() {
            let running_for = entry.started_at.elapsed();
            if running_for > self.config.wedge_timeout && !entry.kill.is_cancelled() {
                warn!(target = %entry.key(), ?running_for, "Session wedged, killing");
                entry.kill.cancel();
                self.metrics.session_wedged();
            }
        }
    }

    async fn drain(&self) {
        for entry in self.sessions.iter() {
            entry.abort.cancel();
        }

        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            let active = self.active.load(Ordering::Acquire);
            if active == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                warn!(active, "Drain timed out with stations still connected");
                break;
            }
        }

        self.pool.close().await;
        info!(
            polled = self.metrics.snapshot().sessions_succeeded,
            "Listening scheduler stopped"
        );
    }
}
