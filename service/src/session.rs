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

//! One polling attempt against one station
//!
//! A [`Session`] is the scheduler's record of a target for the current run.
//! Each attempt runs `execute` on its own task: connect the channel, log
//! in, retrieve data and log out, checking the abort token between steps.
//! Whatever happens, the attempt ends by persisting the poll status and
//! handing the channel back to the caller.

use crate::{
    BacklogPolicy, HandlerRegistry, Payload, PollStatus, Priority, ProtocolHandler, SessionError,
    SessionIo, SessionState, Sinks, Target,
};
use chrono::Utc;
use fieldpoll_channel::{Channel, ChannelId, ChannelPool, Transcript};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

/// What the scheduler should do after an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The target was polled
    Succeeded,
    /// The attempt failed and the target goes back to waiting
    Retry(SessionError),
    /// The attempt failed and no attempts are left
    Exhausted(SessionError),
}

/// Scheduler record of one target
#[derive(Debug)]
pub struct Session {
    target: Arc<Target>,
    state: SessionState,
    attempts: u32,
    max_attempts: u32,
    started_at: Option<Instant>,
    failure: Option<SessionError>,
    channel: Option<ChannelId>,
    abort: CancellationToken,
    kill: CancellationToken,
}

impl Session {
    /// Create a waiting session
    pub fn new(target: Arc<Target>, max_attempts: u32) -> Self {
        Self {
            target,
            state: SessionState::Waiting,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            started_at: None,
            failure: None,
            channel: None,
            abort: CancellationToken::new(),
            kill: CancellationToken::new(),
        }
    }

    /// Target being polled
    pub fn target(&self) -> &Arc<Target> {
        &self.target
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Polling priority
    pub fn priority(&self) -> Priority {
        self.target.priority
    }

    /// Attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Attempt limit
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Failure that ended the last attempt, if it failed
    pub fn failure(&self) -> Option<&SessionError> {
        self.failure.as_ref()
    }

    /// Channel held by the running attempt
    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    /// Whether the next attempt is the last one allowed
    pub fn is_final_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// How long the running attempt has been going
    pub fn running_for(&self) -> Option<Duration> {
        match self.state {
            SessionState::Running => self.started_at.map(|at| at.elapsed()),
            _ => None,
        }
    }

    /// Start an attempt on `channel`
    ///
    /// Returns fresh abort and kill tokens for the attempt.
    pub fn begin(&mut self, channel: ChannelId) -> (CancellationToken, CancellationToken) {
        self.state = SessionState::Running;
        self.attempts += 1;
        self.started_at = Some(Instant::now());
        self.channel = Some(channel);
        self.abort = CancellationToken::new();
        self.kill = CancellationToken::new();
        (self.abort.clone(), self.kill.clone())
    }

    /// Ask the running attempt to stop at its next step
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Kill the running attempt
    ///
    /// Returns `false` if it was already killed.
    pub fn kill(&self) -> bool {
        if self.kill.is_cancelled() {
            return false;
        }
        self.kill.cancel();
        true
    }

    /// Record the outcome of the running attempt
    pub fn finish(&mut self, result: Result<(), SessionError>) -> Completion {
        self.channel = None;
        match result {
            Ok(()) => {
                self.state = SessionState::Success;
                self.failure = None;
                Completion::Succeeded
            }
            Err(error) => {
                self.failure = Some(error.clone());
                if self.attempts >= self.max_attempts {
                    self.state = SessionState::Failed;
                    Completion::Exhausted(error)
                } else {
                    self.state = SessionState::Waiting;
                    Completion::Retry(error)
                }
            }
        }
    }
}

/// Everything an attempt needs besides its channel
pub(crate) struct SessionContext {
    pub target: Arc<Target>,
    pub pool: Arc<dyn ChannelPool>,
    pub registry: Arc<HandlerRegistry>,
    pub sinks: Sinks,
    pub backlog: BacklogPolicy,
    pub transcript_dir: Option<PathBuf>,
    pub abort: CancellationToken,
    pub kill: CancellationToken,
    pub final_attempt: bool,
}

/// Outcome of an attempt, with the channel to release
pub(crate) struct SessionReport {
    pub channel: Channel,
    pub result: Result<(), SessionError>,
}

/// Run one attempt
///
/// A panic anywhere in the attempt is caught here and reported as a
/// protocol failure, so the channel always comes back to the caller.
#[instrument(skip_all, fields(target = %ctx.target.id, channel = %channel.id()))]
pub(crate) async fn execute(ctx: SessionContext, mut channel: Channel) -> SessionReport {
    let result = match AssertUnwindSafe(attempt(&ctx, &mut channel))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic_reason(panic.as_ref());
            error!(reason, "Session panicked");
            let error = SessionError::Protocol(format!("session task panicked: {}", reason));
            let mut status = ctx.sinks.status.load(&ctx.target).await;
            status.record_failure(error.kind(), error.to_string(), Utc::now());
            ctx.sinks.status.persist(&status, &ctx.target).await;
            Err(error)
        }
    };
    SessionReport { channel, result }
}

fn panic_reason(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

async fn attempt(ctx: &SessionContext, channel: &mut Channel) -> Result<(), SessionError> {
    let mut status = ctx.sinks.status.load(&ctx.target).await;
    let transcript = open_transcript(ctx, channel).await;
    let mut handler: Option<Box<dyn ProtocolHandler>> = None;

    let result = tokio::select! {
        biased;
        _ = ctx.kill.cancelled() => Err(SessionError::Wedged),
        result = converse(ctx, channel, &mut status, &mut handler) => result,
    };

    if let Err(error) = &result {
        if ctx.final_attempt {
            let partial = handler.as_mut().and_then(|handler| handler.partial_payload());
            if let Some(data) = partial.filter(|data| !data.is_empty()) {
                debug!(bytes = data.len(), "Delivering partial payload");
                ctx.sinks
                    .data
                    .enqueue(Payload {
                        target: ctx.target.id.clone(),
                        logger: ctx.target.logger.clone(),
                        data,
                        retrieved_at: Utc::now(),
                        partial: true,
                    })
                    .await;
            }
        }
        status.record_failure(error.kind(), error.to_string(), Utc::now());
    } else {
        status.record_success();
    }
    ctx.sinks.status.persist(&status, &ctx.target).await;

    if let Some(transcript) = transcript {
        if let Err(e) = transcript.flush().await {
            warn!(error = %e, "Failed to flush session transcript");
        }
    }

    result
}

async fn open_transcript(ctx: &SessionContext, channel: &mut Channel) -> Option<Arc<Transcript>> {
    let dir = ctx.transcript_dir.as_ref()?;
    let started = Utc::now();
    let path = dir.join(Transcript::file_name(ctx.target.id.as_str(), started));
    match Transcript::create(&path, ctx.target.id.as_str(), started).await {
        Ok(transcript) => {
            let transcript = Arc::new(transcript);
            channel.set_transcript(Some(Arc::clone(&transcript)));
            Some(transcript)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not create session transcript");
            None
        }
    }
}

fn check_abort(ctx: &SessionContext) -> Result<(), SessionError> {
    if ctx.abort.is_cancelled() {
        Err(SessionError::Aborted)
    } else {
        Ok(())
    }
}

async fn converse(
    ctx: &SessionContext,
    channel: &mut Channel,
    status: &mut PollStatus,
    slot: &mut Option<Box<dyn ProtocolHandler>>,
) -> Result<(), SessionError> {
    let since = ctx.backlog.since(Utc::now(), status.last_contact);
    let handler = slot.insert(ctx.registry.create(&ctx.target)?);
    check_abort(ctx)?;

    ctx.pool
        .connect(channel, &ctx.target.comm)
        .await
        .map_err(|e| SessionError::Dial(e.to_string()))?;
    let io = channel
        .io_mut()
        .ok_or_else(|| SessionError::Dial("channel has no stream after connect".to_string()))?;
    let mut io = SessionIo::new(io, &ctx.abort, &ctx.target);
    debug!(%since, "Connected");
    check_abort(ctx)?;

    handler.login(&mut io).await?;
    check_abort(ctx)?;

    let data = handler.retrieve_data(&mut io, since).await?;
    let now = Utc::now();
    status.last_contact = Some(now);
    if let Some(data) = data.filter(|data| !data.is_empty()) {
        debug!(bytes = data.len(), "Retrieved payload");
        ctx.sinks
            .data
            .enqueue(Payload {
                target: ctx.target.id.clone(),
                logger: ctx.target.logger.clone(),
                data,
                retrieved_at: now,
                partial: false,
            })
            .await;
        status.last_message = Some(now);
    }

    if let Some(reason) = handler.abnormal_shutdown() {
        return Err(SessionError::Protocol(reason));
    }
    check_abort(ctx)?;

    handler.logout(&mut io).await?;
    Ok(())
}
