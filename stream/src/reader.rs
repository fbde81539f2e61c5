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

//! Background stream reader
//!
//! The StreamReader is responsible for:
//! - Draining a channel's inbound bytes into a bounded buffer
//! - Forwarding received bytes to the session transcript
//! - Accumulating captured bytes while capture is enabled
//! - Waking callers blocked in a pattern wait

use crate::{Direction, PatternMatcher, ReaderConfig, Transcript};
use metrics::counter;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace, warn};

/// Why a reader stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    /// The peer closed the stream
    EndOfStream,
    /// Reading failed with the given error message
    Failed(String),
}

/// Buffer state shared between the read task and waiters
struct ReadState {
    data: Vec<u8>,
    capacity: usize,
    processed: usize,
    overflowed: bool,
    capturing: bool,
    captured: Vec<u8>,
    capture_overflowed: bool,
    exit: Option<ReaderExit>,
    transcript: Option<Arc<Transcript>>,
}

struct Shared {
    name: String,
    state: Mutex<ReadState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ReadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, bytes: &[u8]) {
        {
            let mut state = self.lock();
            if state.capturing {
                let room = state.capacity.saturating_sub(state.captured.len());
                let take = room.min(bytes.len());
                if take < bytes.len() && !state.capture_overflowed {
                    warn!(
                        channel = %self.name,
                        capacity = state.capacity,
                        dropped = bytes.len() - take,
                        "Capture buffer capacity exceeded, discarding input"
                    );
                    state.capture_overflowed = true;
                }
                state.captured.extend_from_slice(&bytes[..take]);
            }
            let room = state.capacity - state.data.len();
            let take = room.min(bytes.len());
            if take < bytes.len() && !state.overflowed {
                warn!(
                    channel = %self.name,
                    capacity = state.capacity,
                    dropped = bytes.len() - take,
                    "Stream buffer capacity exceeded, discarding input"
                );
                state.overflowed = true;
            }
            state.data.extend_from_slice(&bytes[..take]);
        }
        counter!("fieldpoll.stream.bytes_received").increment(bytes.len() as u64);
        self.notify.notify_waiters();
    }

    fn close(&self, exit: ReaderExit) {
        self.lock().exit = Some(exit);
        self.notify.notify_waiters();
    }
}

/// Reader for the inbound half of one channel
///
/// The reader task runs until the stream ends, fails, or the reader is
/// dropped.
pub struct StreamReader {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl StreamReader {
    /// Start reading `source` in a background task
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<R>(
        name: impl Into<String>,
        source: R,
        config: &ReaderConfig,
        transcript: Option<Arc<Transcript>>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            name: name.into(),
            state: Mutex::new(ReadState {
                data: Vec::with_capacity(config.chunk_size.min(config.buffer_capacity)),
                capacity: config.buffer_capacity,
                processed: 0,
                overflowed: false,
                capturing: false,
                captured: Vec::new(),
                capture_overflowed: false,
                exit: None,
                transcript,
            }),
            notify: Notify::new(),
        });

        let task = tokio::spawn(read_loop(source, Arc::clone(&shared), config.chunk_size));

        Self { shared, task }
    }

    /// Replace the transcript that received bytes are copied to
    pub fn set_transcript(&self, transcript: Option<Arc<Transcript>>) {
        self.shared.lock().transcript = transcript;
    }

    /// Name of the channel this reader serves
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Wait until one of `patterns` appears in the unprocessed bytes
    ///
    /// Returns `true` on a match. See [`StreamReader::wait_for`].
    pub async fn wait(&self, timeout: Duration, patterns: &mut [PatternMatcher]) -> bool {
        self.wait_for(timeout, patterns).await.is_some()
    }

    /// Wait until one of `patterns` appears in the unprocessed bytes
    ///
    /// Every matcher is reset to the processed cursor first. On a match the
    /// processed cursor moves just past it and the index of the matching
    /// pattern is returned; when several match, the one ending earliest wins.
    /// On timeout, or when the stream has ended without a match, the processed
    /// cursor advances past the bytes no pattern can still use and `None` is
    /// returned.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        patterns: &mut [PatternMatcher],
    ) -> Option<usize> {
        let deadline = Instant::now() + timeout;
        let start = self.shared.lock().processed;
        for pattern in patterns.iter_mut() {
            pattern.reset(start);
        }

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let closed = {
                let mut state = self.shared.lock();
                let mut best: Option<(usize, usize)> = None;
                for (index, pattern) in patterns.iter_mut().enumerate() {
                    if pattern.scan(&state.data) {
                        let end = pattern.match_end().unwrap_or(start);
                        if best.is_none_or(|(_, best_end)| end < best_end) {
                            best = Some((index, end));
                        }
                    }
                }
                if let Some((index, end)) = best {
                    state.processed = state.processed.max(end);
                    trace!(channel = %self.shared.name, index, end, "Pattern matched");
                    return Some(index);
                }
                state.exit.is_some()
            };

            if closed || timeout_at(deadline, notified).await.is_err() {
                self.advance_past_dead_bytes(patterns);
                return None;
            }
        }
    }

    fn advance_past_dead_bytes(&self, patterns: &[PatternMatcher]) {
        let mut state = self.shared.lock();
        if let Some(cursor) = patterns.iter().map(PatternMatcher::cursor).min() {
            state.processed = state.processed.max(cursor.min(state.data.len()));
        }
    }

    /// Wait for the next line terminated by `\n`
    ///
    /// The returned text has trailing `\r` and `\n` removed and is decoded
    /// lossily.
    pub async fn read_line(&self, timeout: Duration) -> Option<String> {
        let start = self.processed();
        let mut newline = [PatternMatcher::new(&b"\n"[..])];
        self.wait_for(timeout, &mut newline).await?;
        let end = newline[0].match_end()?;
        let state = self.shared.lock();
        let line = String::from_utf8_lossy(&state.data[start..end]);
        Some(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Offset of the first byte later waits will examine
    pub fn processed(&self) -> usize {
        self.shared.lock().processed
    }

    /// Total number of bytes held in the buffer
    pub fn len(&self) -> usize {
        self.shared.lock().data.len()
    }

    /// Whether nothing has been received yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the bytes from `start` to the end of the buffer
    pub fn bytes_since(&self, start: usize) -> Vec<u8> {
        let state = self.shared.lock();
        let start = start.min(state.data.len());
        state.data[start..].to_vec()
    }

    /// Copy of the bytes later waits will examine
    pub fn unprocessed(&self) -> Vec<u8> {
        let state = self.shared.lock();
        state.data[state.processed..].to_vec()
    }

    /// Enable or disable capture
    ///
    /// Disabling keeps the bytes captured so far. Captured bytes are bounded
    /// by the buffer capacity like the read buffer.
    pub fn set_capture(&self, enabled: bool) {
        self.shared.lock().capturing = enabled;
    }

    /// Whether capture is enabled
    pub fn is_capturing(&self) -> bool {
        self.shared.lock().capturing
    }

    /// Copy of the captured bytes
    pub fn captured(&self) -> Vec<u8> {
        self.shared.lock().captured.clone()
    }

    /// Remove and return the captured bytes
    pub fn take_captured(&self) -> Vec<u8> {
        let mut state = self.shared.lock();
        state.capture_overflowed = false;
        std::mem::take(&mut state.captured)
    }

    /// Discard captured bytes and everything received so far
    ///
    /// Only bytes arriving after this call are seen by later waits.
    pub fn flush_backlog(&self) {
        let mut state = self.shared.lock();
        state.captured.clear();
        state.capture_overflowed = false;
        state.processed = state.data.len();
        debug!(channel = %self.shared.name, processed = state.processed, "Flushed backlog");
    }

    /// Why the reader stopped, if it has
    pub fn exit(&self) -> Option<ReaderExit> {
        self.shared.lock().exit.clone()
    }

    /// Whether the reader has stopped
    pub fn is_closed(&self) -> bool {
        self.shared.lock().exit.is_some()
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("StreamReader")
            .field("name", &self.shared.name)
            .field("buffered", &state.data.len())
            .field("processed", &state.processed)
            .field("capturing", &state.capturing)
            .field("exit", &state.exit)
            .finish()
    }
}

async fn read_loop<R>(mut source: R, shared: Arc<Shared>, chunk_size: usize)
where
    R: AsyncRead + Send + Unpin,
{
    let mut chunk = vec![0u8; chunk_size];
    loop {
        match source.read(&mut chunk).await {
            Ok(0) => {
                debug!(channel = %shared.name, "Stream ended");
                shared.close(ReaderExit::EndOfStream);
                return;
            }
            Ok(n) => {
                let transcript = shared.lock().transcript.clone();
                if let Some(transcript) = transcript {
                    transcript.record(Direction::Received, &chunk[..n]);
                }
                shared.append(&chunk[..n]);
            }
            Err(e) => {
                warn!(channel = %shared.name, error = %e, "Stream read failed");
                shared.close(ReaderExit::Failed(e.to_string()));
                return;
            }
        }
    }
}
