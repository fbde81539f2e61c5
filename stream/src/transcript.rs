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

//! Append-only session transcripts
//!
//! A transcript is a plain text file. The header names the target and the
//! session start time; after it come alternating `SENT:` and `RECV:` blocks
//! holding the literal bytes exchanged. Consecutive records in the same
//! direction are merged into one block.
//!
//! ```text
//! Session transcript for station-12
//! Started: 2026-03-01T12:00:00+00:00
//!
//! SENT:
//! ATZ
//! RECV:
//! OK
//! ```

use crate::{StreamError, StreamResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// Direction of a transcript record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes written to the station
    Sent,
    /// Bytes read from the station
    Received,
}

impl Direction {
    /// Block label used in the transcript file
    pub fn label(self) -> &'static str {
        match self {
            Self::Sent => "SENT",
            Self::Received => "RECV",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

enum TranscriptMessage {
    Data(Direction, Bytes),
    Flush(oneshot::Sender<()>),
}

/// Handle to a session transcript
///
/// Records are queued to a background writer task; [`Transcript::record`]
/// never blocks. The writer finishes and flushes when the last handle is
/// dropped.
#[derive(Debug)]
pub struct Transcript {
    tx: mpsc::UnboundedSender<TranscriptMessage>,
    alive: Arc<AtomicBool>,
}

impl Transcript {
    /// Create a transcript file at `path`, creating parent directories
    pub async fn create(path: &Path, target: &str, started: DateTime<Utc>) -> StreamResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::File::create(path).await?;
        debug!(path = %path.display(), target, "Created session transcript");
        Self::with_writer(file, target, started).await
    }

    /// Write a transcript to an arbitrary sink
    pub async fn with_writer<W>(mut writer: W, target: &str, started: DateTime<Utc>) -> StreamResult<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let header = format!(
            "Session transcript for {}\nStarted: {}\n",
            target,
            started.to_rfc3339()
        );
        writer.write_all(header.as_bytes()).await?;
        writer.flush().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        tokio::spawn(transcript_writer(writer, rx, Arc::clone(&alive)));

        Ok(Self { tx, alive })
    }

    /// File name used for a transcript of `target` started at `started`
    ///
    /// Characters that are awkward in file names are replaced with `_`.
    pub fn file_name(target: &str, started: DateTime<Utc>) -> String {
        let safe: String = target
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}-{}.log", safe, started.format("%Y%m%dT%H%M%S"))
    }

    /// Queue bytes for the transcript
    pub fn record(&self, direction: Direction, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let _ = self.tx.send(TranscriptMessage::Data(
            direction,
            Bytes::copy_from_slice(data),
        ));
    }

    /// Wait until everything queued so far has been written and flushed
    pub async fn flush(&self) -> StreamResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(TranscriptMessage::Flush(ack_tx))
            .map_err(|_| StreamError::TranscriptClosed)?;
        ack_rx.await.map_err(|_| StreamError::TranscriptClosed)
    }

    /// Whether the background writer is still running
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }
}

async fn transcript_writer<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<TranscriptMessage>,
    alive: Arc<AtomicBool>,
) where
    W: AsyncWrite + Send + Unpin,
{
    let mut last: Option<Direction> = None;
    while let Some(message) = rx.recv().await {
        let result = match message {
            TranscriptMessage::Data(direction, data) => {
                write_block(&mut writer, &mut last, direction, &data).await
            }
            TranscriptMessage::Flush(ack) => {
                let result = writer.flush().await;
                let _ = ack.send(());
                result
            }
        };
        if let Err(e) = result {
            error!("Transcript write error: {e}");
            alive.store(false, Ordering::Relaxed);
            return;
        }
    }
    if let Err(e) = writer.flush().await {
        error!("Transcript flush error: {e}");
    }
    alive.store(false, Ordering::Relaxed);
}

async fn write_block<W>(
    writer: &mut W,
    last: &mut Option<Direction>,
    direction: Direction,
    data: &[u8],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if *last != Some(direction) {
        writer
            .write_all(format!("\n{}:\n", direction.label()).as_bytes())
            .await?;
        *last = Some(direction);
    }
    writer.write_all(data).await
}
