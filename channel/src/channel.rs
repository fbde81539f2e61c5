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

//! Channel handles and their bound I/O

use crate::{ChannelError, ChannelId, ChannelKind, ChannelResult, ConfigureHandle, ConfigureState};
use fieldpoll_stream::{Direction, PatternMatcher, ReaderConfig, StreamReader, Transcript};
use metrics::counter;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Line terminator appended by [`ChannelIo::send_line`]
const LINE_END: &[u8] = b"\r\n";

/// Bound I/O of a connected channel
///
/// Inbound bytes are drained by a [`StreamReader`]; outbound bytes are
/// written directly. Both directions are copied to the transcript when one is
/// attached.
pub struct ChannelIo {
    reader: StreamReader,
    writer: Box<dyn AsyncWrite + Send + Sync + Unpin>,
    transcript: Option<Arc<Transcript>>,
}

impl ChannelIo {
    /// Bind a bidirectional stream
    pub fn new<S>(
        name: &str,
        stream: S,
        config: &ReaderConfig,
        transcript: Option<Arc<Transcript>>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = StreamReader::spawn(name, read_half, config, transcript.clone());
        Self {
            reader,
            writer: Box::new(write_half),
            transcript,
        }
    }

    /// The inbound reader
    pub fn reader(&self) -> &StreamReader {
        &self.reader
    }

    /// Write bytes and flush them
    pub async fn send(&mut self, data: &[u8]) -> ChannelResult<()> {
        if self.reader.is_closed() {
            return Err(ChannelError::Closed);
        }
        if let Some(transcript) = &self.transcript {
            transcript.record(Direction::Sent, data);
        }
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        counter!("fieldpoll.channels.bytes_sent").increment(data.len() as u64);
        trace!(channel = %self.reader.name(), len = data.len(), "Sent bytes");
        Ok(())
    }

    /// Write a line followed by CR LF
    pub async fn send_line(&mut self, line: &str) -> ChannelResult<()> {
        let mut data = Vec::with_capacity(line.len() + LINE_END.len());
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(LINE_END);
        self.send(&data).await
    }

    /// Wait for one of `patterns`, returning `true` on a match
    pub async fn expect(&self, timeout: Duration, patterns: &mut [PatternMatcher]) -> bool {
        self.reader.wait(timeout, patterns).await
    }

    /// Attach or detach a transcript for both directions
    pub fn set_transcript(&mut self, transcript: Option<Arc<Transcript>>) {
        self.reader.set_transcript(transcript.clone());
        self.transcript = transcript;
    }

    /// The attached transcript, if any
    pub fn transcript(&self) -> Option<&Arc<Transcript>> {
        self.transcript.as_ref()
    }

    async fn shutdown(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

impl fmt::Debug for ChannelIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelIo")
            .field("reader", &self.reader)
            .field("transcript", &self.transcript.is_some())
            .finish()
    }
}

/// One communication path to a station
///
/// A channel is handed out by a pool, connected for one session, then given
/// back with [`crate::ChannelPool::release`]. At most one session holds it at
/// a time, which ownership enforces.
pub struct Channel {
    id: ChannelId,
    name: String,
    kind: ChannelKind,
    port: Option<u16>,
    configure: ConfigureHandle,
    peer: Option<SocketAddr>,
    pending: Option<TcpStream>,
    transcript: Option<Arc<Transcript>>,
    io: Option<ChannelIo>,
}

impl Channel {
    /// Create an unconnected channel
    pub fn new(id: ChannelId, name: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            port: None,
            configure: ConfigureHandle::default(),
            peer: None,
            pending: None,
            transcript: None,
            io: None,
        }
    }

    /// Set the terminal server port number
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Create a channel holding an accepted inbound socket
    ///
    /// The socket is bound when the channel is connected.
    pub fn accepted(id: ChannelId, stream: TcpStream, peer: SocketAddr) -> Self {
        let mut channel = Self::new(id, format!("inbound-{}", peer), ChannelKind::Listening);
        channel.peer = Some(peer);
        channel.pending = Some(stream);
        channel
    }

    /// Channel ID
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Channel name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pool kind
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Terminal server port number, if any
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Remote address of an accepted channel
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Current configure state
    pub fn configure_state(&self) -> ConfigureState {
        self.configure.get()
    }

    /// Shared configure state handle
    pub fn configure_handle(&self) -> &ConfigureHandle {
        &self.configure
    }

    /// Whether a stream is bound
    pub fn is_connected(&self) -> bool {
        self.io.is_some()
    }

    /// Bound I/O, if connected
    pub fn io(&self) -> Option<&ChannelIo> {
        self.io.as_ref()
    }

    /// Bound I/O, if connected
    pub fn io_mut(&mut self) -> Option<&mut ChannelIo> {
        self.io.as_mut()
    }

    /// Attach a transcript
    ///
    /// Applies to the current binding and to any later one.
    pub fn set_transcript(&mut self, transcript: Option<Arc<Transcript>>) {
        if let Some(io) = &mut self.io {
            io.set_transcript(transcript.clone());
        }
        self.transcript = transcript;
    }

    /// Bind a connected stream, replacing any previous binding
    pub fn bind<S>(&mut self, stream: S, config: &ReaderConfig)
    where
        S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    {
        self.io = Some(ChannelIo::new(
            &self.name,
            stream,
            config,
            self.transcript.clone(),
        ));
        debug!(channel = %self.id, name = %self.name, "Channel bound");
    }

    /// Bind the accepted socket held since the channel was created
    ///
    /// Returns `false` when there is nothing pending.
    pub fn bind_pending(&mut self, config: &ReaderConfig) -> bool {
        match self.pending.take() {
            Some(stream) => {
                self.bind(stream, config);
                true
            }
            None => false,
        }
    }

    /// Drop the bound stream and any pending socket
    pub fn disconnect(&mut self) {
        self.pending = None;
        self.transcript = None;
        if let Some(io) = self.io.take() {
            debug!(channel = %self.id, name = %self.name, "Channel disconnected");
            // Half-close politely if a runtime is still around.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(io.shutdown());
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("port", &self.port)
            .field("configure", &self.configure.get())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}
