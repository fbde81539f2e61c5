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

//! Protocol handler traits and the handler registry

use crate::{HandlerError, Target};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fieldpoll_channel::{ChannelIo, ChannelResult, PatternMatcher};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A handler's view of the session's channel
///
/// Wraps the connected channel I/O and exposes the abort flag so long
/// retrievals can stop early.
pub struct SessionIo<'a> {
    io: &'a mut ChannelIo,
    abort: &'a CancellationToken,
    target: &'a Target,
}

impl<'a> SessionIo<'a> {
    /// Wrap channel I/O for one session
    pub fn new(io: &'a mut ChannelIo, abort: &'a CancellationToken, target: &'a Target) -> Self {
        Self { io, abort, target }
    }

    /// The station being polled
    pub fn target(&self) -> &Target {
        self.target
    }

    /// Write bytes to the station
    pub async fn send(&mut self, data: &[u8]) -> ChannelResult<()> {
        self.io.send(data).await
    }

    /// Write a line to the station
    pub async fn send_line(&mut self, line: &str) -> ChannelResult<()> {
        self.io.send_line(line).await
    }

    /// Wait for one of `patterns`; `true` on a match
    pub async fn wait(&self, timeout: Duration, patterns: &mut [PatternMatcher]) -> bool {
        self.io.reader().wait(timeout, patterns).await
    }

    /// Wait for one of `patterns`, returning the index that matched
    pub async fn wait_for(&self, timeout: Duration, patterns: &mut [PatternMatcher]) -> Option<usize> {
        self.io.reader().wait_for(timeout, patterns).await
    }

    /// Read the next line
    pub async fn read_line(&self, timeout: Duration) -> Option<String> {
        self.io.reader().read_line(timeout).await
    }

    /// Enable or disable capture of received bytes
    pub fn set_capture(&self, enabled: bool) {
        self.io.reader().set_capture(enabled);
    }

    /// Remove and return the captured bytes
    pub fn take_captured(&self) -> Vec<u8> {
        self.io.reader().take_captured()
    }

    /// Discard everything received so far
    pub fn flush_backlog(&self) {
        self.io.reader().flush_backlog();
    }

    /// Whether the station has hung up
    pub fn is_closed(&self) -> bool {
        self.io.reader().is_closed()
    }

    /// Whether the session has been asked to stop
    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }
}

impl fmt::Debug for SessionIo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIo")
            .field("target", &self.target.id)
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Conversation with one family of data loggers
///
/// A fresh handler is built for every session attempt. Only `login` and
/// `retrieve_data` are required; the rest have defaults for loggers that
/// simply hang up.
///
/// # Example
///
/// ```no_run
/// use async_trait::async_trait;
/// use bytes::Bytes;
/// use chrono::{DateTime, Utc};
/// use fieldpoll_channel::PatternMatcher;
/// use fieldpoll_service::{HandlerError, ProtocolHandler, SessionIo};
/// use std::time::Duration;
///
/// struct DumpHandler;
///
/// #[async_trait]
/// impl ProtocolHandler for DumpHandler {
///     async fn login(&mut self, io: &mut SessionIo<'_>) -> Result<(), HandlerError> {
///         io.send_line("").await?;
///         if io.wait(Duration::from_secs(10), &mut [PatternMatcher::new(">")]).await {
///             Ok(())
///         } else {
///             Err(HandlerError::Authentication("no prompt".into()))
///         }
///     }
///
///     async fn retrieve_data(
///         &mut self,
///         io: &mut SessionIo<'_>,
///         _since: DateTime<Utc>,
///     ) -> Result<Option<Bytes>, HandlerError> {
///         io.set_capture(true);
///         io.send_line("DUMP").await?;
///         io.wait(Duration::from_secs(60), &mut [PatternMatcher::new("END")]).await;
///         Ok(Some(Bytes::from(io.take_captured())))
///     }
/// }
/// ```
#[async_trait]
pub trait ProtocolHandler: Send {
    /// Get past the station's login
    async fn login(&mut self, io: &mut SessionIo<'_>) -> Result<(), HandlerError>;

    /// Fetch data recorded since `since`
    async fn retrieve_data(
        &mut self,
        io: &mut SessionIo<'_>,
        since: DateTime<Utc>,
    ) -> Result<Option<Bytes>, HandlerError>;

    /// Leave the station cleanly
    async fn logout(&mut self, _io: &mut SessionIo<'_>) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Reason the conversation ended abnormally, if it did
    ///
    /// Checked after retrieval; a reason fails the session even when data
    /// was returned.
    fn abnormal_shutdown(&self) -> Option<String> {
        None
    }

    /// Data collected before a failure, delivered on the final attempt
    fn partial_payload(&mut self) -> Option<Bytes> {
        None
    }
}

type HandlerFactory =
    Arc<dyn Fn(&Target) -> Result<Box<dyn ProtocolHandler>, HandlerError> + Send + Sync>;

/// Maps logger family tags to handler factories
///
/// Tags are matched without regard to case.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a logger family
    pub fn register<F>(&mut self, logger: &str, factory: F)
    where
        F: Fn(&Target) -> Result<Box<dyn ProtocolHandler>, HandlerError> + Send + Sync + 'static,
    {
        self.factories
            .insert(logger.to_ascii_lowercase(), Arc::new(factory));
    }

    /// Register a factory, builder style
    pub fn with_handler<F>(mut self, logger: &str, factory: F) -> Self
    where
        F: Fn(&Target) -> Result<Box<dyn ProtocolHandler>, HandlerError> + Send + Sync + 'static,
    {
        self.register(logger, factory);
        self
    }

    /// Whether a factory is registered for `logger`
    pub fn contains(&self, logger: &str) -> bool {
        self.factories.contains_key(&logger.to_ascii_lowercase())
    }

    /// Build a handler for `target`
    pub fn create(&self, target: &Target) -> Result<Box<dyn ProtocolHandler>, HandlerError> {
        let factory = self
            .factories
            .get(&target.logger.to_ascii_lowercase())
            .ok_or_else(|| HandlerError::UnknownLogger(target.logger.clone()))?;
        factory(target)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut loggers: Vec<_> = self.factories.keys().collect();
        loggers.sort();
        f.debug_struct("HandlerRegistry")
            .field("loggers", &loggers)
            .finish()
    }
}
