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

//! Error types for the polling service

use crate::types::FailureKind;
use fieldpoll_channel::ChannelError;
use thiserror::Error;

/// Result type for scheduler lifecycle operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Scheduler lifecycle errors
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The scheduler was already started
    #[error("Scheduler already running")]
    AlreadyRunning,

    /// The scheduler was never started
    #[error("Scheduler not running")]
    NotRunning,

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Channel pool error
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by protocol handlers
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The station rejected our credentials or never offered a login
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The station answered something the handler did not expect
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No handler is registered for the logger family
    #[error("No handler registered for logger '{0}'")]
    UnknownLogger(String),

    /// The handler could not be built for this target
    #[error("Handler construction failed: {0}")]
    Construction(String),

    /// Channel I/O failed mid-conversation
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Why a session attempt failed
///
/// Every variant is retried while attempts remain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The channel could not be connected
    #[error("Dial failure: {0}")]
    Dial(String),

    /// No usable handler for the target
    #[error("Configuration failure: {0}")]
    Configuration(String),

    /// Login failed
    #[error("Authentication failure: {0}")]
    Authentication(String),

    /// The conversation went wrong after login
    #[error("Protocol failure: {0}")]
    Protocol(String),

    /// The session was aborted by shutdown
    #[error("Session aborted")]
    Aborted,

    /// The session ran past the wedge timeout and was killed
    #[error("Session wedged")]
    Wedged,
}

impl SessionError {
    /// Failure class recorded in the poll status
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Dial(_) => FailureKind::Dial,
            Self::Configuration(_) => FailureKind::Configuration,
            Self::Authentication(_) => FailureKind::Authentication,
            Self::Protocol(_) | Self::Aborted | Self::Wedged => FailureKind::Protocol,
        }
    }

    /// Whether the session never got a connected channel
    pub fn is_connect_error(&self) -> bool {
        matches!(self, Self::Dial(_))
    }
}

impl From<HandlerError> for SessionError {
    fn from(error: HandlerError) -> Self {
        match error {
            HandlerError::Authentication(reason) => Self::Authentication(reason),
            HandlerError::Protocol(reason) => Self::Protocol(reason),
            HandlerError::UnknownLogger(_) | HandlerError::Construction(_) => {
                Self::Configuration(error.to_string())
            }
            HandlerError::Channel(e) => Self::Protocol(e.to_string()),
        }
    }
}
