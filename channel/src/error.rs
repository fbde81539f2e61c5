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

//! Error types for channel operations

use thiserror::Error;

/// Result type for channel operations
pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// Channel error types
#[derive(Debug, Error)]
pub enum ChannelError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transcript error from the stream layer
    #[error("Stream error: {0}")]
    Stream(#[from] fieldpoll_stream::StreamError),

    /// TCP connect did not complete in time
    #[error("Connect to {0} timed out")]
    ConnectTimeout(String),

    /// The channel has no bound stream
    #[error("Channel not connected")]
    NotConnected,

    /// The peer closed the connection
    #[error("Channel closed by peer")]
    Closed,

    /// Port configuration finished in the failed state
    #[error("Configuration of port {port} failed: {reason}")]
    ConfigureFailed {
        /// Terminal server port number
        port: u16,
        /// What went wrong
        reason: String,
    },

    /// Port configuration did not finish in time
    #[error("Configuration of port {0} timed out")]
    ConfigureTimeout(u16),

    /// The configuration queue stayed full for the whole enqueue timeout
    #[error("Configuration queue full")]
    QueueTimeout,

    /// The configuration worker has stopped
    #[error("Configuration worker stopped")]
    QueueClosed,

    /// Modem dialing failed
    #[error("Dial failed: {0}")]
    Dial(String),

    /// The pool has been closed
    #[error("Channel pool closed")]
    PoolClosed,

    /// The terminal server answered unexpectedly
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A serial parameter read back from the terminal server differs
    #[error("Parameter {name} mismatch: expected {expected}, found {actual}")]
    ParamMismatch {
        /// Parameter name as the terminal server reports it
        name: &'static str,
        /// Value that was set
        expected: String,
        /// Value that was read back
        actual: String,
    },
}

impl ChannelError {
    /// Check if the error happened while establishing the channel
    ///
    /// Pools count these against the port when deciding on quarantine.
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ConnectTimeout(_)
                | Self::ConfigureFailed { .. }
                | Self::ConfigureTimeout(_)
                | Self::QueueTimeout
                | Self::Dial(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ChannelError::ParamMismatch {
            name: "baud",
            expected: "9600".to_string(),
            actual: "1200".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Parameter baud mismatch: expected 9600, found 1200"
        );

        let err = ChannelError::ConfigureFailed {
            port: 3,
            reason: "no login prompt".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Configuration of port 3 failed: no login prompt"
        );
    }

    #[test]
    fn test_connect_error_classification() {
        assert!(ChannelError::Dial("BUSY".to_string()).is_connect_error());
        assert!(ChannelError::ConnectTimeout("host:1".to_string()).is_connect_error());
        assert!(!ChannelError::Closed.is_connect_error());
        assert!(!ChannelError::Protocol("x".to_string()).is_connect_error());
    }
}
