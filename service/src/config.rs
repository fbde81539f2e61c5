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

//! Scheduler configuration
//!
//! # Examples
//!
//! ```
//! use fieldpoll_service::{ListenerAuth, SchedulerConfig};
//! use std::time::Duration;
//!
//! let config = SchedulerConfig::default()
//!     .with_max_attempts(5)
//!     .with_wedge_timeout(Duration::from_secs(900))
//!     .with_transcript_dir("/var/log/fieldpoll");
//! assert!(config.validate().is_ok());
//!
//! let auth = ListenerAuth::default().with_password("letmein");
//! assert!(auth.validate().is_ok());
//! ```

use crate::BacklogPolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pause between scheduling passes
    pub pause_interval: Duration,

    /// Running time after which a session is considered wedged
    pub wedge_timeout: Duration,

    /// How often running sessions are checked for wedging
    pub wedge_check_interval: Duration,

    /// How long shutdown waits for aborted sessions to finish
    pub drain_timeout: Duration,

    /// Attempts allowed per target per run
    pub max_attempts: u32,

    /// Data window policy
    pub backlog: BacklogPolicy,

    /// Directory for session transcripts; `None` disables them
    pub transcript_dir: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pause_interval: Duration::from_millis(250),
            wedge_timeout: Duration::from_secs(1800), // 30 minutes
            wedge_check_interval: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
            max_attempts: 3,
            backlog: BacklogPolicy::default(),
            transcript_dir: None,
        }
    }
}

impl SchedulerConfig {
    /// Set the pause interval
    pub fn with_pause_interval(mut self, interval: Duration) -> Self {
        self.pause_interval = interval;
        self
    }

    /// Set the wedge timeout
    pub fn with_wedge_timeout(mut self, timeout: Duration) -> Self {
        self.wedge_timeout = timeout;
        self
    }

    /// Set the wedge check interval
    pub fn with_wedge_check_interval(mut self, interval: Duration) -> Self {
        self.wedge_check_interval = interval;
        self
    }

    /// Set the drain timeout
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the attempt limit
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the backlog policy
    pub fn with_backlog(mut self, backlog: BacklogPolicy) -> Self {
        self.backlog = backlog;
        self
    }

    /// Write session transcripts into `dir`
    pub fn with_transcript_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.transcript_dir = Some(dir.into());
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.pause_interval.is_zero() {
            return Err("pause_interval must be greater than 0".to_string());
        }
        if self.wedge_timeout.is_zero() {
            return Err("wedge_timeout must be greater than 0".to_string());
        }
        if self.wedge_check_interval.is_zero() {
            return Err("wedge_check_interval must be greater than 0".to_string());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        self.backlog.validate()
    }
}

/// Handshake required from stations that call in
#[derive(Debug, Clone)]
pub struct ListenerAuth {
    /// Shared password; `None` skips the challenge
    pub password: Option<String>,

    /// Prompt sent before reading the password
    pub password_prompt: String,

    /// Prompt sent before reading the station identification, if any
    pub identify_prompt: Option<String>,

    /// Time allowed for each handshake line
    pub response_timeout: Duration,
}

impl Default for ListenerAuth {
    fn default() -> Self {
        Self {
            password: None,
            password_prompt: "Password: ".to_string(),
            identify_prompt: None,
            response_timeout: Duration::from_secs(30),
        }
    }
}

impl ListenerAuth {
    /// Require a password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the password prompt
    pub fn with_password_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.password_prompt = prompt.into();
        self
    }

    /// Prompt stations for their identification
    pub fn with_identify_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.identify_prompt = Some(prompt.into());
        self
    }

    /// Set the response timeout
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.response_timeout.is_zero() {
            return Err("response_timeout must be greater than 0".to_string());
        }
        if self.password.as_deref() == Some("") {
            return Err("password must not be empty when set".to_string());
        }
        Ok(())
    }
}
