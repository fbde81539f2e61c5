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

//! Core types for the polling service

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Station identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(Arc<str>);

impl TargetId {
    /// Create a target ID
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The ID as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Polling priority, 1 (highest) to 3 (lowest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Priority(u8);

impl Priority {
    /// Highest priority
    pub const HIGHEST: Self = Self(1);
    /// Lowest priority, the default
    pub const LOWEST: Self = Self(3);
    /// Number of priority tiers
    pub const TIERS: usize = 3;

    /// Create a priority, clamping into 1..=3
    pub fn new(value: u8) -> Self {
        Self(value.clamp(Self::HIGHEST.0, Self::LOWEST.0))
    }

    /// The numeric priority
    pub fn value(self) -> u8 {
        self.0
    }

    /// Zero-based tier index, 0 being the highest priority
    pub fn tier(self) -> usize {
        usize::from(self.0 - 1)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::LOWEST
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a session stands within one polling run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Eligible for selection
    Waiting,
    /// Holding a channel and talking to the station
    Running,
    /// Finished successfully
    Success,
    /// Finished with all attempts used
    Failed,
}

impl SessionState {
    /// Check if the session has finished for this run
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Classification of a failed session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Could not connect or dial
    Dial,
    /// No usable handler
    Configuration,
    /// Login rejected
    Authentication,
    /// Conversation failed after login
    Protocol,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dial => write!(f, "dial"),
            Self::Configuration => write!(f, "configuration"),
            Self::Authentication => write!(f, "authentication"),
            Self::Protocol => write!(f, "protocol"),
        }
    }
}

/// Scheduler run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Created, not started
    Idle,
    /// Selecting and running sessions
    Running,
    /// Aborting sessions and closing the pool
    Draining,
    /// Finished
    Stopped,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Tally published when a polling run stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Targets polled successfully
    pub succeeded: usize,
    /// Targets that used every attempt
    pub failed: usize,
    /// Targets never finished because of shutdown
    pub unfinished: usize,
    /// Targets excluded by their seasonal window
    pub out_of_season: usize,
    /// Wall time from start to stop
    pub elapsed: Duration,
}

impl RunSummary {
    /// Targets that were part of the run
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.unfinished
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RunSummary {{ succeeded: {}, failed: {}, unfinished: {}, out_of_season: {}, elapsed: {:?} }}",
            self.succeeded, self.failed, self.unfinished, self.out_of_season, self.elapsed
        )
    }
}
