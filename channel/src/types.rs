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

//! Core channel types

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};

/// Unique identifier for a channel (monotonically increasing per pool)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Create a new channel ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the underlying u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan-{}", self.0)
    }
}

/// Which kind of pool a channel belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Outbound TCP connection
    DialOut,
    /// Serial port proxied through a terminal server
    TerminalServer,
    /// Inbound connection accepted from a station
    Listening,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DialOut => write!(f, "dial-out"),
            Self::TerminalServer => write!(f, "terminal-server"),
            Self::Listening => write!(f, "listening"),
        }
    }
}

/// Port configuration state (stored as atomic u8 for lock-free access)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfigureState {
    /// Port has not been configured since allocation
    Waiting = 0,
    /// A configuration request is queued or in progress
    Running = 1,
    /// The port is configured for the current target
    Success = 2,
    /// Configuration failed
    Failed = 3,
}

impl ConfigureState {
    /// Convert from u8 (for atomic operations)
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Waiting,
            1 => Self::Running,
            2 => Self::Success,
            _ => Self::Failed,
        }
    }

    /// Convert to u8 (for atomic operations)
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if configuration has finished one way or the other
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for ConfigureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug)]
struct ConfigureShared {
    state: AtomicU8,
    changed: Notify,
}

/// Shared handle to a channel's configure state
///
/// The pool and the configuration worker hold clones of the same handle.
/// Waiters are woken whenever the state changes.
#[derive(Debug, Clone)]
pub struct ConfigureHandle(Arc<ConfigureShared>);

impl Default for ConfigureHandle {
    fn default() -> Self {
        Self::new(ConfigureState::Waiting)
    }
}

impl ConfigureHandle {
    /// Create a handle in the given state
    pub fn new(state: ConfigureState) -> Self {
        Self(Arc::new(ConfigureShared {
            state: AtomicU8::new(state.as_u8()),
            changed: Notify::new(),
        }))
    }

    /// Current state
    pub fn get(&self) -> ConfigureState {
        ConfigureState::from_u8(self.0.state.load(Ordering::Acquire))
    }

    /// Set the state and wake waiters
    pub fn set(&self, state: ConfigureState) {
        self.0.state.store(state.as_u8(), Ordering::Release);
        self.0.changed.notify_waiters();
    }

    /// Wait until the state is Success or Failed
    ///
    /// Returns `None` if it has not settled within `timeout`.
    pub async fn wait_settled(&self, timeout: Duration) -> Option<ConfigureState> {
        let deadline = Instant::now() + timeout;
        loop {
            let changed = self.0.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let state = self.get();
            if state.is_settled() {
                return Some(state);
            }
            if timeout_at(deadline, changed).await.is_err() {
                return None;
            }
        }
    }
}

/// How a channel's last use ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalState {
    /// The session completed
    Success,
    /// The session failed
    Failed,
}

/// Serial line parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
    /// Parity bit always 1
    Mark,
    /// Parity bit always 0
    Space,
}

impl Parity {
    /// Name as used in terminal server commands
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Even => "even",
            Self::Odd => "odd",
            Self::Mark => "mark",
            Self::Space => "space",
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Parity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "even" | "e" => Ok(Self::Even),
            "odd" | "o" => Ok(Self::Odd),
            "mark" | "m" => Ok(Self::Mark),
            "space" | "s" => Ok(Self::Space),
            other => Err(format!("unknown parity '{}'", other)),
        }
    }
}

/// Serial line settings for a station
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialParams {
    /// Line speed in bits per second
    pub baud: u32,
    /// Data bits per character
    pub data_bits: u8,
    /// Stop bits per character
    pub stop_bits: u8,
    /// Parity
    pub parity: Parity,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            baud: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

impl SerialParams {
    /// Create serial settings
    pub fn new(baud: u32, data_bits: u8, stop_bits: u8, parity: Parity) -> Self {
        Self {
            baud,
            data_bits,
            stop_bits,
            parity,
        }
    }
}

impl fmt::Display for SerialParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{}{}",
            self.baud,
            self.data_bits,
            self.parity.as_str().chars().next().unwrap_or('n').to_ascii_uppercase(),
            self.stop_bits
        )
    }
}

/// How to reach a station
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommParams {
    /// Network address (`host:port`) for direct connections
    pub address: String,
    /// Phone number to dial through a modem, if any
    pub phone: Option<String>,
    /// Serial line settings
    pub serial: SerialParams,
}

impl CommParams {
    /// Create parameters for the given address
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Set the phone number
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    /// Set the serial settings
    pub fn with_serial(mut self, serial: SerialParams) -> Self {
        self.serial = serial;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configure_state_conversion() {
        for state in [
            ConfigureState::Waiting,
            ConfigureState::Running,
            ConfigureState::Success,
            ConfigureState::Failed,
        ] {
            assert_eq!(ConfigureState::from_u8(state.as_u8()), state);
        }
        assert!(!ConfigureState::Running.is_settled());
        assert!(ConfigureState::Failed.is_settled());
    }

    #[test]
    fn test_parity_parse() {
        assert_eq!("EVEN".parse::<Parity>(), Ok(Parity::Even));
        assert_eq!("n".parse::<Parity>(), Ok(Parity::None));
        assert!("sideways".parse::<Parity>().is_err());
    }

    #[test]
    fn test_serial_display() {
        let serial = SerialParams::new(1200, 7, 1, Parity::Even);
        assert_eq!(serial.to_string(), "1200 7E1");
    }

    #[tokio::test]
    async fn test_wait_settled_wakes_on_set() {
        let handle = ConfigureHandle::new(ConfigureState::Running);
        let setter = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            setter.set(ConfigureState::Success);
        });

        let state = handle.wait_settled(Duration::from_secs(5)).await;
        assert_eq!(state, Some(ConfigureState::Success));
    }

    #[tokio::test]
    async fn test_wait_settled_times_out() {
        let handle = ConfigureHandle::new(ConfigureState::Running);
        assert_eq!(handle.wait_settled(Duration::from_millis(30)).await, None);
    }
}
