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

//! Pool, dialer and configuration worker settings
//!
//! # Examples
//!
//! ```
//! use fieldpoll_channel::{ConfigWorkerConfig, TerminalServerConfig};
//! use std::time::Duration;
//!
//! let pool = TerminalServerConfig::new("ts1.example.net", 4000)
//!     .with_ports(1..=8)
//!     .with_configure_timeout(Duration::from_secs(60));
//! assert!(pool.validate().is_ok());
//!
//! let worker = ConfigWorkerConfig::new("ts1.example.net:23")
//!     .with_credentials("admin", "secret")
//!     .with_max_consecutive_failures(3);
//! assert!(worker.validate().is_ok());
//! ```

use fieldpoll_stream::ReaderConfig;
use std::net::SocketAddr;
use std::time::Duration;

/// Dial-out pool configuration
#[derive(Debug, Clone)]
pub struct DialOutConfig {
    /// Maximum number of channels in use at once
    pub capacity: usize,

    /// Time allowed for a TCP connect
    pub connect_timeout: Duration,

    /// Reader settings for connected channels
    pub reader: ReaderConfig,
}

impl Default for DialOutConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            connect_timeout: Duration::from_secs(30),
            reader: ReaderConfig::default(),
        }
    }
}

impl DialOutConfig {
    /// Set the capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the reader configuration
    pub fn with_reader(mut self, reader: ReaderConfig) -> Self {
        self.reader = reader;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("capacity must be greater than 0".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("connect_timeout must be greater than 0".to_string());
        }
        self.reader.validate()
    }
}

/// Modem dial script settings
#[derive(Debug, Clone)]
pub struct DialerConfig {
    /// Modem reset command
    pub init_command: String,

    /// Prefix placed before the phone number
    pub dial_prefix: String,

    /// Time allowed for the modem to acknowledge the reset
    pub reset_timeout: Duration,

    /// Time allowed for the remote modem to answer
    pub dial_timeout: Duration,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            init_command: "ATZ".to_string(),
            dial_prefix: "ATDT".to_string(),
            reset_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(60),
        }
    }
}

impl DialerConfig {
    /// Set the reset command
    pub fn with_init_command(mut self, command: impl Into<String>) -> Self {
        self.init_command = command.into();
        self
    }

    /// Set the dial prefix
    pub fn with_dial_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.dial_prefix = prefix.into();
        self
    }

    /// Set the reset timeout
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the dial timeout
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.dial_prefix.is_empty() {
            return Err("dial_prefix must not be empty".to_string());
        }
        if self.reset_timeout.is_zero() || self.dial_timeout.is_zero() {
            return Err("dialer timeouts must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Terminal server pool configuration
#[derive(Debug, Clone)]
pub struct TerminalServerConfig {
    /// Terminal server host name or address
    pub host: String,

    /// TCP port of serial port 0; port `n` listens on `base_port + n`
    pub base_port: u16,

    /// Serial port numbers this pool may hand out
    pub ports: Vec<u16>,

    /// Time allowed for a TCP connect
    pub connect_timeout: Duration,

    /// Time allowed for port configuration to settle
    pub configure_timeout: Duration,

    /// Consecutive connect-failure releases before a port is quarantined
    ///
    /// Zero disables quarantine.
    pub quarantine_threshold: u32,

    /// How long a quarantined port is skipped
    pub quarantine_cooldown: Duration,

    /// Modem dial settings
    pub dialer: DialerConfig,

    /// Reader settings for connected channels
    pub reader: ReaderConfig,
}

impl Default for TerminalServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            base_port: 4000,
            ports: Vec::new(),
            connect_timeout: Duration::from_secs(30),
            configure_timeout: Duration::from_secs(120),
            quarantine_threshold: 3,
            quarantine_cooldown: Duration::from_secs(600),
            dialer: DialerConfig::default(),
            reader: ReaderConfig::default(),
        }
    }
}

impl TerminalServerConfig {
    /// Create a configuration for the given terminal server
    pub fn new(host: impl Into<String>, base_port: u16) -> Self {
        Self {
            host: host.into(),
            base_port,
            ..Default::default()
        }
    }

    /// Set the serial port numbers
    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.ports = ports.into_iter().collect();
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the configure timeout
    pub fn with_configure_timeout(mut self, timeout: Duration) -> Self {
        self.configure_timeout = timeout;
        self
    }

    /// Set the quarantine threshold and cooldown
    pub fn with_quarantine(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.quarantine_threshold = threshold;
        self.quarantine_cooldown = cooldown;
        self
    }

    /// Set the dialer configuration
    pub fn with_dialer(mut self, dialer: DialerConfig) -> Self {
        self.dialer = dialer;
        self
    }

    /// Set the reader configuration
    pub fn with_reader(mut self, reader: ReaderConfig) -> Self {
        self.reader = reader;
        self
    }

    /// TCP address of the given serial port
    pub fn port_address(&self, port: u16) -> String {
        format!("{}:{}", self.host, u32::from(self.base_port) + u32::from(port))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("host must not be empty".to_string());
        }
        if self.ports.is_empty() {
            return Err("at least one port is required".to_string());
        }
        if let Some(port) = self
            .ports
            .iter()
            .find(|&&port| u32::from(self.base_port) + u32::from(port) > u32::from(u16::MAX))
        {
            return Err(format!("port {} is out of range for base {}", port, self.base_port));
        }
        let mut sorted = self.ports.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != self.ports.len() {
            return Err("ports must be unique".to_string());
        }
        if self.configure_timeout.is_zero() {
            return Err("configure_timeout must be greater than 0".to_string());
        }
        self.dialer.validate()?;
        self.reader.validate()
    }
}

/// Listening pool configuration
#[derive(Debug, Clone)]
pub struct ListeningConfig {
    /// Address to accept station connections on
    pub bind_address: SocketAddr,

    /// Maximum number of stations served at once
    pub max_concurrent: usize,

    /// Reader settings for accepted channels
    pub reader: ReaderConfig,
}

impl Default for ListeningConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 4100)),
            max_concurrent: 16,
            reader: ReaderConfig::default(),
        }
    }
}

impl ListeningConfig {
    /// Create a configuration bound to the given address
    pub fn new(bind_address: SocketAddr) -> Self {
        Self {
            bind_address,
            ..Default::default()
        }
    }

    /// Set the concurrency limit
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set the reader configuration
    pub fn with_reader(mut self, reader: ReaderConfig) -> Self {
        self.reader = reader;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent == 0 {
            return Err("max_concurrent must be greater than 0".to_string());
        }
        self.reader.validate()
    }
}

/// Configuration worker settings
#[derive(Debug, Clone)]
pub struct ConfigWorkerConfig {
    /// Terminal server administration address (`host:port`)
    pub admin_address: String,

    /// Administrator user name
    pub username: String,

    /// Administrator password
    pub password: String,

    /// Command prompt printed by the terminal server
    pub prompt: String,

    /// Maximum number of queued requests
    pub queue_capacity: usize,

    /// How long a producer waits for queue space
    pub enqueue_timeout: Duration,

    /// Time allowed for the admin connection
    pub connect_timeout: Duration,

    /// Time allowed for each expected response
    pub response_timeout: Duration,

    /// Failures in a row tolerated before the terminal server is rebooted
    pub max_consecutive_failures: u32,

    /// Pause after issuing a reboot
    pub reboot_cooldown: Duration,
}

impl Default for ConfigWorkerConfig {
    fn default() -> Self {
        Self {
            admin_address: "127.0.0.1:23".to_string(),
            username: "admin".to_string(),
            password: String::new(),
            prompt: "#>".to_string(),
            queue_capacity: 32,
            enqueue_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(10),
            max_consecutive_failures: 3,
            reboot_cooldown: Duration::from_secs(90),
        }
    }
}

impl ConfigWorkerConfig {
    /// Create a configuration for the given admin address
    pub fn new(admin_address: impl Into<String>) -> Self {
        Self {
            admin_address: admin_address.into(),
            ..Default::default()
        }
    }

    /// Set the administrator credentials
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set the command prompt
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Set the queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the enqueue timeout
    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the response timeout
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the consecutive failure limit
    pub fn with_max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    /// Set the reboot cooldown
    pub fn with_reboot_cooldown(mut self, cooldown: Duration) -> Self {
        self.reboot_cooldown = cooldown;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.admin_address.is_empty() {
            return Err("admin_address must not be empty".to_string());
        }
        if self.prompt.is_empty() {
            return Err("prompt must not be empty".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".to_string());
        }
        if self.response_timeout.is_zero() {
            return Err("response_timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_address() {
        let config = TerminalServerConfig::new("ts1", 4000).with_ports([1, 2]);
        assert_eq!(config.port_address(2), "ts1:4002");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_terminal_server_validation() {
        assert!(TerminalServerConfig::new("ts1", 4000).validate().is_err());
        assert!(
            TerminalServerConfig::new("ts1", 4000)
                .with_ports([1, 1])
                .validate()
                .is_err()
        );
        assert!(
            TerminalServerConfig::new("ts1", 65530)
                .with_ports([10])
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_dial_out_validation() {
        assert!(DialOutConfig::default().validate().is_ok());
        assert!(DialOutConfig::default().with_capacity(0).validate().is_err());
    }

    #[test]
    fn test_worker_validation() {
        assert!(ConfigWorkerConfig::default().validate().is_ok());
        assert!(
            ConfigWorkerConfig::default()
                .with_queue_capacity(0)
                .validate()
                .is_err()
        );
        assert!(ConfigWorkerConfig::default().with_prompt("").validate().is_err());
    }
}
