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

//! Terminal server port configuration worker
//!
//! Serial ports on a terminal server have to be set to a station's line
//! settings before they are used. The terminal server only tolerates one
//! administrative session at a time, so every request goes through a single
//! worker task fed by a bounded queue.
//!
//! For each request the worker logs in to the admin port, issues
//! `set serial port=<n> ...`, reads the settings back with
//! `show serial port=<n>` and checks them. Repeated failures usually mean the
//! terminal server itself is wedged; once more than
//! [`ConfigWorkerConfig::max_consecutive_failures`] requests fail in a row
//! the worker sends `boot action=reset` and pauses.

use crate::{
    ChannelError, ChannelIo, ChannelResult, ConfigWorkerConfig, ConfigureHandle, ConfigureState,
    Parity, PatternMatcher, ReaderConfig, SerialParams,
};
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A request to configure one serial port
///
/// Completion is reported through `state`, which the worker sets to
/// Success or Failed.
#[derive(Debug, Clone)]
pub struct ConfigureRequest {
    /// Terminal server port number
    pub port: u16,
    /// Configure state of the channel being configured
    pub state: ConfigureHandle,
    /// Settings to apply
    pub serial: SerialParams,
}

#[derive(Debug, Default)]
struct WorkerStats {
    consecutive_failures: AtomicU32,
    completed: AtomicU64,
    failed: AtomicU64,
    reboots: AtomicU64,
}

/// Serializes port configuration against one terminal server
#[derive(Debug)]
pub struct ConfigWorker {
    tx: mpsc::Sender<ConfigureRequest>,
    config: Arc<ConfigWorkerConfig>,
    stats: Arc<WorkerStats>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigWorker {
    /// Start the worker task
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: ConfigWorkerConfig) -> Self {
        let config = Arc::new(config);
        let stats = Arc::new(WorkerStats::default());
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));

        let task = tokio::spawn(worker_loop(
            Arc::clone(&config),
            rx,
            Arc::clone(&stats),
            shutdown.clone(),
        ));
        info!(admin = %config.admin_address, "Configuration worker started");

        Self {
            tx,
            config,
            stats,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue a configuration request
    ///
    /// Waits up to the enqueue timeout for queue space. The outcome of the
    /// configuration itself is observed through the request's state handle.
    pub async fn configure(&self, request: ConfigureRequest) -> ChannelResult<()> {
        let port = request.port;
        match self
            .tx
            .send_timeout(request, self.config.enqueue_timeout)
            .await
        {
            Ok(()) => {
                debug!(port, "Configuration request queued");
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(port, "Configuration queue full");
                counter!("fieldpoll.configure.queue_timeouts").increment(1);
                Err(ChannelError::QueueTimeout)
            }
            Err(SendTimeoutError::Closed(_)) => Err(ChannelError::QueueClosed),
        }
    }

    /// Failures since the last success or reboot
    pub fn consecutive_failures(&self) -> u32 {
        self.stats.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Requests that succeeded
    pub fn completed(&self) -> u64 {
        self.stats.completed.load(Ordering::Relaxed)
    }

    /// Requests that failed
    pub fn failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    /// Reboots issued
    pub fn reboots(&self) -> u64 {
        self.stats.reboots.load(Ordering::Relaxed)
    }

    /// Stop the worker
    ///
    /// Queued requests that were never started keep their current state.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("Configuration worker stopped");
    }
}

impl Drop for ConfigWorker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn worker_loop(
    config: Arc<ConfigWorkerConfig>,
    mut rx: mpsc::Receiver<ConfigureRequest>,
    stats: Arc<WorkerStats>,
    shutdown: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        gauge!("fieldpoll.configure.queue_depth").set(rx.len() as f64);

        match configure_port(&config, &request).await {
            Ok(()) => {
                stats.consecutive_failures.store(0, Ordering::Relaxed);
                stats.completed.fetch_add(1, Ordering::Relaxed);
                counter!("fieldpoll.configure.success").increment(1);
                request.state.set(ConfigureState::Success);
                info!(port = request.port, serial = %request.serial, "Port configured");
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                counter!("fieldpoll.configure.failure").increment(1);
                request.state.set(ConfigureState::Failed);
                let failures = stats.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(port = request.port, failures, error = %e, "Port configuration failed");

                if failures > config.max_consecutive_failures {
                    reboot(&config).await;
                    stats.consecutive_failures.store(0, Ordering::Relaxed);
                    stats.reboots.fetch_add(1, Ordering::Relaxed);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(config.reboot_cooldown) => {}
                    }
                }
            }
        }
    }
    debug!("Configuration worker loop terminated");
}

#[instrument(skip(config, request), fields(port = request.port))]
async fn configure_port(
    config: &ConfigWorkerConfig,
    request: &ConfigureRequest,
) -> ChannelResult<()> {
    let mut io = open_admin(config).await?;
    let result = apply_settings(config, &mut io, request).await;
    let _ = io.send_line("exit").await;
    result.map_err(|e| match e {
        ChannelError::ConfigureFailed { .. } => e,
        other => ChannelError::ConfigureFailed {
            port: request.port,
            reason: other.to_string(),
        },
    })
}

async fn apply_settings(
    config: &ConfigWorkerConfig,
    io: &mut ChannelIo,
    request: &ConfigureRequest,
) -> ChannelResult<()> {
    let serial = &request.serial;
    io.send_line(&format!(
        "set serial port={} baud={} databits={} stopbits={} parity={}",
        request.port, serial.baud, serial.data_bits, serial.stop_bits, serial.parity
    ))
    .await?;
    expect_prompt(config, io, false).await?;

    io.reader().flush_backlog();
    io.reader().set_capture(true);
    io.send_line(&format!("show serial port={}", request.port))
        .await?;
    let shown = expect_prompt(config, io, false).await;
    io.reader().set_capture(false);
    shown?;

    let captured = io.reader().take_captured();
    let settings = parse_serial_settings(&String::from_utf8_lossy(&captured));
    verify_settings(serial, &settings)
}

async fn open_admin(config: &ConfigWorkerConfig) -> ChannelResult<ChannelIo> {
    let stream = timeout(
        config.connect_timeout,
        TcpStream::connect(&config.admin_address),
    )
    .await
    .map_err(|_| ChannelError::ConnectTimeout(config.admin_address.clone()))??;

    let mut io = ChannelIo::new("ts-admin", stream, &ReaderConfig::default(), None);
    login(config, &mut io).await?;
    Ok(io)
}

async fn login(config: &ConfigWorkerConfig, io: &mut ChannelIo) -> ChannelResult<()> {
    let wait = config.response_timeout;

    let mut login = [PatternMatcher::new("login:")];
    if !io.expect(wait, &mut login).await {
        // Some units only print the banner after a keystroke.
        io.send_line("").await?;
        if !io.expect(wait, &mut login).await {
            return Err(ChannelError::Protocol("no login prompt".to_string()));
        }
    }

    io.send_line(&config.username).await?;
    if !io.expect(wait, &mut [PatternMatcher::new("Password:")]).await {
        return Err(ChannelError::Protocol("no password prompt".to_string()));
    }

    io.send_line(&config.password).await?;
    expect_prompt(config, io, true).await
}

async fn expect_prompt(
    config: &ConfigWorkerConfig,
    io: &mut ChannelIo,
    nudge: bool,
) -> ChannelResult<()> {
    let mut prompt = [PatternMatcher::text(&config.prompt)];
    if io.expect(config.response_timeout, &mut prompt).await {
        return Ok(());
    }
    if nudge {
        io.send_line("").await?;
        if io.expect(config.response_timeout, &mut prompt).await {
            return Ok(());
        }
    }
    Err(ChannelError::Protocol("no command prompt".to_string()))
}

async fn reboot(config: &ConfigWorkerConfig) {
    warn!(
        admin = %config.admin_address,
        limit = config.max_consecutive_failures,
        "Too many configuration failures, rebooting terminal server"
    );
    counter!("fieldpoll.configure.reboots").increment(1);
    match open_admin(config).await {
        Ok(mut io) => {
            if let Err(e) = io.send_line("boot action=reset").await {
                warn!(error = %e, "Failed to send reboot command");
            }
        }
        Err(e) => warn!(error = %e, "Could not log in to reboot terminal server"),
    }
}

/// Parse `key=value` tokens from terminal server output
///
/// Keys are lowercased; tokens without `=` are ignored and later tokens win.
pub fn parse_serial_settings(text: &str) -> HashMap<String, String> {
    text.split_whitespace()
        .filter_map(|token| token.split_once('='))
        .map(|(key, value)| {
            (
                key.to_ascii_lowercase(),
                value.trim_end_matches([',', ';']).to_string(),
            )
        })
        .filter(|(key, value)| !key.is_empty() && !value.is_empty())
        .collect()
}

fn verify_settings(serial: &SerialParams, settings: &HashMap<String, String>) -> ChannelResult<()> {
    let actual = |name: &str| {
        settings
            .get(name)
            .cloned()
            .unwrap_or_else(|| "<missing>".to_string())
    };

    let numeric: [(&'static str, u32); 3] = [
        ("baud", serial.baud),
        ("databits", u32::from(serial.data_bits)),
        ("stopbits", u32::from(serial.stop_bits)),
    ];
    for (name, expected) in numeric {
        let found = actual(name);
        if found.parse::<u32>().ok() != Some(expected) {
            return Err(ChannelError::ParamMismatch {
                name,
                expected: expected.to_string(),
                actual: found,
            });
        }
    }

    let found = actual("parity");
    if found.parse::<Parity>().ok() != Some(serial.parity) {
        return Err(ChannelError::ParamMismatch {
            name: "parity",
            expected: serial.parity.to_string(),
            actual: found,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serial_settings() {
        let text = "show serial port=2\r\nport=2 baud=1200, databits=7 stopbits=1 parity=EVEN\r\n#>";
        let settings = parse_serial_settings(text);
        assert_eq!(settings.get("port").map(String::as_str), Some("2"));
        assert_eq!(settings.get("baud").map(String::as_str), Some("1200"));
        assert_eq!(settings.get("parity").map(String::as_str), Some("EVEN"));
        assert!(!settings.contains_key("#>"));
    }

    #[test]
    fn test_verify_settings() {
        let serial = SerialParams::new(1200, 7, 1, Parity::Even);
        let good = parse_serial_settings("baud=1200 databits=7 stopbits=1 parity=even");
        assert!(verify_settings(&serial, &good).is_ok());

        let bad = parse_serial_settings("baud=9600 databits=7 stopbits=1 parity=even");
        match verify_settings(&serial, &bad) {
            Err(ChannelError::ParamMismatch { name, actual, .. }) => {
                assert_eq!(name, "baud");
                assert_eq!(actual, "9600");
            }
            other => panic!("expected mismatch, got {:?}", other),
        }

        let missing = parse_serial_settings("baud=1200 databits=7 stopbits=1");
        assert!(matches!(
            verify_settings(&serial, &missing),
            Err(ChannelError::ParamMismatch { name: "parity", .. })
        ));
    }
}
