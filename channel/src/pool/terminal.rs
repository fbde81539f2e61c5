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

use crate::{
    Channel, ChannelError, ChannelId, ChannelKind, ChannelPool, ChannelResult, CommParams,
    ConfigWorker, ConfigureRequest, ConfigureState, FinalState, ModemDialer, TerminalServerConfig,
};
use async_trait::async_trait;
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct PortSlot {
    port: u16,
    in_use: bool,
    connect_failures: u32,
    quarantined_until: Option<Instant>,
}

impl PortSlot {
    fn is_available(&mut self, now: Instant) -> bool {
        if let Some(until) = self.quarantined_until {
            if now < until {
                return false;
            }
            info!(port = self.port, "Port quarantine lifted");
            self.quarantined_until = None;
        }
        !self.in_use
    }
}

/// Pool of serial ports reached through a terminal server
///
/// Each port is configured for the target's line settings before its first
/// connect after allocation. Ports whose sessions keep failing to connect are
/// quarantined for a while.
#[derive(Debug)]
pub struct TerminalServerPool {
    config: TerminalServerConfig,
    slots: Mutex<Vec<PortSlot>>,
    worker: Option<Arc<ConfigWorker>>,
    dialer: ModemDialer,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl TerminalServerPool {
    /// Create a pool over the configured ports
    ///
    /// Without a worker, ports are used with whatever settings they already
    /// have.
    pub fn new(config: TerminalServerConfig, worker: Option<Arc<ConfigWorker>>) -> Self {
        let slots = config
            .ports
            .iter()
            .map(|&port| PortSlot {
                port,
                in_use: false,
                connect_failures: 0,
                quarantined_until: None,
            })
            .collect();
        let dialer = ModemDialer::new(config.dialer.clone());
        Self {
            config,
            slots: Mutex::new(slots),
            worker,
            dialer,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Vec<PortSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ports currently quarantined
    pub fn quarantined_ports(&self) -> Vec<u16> {
        let now = Instant::now();
        self.slots()
            .iter()
            .filter(|slot| slot.quarantined_until.is_some_and(|until| now < until))
            .map(|slot| slot.port)
            .collect()
    }

    async fn configure(&self, channel: &Channel, port: u16, params: &CommParams) -> ChannelResult<()> {
        let Some(worker) = &self.worker else {
            return Ok(());
        };
        let handle = channel.configure_handle();
        if handle.get() == ConfigureState::Waiting {
            handle.set(ConfigureState::Running);
            let request = ConfigureRequest {
                port,
                state: handle.clone(),
                serial: params.serial.clone(),
            };
            if let Err(e) = worker.configure(request).await {
                handle.set(ConfigureState::Failed);
                return Err(e);
            }
        }

        match handle.wait_settled(self.config.configure_timeout).await {
            Some(ConfigureState::Success) => Ok(()),
            Some(_) => Err(ChannelError::Dial(format!(
                "port {} could not be configured",
                port
            ))),
            None => Err(ChannelError::ConfigureTimeout(port)),
        }
    }
}

#[async_trait]
impl ChannelPool for TerminalServerPool {
    fn allocate(&self) -> Option<Channel> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let now = Instant::now();
        let port = {
            let mut slots = self.slots();
            let index = slots.iter_mut().position(|slot| slot.is_available(now))?;
            let slot = &mut slots[index];
            slot.in_use = true;
            slot.port
        };

        let id = ChannelId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        gauge!("fieldpoll.channels.terminal_free").set(self.free_count() as f64);
        debug!(channel = %id, port, "Allocated terminal server port");
        Some(Channel::new(id, format!("port-{}", port), ChannelKind::TerminalServer).with_port(port))
    }

    async fn connect(&self, channel: &mut Channel, params: &CommParams) -> ChannelResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::PoolClosed);
        }
        let port = channel.port().ok_or(ChannelError::NotConnected)?;
        self.configure(channel, port, params).await?;

        let address = self.config.port_address(port);
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| ChannelError::ConnectTimeout(address.clone()))??;
        channel.bind(stream, &self.config.reader);
        counter!("fieldpoll.channels.connects").increment(1);

        if let Some(phone) = &params.phone {
            let Some(io) = channel.io_mut() else {
                return Err(ChannelError::NotConnected);
            };
            if let Err(e) = self.dialer.dial(io, phone).await {
                channel.disconnect();
                return Err(e);
            }
        }
        info!(channel = %channel.id(), port, %address, "Connected");
        Ok(())
    }

    fn release(&self, mut channel: Channel, state: FinalState, was_connect_error: bool) {
        channel.disconnect();
        let Some(port) = channel.port() else {
            warn!(channel = %channel.id(), "Released channel without a port");
            return;
        };

        let mut slots = self.slots();
        let Some(slot) = slots.iter_mut().find(|slot| slot.port == port) else {
            warn!(channel = %channel.id(), port, "Released unknown port");
            return;
        };
        slot.in_use = false;

        if was_connect_error {
            slot.connect_failures += 1;
            let threshold = self.config.quarantine_threshold;
            if threshold > 0 && slot.connect_failures >= threshold {
                warn!(
                    port,
                    failures = slot.connect_failures,
                    cooldown = ?self.config.quarantine_cooldown,
                    "Quarantining port"
                );
                slot.quarantined_until = Some(Instant::now() + self.config.quarantine_cooldown);
                slot.connect_failures = 0;
                counter!("fieldpoll.channels.quarantined").increment(1);
            }
        } else if state == FinalState::Success {
            slot.connect_failures = 0;
        }
        debug!(channel = %channel.id(), port, ?state, was_connect_error, "Released port");
    }

    fn capacity(&self) -> usize {
        self.config.ports.len()
    }

    fn free_count(&self) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        let now = Instant::now();
        self.slots()
            .iter()
            .filter(|slot| !slot.in_use && slot.quarantined_until.is_none_or(|until| now >= until))
            .count()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(worker) = &self.worker {
            worker.shutdown().await;
        }
        info!(host = %self.config.host, "Terminal server pool closed");
    }
}
