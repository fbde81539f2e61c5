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
    Channel, ChannelError, ChannelId, ChannelPool, ChannelResult, CommParams, FinalState,
    ListeningConfig,
};
use async_trait::async_trait;
use metrics::{counter, gauge};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type ReadyQueue = Arc<Mutex<VecDeque<Channel>>>;

fn lock_queue(queue: &ReadyQueue) -> MutexGuard<'_, VecDeque<Channel>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pool of connections opened by stations
///
/// An acceptor task queues every inbound connection as a ready channel;
/// [`ChannelPool::allocate`] pops the oldest one. The pool never refuses a
/// connection itself; deciding whether there is room is up to the caller.
#[derive(Debug)]
pub struct ListeningPool {
    config: ListeningConfig,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    ready: ReadyQueue,
    accepted: Arc<Notify>,
    in_use: AtomicUsize,
    running: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ListeningPool {
    /// Bind the listening socket
    ///
    /// Connections are not accepted until [`ListeningPool::start`] is called.
    pub async fn bind(config: ListeningConfig) -> ChannelResult<Self> {
        let listener = TcpListener::bind(config.bind_address).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Listening pool bound");

        Ok(Self {
            config,
            local_addr,
            listener: Mutex::new(Some(listener)),
            ready: Arc::new(Mutex::new(VecDeque::new())),
            accepted: Arc::new(Notify::new()),
            in_use: AtomicUsize::new(0),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            accept_handle: Mutex::new(None),
        })
    }

    /// Start the acceptor task
    pub fn start(&self) -> ChannelResult<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ChannelError::PoolClosed)?;
        self.running.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.ready),
            Arc::clone(&self.accepted),
            Arc::clone(&self.running),
            Arc::clone(&self.shutdown_notify),
        ));
        *self
            .accept_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(address = %self.local_addr, "Accepting station connections");
        Ok(())
    }

    /// Address the pool accepts on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the acceptor is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of accepted channels not yet allocated
    pub fn ready_count(&self) -> usize {
        lock_queue(&self.ready).len()
    }

    /// Wait until a connection is accepted or `timeout` passes
    ///
    /// Returns immediately if channels are already queued.
    pub async fn accepted(&self, timeout: Duration) {
        let notified = self.accepted.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.ready_count() > 0 {
            return;
        }
        let _ = tokio::time::timeout(timeout, notified).await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    ready: ReadyQueue,
    accepted: Arc<Notify>,
    running: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
) {
    let next_id = AtomicU64::new(1);
    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let accept_result = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown_notify.notified() => break,
        };

        match accept_result {
            Ok((stream, peer)) => {
                let id = ChannelId::new(next_id.fetch_add(1, Ordering::Relaxed));
                debug!(channel = %id, %peer, "Accepted station connection");
                counter!("fieldpoll.channels.accepted").increment(1);
                let depth = {
                    let mut queue = lock_queue(&ready);
                    queue.push_back(Channel::accepted(id, stream, peer));
                    queue.len()
                };
                gauge!("fieldpoll.channels.ready").set(depth as f64);
                accepted.notify_waiters();
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                // Back off on errors to avoid tight loop
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    info!("Accept loop terminated");
}

#[async_trait]
impl ChannelPool for ListeningPool {
    fn allocate(&self) -> Option<Channel> {
        let channel = lock_queue(&self.ready).pop_front()?;
        self.in_use.fetch_add(1, Ordering::AcqRel);
        Some(channel)
    }

    async fn connect(&self, channel: &mut Channel, _params: &CommParams) -> ChannelResult<()> {
        if channel.is_connected() || channel.bind_pending(&self.config.reader) {
            Ok(())
        } else {
            Err(ChannelError::NotConnected)
        }
    }

    fn release(&self, mut channel: Channel, state: FinalState, was_connect_error: bool) {
        channel.disconnect();
        if self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            warn!(channel = %channel.id(), "Released channel that was not allocated");
        }
        debug!(channel = %channel.id(), ?state, was_connect_error, "Released inbound channel");
    }

    fn capacity(&self) -> usize {
        self.config.max_concurrent
    }

    fn free_count(&self) -> usize {
        self.config
            .max_concurrent
            .saturating_sub(self.in_use.load(Ordering::Acquire))
    }

    async fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(address = %self.local_addr, "Closing listening pool");
        self.shutdown_notify.notify_waiters();

        let handle = self
            .accept_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }

        let dropped = {
            let mut queue = lock_queue(&self.ready);
            let dropped = queue.len();
            for mut channel in queue.drain(..) {
                channel.disconnect();
            }
            dropped
        };
        if dropped > 0 {
            debug!(dropped, "Dropped queued inbound channels");
        }
    }
}

impl Drop for ListeningPool {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.shutdown_notify.notify_waiters();
        }
    }
}
