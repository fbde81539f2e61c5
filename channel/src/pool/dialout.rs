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
    DialOutConfig, FinalState,
};
use async_trait::async_trait;
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Pool of outbound TCP channels
///
/// Channels are created on demand; the pool only bounds how many exist at
/// once.
#[derive(Debug)]
pub struct DialOutPool {
    config: DialOutConfig,
    in_use: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl DialOutPool {
    /// Create a pool
    pub fn new(config: DialOutConfig) -> Self {
        Self {
            config,
            in_use: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of channels currently allocated
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ChannelPool for DialOutPool {
    fn allocate(&self) -> Option<Channel> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.config.capacity).then_some(n + 1)
            })
            .ok()?;

        let id = ChannelId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        gauge!("fieldpoll.channels.dialout_in_use").set(self.in_use() as f64);
        debug!(channel = %id, "Allocated dial-out channel");
        Some(Channel::new(id, format!("dialout-{}", id.as_u64()), ChannelKind::DialOut))
    }

    async fn connect(&self, channel: &mut Channel, params: &CommParams) -> ChannelResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::PoolClosed);
        }
        let stream = timeout(
            self.config.connect_timeout,
            TcpStream::connect(&params.address),
        )
        .await
        .map_err(|_| ChannelError::ConnectTimeout(params.address.clone()))??;

        channel.bind(stream, &self.config.reader);
        counter!("fieldpoll.channels.connects").increment(1);
        info!(channel = %channel.id(), address = %params.address, "Connected");
        Ok(())
    }

    fn release(&self, mut channel: Channel, state: FinalState, was_connect_error: bool) {
        channel.disconnect();
        let previous = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous.is_err() {
            warn!(channel = %channel.id(), "Released channel that was not allocated");
        }
        gauge!("fieldpoll.channels.dialout_in_use").set(self.in_use() as f64);
        debug!(channel = %channel.id(), ?state, was_connect_error, "Released dial-out channel");
    }

    fn capacity(&self) -> usize {
        self.config.capacity
    }

    fn free_count(&self) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        self.config.capacity.saturating_sub(self.in_use())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(in_use = self.in_use(), "Dial-out pool closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[test]
    fn test_allocation_is_bounded() {
        let pool = DialOutPool::new(DialOutConfig::default().with_capacity(2));
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());
        assert_eq!(pool.free_count(), 0);
        assert_ne!(a.id(), b.id());

        pool.release(a, FinalState::Success, false);
        assert_eq!(pool.free_count(), 1);
        assert!(pool.allocate().is_some());
    }

    #[tokio::test]
    async fn test_connect_binds_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let pool = DialOutPool::new(DialOutConfig::default());

        let mut channel = pool.allocate().unwrap();
        pool.connect(&mut channel, &CommParams::new(address))
            .await
            .unwrap();
        assert!(channel.is_connected());
        let _accepted = listener.accept().await.unwrap();
        pool.release(channel, FinalState::Success, false);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let pool = DialOutPool::new(
            DialOutConfig::default().with_connect_timeout(Duration::from_secs(2)),
        );
        let mut channel = pool.allocate().unwrap();
        let err = pool
            .connect(&mut channel, &CommParams::new(address))
            .await
            .unwrap_err();
        assert!(err.is_connect_error());
        pool.release(channel, FinalState::Failed, true);
    }

    #[tokio::test]
    async fn test_closed_pool_allocates_nothing() {
        let pool = DialOutPool::new(DialOutConfig::default());
        pool.close().await;
        assert!(pool.allocate().is_none());
        assert_eq!(pool.free_count(), 0);
    }
}
