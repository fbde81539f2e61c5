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

//! Shared fixtures for service integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use fieldpoll_channel::{
    Channel, ChannelError, ChannelId, ChannelKind, ChannelPool, ChannelResult, CommParams,
    FinalState, ReaderConfig,
};
use fieldpoll_service::{
    Escalation, HandlerError, HandlerRegistry, MemoryDataSink, MemoryStatusStore, PollStatus,
    ProtocolHandler, SessionIo, Sinks,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream, duplex};

/// Logger tag served by [`ScriptedHandler`]
pub const SCRIPTED: &str = "scripted";

/// What a scripted session does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Log in, retrieve `DATA`, log out
    Succeed,
    /// Like `Succeed` but retrieval takes a while
    Slow,
    /// Reject the login
    FailLogin,
    /// Fail during retrieval
    FailRetrieve,
    /// Retrieve data, then report an abnormal shutdown with a partial payload
    Abnormal,
    /// Never finish unless aborted
    Hang,
    /// Panic during login
    Panic,
}

/// Per-target outcomes, consumed one per attempt
#[derive(Debug)]
pub struct Script {
    default: Outcome,
    outcomes: Mutex<HashMap<String, VecDeque<Outcome>>>,
    order: Mutex<Vec<String>>,
}

impl Script {
    pub fn new(default: Outcome) -> Arc<Self> {
        Arc::new(Self {
            default,
            outcomes: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, target: &str, outcomes: &[Outcome]) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(target.to_string())
            .or_default()
            .extend(outcomes.iter().copied());
    }

    fn next(&self, target: &str) -> Outcome {
        self.order.lock().unwrap().push(target.to_string());
        self.outcomes
            .lock()
            .unwrap()
            .get_mut(target)
            .and_then(VecDeque::pop_front)
            .unwrap_or(self.default)
    }

    /// Targets in the order their sessions started
    pub fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

pub struct ScriptedHandler {
    outcome: Outcome,
}

async fn hang(io: &SessionIo<'_>) -> HandlerError {
    while !io.is_aborted() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    HandlerError::Protocol("stopped".into())
}

#[async_trait]
impl ProtocolHandler for ScriptedHandler {
    async fn login(&mut self, io: &mut SessionIo<'_>) -> Result<(), HandlerError> {
        match self.outcome {
            Outcome::FailLogin => Err(HandlerError::Authentication("bad password".into())),
            Outcome::Hang => Err(hang(io).await),
            Outcome::Panic => panic!("handler bug"),
            _ => {
                io.send_line("LOGIN").await?;
                Ok(())
            }
        }
    }

    async fn retrieve_data(
        &mut self,
        io: &mut SessionIo<'_>,
        _since: DateTime<Utc>,
    ) -> Result<Option<Bytes>, HandlerError> {
        match self.outcome {
            Outcome::FailRetrieve => Err(HandlerError::Protocol("garbled dump".into())),
            Outcome::Slow => {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(Some(Bytes::from_static(b"DATA")))
            }
            _ => {
                io.send_line("DUMP").await?;
                Ok(Some(Bytes::from_static(b"DATA")))
            }
        }
    }

    fn abnormal_shutdown(&self) -> Option<String> {
        (self.outcome == Outcome::Abnormal).then(|| "station hung up mid-dump".to_string())
    }

    fn partial_payload(&mut self) -> Option<Bytes> {
        (self.outcome == Outcome::Abnormal).then(|| Bytes::from_static(b"PART"))
    }
}

/// Registry serving [`SCRIPTED`] targets from `script`
pub fn registry(script: Arc<Script>) -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(SCRIPTED, move |target| {
        let outcome = script.next(target.id.as_str());
        Ok(Box::new(ScriptedHandler { outcome }) as Box<dyn ProtocolHandler>)
    });
    Arc::new(registry)
}

/// Escalation that remembers every call
#[derive(Debug, Default)]
pub struct RecordingEscalation {
    reasons: Mutex<Vec<String>>,
}

impl RecordingEscalation {
    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().unwrap().clone()
    }
}

#[async_trait]
impl Escalation for RecordingEscalation {
    async fn assert_failure(&self, reason: &str, _status: &PollStatus) {
        self.reasons.lock().unwrap().push(reason.to_string());
    }
}

/// In-memory sinks with handles kept for assertions
pub struct TestSinks {
    pub status: Arc<MemoryStatusStore>,
    pub data: Arc<MemoryDataSink>,
    pub escalation: Arc<RecordingEscalation>,
}

impl TestSinks {
    pub fn new() -> Self {
        Self {
            status: Arc::new(MemoryStatusStore::new()),
            data: Arc::new(MemoryDataSink::new()),
            escalation: Arc::new(RecordingEscalation::default()),
        }
    }

    pub fn sinks(&self) -> Sinks {
        Sinks::new(
            self.status.clone(),
            self.data.clone(),
            self.escalation.clone(),
        )
    }
}

/// A released channel as seen by [`TestPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Release {
    pub channel: ChannelId,
    pub state: FinalState,
    pub was_connect_error: bool,
}

/// Pool that connects channels to in-memory pipes
///
/// Addresses listed with [`TestPool::unreachable`] fail to connect.
#[derive(Debug)]
pub struct TestPool {
    capacity: usize,
    in_use: AtomicUsize,
    peak: AtomicUsize,
    next_id: AtomicU64,
    unreachable: Mutex<HashSet<String>>,
    peers: Mutex<Vec<DuplexStream>>,
    releases: Mutex<Vec<Release>>,
    closed: AtomicBool,
}

impl TestPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            in_use: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            unreachable: Mutex::new(HashSet::new()),
            peers: Mutex::new(Vec::new()),
            releases: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn unreachable(&self, address: &str) {
        self.unreachable.lock().unwrap().insert(address.to_string());
    }

    /// Most channels ever allocated at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> Vec<Release> {
        self.releases.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelPool for TestPool {
    fn allocate(&self) -> Option<Channel> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let capacity = self.capacity;
        let previous = self
            .in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < capacity).then_some(n + 1)
            })
            .ok()?;
        self.peak.fetch_max(previous + 1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Some(Channel::new(
            ChannelId::new(id),
            format!("test-{}", id),
            ChannelKind::DialOut,
        ))
    }

    async fn connect(&self, channel: &mut Channel, params: &CommParams) -> ChannelResult<()> {
        if self.unreachable.lock().unwrap().contains(&params.address) {
            return Err(ChannelError::ConnectTimeout(params.address.clone()));
        }
        let (local, remote) = duplex(4096);
        channel.bind(local, &ReaderConfig::default());
        self.peers.lock().unwrap().push(remote);
        Ok(())
    }

    fn release(&self, mut channel: Channel, state: FinalState, was_connect_error: bool) {
        channel.disconnect();
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        self.releases.lock().unwrap().push(Release {
            channel: channel.id(),
            state,
            was_connect_error,
        });
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn free_count(&self) -> usize {
        self.capacity - self.in_use()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Station that answers the password and identification handshake
///
/// Both answers go out in one write, ahead of the prompts.
pub async fn call_in(
    address: std::net::SocketAddr,
    password: Option<&str>,
    identity: &str,
) -> tokio::net::TcpStream {
    let mut stream = tokio::net::TcpStream::connect(address).await.unwrap();
    let mut answers = String::new();
    if let Some(password) = password {
        answers.push_str(password);
        answers.push_str("\r\n");
    }
    answers.push_str(identity);
    answers.push_str("\r\n");
    stream.write_all(answers.as_bytes()).await.unwrap();
    stream
}

/// Wait until `condition` holds, polling every few milliseconds
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
