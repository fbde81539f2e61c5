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

//! Where session results go
//!
//! The scheduler does not decode telemetry or store status itself. Sessions
//! hand raw payloads to a [`DataSink`], record contact times through a
//! [`StatusSink`], and exhausted targets are reported to an [`Escalation`].
//! In-memory implementations are provided for embedding and tests.

use crate::{FailureKind, Target, TargetId};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::error;

/// Per-target polling status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollStatus {
    /// Last time data retrieval completed
    pub last_contact: Option<DateTime<Utc>>,
    /// Last time a non-empty payload was received
    pub last_message: Option<DateTime<Utc>>,
    /// Last time a session failed
    pub last_error: Option<DateTime<Utc>>,
    /// Free-text note about the last outcome
    pub annotation: Option<String>,
    /// Class of the last failure
    pub last_failure: Option<FailureKind>,
}

impl PollStatus {
    /// Record a failure at `at`
    pub fn record_failure(&mut self, kind: FailureKind, annotation: impl Into<String>, at: DateTime<Utc>) {
        self.last_error = Some(at);
        self.last_failure = Some(kind);
        self.annotation = Some(annotation.into());
    }

    /// Clear the failure left by an earlier attempt
    ///
    /// `last_error` is kept as a record of when the station last failed.
    pub fn record_success(&mut self) {
        self.last_failure = None;
        self.annotation = None;
    }
}

/// Raw data retrieved from a station
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Station the data came from
    pub target: TargetId,
    /// Logger family tag, for the decoder
    pub logger: String,
    /// Bytes as received
    pub data: Bytes,
    /// When retrieval finished
    pub retrieved_at: DateTime<Utc>,
    /// Whether the session failed after collecting this data
    pub partial: bool,
}

/// Persistent per-target status
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Load the stored status, or a blank one
    async fn load(&self, target: &Target) -> PollStatus;

    /// Store the status
    async fn persist(&self, status: &PollStatus, target: &Target);
}

/// Consumer of retrieved data
#[async_trait]
pub trait DataSink: Send + Sync {
    /// Queue a payload for decoding
    async fn enqueue(&self, payload: Payload);
}

/// Notified when a target used every attempt without success
#[async_trait]
pub trait Escalation: Send + Sync {
    /// Raise an alarm for the target described by `status`
    async fn assert_failure(&self, reason: &str, status: &PollStatus);
}

/// The external collaborators a scheduler reports to
#[derive(Clone)]
pub struct Sinks {
    /// Status store
    pub status: Arc<dyn StatusSink>,
    /// Data consumer
    pub data: Arc<dyn DataSink>,
    /// Failure escalation
    pub escalation: Arc<dyn Escalation>,
}

impl Sinks {
    /// Bundle the collaborators
    pub fn new(
        status: Arc<dyn StatusSink>,
        data: Arc<dyn DataSink>,
        escalation: Arc<dyn Escalation>,
    ) -> Self {
        Self {
            status,
            data,
            escalation,
        }
    }

    /// In-memory status and data with escalation to the log
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStatusStore::new()),
            Arc::new(MemoryDataSink::new()),
            Arc::new(LogEscalation),
        )
    }
}

impl std::fmt::Debug for Sinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sinks").finish_non_exhaustive()
    }
}

/// Status store kept in memory
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    statuses: DashMap<TargetId, PollStatus>,
}

impl MemoryStatusStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the status of a target
    pub fn insert(&self, target: TargetId, status: PollStatus) {
        self.statuses.insert(target, status);
    }

    /// Current status of a target
    pub fn get(&self, target: &TargetId) -> Option<PollStatus> {
        self.statuses.get(target).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl StatusSink for MemoryStatusStore {
    async fn load(&self, target: &Target) -> PollStatus {
        self.get(&target.id).unwrap_or_default()
    }

    async fn persist(&self, status: &PollStatus, target: &Target) {
        self.statuses.insert(target.id.clone(), status.clone());
    }
}

/// Data sink that keeps payloads in memory
#[derive(Debug, Default)]
pub struct MemoryDataSink {
    payloads: Mutex<Vec<Payload>>,
}

impl MemoryDataSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads received so far
    pub fn payloads(&self) -> Vec<Payload> {
        self.payloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove and return the payloads received so far
    pub fn take(&self) -> Vec<Payload> {
        std::mem::take(&mut *self.payloads.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl DataSink for MemoryDataSink {
    async fn enqueue(&self, payload: Payload) {
        self.payloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload);
    }
}

/// Escalation that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEscalation;

#[async_trait]
impl Escalation for LogEscalation {
    async fn assert_failure(&self, reason: &str, status: &PollStatus) {
        error!(
            reason,
            last_contact = ?status.last_contact,
            last_failure = ?status.last_failure,
            "Polling failure asserted"
        );
    }
}
