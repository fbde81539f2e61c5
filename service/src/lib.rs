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

//! Field Station Polling Service
//!
//! Schedules polling sessions against remote data loggers over the channel
//! pools provided by `fieldpoll-channel`. Two front ends share the same
//! session machinery:
//!
//! - [`Scheduler`] walks a roster of targets, picking the next one by
//!   priority round-robin whenever a channel is free, and retries failures up
//!   to an attempt limit.
//! - [`ListeningScheduler`] serves stations that call in, after a password
//!   challenge and self-identification.
//!
//! # Architecture
//!
//! ```text
//! Scheduler / ListeningScheduler
//!     ↓
//! Session (one task per attempt)
//!     ↓
//! ProtocolHandler → SessionIo → ChannelIo → StreamReader
//! ```
//!
//! Decoding and storage live outside this crate; sessions report through the
//! [`StatusSink`], [`DataSink`] and [`Escalation`] traits.

mod backlog;
mod config;
mod error;
mod handler;
mod listening;
mod metrics;
mod scheduler;
mod session;
mod sink;
mod target;
mod types;

pub use backlog::BacklogPolicy;
pub use config::{ListenerAuth, SchedulerConfig};
pub use error::{HandlerError, Result, ServiceError, SessionError};
pub use handler::{HandlerRegistry, ProtocolHandler, SessionIo};
pub use listening::ListeningScheduler;
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
pub use scheduler::{Scheduler, SessionInfo, select_next};
pub use session::{Completion, Session};
pub use sink::{
    DataSink, Escalation, LogEscalation, MemoryDataSink, MemoryStatusStore, Payload, PollStatus,
    Sinks, StatusSink,
};
pub use target::{Season, Target};
pub use types::{FailureKind, Priority, RunState, RunSummary, SessionState, TargetId};
