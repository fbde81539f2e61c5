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

//! # Fieldpoll Stream Reader
//!
//! This crate provides the byte-level plumbing shared by every polling
//! session: a background reader that drains a live byte stream into a
//! growable buffer, incremental pattern matchers used to wait for expected
//! protocol responses, and an append-only session transcript.
//!
//! ## Core Components
//!
//! ### [`StreamReader`]
//!
//! Owns a background task that reads from any [`tokio::io::AsyncRead`] and
//! appends the bytes to a bounded buffer. Callers block (with a timeout) until
//! one of several [`PatternMatcher`]s matches the unprocessed part of the
//! buffer. A capture mode accumulates the bytes seen while it is enabled, which
//! is how command responses are collected.
//!
//! ### [`PatternMatcher`]
//!
//! An immutable byte pattern with a mutable scan cursor, so repeated checks
//! against a growing buffer never rescan bytes that cannot start a match.
//!
//! ### [`Transcript`]
//!
//! A plain text log of everything sent and received during a session, written
//! by a background task so the read and send paths never block on disk I/O.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use fieldpoll_stream::{PatternMatcher, ReaderConfig, StreamReader};
//! use std::time::Duration;
//! use tokio::net::TcpStream;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let socket = TcpStream::connect("10.0.0.5:4001").await?;
//! let (read_half, _write_half) = socket.into_split();
//! let reader = StreamReader::spawn("station-1", read_half, &ReaderConfig::default(), None);
//!
//! let mut prompts = [PatternMatcher::new("login:"), PatternMatcher::new("ERROR")];
//! match reader.wait_for(Duration::from_secs(5), &mut prompts).await {
//!     Some(0) => println!("login prompt received"),
//!     Some(_) => println!("station reported an error"),
//!     None => println!("no response"),
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod pattern;
mod reader;
mod result;
mod transcript;

pub use config::ReaderConfig;
pub use pattern::PatternMatcher;
pub use reader::{ReaderExit, StreamReader};
pub use result::{StreamError, StreamResult};
pub use transcript::{Direction, Transcript};
