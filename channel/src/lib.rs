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

//! Communication channels for field station polling
//!
//! A [`Channel`] is one path to a station: an outbound TCP socket, a serial
//! line proxied through a terminal server, or a connection a station opened
//! to us. Channels come from a [`ChannelPool`], which bounds how many are in
//! use at once.
//!
//! # Pools
//!
//! - [`DialOutPool`] creates outbound sockets on demand up to a cap
//! - [`TerminalServerPool`] hands out numbered serial ports; each port is
//!   configured through the [`ConfigWorker`] before its first connect and may
//!   dial a modem with the [`ModemDialer`]
//! - [`ListeningPool`] accepts inbound connections into a ready queue
//!
//! # Example
//!
//! ```no_run
//! use fieldpoll_channel::{ChannelPool, CommParams, DialOutConfig, DialOutPool, FinalState};
//!
//! # async fn example() -> fieldpoll_channel::ChannelResult<()> {
//! let pool = DialOutPool::new(DialOutConfig::default().with_capacity(4));
//! let params = CommParams::new("10.0.0.12:4001");
//!
//! if let Some(mut channel) = pool.allocate() {
//!     pool.connect(&mut channel, &params).await?;
//!     if let Some(io) = channel.io_mut() {
//!         io.send_line("ATZ").await?;
//!     }
//!     pool.release(channel, FinalState::Success, false);
//! }
//! # Ok(())
//! # }
//! ```

mod channel;
mod config;
mod configure;
mod dialer;
mod error;
mod pool;
mod types;

pub use channel::{Channel, ChannelIo};
pub use config::{
    ConfigWorkerConfig, DialOutConfig, DialerConfig, ListeningConfig, TerminalServerConfig,
};
pub use configure::{ConfigWorker, ConfigureRequest, parse_serial_settings};
pub use dialer::ModemDialer;
pub use error::{ChannelError, ChannelResult};
pub use pool::{ChannelPool, DialOutPool, ListeningPool, TerminalServerPool};
pub use types::{
    ChannelId, ChannelKind, CommParams, ConfigureHandle, ConfigureState, FinalState, Parity,
    SerialParams,
};

// Re-export the stream types channel users work with directly
pub use fieldpoll_stream::{PatternMatcher, ReaderConfig, StreamReader, Transcript};
