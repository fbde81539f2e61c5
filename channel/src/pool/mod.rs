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

//! Channel pools

mod dialout;
mod listening;
mod terminal;

pub use dialout::DialOutPool;
pub use listening::ListeningPool;
pub use terminal::TerminalServerPool;

use crate::{Channel, ChannelResult, CommParams, FinalState};
use async_trait::async_trait;

/// A bounded supply of channels
///
/// Implementations guard their own accounting; every method may be called
/// concurrently from the scheduler and from session tasks.
#[async_trait]
pub trait ChannelPool: Send + Sync {
    /// Take a free channel without waiting
    ///
    /// Returns `None` when the pool is exhausted or closed.
    fn allocate(&self) -> Option<Channel>;

    /// Connect an allocated channel to the station described by `params`
    async fn connect(&self, channel: &mut Channel, params: &CommParams) -> ChannelResult<()>;

    /// Give a channel back, closing whatever it has bound
    ///
    /// `was_connect_error` tells the pool the session never got past
    /// [`ChannelPool::connect`].
    fn release(&self, channel: Channel, state: FinalState, was_connect_error: bool);

    /// Maximum number of channels in use at once
    fn capacity(&self) -> usize;

    /// Number of channels that could be allocated right now
    fn free_count(&self) -> usize;

    /// Stop handing out channels and release pool-wide resources
    async fn close(&self);
}
