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

//! Stream reader configuration

/// Stream reader configuration
///
/// # Example
///
/// ```
/// use fieldpoll_stream::ReaderConfig;
///
/// let config = ReaderConfig::default()
///     .with_buffer_capacity(64 * 1024)
///     .with_chunk_size(512);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Maximum number of bytes retained for one channel
    ///
    /// Bytes arriving after the buffer is full are dropped and a warning is
    /// logged once per overflow.
    pub buffer_capacity: usize,

    /// Size of a single read from the underlying stream
    pub chunk_size: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024 * 1024, // 1 MiB
            chunk_size: 4096,
        }
    }
}

impl ReaderConfig {
    /// Set the buffer capacity
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Set the read chunk size
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.buffer_capacity == 0 {
            return Err("buffer_capacity must be greater than 0".to_string());
        }
        if self.chunk_size == 0 {
            return Err("chunk_size must be greater than 0".to_string());
        }
        Ok(())
    }
}
