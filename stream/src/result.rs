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

//! Error types and result aliases for stream operations

/// Result type for stream operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors raised by the stream reader and transcript writer
///
/// Pattern timeouts are not errors: an expected response that never
/// arrives is reported as `false`/`None` by the wait calls, not as an error.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// An I/O error occurred while writing a transcript
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The transcript writer task has stopped
    #[error("Transcript writer closed")]
    TranscriptClosed,
}
