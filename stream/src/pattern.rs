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

//! Incremental byte pattern matching

use bytes::Bytes;
use std::fmt;

/// Incremental matcher for one expected byte sequence
///
/// The pattern itself never changes. The cursor records how far into the
/// reader's buffer the matcher has already looked, so a check against a buffer
/// that has grown only examines the new bytes plus the tail that could still
/// begin a match.
///
/// Cursors and match positions are absolute offsets into the reader's buffer.
#[derive(Clone)]
pub struct PatternMatcher {
    pattern: Bytes,
    cursor: usize,
    match_end: Option<usize>,
}

impl PatternMatcher {
    /// Create a matcher for the given byte sequence
    pub fn new(pattern: impl Into<Bytes>) -> Self {
        Self {
            pattern: pattern.into(),
            cursor: 0,
            match_end: None,
        }
    }

    /// Create a matcher from a borrowed string, copying it
    pub fn text(pattern: &str) -> Self {
        Self::new(Bytes::copy_from_slice(pattern.as_bytes()))
    }

    /// The bytes this matcher looks for
    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    /// Offset of the first byte not yet ruled out as a match start
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Offset just past the match, once matched
    pub fn match_end(&self) -> Option<usize> {
        self.match_end
    }

    /// Whether the pattern has been found since the last reset
    pub fn is_matched(&self) -> bool {
        self.match_end.is_some()
    }

    /// Restart matching at `position`, forgetting any previous match
    pub fn reset(&mut self, position: usize) {
        self.cursor = position;
        self.match_end = None;
    }

    /// Check `data` from the cursor onward
    ///
    /// `data` is the complete buffer, not only the new bytes. Returns `true`
    /// once the pattern has been found.
    pub fn scan(&mut self, data: &[u8]) -> bool {
        if self.match_end.is_some() {
            return true;
        }

        let start = self.cursor.min(data.len());
        let len = self.pattern.len();
        if len == 0 {
            self.match_end = Some(start);
            return true;
        }

        if let Some(pos) = data[start..]
            .windows(len)
            .position(|window| window == &self.pattern[..])
        {
            let end = start + pos + len;
            self.cursor = end;
            self.match_end = Some(end);
            return true;
        }

        // Only the last `len - 1` bytes can still start a match.
        self.cursor = data.len().saturating_sub(len - 1).max(start);
        false
    }
}

impl fmt::Debug for PatternMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternMatcher")
            .field("pattern", &String::from_utf8_lossy(&self.pattern))
            .field("cursor", &self.cursor)
            .field("match_end", &self.match_end)
            .finish()
    }
}

impl From<&'static str> for PatternMatcher {
    fn from(pattern: &'static str) -> Self {
        Self::new(pattern)
    }
}

impl From<String> for PatternMatcher {
    fn from(pattern: String) -> Self {
        Self::new(pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_in_single_buffer() {
        let mut matcher = PatternMatcher::new("login:");
        assert!(matcher.scan(b"abclogin:"));
        assert_eq!(matcher.match_end(), Some(9));
    }

    #[test]
    fn test_match_split_across_growth() {
        let mut buffer = b"abclo".to_vec();
        let mut matcher = PatternMatcher::new("login:");

        assert!(!matcher.scan(&buffer));
        // "lo" may begin the pattern, so the cursor stops before it
        assert_eq!(matcher.cursor(), 0);

        buffer.extend_from_slice(b"gin");
        assert!(!matcher.scan(&buffer));
        assert_eq!(matcher.cursor(), 3);

        buffer.extend_from_slice(b":xyz");
        assert!(matcher.scan(&buffer));
        assert_eq!(matcher.match_end(), Some(9));
    }

    #[test]
    fn test_cursor_skips_dead_bytes() {
        let mut matcher = PatternMatcher::new("OK");
        assert!(!matcher.scan(b"garbage"));
        assert_eq!(matcher.cursor(), 6);
    }

    #[test]
    fn test_reset_forgets_match() {
        let mut matcher = PatternMatcher::new("#>");
        assert!(matcher.scan(b"#> "));
        matcher.reset(3);
        assert!(!matcher.is_matched());
        assert!(!matcher.scan(b"#> "));
        assert!(matcher.scan(b"#> x#>"));
        assert_eq!(matcher.match_end(), Some(6));
    }

    #[test]
    fn test_empty_pattern_matches_at_cursor() {
        let mut matcher = PatternMatcher::new("");
        matcher.reset(2);
        assert!(matcher.scan(b"abcd"));
        assert_eq!(matcher.match_end(), Some(2));
    }
}
