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

//! Pollable stations

use crate::{Priority, TargetId};
use chrono::{Datelike, NaiveDate};
use fieldpoll_channel::CommParams;
use std::fmt;

/// Annual window during which a station is polled
///
/// Bounds are inclusive month/day pairs. A window whose start falls after its
/// end wraps over the new year, so November 1 to March 31 covers winter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Season {
    start: (u32, u32),
    end: (u32, u32),
}

impl Season {
    /// Create a window from `(month, day)` bounds
    pub fn new(start: (u32, u32), end: (u32, u32)) -> Self {
        Self { start, end }
    }

    /// Whether `date` falls inside the window
    pub fn contains(&self, date: NaiveDate) -> bool {
        let day = (date.month(), date.day());
        if self.start <= self.end {
            self.start <= day && day <= self.end
        } else {
            day >= self.start || day <= self.end
        }
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}-{:02}..{:02}-{:02}",
            self.start.0, self.start.1, self.end.0, self.end.1
        )
    }
}

/// A station to poll
///
/// Targets are immutable once handed to a scheduler.
#[derive(Debug, Clone)]
pub struct Target {
    /// Station identifier
    pub id: TargetId,
    /// Display name
    pub name: String,
    /// Logger family tag used to pick the protocol handler
    pub logger: String,
    /// How to reach the station
    pub comm: CommParams,
    /// Polling priority
    pub priority: Priority,
    /// Enable windows; empty means always enabled
    pub seasons: Vec<Season>,
}

impl Target {
    /// Create a target with default priority and no seasonal limits
    pub fn new(
        id: impl AsRef<str>,
        name: impl Into<String>,
        logger: impl Into<String>,
        comm: CommParams,
    ) -> Self {
        Self {
            id: TargetId::new(id),
            name: name.into(),
            logger: logger.into(),
            comm,
            priority: Priority::default(),
            seasons: Vec::new(),
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Add an enable window
    pub fn with_season(mut self, season: Season) -> Self {
        self.seasons.push(season);
        self
    }

    /// Whether the station should be polled on `date`
    pub fn is_in_season(&self, date: NaiveDate) -> bool {
        self.seasons.is_empty() || self.seasons.iter().any(|season| season.contains(date))
    }

    /// Whether `text` identifies this station
    ///
    /// Matches the ID or the name, ignoring case and surrounding whitespace.
    pub fn is_identified_by(&self, text: &str) -> bool {
        let text = text.trim();
        !text.is_empty()
            && (text.eq_ignore_ascii_case(self.id.as_str()) || text.eq_ignore_ascii_case(&self.name))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.name)
    }
}
