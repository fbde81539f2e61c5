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

//! How far back a session asks a station for data

use chrono::{DateTime, TimeDelta, Utc};

/// Window of data requested from a station
///
/// By default a session requests everything since `now - max_backlog`. If the
/// station was last contacted more recently, the window narrows to
/// `last_contact - fudge`, but never to less than `min_backlog`. An operator
/// override replaces the whole calculation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklogPolicy {
    /// Longest window ever requested
    pub max_backlog: TimeDelta,
    /// Shortest window ever requested
    pub min_backlog: TimeDelta,
    /// Overlap kept before the last contact
    pub fudge: TimeDelta,
    /// Fixed start time that overrides the calculation
    pub override_since: Option<DateTime<Utc>>,
}

impl Default for BacklogPolicy {
    fn default() -> Self {
        Self {
            max_backlog: TimeDelta::hours(48),
            min_backlog: TimeDelta::hours(2),
            fudge: TimeDelta::minutes(30),
            override_since: None,
        }
    }
}

impl BacklogPolicy {
    /// Set the maximum backlog
    pub fn with_max_backlog(mut self, backlog: TimeDelta) -> Self {
        self.max_backlog = backlog;
        self
    }

    /// Set the minimum backlog
    pub fn with_min_backlog(mut self, backlog: TimeDelta) -> Self {
        self.min_backlog = backlog;
        self
    }

    /// Set the fudge
    pub fn with_fudge(mut self, fudge: TimeDelta) -> Self {
        self.fudge = fudge;
        self
    }

    /// Set the operator override
    pub fn with_override_since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.override_since = since;
        self
    }

    /// Start of the window to request at `now`
    pub fn since(&self, now: DateTime<Utc>, last_contact: Option<DateTime<Utc>>) -> DateTime<Utc> {
        if let Some(since) = self.override_since {
            return since;
        }

        let mut since = earlier(now, self.max_backlog);
        if let Some(last_contact) = last_contact {
            let resume = earlier(last_contact, self.fudge);
            if resume > since {
                since = resume;
            }
        }
        let floor = earlier(now, self.min_backlog);
        if since > floor {
            since = floor;
        }
        since
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<(), String> {
        if self.min_backlog < TimeDelta::zero() || self.fudge < TimeDelta::zero() {
            return Err("backlog durations must not be negative".to_string());
        }
        if self.min_backlog > self.max_backlog {
            return Err("min_backlog must not exceed max_backlog".to_string());
        }
        if self.max_backlog > longest_window() || self.fudge > longest_window() {
            return Err(format!(
                "backlog durations must not exceed {} days",
                longest_window().num_days()
            ));
        }
        Ok(())
    }
}

/// Longest backlog or fudge a policy accepts
fn longest_window() -> TimeDelta {
    TimeDelta::days(36_500)
}

/// `at - delta`, saturating at the earliest representable time
fn earlier(at: DateTime<Utc>, delta: TimeDelta) -> DateTime<Utc> {
    at.checked_sub_signed(delta).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_never_contacted_uses_max() {
        let policy = BacklogPolicy::default();
        assert_eq!(policy.since(now(), None), now() - TimeDelta::hours(48));
    }

    #[test]
    fn test_recent_contact_narrows_window() {
        let policy = BacklogPolicy::default();
        let last = now() - TimeDelta::hours(6);
        assert_eq!(
            policy.since(now(), Some(last)),
            last - TimeDelta::minutes(30)
        );
    }

    #[test]
    fn test_old_contact_is_ignored() {
        let policy = BacklogPolicy::default();
        let last = now() - TimeDelta::days(10);
        assert_eq!(policy.since(now(), Some(last)), now() - TimeDelta::hours(48));
    }

    #[test]
    fn test_very_recent_contact_keeps_minimum() {
        let policy = BacklogPolicy::default();
        let last = now() - TimeDelta::minutes(10);
        assert_eq!(policy.since(now(), Some(last)), now() - TimeDelta::hours(2));
    }

    #[test]
    fn test_override_wins() {
        let fixed = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let policy = BacklogPolicy::default().with_override_since(Some(fixed));
        assert_eq!(policy.since(now(), Some(now())), fixed);
    }

    #[test]
    fn test_validation() {
        assert!(BacklogPolicy::default().validate().is_ok());
        assert!(
            BacklogPolicy::default()
                .with_min_backlog(TimeDelta::days(5))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_huge_backlog_is_rejected_and_saturates() {
        let policy = BacklogPolicy::default().with_max_backlog(TimeDelta::MAX);
        assert!(policy.validate().is_err());
        assert_eq!(policy.since(now(), None), DateTime::<Utc>::MIN_UTC);
        assert!(
            BacklogPolicy::default()
                .with_max_backlog(TimeDelta::days(365))
                .validate()
                .is_ok()
        );
    }

    proptest! {
        #[test]
        fn prop_window_stays_within_bounds(minutes_ago in proptest::option::of(0i64..100_000)) {
            let policy = BacklogPolicy::default();
            let last = minutes_ago.map(|m| now() - TimeDelta::minutes(m));
            let since = policy.since(now(), last);
            prop_assert!(since >= now() - policy.max_backlog);
            prop_assert!(since <= now() - policy.min_backlog);
        }
    }
}
