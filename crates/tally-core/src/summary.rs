//! Cached aggregate view of a counter.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::counter::{CounterMetadata, Entry};
use crate::interval::{Calendar, Interval};
use crate::types::{CounterColor, CounterKind, CounterName};

/// Shown instead of numbers once the goal for the current interval is met.
pub const GOAL_MET_GLYPH: &str = "\u{1F44D}";

/// Shown for a TIMER counter that is stopped.
pub const TIMER_STOPPED_GLYPH: &str = "\u{25B6}";

/// Derived state of a counter. Always recomputed from metadata and entries, never persisted.
///
/// Invariants: `total_count >= last_interval_count`, and `least_recent`/`most_recent`
/// are `None` exactly when `total_count == 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSummary {
    pub name: CounterName,
    pub interval: Interval,
    pub goal: u32,
    pub color: CounterColor,
    pub category: String,
    pub kind: CounterKind,
    /// Entries in the bucket containing "now".
    pub last_interval_count: usize,
    pub total_count: usize,
    pub least_recent: Option<DateTime<Utc>>,
    pub most_recent: Option<DateTime<Utc>>,
}

impl CounterSummary {
    /// Computes the summary of a counter.
    ///
    /// `entries` must be sorted ascending by timestamp; it is not re-sorted here.
    pub fn compute(
        metadata: &CounterMetadata,
        entries: &[Entry],
        calendar: &Calendar,
        now: DateTime<Utc>,
    ) -> Self {
        let total_count = entries.len();
        let last_interval_count = match metadata.interval {
            Interval::Lifetime | Interval::Timer => total_count,
            interval => {
                let start = calendar.truncate(now, interval);
                let lower = entries.partition_point(|e| e.timestamp < start);
                let upper = entries.partition_point(|e| e.timestamp <= now);
                upper.saturating_sub(lower)
            }
        };

        Self {
            last_interval_count,
            total_count,
            least_recent: entries.first().map(|e| e.timestamp),
            most_recent: entries.last().map(|e| e.timestamp),
            ..Self::empty(metadata)
        }
    }

    /// Summary of a counter without any entries.
    pub fn empty(metadata: &CounterMetadata) -> Self {
        Self {
            name: metadata.name.clone(),
            interval: metadata.interval,
            goal: metadata.goal,
            color: metadata.color,
            category: metadata.category.clone(),
            kind: metadata.kind,
            last_interval_count: 0,
            total_count: 0,
            least_recent: None,
            most_recent: None,
        }
    }

    pub fn is_goal_met(&self) -> bool {
        self.goal > 0 && self.last_interval_count >= self.goal as usize
    }

    /// Whether a TIMER counter is currently running (odd number of toggles).
    pub const fn is_running(&self) -> bool {
        matches!(self.interval, Interval::Timer) && self.total_count % 2 == 1
    }

    /// The later of `now` and the most recent entry.
    pub fn latest_between_now_and_most_recent(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.most_recent.map_or(now, |last| last.max(now))
    }

    /// The value shown next to the counter name.
    pub fn display_value(&self, now: DateTime<Utc>) -> String {
        if self.interval == Interval::Timer {
            return match self.most_recent {
                Some(started) if self.is_running() => format_elapsed(now - started),
                _ => TIMER_STOPPED_GLYPH.to_string(),
            };
        }
        if self.goal == 0 {
            self.last_interval_count.to_string()
        } else if self.is_goal_met() {
            GOAL_MET_GLYPH.to_string()
        } else {
            format!("{}/{}", self.last_interval_count, self.goal)
        }
    }
}

/// Formats a running timer.
///
/// `H.MM` past an hour, `M.SS` past ten minutes, `M:SS` below that.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if secs >= 3600 {
        format!("{hours}.{minutes:02}")
    } else if secs >= 600 {
        format!("{minutes}.{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}
