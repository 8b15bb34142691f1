//! Finite, randomly addressable chart buckets over an unbounded history.

use std::ops::Range;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::counter::Entry;
use crate::interval::{Calendar, Interval, WallClock, Zone};
use crate::summary::CounterSummary;

/// Ordered sequence of calendar-aligned buckets covering a counter's history.
///
/// Bucket 0 starts at the truncated least recent entry (or "now" for an empty
/// history) and the last bucket contains the later of "now" and the most
/// recent entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketWindow<Z = Zone> {
    calendar: Calendar<Z>,
    interval: Interval,
    origin: DateTime<Utc>,
    count: usize,
}

impl<Z: WallClock> BucketWindow<Z> {
    /// Builds the window for a history bounded by `least_recent` and `most_recent`.
    ///
    /// Callers should pass a chart-displayable interval (see
    /// [`Interval::chart_interval`]). TIMER cannot be counted and degrades to a
    /// single bucket.
    pub fn new(
        calendar: Calendar<Z>,
        interval: Interval,
        least_recent: Option<DateTime<Utc>>,
        most_recent: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let origin = calendar.truncate(least_recent.unwrap_or(now), interval);
        let count = if interval == Interval::Lifetime {
            1
        } else {
            let last = calendar.truncate(most_recent.map_or(now, |m| m.max(now)), interval);
            match calendar.count_buckets(interval, origin, last) {
                Ok(between) => usize::try_from(between.saturating_add(1))
                    .unwrap_or(0)
                    .max(1),
                Err(err) => {
                    warn!(%err, "falling back to a single chart bucket");
                    1
                }
            }
        };
        Self {
            calendar,
            interval,
            origin,
            count,
        }
    }

    /// Builds the window for a summarized counter.
    pub fn for_summary(
        calendar: Calendar<Z>,
        summary: &CounterSummary,
        interval: Interval,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            calendar,
            interval,
            summary.least_recent,
            summary.most_recent,
            now,
        )
    }

    pub const fn calendar(&self) -> Calendar<Z> {
        self.calendar
    }

    #[must_use]
    pub const fn interval(&self) -> Interval {
        self.interval
    }

    /// Start of bucket 0.
    pub const fn origin(&self) -> DateTime<Utc> {
        self.origin
    }

    /// Number of buckets; always at least one.
    pub const fn bucket_count(&self) -> usize {
        self.count
    }

    /// Half-open time range of the bucket at `position`.
    ///
    /// Both ends are re-truncated: a bucket that started late because its
    /// midnight was skipped must not shift the buckets after it.
    pub fn bucket_range(&self, position: usize) -> Range<DateTime<Utc>> {
        let k = i64::try_from(position).unwrap_or(i64::MAX);
        let start = self.bucket_start(k);
        let end = self.bucket_start(k.saturating_add(1));
        start..end
    }

    fn bucket_start(&self, k: i64) -> DateTime<Utc> {
        let advanced = self.calendar.advance(self.origin, self.interval, k);
        if self.interval == Interval::Lifetime || self.interval == Interval::Timer {
            advanced
        } else {
            self.calendar.truncate(advanced, self.interval)
        }
    }

    /// Index of the bucket containing `date`, clamped to the window.
    pub fn position_for_date(&self, date: DateTime<Utc>) -> usize {
        let truncated = self.calendar.truncate(date, self.interval);
        match self
            .calendar
            .count_buckets(self.interval, self.origin, truncated)
        {
            Ok(between) => usize::try_from(between.max(0))
                .unwrap_or(usize::MAX)
                .min(self.count - 1),
            Err(_) => 0,
        }
    }

    /// Counts entries per bucket. `entries` must be sorted ascending by timestamp.
    pub fn tally(&self, entries: &[Entry]) -> Vec<usize> {
        (0..self.count)
            .map(|position| {
                let range = self.bucket_range(position);
                let lower = entries.partition_point(|e| e.timestamp < range.start);
                let upper = entries.partition_point(|e| e.timestamp < range.end);
                upper - lower
            })
            .collect()
    }
}
