//! Bucket granularities and the calendar arithmetic behind them.
//!
//! All points in time are `DateTime<Utc>`. Truncation and advancing happen on
//! the wall clock of the calendar's zone (see [`WallClock`]), so a DAY bucket
//! is a local calendar day even when it is 23 or 25 hours long. HOUR buckets
//! follow elapsed time, so a repeated fall-back hour is two buckets.

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Local, LocalResult, Months, NaiveDateTime,
    NaiveTime, TimeZone, Timelike, Utc, Weekday,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How far TIMER and LIFETIME jump per bucket. Far enough to cover any real history.
const LIFETIME_YEARS: i64 = 1000;
const MONTHS_PER_LIFETIME: i64 = LIFETIME_YEARS * 12;

/// Bucket granularity of a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Interval {
    Hour,
    #[default]
    Day,
    Week,
    Month,
    Year,
    /// Start/stop toggle mode: entries alternate between start and stop.
    Timer,
    /// A single bucket spanning the whole history.
    Lifetime,
}

impl Interval {
    pub const ALL: [Self; 7] = [
        Self::Hour,
        Self::Day,
        Self::Week,
        Self::Month,
        Self::Year,
        Self::Timer,
        Self::Lifetime,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Year => "year",
            Self::Timer => "timer",
            Self::Lifetime => "lifetime",
        }
    }

    /// The interval to use when charting a counter with this interval.
    ///
    /// TIMER charts day by day and LIFETIME charts year by year.
    #[must_use]
    pub const fn chart_interval(self) -> Self {
        match self {
            Self::Timer => Self::Day,
            Self::Lifetime => Self::Year,
            other => other,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = UnknownInterval;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "year" | "ytd" => Ok(Self::Year),
            "timer" | "mytimer" => Ok(Self::Timer),
            "lifetime" => Ok(Self::Lifetime),
            _ => Err(UnknownInterval(s.to_string())),
        }
    }
}

impl Serialize for Interval {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error type for unknown interval strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown interval: {0}")]
pub struct UnknownInterval(String);

/// Calendar arithmetic failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CalendarError {
    /// The interval has no countable unit.
    #[error("{0} has no countable bucket unit")]
    UnsupportedGranularity(Interval),
}

/// Offset rules of a time zone, as far as bucket arithmetic needs them.
pub trait WallClock: Copy {
    /// Local wall-clock time of `point`.
    fn wall_clock(&self, point: DateTime<Utc>) -> NaiveDateTime;

    /// Instants displayed as `wall`: two inside a fall-back overlap, none inside
    /// a spring-forward gap.
    fn instants(&self, wall: NaiveDateTime) -> LocalResult<DateTime<Utc>>;

    /// Maps a wall-clock time back to an instant.
    ///
    /// Ambiguous times resolve to the earlier instant. Skipped times move
    /// forward to the first instant after the gap.
    fn resolve(&self, wall: NaiveDateTime) -> DateTime<Utc> {
        match self.instants(wall) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt,
            LocalResult::None => {
                // DST gaps are at most an hour.
                let shifted = wall
                    .checked_add_signed(Duration::hours(1))
                    .unwrap_or(wall);
                self.instants(shifted)
                    .earliest()
                    .unwrap_or_else(|| wall.and_utc())
            }
        }
    }
}

/// Time zone whose wall clock defines bucket boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Local,
    Utc,
    Fixed(FixedOffset),
}

impl WallClock for Zone {
    fn wall_clock(&self, point: DateTime<Utc>) -> NaiveDateTime {
        match *self {
            Self::Local => point.with_timezone(&Local).naive_local(),
            Self::Utc => point.naive_utc(),
            Self::Fixed(offset) => point.with_timezone(&offset).naive_local(),
        }
    }

    fn instants(&self, wall: NaiveDateTime) -> LocalResult<DateTime<Utc>> {
        match *self {
            Self::Local => instants_in(&Local, wall),
            Self::Utc => LocalResult::Single(wall.and_utc()),
            Self::Fixed(offset) => instants_in(&offset, wall),
        }
    }
}

fn instants_in<Tz: TimeZone>(tz: &Tz, wall: NaiveDateTime) -> LocalResult<DateTime<Utc>> {
    tz.from_local_datetime(&wall)
        .map(|dt| dt.with_timezone(&Utc))
}

/// Calendar-aligned bucket arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calendar<Z = Zone> {
    zone: Z,
    week_start: Weekday,
}

impl Default for Calendar {
    fn default() -> Self {
        Self::new(Zone::Local, Weekday::Mon)
    }
}

impl Calendar {
    /// A UTC calendar with weeks starting on Monday.
    #[must_use]
    pub const fn utc() -> Self {
        Self::new(Zone::Utc, Weekday::Mon)
    }
}

impl<Z: WallClock> Calendar<Z> {
    #[must_use]
    pub const fn new(zone: Z, week_start: Weekday) -> Self {
        Self { zone, week_start }
    }

    #[must_use]
    pub const fn zone(&self) -> Z {
        self.zone
    }

    #[must_use]
    pub const fn week_start(&self) -> Weekday {
        self.week_start
    }

    /// Local wall-clock time of `point` in this calendar's zone.
    #[must_use]
    pub fn wall_clock(&self, point: DateTime<Utc>) -> NaiveDateTime {
        self.zone.wall_clock(point)
    }

    /// Rounds `point` down to the start of the bucket containing it.
    ///
    /// TIMER and LIFETIME only truncate to the day.
    pub fn truncate(&self, point: DateTime<Utc>, interval: Interval) -> DateTime<Utc> {
        let wall = self.zone.wall_clock(point);
        let date = wall.date();
        let midnight = |d: chrono::NaiveDate| d.and_time(NaiveTime::MIN);
        let truncated = match interval {
            // Stays on the instant's own offset, so both hours of a fall-back overlap keep
            // their own bucket.
            Interval::Hour => {
                let into_hour = Duration::minutes(i64::from(wall.minute()))
                    + Duration::seconds(i64::from(wall.second()))
                    + Duration::nanoseconds(i64::from(wall.nanosecond()));
                return point.checked_sub_signed(into_hour).unwrap_or(point);
            }
            Interval::Day | Interval::Timer | Interval::Lifetime => midnight(date),
            Interval::Week => {
                let back = (7 + date.weekday().num_days_from_monday()
                    - self.week_start.num_days_from_monday())
                    % 7;
                midnight(date - Duration::days(i64::from(back)))
            }
            Interval::Month => midnight(date.with_day(1).unwrap_or(date)),
            Interval::Year => midnight(date.with_ordinal(1).unwrap_or(date)),
        };
        self.zone.resolve(truncated)
    }

    /// Moves `point` forward by `n` whole buckets (backward when `n` is negative).
    ///
    /// Saturates at the representable range instead of failing.
    pub fn advance(&self, point: DateTime<Utc>, interval: Interval, n: i64) -> DateTime<Utc> {
        let saturated = || {
            if n >= 0 {
                DateTime::<Utc>::MAX_UTC
            } else {
                DateTime::<Utc>::MIN_UTC
            }
        };
        let shifted = match interval {
            Interval::Hour => Duration::try_hours(n).and_then(|d| point.checked_add_signed(d)),
            Interval::Day => self.shift_days(point, n),
            Interval::Week => n.checked_mul(7).and_then(|days| self.shift_days(point, days)),
            Interval::Month => self.shift_months(point, n),
            Interval::Year => n.checked_mul(12).and_then(|m| self.shift_months(point, m)),
            Interval::Timer | Interval::Lifetime => n
                .checked_mul(MONTHS_PER_LIFETIME)
                .and_then(|m| self.shift_months(point, m)),
        };
        shifted.unwrap_or_else(saturated)
    }

    /// Counts bucket boundaries crossed from `start` to `end` (negative when
    /// `end` is earlier).
    ///
    /// Both points are truncated first, so the result is the difference of
    /// their bucket positions. Fails for TIMER, which has no countable unit.
    pub fn count_buckets(
        &self,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, CalendarError> {
        if interval == Interval::Timer {
            return Err(CalendarError::UnsupportedGranularity(interval));
        }
        let start = self.truncate(start, interval);
        let end = self.truncate(end, interval);
        let from = self.zone.wall_clock(start);
        let to = self.zone.wall_clock(end);
        let days = (to.date() - from.date()).num_days();
        let months = month_index(to) - month_index(from);
        Ok(match interval {
            Interval::Hour => (end - start).num_hours(),
            Interval::Day => days,
            Interval::Week => days / 7,
            Interval::Month => months,
            Interval::Year => i64::from(to.year() - from.year()),
            Interval::Timer | Interval::Lifetime => months / MONTHS_PER_LIFETIME,
        })
    }

    fn shift_days(&self, point: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
        let wall = self.zone.wall_clock(point);
        let shifted = wall.checked_add_signed(Duration::try_days(days)?)?;
        Some(self.zone.resolve(shifted))
    }

    fn shift_months(&self, point: DateTime<Utc>, months: i64) -> Option<DateTime<Utc>> {
        let wall = self.zone.wall_clock(point);
        let magnitude = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
        let shifted = if months >= 0 {
            wall.checked_add_months(magnitude)?
        } else {
            wall.checked_sub_months(magnitude)?
        };
        Some(self.zone.resolve(shifted))
    }
}

/// Months since year zero.
fn month_index(wall: NaiveDateTime) -> i64 {
    i64::from(wall.year()) * 12 + i64::from(wall.month0())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    /// A zone with a single offset change at `switch`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct SwitchingZone {
        switch: DateTime<Utc>,
        before: FixedOffset,
        after: FixedOffset,
    }

    impl SwitchingZone {
        fn new(switch: &str, before_hours: i32, after_hours: i32) -> Self {
            Self {
                switch: at(switch),
                before: FixedOffset::east_opt(before_hours * 3600).unwrap(),
                after: FixedOffset::east_opt(after_hours * 3600).unwrap(),
            }
        }

        /// New York falling back from UTC-4 to UTC-5 at 02:00 local on 2024-11-03.
        pub(crate) fn fall_back() -> Self {
            Self::new("2024-11-03T06:00:00Z", -4, -5)
        }

        /// Santiago springing forward from UTC-4 to UTC-3 at midnight on 2024-09-08.
        pub(crate) fn midnight_gap() -> Self {
            Self::new("2024-09-08T04:00:00Z", -4, -3)
        }
    }

    impl WallClock for SwitchingZone {
        fn wall_clock(&self, point: DateTime<Utc>) -> NaiveDateTime {
            let offset = if point < self.switch {
                self.before
            } else {
                self.after
            };
            point.with_timezone(&offset).naive_local()
        }

        fn instants(&self, wall: NaiveDateTime) -> LocalResult<DateTime<Utc>> {
            let on = |offset: FixedOffset| {
                offset
                    .from_local_datetime(&wall)
                    .single()
                    .map(|dt| dt.with_timezone(&Utc))
            };
            let before = on(self.before).filter(|dt| *dt < self.switch);
            let after = on(self.after).filter(|dt| *dt >= self.switch);
            match (before, after) {
                (Some(early), Some(late)) => LocalResult::Ambiguous(early, late),
                (Some(only), None) | (None, Some(only)) => LocalResult::Single(only),
                (None, None) => LocalResult::None,
            }
        }
    }

    #[test]
    fn truncate_each_interval() {
        let cal = Calendar::utc();
        // Thursday
        let t = at("2024-02-15T13:47:12.345Z");
        assert_eq!(cal.truncate(t, Interval::Hour), at("2024-02-15T13:00:00Z"));
        assert_eq!(cal.truncate(t, Interval::Day), at("2024-02-15T00:00:00Z"));
        assert_eq!(cal.truncate(t, Interval::Week), at("2024-02-12T00:00:00Z"));
        assert_eq!(cal.truncate(t, Interval::Month), at("2024-02-01T00:00:00Z"));
        assert_eq!(cal.truncate(t, Interval::Year), at("2024-01-01T00:00:00Z"));
        assert_eq!(cal.truncate(t, Interval::Timer), at("2024-02-15T00:00:00Z"));
        assert_eq!(cal.truncate(t, Interval::Lifetime), at("2024-02-15T00:00:00Z"));
    }

    #[test]
    fn truncate_week_honors_configured_first_day() {
        let sunday_first = Calendar::new(Zone::Utc, Weekday::Sun);
        let thursday = at("2024-02-15T09:00:00Z");
        assert_eq!(
            sunday_first.truncate(thursday, Interval::Week),
            at("2024-02-11T00:00:00Z")
        );
        // A point on the first day itself stays on that day.
        let sunday = at("2024-02-11T23:59:59Z");
        assert_eq!(
            sunday_first.truncate(sunday, Interval::Week),
            at("2024-02-11T00:00:00Z")
        );
    }

    #[test]
    fn truncate_uses_zone_wall_clock() {
        let plus_two = Calendar::new(
            Zone::Fixed(FixedOffset::east_opt(2 * 3600).unwrap()),
            Weekday::Mon,
        );
        // 23:30 UTC on the 14th is 01:30 on the 15th at UTC+2.
        let t = at("2024-02-14T23:30:00Z");
        assert_eq!(plus_two.truncate(t, Interval::Day), at("2024-02-14T22:00:00Z"));
    }

    #[test]
    fn truncate_is_idempotent() {
        let cal = Calendar::new(Zone::Utc, Weekday::Wed);
        let points = [
            at("2024-02-29T23:59:59Z"),
            at("2023-12-31T00:00:00Z"),
            at("2025-07-04T12:34:56Z"),
        ];
        for interval in Interval::ALL {
            if interval == Interval::Timer {
                continue;
            }
            for point in points {
                let once = cal.truncate(point, interval);
                assert_eq!(cal.truncate(once, interval), once, "{interval} at {point}");
            }
        }
    }

    #[test]
    fn advance_each_interval() {
        let cal = Calendar::utc();
        let t = at("2024-01-31T10:00:00Z");
        assert_eq!(cal.advance(t, Interval::Hour, 3), at("2024-01-31T13:00:00Z"));
        assert_eq!(cal.advance(t, Interval::Day, 1), at("2024-02-01T10:00:00Z"));
        assert_eq!(cal.advance(t, Interval::Week, 2), at("2024-02-14T10:00:00Z"));
        // Clamped to the end of February.
        assert_eq!(cal.advance(t, Interval::Month, 1), at("2024-02-29T10:00:00Z"));
        assert_eq!(cal.advance(t, Interval::Year, -1), at("2023-01-31T10:00:00Z"));
        assert_eq!(cal.advance(t, Interval::Lifetime, 1), at("3024-01-31T10:00:00Z"));
        assert_eq!(cal.advance(t, Interval::Timer, 1), at("3024-01-31T10:00:00Z"));
    }

    #[test]
    fn advance_saturates() {
        let cal = Calendar::utc();
        let t = at("2024-01-01T00:00:00Z");
        assert_eq!(
            cal.advance(t, Interval::Lifetime, i64::MAX),
            DateTime::<Utc>::MAX_UTC
        );
        assert_eq!(
            cal.advance(t, Interval::Hour, i64::MIN),
            DateTime::<Utc>::MIN_UTC
        );
    }

    #[test]
    fn count_buckets_between_truncated_points() {
        let cal = Calendar::utc();
        let start = at("2024-01-01T00:00:00Z");
        assert_eq!(
            cal.count_buckets(Interval::Day, start, at("2024-01-10T00:00:00Z")),
            Ok(9)
        );
        assert_eq!(
            cal.count_buckets(Interval::Hour, start, at("2024-01-02T00:00:00Z")),
            Ok(24)
        );
        assert_eq!(
            cal.count_buckets(Interval::Week, start, at("2024-01-29T00:00:00Z")),
            Ok(4)
        );
        assert_eq!(
            cal.count_buckets(Interval::Month, start, at("2025-03-01T00:00:00Z")),
            Ok(14)
        );
        assert_eq!(
            cal.count_buckets(Interval::Year, start, at("2030-01-01T00:00:00Z")),
            Ok(6)
        );
        assert_eq!(
            cal.count_buckets(Interval::Lifetime, start, at("2030-01-01T00:00:00Z")),
            Ok(0)
        );
    }

    #[test]
    fn count_buckets_counts_calendar_boundaries() {
        let cal = Calendar::utc();
        let start = at("2024-01-31T18:00:00Z");
        assert_eq!(
            cal.count_buckets(Interval::Month, start, at("2024-02-01T06:00:00Z")),
            Ok(1)
        );
        assert_eq!(
            cal.count_buckets(Interval::Month, start, at("2024-03-31T00:00:00Z")),
            Ok(2)
        );
        assert_eq!(
            cal.count_buckets(Interval::Month, at("2024-03-31T00:00:00Z"), start),
            Ok(-2)
        );
        assert_eq!(
            cal.count_buckets(Interval::Day, start, at("2024-02-01T06:00:00Z")),
            Ok(1)
        );
        assert_eq!(
            cal.count_buckets(
                Interval::Year,
                at("2024-12-31T23:00:00Z"),
                at("2025-01-01T01:00:00Z")
            ),
            Ok(1)
        );
    }

    #[test]
    fn count_buckets_rejects_timer() {
        let cal = Calendar::utc();
        let t = at("2024-01-01T00:00:00Z");
        assert_eq!(
            cal.count_buckets(Interval::Timer, t, t),
            Err(CalendarError::UnsupportedGranularity(Interval::Timer))
        );
    }

    #[test]
    fn advance_then_count_round_trips() {
        let cal = Calendar::new(Zone::Utc, Weekday::Sun);
        let origin = cal.truncate(at("2023-11-17T08:15:00Z"), Interval::Week);
        for interval in [
            Interval::Hour,
            Interval::Day,
            Interval::Week,
            Interval::Month,
            Interval::Year,
        ] {
            let origin = cal.truncate(origin, interval);
            for k in [0, 1, 5, 40] {
                let start = cal.advance(origin, interval, k);
                let back = cal.count_buckets(interval, origin, cal.truncate(start, interval));
                assert_eq!(back, Ok(k), "{interval} k={k}");
            }
        }
    }

    #[test]
    fn fall_back_hours_are_separate_buckets() {
        let cal = Calendar::new(SwitchingZone::fall_back(), Weekday::Mon);
        // 01:30 EDT and 01:30 EST.
        let first = at("2024-11-03T05:30:00Z");
        let second = at("2024-11-03T06:30:00Z");
        assert_eq!(cal.truncate(first, Interval::Hour), at("2024-11-03T05:00:00Z"));
        assert_eq!(cal.truncate(second, Interval::Hour), at("2024-11-03T06:00:00Z"));
        assert_eq!(cal.count_buckets(Interval::Hour, first, second), Ok(1));
    }

    #[test]
    fn fall_back_day_is_one_bucket() {
        let cal = Calendar::new(SwitchingZone::fall_back(), Weekday::Mon);
        let day = cal.truncate(at("2024-11-03T12:00:00Z"), Interval::Day);
        assert_eq!(day, at("2024-11-03T04:00:00Z"));
        let next = cal.advance(day, Interval::Day, 1);
        assert_eq!(next, at("2024-11-04T05:00:00Z"));
        assert_eq!((next - day).num_hours(), 25);
        // 23:30 EST is still the 3rd.
        assert_eq!(
            cal.count_buckets(Interval::Day, day, at("2024-11-04T04:30:00Z")),
            Ok(0)
        );
        assert_eq!(cal.count_buckets(Interval::Day, day, next), Ok(1));
    }

    #[test]
    fn skipped_midnight_starts_day_after_the_gap() {
        let cal = Calendar::new(SwitchingZone::midnight_gap(), Weekday::Mon);
        // 12:00 local on the 8th; local midnight does not exist that day.
        let day = cal.truncate(at("2024-09-08T15:00:00Z"), Interval::Day);
        assert_eq!(day, at("2024-09-08T04:00:00Z"));
        assert_eq!(cal.wall_clock(day).hour(), 1);
        let next = cal.truncate(at("2024-09-09T15:00:00Z"), Interval::Day);
        assert_eq!(next, at("2024-09-09T03:00:00Z"));
        assert_eq!(cal.count_buckets(Interval::Day, day, next), Ok(1));
        assert_eq!(
            cal.count_buckets(Interval::Day, at("2024-09-07T12:00:00Z"), day),
            Ok(1)
        );
        assert_eq!(
            cal.count_buckets(Interval::Week, at("2024-09-02T12:00:00Z"), next),
            Ok(1)
        );
    }

    #[test]
    fn interval_parses_legacy_names() {
        assert_eq!("YTD".parse::<Interval>().unwrap(), Interval::Year);
        assert_eq!("MYTIMER".parse::<Interval>().unwrap(), Interval::Timer);
        assert_eq!("Week".parse::<Interval>().unwrap(), Interval::Week);
        let err = "fortnight".parse::<Interval>().unwrap_err();
        assert_eq!(err.to_string(), "unknown interval: fortnight");
    }

    #[test]
    fn chart_interval_projection() {
        assert_eq!(Interval::Timer.chart_interval(), Interval::Day);
        assert_eq!(Interval::Lifetime.chart_interval(), Interval::Year);
        assert_eq!(Interval::Month.chart_interval(), Interval::Month);
    }

    #[test]
    fn interval_serde_roundtrip() {
        for interval in Interval::ALL {
            let json = serde_json::to_string(&interval).unwrap();
            let parsed: Interval = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, interval);
        }
    }
}
