//! Argument parsing shared by the subcommands.

use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use tally_core::CounterName;

static RELATIVE_TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\s*(second|minute|hour|day|week)s?\s+ago$")
        .expect("relative time pattern is valid")
});

/// Roughly a thousand years.
const MAX_RELATIVE_SECONDS: i64 = 1000 * 365 * 24 * 60 * 60;

/// Parses a counter name given on the command line.
pub fn counter_name(raw: &str) -> Result<CounterName> {
    CounterName::new(raw).with_context(|| format!("invalid counter name {raw:?}"))
}

/// Parses a point in time relative to `now`.
///
/// Accepts `now`, RFC 3339 (`2026-01-15T10:30:00Z`) or `N <unit>s ago` where unit
/// is second, minute, hour, day or week.
pub fn parse_time(s: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("now") {
        return Ok(now);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    let Some(caps) = RELATIVE_TIME_RE.captures(s) else {
        bail!("invalid time {s:?}: use RFC 3339 (2026-01-15T10:30:00Z) or e.g. \"2 hours ago\"");
    };
    let n: i64 = caps[1]
        .parse()
        .context("failed to parse number in relative time")?;
    let seconds_per_unit = match &caps[2] {
        "second" => 1,
        "minute" => 60,
        "hour" => 60 * 60,
        "day" => 24 * 60 * 60,
        "week" => 7 * 24 * 60 * 60,
        unit => bail!("unknown time unit: {unit}"),
    };
    if n > MAX_RELATIVE_SECONDS / seconds_per_unit {
        bail!("relative time too large: {s}");
    }
    Ok(now - Duration::seconds(n * seconds_per_unit))
}
