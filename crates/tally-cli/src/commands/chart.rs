//! Bar chart of a counter's history.

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tally_core::Interval;
use tally_store::{ChartData, StateStore};

use super::util;

/// Renders a proportional bar of ten blocks.
///
/// Any non-zero value gets at least one block so small buckets stay visible.
pub fn progress_bar(value: usize, max: usize) -> String {
    let filled = if max == 0 || value == 0 {
        0
    } else if value.saturating_mul(20) < max {
        1
    } else {
        (value.saturating_mul(20).saturating_add(max) / (2 * max)).min(10)
    };
    format!("{}{}", "█".repeat(filled), "░".repeat(10 - filled))
}

const fn label_format(interval: Interval) -> &'static str {
    match interval {
        Interval::Hour => "%Y-%m-%d %H:00",
        Interval::Month => "%Y-%m",
        Interval::Year => "%Y",
        Interval::Day | Interval::Week | Interval::Timer | Interval::Lifetime => "%Y-%m-%d",
    }
}

/// Writes the `last` most recent buckets, oldest first, one per line.
pub fn write_chart<W: Write>(writer: &mut W, chart: &ChartData, last: usize) -> Result<()> {
    let window = &chart.window;
    let calendar = window.calendar();
    let format = label_format(window.interval());
    let skip = chart.counts.len().saturating_sub(last);
    let shown = &chart.counts[skip..];
    let max = shown.iter().copied().max().unwrap_or(0);

    for (offset, count) in shown.iter().enumerate() {
        let start = window.bucket_range(skip + offset).start;
        let label = calendar.wall_clock(start).format(format);
        writeln!(writer, "{label}  {}  {count}", progress_bar(*count, max))?;
    }
    Ok(())
}

/// Runs the chart command.
pub async fn run<W: Write>(
    store: &StateStore,
    writer: &mut W,
    name: &str,
    interval: Option<Interval>,
    last: usize,
    now: DateTime<Utc>,
) -> Result<()> {
    let name = util::counter_name(name)?;
    let chart = store.chart(&name, interval, now).await?;
    write_chart(writer, &chart, last)
}
