//! Detailed view of one counter.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tally_core::{Calendar, CounterMetadata, CounterSummary};
use tally_store::StateStore;

use super::util;

#[derive(Debug, Serialize)]
struct JsonDetail<'a> {
    #[serde(flatten)]
    summary: &'a CounterSummary,
    value: String,
    step: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    formula: Option<&'a str>,
}

fn field<W: Write>(writer: &mut W, label: &str, value: impl std::fmt::Display) -> Result<()> {
    writeln!(writer, "{:<10}{value}", format!("{label}:"))?;
    Ok(())
}

pub fn write_show<W: Write>(
    writer: &mut W,
    metadata: &CounterMetadata,
    summary: &CounterSummary,
    calendar: Calendar,
    now: DateTime<Utc>,
) -> Result<()> {
    let timestamp = |point: Option<DateTime<Utc>>| {
        point.map_or_else(
            || "never".to_string(),
            |p| calendar.wall_clock(p).format("%Y-%m-%d %H:%M:%S").to_string(),
        )
    };

    field(writer, "Counter", &summary.name)?;
    field(writer, "Value", summary.display_value(now))?;
    field(writer, "Interval", summary.interval)?;
    if summary.goal == 0 {
        field(writer, "Goal", "none")?;
    } else {
        field(writer, "Goal", summary.goal)?;
    }
    field(writer, "Category", &summary.category)?;
    field(writer, "Kind", summary.kind)?;
    if let Some(formula) = &metadata.formula {
        field(writer, "Formula", formula)?;
    }
    field(writer, "Color", summary.color)?;
    field(writer, "Step", metadata.step)?;
    field(writer, "Total", summary.total_count)?;
    field(writer, "First", timestamp(summary.least_recent))?;
    field(writer, "Last", timestamp(summary.most_recent))?;
    Ok(())
}

pub fn write_show_json<W: Write>(
    writer: &mut W,
    metadata: &CounterMetadata,
    summary: &CounterSummary,
    now: DateTime<Utc>,
) -> Result<()> {
    let detail = JsonDetail {
        summary,
        value: summary.display_value(now),
        step: metadata.step,
        formula: metadata.formula.as_deref(),
    };
    writeln!(writer, "{}", serde_json::to_string_pretty(&detail)?)?;
    Ok(())
}

/// Runs the show command.
pub async fn run<W: Write>(
    store: &StateStore,
    writer: &mut W,
    name: &str,
    json: bool,
    calendar: Calendar,
    now: DateTime<Utc>,
) -> Result<()> {
    let name = util::counter_name(name)?;
    let metadata = store.metadata(&name).await?;
    let summary = store
        .summary(&name)?
        .with_context(|| format!("{name} has not been summarized yet"))?;
    if json {
        write_show_json(writer, &metadata, &summary, now)
    } else {
        write_show(writer, &metadata, &summary, calendar, now)
    }
}
