//! Counter overview in display order.

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tally_core::CounterSummary;
use tally_store::StateStore;

/// A summary with its rendered value, for JSON output.
#[derive(Debug, Serialize)]
pub struct JsonCounter<'a> {
    #[serde(flatten)]
    pub summary: &'a CounterSummary,
    pub value: String,
}

/// Writes one aligned row per counter.
pub fn write_list<W: Write>(
    writer: &mut W,
    summaries: &[Arc<CounterSummary>],
    now: DateTime<Utc>,
) -> Result<()> {
    if summaries.is_empty() {
        writeln!(writer, "No counters yet. Create one with 'tally add <name>'.")?;
        return Ok(());
    }

    let width = summaries
        .iter()
        .map(|s| s.name.as_str().chars().count())
        .max()
        .unwrap_or(0)
        .max("Counter".len());
    writeln!(
        writer,
        "{:<width$}  {:>7}  {:<8}  Category",
        "Counter", "Value", "Interval"
    )?;
    for summary in summaries {
        writeln!(
            writer,
            "{:<width$}  {:>7}  {:<8}  {}",
            summary.name.as_str(),
            summary.display_value(now),
            summary.interval.as_str(),
            summary.category
        )?;
    }
    Ok(())
}

pub fn write_list_json<W: Write>(
    writer: &mut W,
    summaries: &[Arc<CounterSummary>],
    now: DateTime<Utc>,
) -> Result<()> {
    let counters: Vec<JsonCounter<'_>> = summaries
        .iter()
        .map(|summary| JsonCounter {
            summary,
            value: summary.display_value(now),
        })
        .collect();
    writeln!(writer, "{}", serde_json::to_string_pretty(&counters)?)?;
    Ok(())
}

/// Runs the list command.
pub async fn run<W: Write>(
    store: &StateStore,
    writer: &mut W,
    category: Option<&str>,
    categories: bool,
    json: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    if categories {
        let categories = store.categories().await?;
        if json {
            writeln!(writer, "{}", serde_json::to_string_pretty(&categories)?)?;
        } else {
            for category in categories {
                writeln!(writer, "{category}")?;
            }
        }
        return Ok(());
    }

    let mut summaries = store.summaries().await?;
    if let Some(category) = category {
        summaries.retain(|summary| summary.category == category);
    }
    if json {
        write_list_json(writer, &summaries, now)
    } else {
        write_list(writer, &summaries, now)
    }
}
