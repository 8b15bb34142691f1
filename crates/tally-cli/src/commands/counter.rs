//! Commands that create, change or remove counters and their entries.

use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tally_core::{Calendar, CounterSummary};
use tally_store::{StateStore, StoreConfig};

use super::util;
use crate::cli::CounterSettings;

fn write_status<W: Write>(writer: &mut W, summary: &CounterSummary, now: DateTime<Utc>) -> Result<()> {
    writeln!(writer, "{}: {}", summary.name, summary.display_value(now))?;
    Ok(())
}

fn format_time(calendar: Calendar, point: DateTime<Utc>) -> String {
    calendar
        .wall_clock(point)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

pub async fn add<W: Write>(
    store: &StateStore,
    writer: &mut W,
    defaults: &StoreConfig,
    name: &str,
    settings: &CounterSettings,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut metadata = defaults.placeholder(util::counter_name(name)?);
    settings.apply_to(&mut metadata);
    let summary = store.add_counter(metadata).await?;
    write!(writer, "Added ")?;
    write_status(writer, &summary, now)
}

pub async fn edit<W: Write>(
    store: &StateStore,
    writer: &mut W,
    name: &str,
    settings: &CounterSettings,
    now: DateTime<Utc>,
) -> Result<()> {
    let name = util::counter_name(name)?;
    let settings = settings.clone();
    let summary = store
        .edit_metadata(&name, move |metadata| settings.apply_to(metadata))
        .await?;
    write_status(writer, &summary, now)
}

pub async fn increment<W: Write>(
    store: &StateStore,
    writer: &mut W,
    name: &str,
    at: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    let name = util::counter_name(name)?;
    let at = at.map(|raw| util::parse_time(raw, now)).transpose()?;
    let summary = match at {
        Some(at) => store.increment_at(&name, at).await?,
        None => store.increment(&name).await?,
    };
    write_status(writer, &summary, now)
}

pub async fn decrement<W: Write>(
    store: &StateStore,
    writer: &mut W,
    name: &str,
    calendar: Calendar,
) -> Result<()> {
    let name = util::counter_name(name)?;
    match store.decrement(&name).await? {
        Some(removed) => writeln!(
            writer,
            "Removed {name} entry from {}",
            format_time(calendar, removed)
        )?,
        None => writeln!(writer, "{name} has no entries")?,
    }
    Ok(())
}

pub async fn undo<W: Write>(
    store: &StateStore,
    writer: &mut W,
    name: &str,
    minutes: u32,
    calendar: Calendar,
) -> Result<()> {
    let name = util::counter_name(name)?;
    let limit = Duration::minutes(i64::from(minutes));
    match store.decrement_within(&name, limit).await? {
        Some(removed) => writeln!(
            writer,
            "Removed {name} entry from {}",
            format_time(calendar, removed)
        )?,
        None => writeln!(
            writer,
            "Nothing recorded for {name} in the last {minutes} minutes"
        )?,
    }
    Ok(())
}

pub async fn rename<W: Write>(
    store: &StateStore,
    writer: &mut W,
    old: &str,
    new: &str,
) -> Result<()> {
    let old = util::counter_name(old)?;
    let new = util::counter_name(new)?;
    store
        .rename(&old, &new)
        .await
        .with_context(|| format!("failed to rename {old} to {new}"))?;
    writeln!(writer, "Renamed {old} to {new}")?;
    Ok(())
}

pub async fn delete<W: Write>(store: &StateStore, writer: &mut W, name: &str) -> Result<()> {
    let name = util::counter_name(name)?;
    let removed = store.delete_counter(&name).await?;
    writeln!(writer, "Deleted {name} and {removed} entries")?;
    Ok(())
}

pub async fn reset<W: Write>(store: &StateStore, writer: &mut W, name: &str) -> Result<()> {
    let name = util::counter_name(name)?;
    let removed = store.reset_counter(&name).await?;
    writeln!(writer, "Cleared {removed} entries from {name}")?;
    Ok(())
}

pub async fn order<W: Write>(store: &StateStore, writer: &mut W, names: &[String]) -> Result<()> {
    let names = names
        .iter()
        .map(|name| util::counter_name(name))
        .collect::<Result<Vec<_>>>()?;
    if let Some(missing) = names.iter().find(|name| !store.counter_exists(name)) {
        anyhow::bail!("counter not found: {missing}");
    }
    store.reorder(names).await?;
    let order = store.counter_names().await?;
    let order: Vec<&str> = order.iter().map(|name| name.as_str()).collect();
    writeln!(writer, "{}", order.join(", "))?;
    Ok(())
}
