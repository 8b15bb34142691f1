//! Line-oriented bulk transfer format.
//!
//! One counter per line, UTF-8, newline terminated:
//!
//! ```text
//! name,1700000000000,1700000100000
//! ```
//!
//! Timestamps are epoch milliseconds. Names may contain commas and nothing is
//! escaped: while scanning left to right, a token only ends the name once it
//! parses as an integer of at least [`MIN_TIMESTAMP_MS`]. From then on every
//! token must be a timestamp.
//!
//! An extended line carries the counter's settings as a JSON object followed
//! by a bracketed timestamp list:
//!
//! ```text
//! {"name":"a,b","interval":"week","goal":3},[1700000000000]
//! ```
//!
//! Plain exports write names starting with `{` as extended lines without settings.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::counter::{CounterMetadata, Entry};
use crate::interval::Interval;
use crate::types::{CounterColor, CounterName, ValidationError};

/// Smallest integer accepted as the first timestamp of a plain line (early 1973).
pub const MIN_TIMESTAMP_MS: i64 = 100_000_000_000;

/// A line that could not be parsed. Line numbers are 1-based.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: invalid timestamp {token:?}")]
    InvalidTimestamp { line: usize, token: String },

    #[error("line {line}: {source}")]
    InvalidName {
        line: usize,
        #[source]
        source: ValidationError,
    },

    #[error("line {line}: invalid counter settings: {message}")]
    InvalidMetadata { line: usize, message: String },
}

/// Failure while reading a whole import stream.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("failed to read import stream: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Counter settings carried by an extended line. Absent fields keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSettings {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<Interval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<CounterColor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl LineSettings {
    fn from_metadata(metadata: &CounterMetadata) -> Self {
        Self {
            name: metadata.name.to_string(),
            interval: Some(metadata.interval),
            goal: Some(metadata.goal),
            color: Some(metadata.color),
            category: Some(metadata.category.clone()),
        }
    }

    /// Whether the line carries nothing beyond the name.
    fn is_empty(&self) -> bool {
        self.interval.is_none()
            && self.goal.is_none()
            && self.color.is_none()
            && self.category.is_none()
    }

    /// Applies the carried settings on top of `metadata`.
    pub fn apply_to(&self, metadata: &mut CounterMetadata) {
        if let Some(interval) = self.interval {
            metadata.interval = interval;
        }
        if let Some(goal) = self.goal {
            metadata.goal = goal;
        }
        if let Some(color) = self.color {
            metadata.color = color;
        }
        if let Some(category) = self.category.as_ref().filter(|c| !c.is_empty()) {
            metadata.category.clone_from(category);
        }
    }
}

/// One parsed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportLine {
    pub name: CounterName,
    pub timestamps: Vec<DateTime<Utc>>,
    pub settings: Option<LineSettings>,
}

/// Parses one line. Blank lines yield `None`.
pub fn parse_line(line: &str, line_no: usize) -> Result<Option<ImportLine>, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }
    if line.starts_with('{') {
        parse_extended_line(line, line_no).map(Some)
    } else {
        parse_plain_line(line, line_no).map(Some)
    }
}

fn parse_plain_line(line: &str, line_no: usize) -> Result<ImportLine, ParseError> {
    let mut tokens = line.split(',');
    let mut name = tokens.next().unwrap_or_default().to_string();
    let mut timestamps = Vec::new();
    let mut name_ended = false;

    for token in tokens {
        if name_ended {
            timestamps.push(parse_timestamp(token, line_no)?);
            continue;
        }
        match token.parse::<i64>() {
            Ok(ms) if ms >= MIN_TIMESTAMP_MS => {
                name_ended = true;
                timestamps.push(millis_to_datetime(ms, token, line_no)?);
            }
            _ => {
                name.push(',');
                name.push_str(token);
            }
        }
    }

    let name = CounterName::new(name).map_err(|source| ParseError::InvalidName {
        line: line_no,
        source,
    })?;
    Ok(ImportLine {
        name,
        timestamps,
        settings: None,
    })
}

fn parse_extended_line(line: &str, line_no: usize) -> Result<ImportLine, ParseError> {
    let invalid = |message: String| ParseError::InvalidMetadata {
        line: line_no,
        message,
    };

    let mut stream = serde_json::Deserializer::from_str(line).into_iter::<LineSettings>();
    let settings = stream
        .next()
        .ok_or_else(|| invalid("missing settings object".to_string()))?
        .map_err(|err| invalid(err.to_string()))?;
    let rest = &line[stream.byte_offset()..];

    let list = rest
        .trim()
        .strip_prefix(',')
        .map(str::trim_start)
        .and_then(|r| r.strip_prefix('['))
        .and_then(|r| r.strip_suffix(']'))
        .ok_or_else(|| invalid("expected ,[timestamps] after settings".to_string()))?;

    let mut timestamps = Vec::new();
    for token in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        timestamps.push(parse_timestamp(token, line_no)?);
    }

    let name = CounterName::new(settings.name.clone()).map_err(|source| {
        ParseError::InvalidName {
            line: line_no,
            source,
        }
    })?;
    Ok(ImportLine {
        name,
        timestamps,
        settings: Some(settings),
    })
}

fn parse_timestamp(token: &str, line_no: usize) -> Result<DateTime<Utc>, ParseError> {
    let ms = token
        .parse::<i64>()
        .map_err(|_| ParseError::InvalidTimestamp {
            line: line_no,
            token: token.to_string(),
        })?;
    millis_to_datetime(ms, token, line_no)
}

fn millis_to_datetime(ms: i64, token: &str, line_no: usize) -> Result<DateTime<Utc>, ParseError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| ParseError::InvalidTimestamp {
        line: line_no,
        token: token.to_string(),
    })
}

/// Everything parsed from an import stream, before any of it is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportBatch {
    /// Counter names in first-seen order, without duplicates.
    pub names: Vec<CounterName>,
    pub entries: Vec<Entry>,
    pub settings: HashMap<CounterName, LineSettings>,
    pub lines: usize,
}

impl ImportBatch {
    fn push(&mut self, line: ImportLine) {
        if !self.names.contains(&line.name) {
            self.names.push(line.name.clone());
        }
        self.entries.extend(
            line.timestamps
                .into_iter()
                .map(|timestamp| Entry::new(line.name.clone(), timestamp)),
        );
        if let Some(settings) = line.settings.filter(|s| !s.is_empty()) {
            self.settings.insert(line.name, settings);
        }
    }
}

/// Reads and parses a whole import stream.
///
/// `on_line` is called with the number of lines read so far. The first bad
/// line aborts the read.
pub fn read_batch<R: BufRead>(
    reader: R,
    mut on_line: impl FnMut(usize),
) -> Result<ImportBatch, ReadError> {
    let mut batch = ImportBatch::default();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if let Some(parsed) = parse_line(&line, idx + 1)? {
            batch.push(parsed);
        }
        batch.lines = idx + 1;
        on_line(batch.lines);
    }
    Ok(batch)
}

/// Writes a plain `name,ts,...` line.
///
/// A name starting with `{` would read back as an extended line, so it is
/// written as one carrying only the name.
pub fn write_plain_line<W: Write>(
    writer: &mut W,
    name: &CounterName,
    entries: &[Entry],
) -> io::Result<()> {
    if name.as_str().starts_with('{') {
        let settings = LineSettings {
            name: name.to_string(),
            ..LineSettings::default()
        };
        return write_settings_line(writer, &settings, entries);
    }
    writer.write_all(name.as_str().as_bytes())?;
    for entry in entries {
        write!(writer, ",{}", entry.timestamp.timestamp_millis())?;
    }
    writer.write_all(b"\n")
}

/// Writes an extended line carrying the counter's settings.
pub fn write_extended_line<W: Write>(
    writer: &mut W,
    metadata: &CounterMetadata,
    entries: &[Entry],
) -> io::Result<()> {
    write_settings_line(writer, &LineSettings::from_metadata(metadata), entries)
}

fn write_settings_line<W: Write>(
    writer: &mut W,
    settings: &LineSettings,
    entries: &[Entry],
) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, settings)?;
    writer.write_all(b",[")?;
    for (idx, entry) in entries.iter().enumerate() {
        if idx > 0 {
            writer.write_all(b",")?;
        }
        write!(writer, "{}", entry.timestamp.timestamp_millis())?;
    }
    writer.write_all(b"]\n")
}
