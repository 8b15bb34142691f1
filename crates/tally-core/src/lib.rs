//! Core domain logic for tally.
//!
//! This crate contains the fundamental types and logic for:
//! - Counters and their entries
//! - Calendar-aligned interval arithmetic in a configurable time zone
//! - Summaries and chart bucket windows derived from entry history
//! - The line-oriented import/export format

pub mod codec;
mod counter;
pub mod interval;
mod summary;
pub mod types;
mod window;

pub use codec::{ImportBatch, ImportLine, LineSettings, ParseError, ReadError};
pub use counter::{CounterMetadata, DEFAULT_CATEGORY, Entry};
pub use interval::{Calendar, CalendarError, Interval, UnknownInterval, WallClock, Zone};
pub use summary::{CounterSummary, GOAL_MET_GLYPH, TIMER_STOPPED_GLYPH, format_elapsed};
pub use types::{CounterColor, CounterKind, CounterName, ValidationError};
pub use window::BucketWindow;
