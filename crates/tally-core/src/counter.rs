//! Counter configuration and recorded entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::interval::Interval;
use crate::types::{CounterColor, CounterKind, CounterName, ValidationError};

/// Category assigned when none is chosen.
pub const DEFAULT_CATEGORY: &str = "Default";

/// One timestamped occurrence recorded against a counter.
///
/// Duplicate timestamps for the same counter are legal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub counter: CounterName,
    pub timestamp: DateTime<Utc>,
}

impl Entry {
    pub const fn new(counter: CounterName, timestamp: DateTime<Utc>) -> Self {
        Self { counter, timestamp }
    }
}

/// User-editable configuration of a counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterMetadata {
    pub name: CounterName,
    pub interval: Interval,
    /// Target count per interval; zero means no goal.
    #[serde(default)]
    pub goal: u32,
    #[serde(default)]
    pub color: CounterColor,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub kind: CounterKind,
    /// Only meaningful for [`CounterKind::Dynamic`] counters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    /// Entries recorded per increment.
    #[serde(default = "default_step")]
    pub step: u32,
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

const fn default_step() -> u32 {
    1
}

impl CounterMetadata {
    /// Creates metadata with default settings for the given name.
    pub fn new(name: CounterName) -> Self {
        Self {
            name,
            interval: Interval::default(),
            goal: 0,
            color: CounterColor::default(),
            category: default_category(),
            kind: CounterKind::default(),
            formula: None,
            step: default_step(),
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Interval) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_goal(mut self, goal: u32) -> Self {
        self.goal = goal;
        self
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.step == 0 {
            return Err(ValidationError::InvalidStep { value: self.step });
        }
        if self.category.is_empty() {
            return Err(ValidationError::Empty { field: "category" });
        }
        Ok(())
    }
}
