//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tally_core::{CounterColor, CounterKind, CounterMetadata, Interval};

/// Count things, per hour, day, week, month or year.
///
/// Counters are stored locally; every command works against the same database.
#[derive(Debug, Parser)]
#[command(name = "tally", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create a counter.
    Add {
        name: String,
        #[command(flatten)]
        settings: CounterSettings,
    },

    /// Change a counter's settings.
    Edit {
        name: String,
        #[command(flatten)]
        settings: CounterSettings,
    },

    /// Record an occurrence.
    Inc {
        name: String,

        /// When it happened (e.g., 2026-01-15T10:30:00Z or "2 hours ago").
        #[arg(long)]
        at: Option<String>,
    },

    /// Remove the most recent occurrence.
    Dec { name: String },

    /// Remove the most recent occurrence if it was recorded in the last few minutes.
    Undo {
        name: String,

        #[arg(long, default_value_t = 5)]
        minutes: u32,
    },

    /// Give a counter a new name, keeping its history.
    Rename { old: String, new: String },

    /// Delete a counter and its history.
    Delete { name: String },

    /// Delete a counter's history but keep the counter.
    Reset { name: String },

    /// List counters in display order.
    List {
        /// Only show counters in this category.
        #[arg(long)]
        category: Option<String>,

        /// List the categories in use instead of counters.
        #[arg(long, conflicts_with = "category")]
        categories: bool,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show one counter in detail.
    Show {
        name: String,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Draw a counter's history as bars.
    Chart {
        name: String,

        /// Bucket size (defaults to the counter's interval).
        #[arg(long)]
        interval: Option<Interval>,

        /// Number of most recent buckets to draw.
        #[arg(long, default_value_t = 10)]
        last: usize,
    },

    /// Write every counter to stdout or a file.
    Export {
        /// Output file (defaults to stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Include counter settings on each line.
        #[arg(long)]
        extended: bool,
    },

    /// Read counters from stdin or a file.
    Import {
        /// Input file (defaults to stdin).
        input: Option<PathBuf>,
    },

    /// Move counters to the front of the display order.
    Order {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

/// Counter settings shared by `add` and `edit`. Unset flags leave the setting alone.
#[derive(Debug, Clone, Default, Args)]
pub struct CounterSettings {
    /// hour, day, week, month, year, timer or lifetime.
    #[arg(long)]
    pub interval: Option<Interval>,

    /// Target count per interval (0 for none).
    #[arg(long)]
    pub goal: Option<u32>,

    /// Color as #RRGGBB or #AARRGGBB.
    #[arg(long)]
    pub color: Option<CounterColor>,

    #[arg(long)]
    pub category: Option<String>,

    /// Entries recorded per increment.
    #[arg(long)]
    pub step: Option<u32>,

    /// standard or dynamic.
    #[arg(long)]
    pub kind: Option<CounterKind>,

    /// Formula of a dynamic counter.
    #[arg(long)]
    pub formula: Option<String>,
}

impl CounterSettings {
    /// Overwrites the settings that were given.
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
        if let Some(category) = &self.category {
            metadata.category.clone_from(category);
        }
        if let Some(step) = self.step {
            metadata.step = step;
        }
        if let Some(kind) = self.kind {
            metadata.kind = kind;
        }
        if let Some(formula) = &self.formula {
            metadata.formula = Some(formula.clone());
        }
    }
}
