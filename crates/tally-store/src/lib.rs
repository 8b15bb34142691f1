//! Live counter state for tally.
//!
//! [`StateStore`] keeps one observable summary per counter in memory, applies
//! mutations through the database one counter at a time, and fans notifications
//! out to registered [`CounterObserver`]s from a single dispatcher task.
//!
//! The store must be opened inside a Tokio runtime.

mod cell;
mod error;
mod observer;
mod progress;
mod store;
mod transfer;

pub use cell::SummarySnapshot;
pub use error::StoreError;
pub use observer::{CounterObserver, ObserverId};
pub use progress::{ImportStatus, NoProgress, ProgressSink};
pub use store::{ChartData, StateStore, StoreConfig};
pub use transfer::{ExportFormat, ExportSummary, ImportSummary};
