//! Progress reporting for bulk transfers.

/// State of an import, reported alongside the number of lines parsed so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStatus {
    InProgress,
    Done,
    Error,
}

/// Receives progress of imports and exports.
///
/// Called from blocking worker threads, so implementations must be thread-safe.
pub trait ProgressSink: Send + Sync {
    fn import_progress(&self, _lines: usize, _status: ImportStatus) {}

    /// `exported` counters out of `total` have been written.
    fn export_progress(&self, _exported: usize, _total: usize) {}
}

/// Discards all progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}
