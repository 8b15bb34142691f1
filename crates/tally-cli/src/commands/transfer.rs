//! `export` and `import`: move counters in and out as text lines.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tally_store::{ExportFormat, ImportStatus, ProgressSink, StateStore};
use tracing::{debug, warn};

/// Reports transfer progress to the log.
#[derive(Debug, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn import_progress(&self, lines: usize, status: ImportStatus) {
        match status {
            ImportStatus::InProgress => {
                if lines % 1000 == 0 {
                    debug!(lines, "importing");
                }
            }
            ImportStatus::Done => debug!(lines, "parsed import"),
            ImportStatus::Error => warn!(lines, "import aborted"),
        }
    }

    fn export_progress(&self, exported: usize, total: usize) {
        debug!(exported, total, "exporting");
    }
}

/// Writes every counter to `output`, or to stdout when no path is given.
///
/// The summary goes to `writer` only when exporting to a file, so stdout stays
/// importable.
pub async fn export<W: Write>(
    store: &StateStore,
    writer: &mut W,
    output: Option<&Path>,
    extended: bool,
) -> Result<()> {
    let format = if extended {
        ExportFormat::Extended
    } else {
        ExportFormat::Plain
    };
    let target: Box<dyn Write + Send> = match output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => Box::new(io::stdout()),
    };

    let summary = store
        .export_all(target, format, Arc::new(LogProgress))
        .await
        .context("export failed")?;
    if let Some(path) = output {
        writeln!(
            writer,
            "Exported {} counters ({} entries) to {}",
            summary.counters,
            summary.entries,
            path.display()
        )?;
    }
    Ok(())
}

/// Reads counters from `input`, or from stdin when no path is given.
pub async fn import<W: Write>(
    store: &StateStore,
    writer: &mut W,
    input: Option<&Path>,
) -> Result<()> {
    let source: Box<dyn io::BufRead + Send> = match input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let summary = store
        .bulk_import(source, Arc::new(LogProgress))
        .await
        .context("import failed")?;
    writeln!(
        writer,
        "Imported {} entries from {} lines ({} new counters, {} updated)",
        summary.entries, summary.lines, summary.counters_created, summary.counters_updated
    )?;
    Ok(())
}
