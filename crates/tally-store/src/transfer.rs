//! Bulk import and export over the line-oriented transfer format.

use std::io::{BufRead, Write};
use std::sync::Arc;

use tally_core::codec::{self, ImportBatch};
use tally_db::Database;
use tracing::{info, warn};

use crate::cell::SummaryCell;
use crate::error::StoreError;
use crate::observer::Event;
use crate::progress::{ImportStatus, ProgressSink};
use crate::store::{StateStore, summarize};

/// Line format used when exporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    /// `name,ts,...`
    #[default]
    Plain,
    /// `{settings},[ts,...]`, which also carries each counter's settings.
    Extended,
}

/// Outcome of [`StateStore::bulk_import`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportSummary {
    pub lines: usize,
    pub counters_created: usize,
    pub counters_updated: usize,
    pub entries: usize,
}

/// Outcome of [`StateStore::export_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportSummary {
    pub counters: usize,
    pub entries: usize,
}

impl StateStore {
    /// Imports counters and entries from `reader`.
    ///
    /// The whole stream is parsed before anything is written, so a malformed line
    /// aborts the import with no changes. Unknown counters are created with
    /// placeholder settings (or the settings an extended line carries) before their
    /// entries are inserted. The reader is dropped on this task whatever the outcome.
    pub async fn bulk_import<R>(
        &self,
        reader: R,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<ImportSummary, StoreError>
    where
        R: BufRead + Send + 'static,
    {
        let sink = Arc::clone(&progress);
        let (reader, parsed, lines) = tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut lines = 0;
            let parsed = codec::read_batch(&mut reader, |read| {
                lines = read;
                sink.import_progress(read, ImportStatus::InProgress);
            });
            (reader, parsed, lines)
        })
        .await?;
        drop(reader);

        let batch = match parsed {
            Ok(batch) => batch,
            Err(err) => {
                warn!(%err, lines, "import aborted");
                progress.import_progress(lines, ImportStatus::Error);
                return Err(err.into());
            }
        };

        match self.apply_import(batch).await {
            Ok(summary) => {
                progress.import_progress(summary.lines, ImportStatus::Done);
                info!(
                    lines = summary.lines,
                    created = summary.counters_created,
                    entries = summary.entries,
                    "imported"
                );
                Ok(summary)
            }
            Err(err) => {
                progress.import_progress(lines, ImportStatus::Error);
                Err(err)
            }
        }
    }

    async fn apply_import(&self, batch: ImportBatch) -> Result<ImportSummary, StoreError> {
        let _guards = self.lock_names(&batch.names).await;

        // Cells for new counters are built now but only registered after the write commits.
        let targets: Vec<(Arc<SummaryCell>, bool)> = batch
            .names
            .iter()
            .map(|name| match self.cell(name) {
                Ok(cell) => (cell, false),
                Err(_) => (Arc::new(SummaryCell::pending()), true),
            })
            .collect();
        let config = self.inner.config.clone();

        let (summary, computed) = self
            .blocking(move |db| {
                let mut created = Vec::new();
                let mut updated = Vec::new();
                for (name, (_, is_new)) in batch.names.iter().zip(&targets) {
                    let settings = batch.settings.get(name);
                    if *is_new {
                        let mut metadata = config.placeholder(name.clone());
                        if let Some(settings) = settings {
                            settings.apply_to(&mut metadata);
                        }
                        created.push(metadata);
                    } else if let Some(settings) = settings {
                        let mut metadata = db
                            .counter(name)?
                            .ok_or_else(|| StoreError::CounterNotFound(name.clone()))?;
                        settings.apply_to(&mut metadata);
                        updated.push(metadata);
                    }
                }
                let entries = db.apply_import(&created, &updated, &batch.entries)?;

                let mut computed = Vec::with_capacity(targets.len());
                for (name, (cell, is_new)) in batch.names.iter().zip(targets) {
                    let token = cell.next_token();
                    let summary = summarize(db, &config.calendar, name)?;
                    computed.push((cell, is_new, token, summary));
                }
                let summary = ImportSummary {
                    lines: batch.lines,
                    counters_created: created.len(),
                    counters_updated: updated.len(),
                    entries,
                };
                Ok((summary, computed))
            })
            .await?;

        {
            let mut cells = self.write_cells();
            for (cell, is_new, _, summary) in &computed {
                if *is_new {
                    cells.insert(summary.name.clone(), Arc::clone(cell));
                    self.send_event(Event::Added(summary.name.clone()), None);
                }
            }
        }
        for (cell, _, token, summary) in computed {
            self.publish(&cell, token, summary);
        }
        Ok(summary)
    }

    /// Writes every counter, in display order, to `writer`.
    ///
    /// Progress is reported after each counter. The writer is flushed and then
    /// dropped on this task whatever the outcome.
    pub async fn export_all<W>(
        &self,
        writer: W,
        format: ExportFormat,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<ExportSummary, StoreError>
    where
        W: Write + Send + 'static,
    {
        let (writer, result) = self
            .blocking(move |db| {
                let mut writer = writer;
                let result = write_export(db, &mut writer, format, progress.as_ref());
                Ok((writer, result))
            })
            .await?;
        drop(writer);

        let summary = result?;
        info!(
            counters = summary.counters,
            entries = summary.entries,
            "exported"
        );
        Ok(summary)
    }
}

fn write_export<W: Write>(
    db: &Database,
    writer: &mut W,
    format: ExportFormat,
    progress: &dyn ProgressSink,
) -> Result<ExportSummary, StoreError> {
    let counters = db.list_counters()?;
    let total = counters.len();
    let mut summary = ExportSummary::default();
    for (idx, metadata) in counters.iter().enumerate() {
        let entries = db.entries(&metadata.name)?;
        match format {
            ExportFormat::Plain => codec::write_plain_line(writer, &metadata.name, &entries)?,
            ExportFormat::Extended => codec::write_extended_line(writer, metadata, &entries)?,
        }
        summary.counters += 1;
        summary.entries += entries.len();
        progress.export_progress(idx + 1, total);
    }
    writer.flush()?;
    Ok(summary)
}
