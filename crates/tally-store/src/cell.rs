//! Observable summary cell, one per live counter.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tally_core::CounterSummary;
use tokio::sync::watch;

/// Latest summary of a counter, or `None` while the first computation is pending.
pub type SummarySnapshot = Option<Arc<CounterSummary>>;

/// Holds the published summary of one counter.
///
/// The cell keeps its identity across renames and is retired on delete. Every
/// recomputation draws a token before it reads the database; a publication is
/// only accepted if its token is newer than the last accepted one, so a slow
/// recompute can never overwrite a fresher result.
#[derive(Debug)]
pub(crate) struct SummaryCell {
    tx: watch::Sender<SummarySnapshot>,
    live: AtomicBool,
    issued: AtomicU64,
    published: Mutex<u64>,
}

impl SummaryCell {
    pub(crate) fn pending() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            live: AtomicBool::new(true),
            issued: AtomicU64::new(0),
            published: Mutex::new(0),
        }
    }

    /// Draws a token for a recomputation about to read the database.
    pub(crate) fn next_token(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Publishes `summary` unless the cell was retired or a newer token already published.
    ///
    /// `notify` runs while the publication is still exclusive, so notifications
    /// leave in the same order the values were published.
    pub(crate) fn publish(
        &self,
        token: u64,
        summary: Arc<CounterSummary>,
        notify: impl FnOnce(Arc<CounterSummary>),
    ) -> bool {
        let mut published = self.published.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_live() || token <= *published {
            return false;
        }
        *published = token;
        self.tx.send_replace(Some(Arc::clone(&summary)));
        notify(summary);
        true
    }

    pub(crate) fn retire(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn current(&self) -> SummarySnapshot {
        self.tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SummarySnapshot> {
        self.tx.subscribe()
    }
}
