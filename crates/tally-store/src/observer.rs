//! Observer registration and the dispatcher task that delivers notifications.
//!
//! Observers are only ever called from the dispatcher task, one notification at
//! a time, in the order the store enqueued them. The registry is snapshotted
//! before each delivery, so an observer may register or unregister observers
//! (itself included) from inside a callback.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tally_core::{CounterName, CounterSummary};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::cell::SummaryCell;

/// Receives counter lifecycle and summary notifications.
///
/// Every method has an empty default so observers implement only what they need.
pub trait CounterObserver: Send + Sync {
    /// All persisted counters have their first summary. Delivered once per observer.
    fn on_initial_counters_loaded(&self) {}

    fn on_counter_added(&self, _name: &CounterName) {}

    fn on_counter_removed(&self, _name: &CounterName) {}

    fn on_counter_renamed(&self, _old: &CounterName, _new: &CounterName) {}

    /// The entry recorded at `removed` was deleted.
    fn on_counter_decremented(&self, _name: &CounterName, _removed: DateTime<Utc>) {}

    fn on_summary_changed(&self, _summary: &CounterSummary) {}
}

/// Handle returned by [`StateStore::observe`](crate::StateStore::observe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
pub(crate) struct ObserverRegistry {
    next_id: u64,
    observers: Vec<(ObserverId, Arc<dyn CounterObserver>)>,
    loaded: bool,
}

impl ObserverRegistry {
    pub(crate) fn insert(&mut self, observer: Arc<dyn CounterObserver>) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.observers.push((id, observer));
        id
    }

    pub(crate) fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        self.observers.len() != before
    }

    fn contains(&self, id: ObserverId) -> bool {
        self.observers.iter().any(|(existing, _)| *existing == id)
    }

    pub(crate) fn ids(&self) -> Vec<ObserverId> {
        self.observers.iter().map(|(id, _)| *id).collect()
    }

    pub(crate) const fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub(crate) const fn mark_loaded(&mut self) {
        self.loaded = true;
    }

    fn snapshot(&self) -> Vec<(ObserverId, Arc<dyn CounterObserver>)> {
        self.observers.clone()
    }
}

pub(crate) type SharedRegistry = Arc<Mutex<ObserverRegistry>>;

/// A notification waiting for delivery.
#[derive(Debug)]
pub(crate) enum Event {
    Added(CounterName),
    Removed(CounterName),
    Renamed { old: CounterName, new: CounterName },
    Decremented { name: CounterName, removed: DateTime<Utc> },
    SummaryChanged(Arc<CounterSummary>),
}

/// Messages consumed by the dispatcher task.
pub(crate) enum Dispatch {
    /// Deliver `event` to every registered observer. When `cell` is set, the
    /// event is dropped if the cell was retired in the meantime.
    Event {
        event: Event,
        cell: Option<Arc<SummaryCell>>,
    },
    /// Deliver the initial-load notification to these observers.
    Initial(Vec<ObserverId>),
    /// Acknowledge once everything queued before it was delivered.
    Flush(oneshot::Sender<()>),
    Shutdown,
}

pub(crate) async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
    registry: SharedRegistry,
) {
    while let Some(message) = rx.recv().await {
        match message {
            Dispatch::Event { event, cell } => {
                if cell.as_ref().is_some_and(|cell| !cell.is_live()) {
                    debug!(?event, "dropping notification for a removed counter");
                    continue;
                }
                deliver(&registry, None, |observer| notify(observer, &event));
            }
            Dispatch::Initial(ids) => {
                deliver(&registry, Some(ids.as_slice()), |observer| {
                    observer.on_initial_counters_loaded();
                });
            }
            Dispatch::Flush(ack) => {
                let _ = ack.send(());
            }
            Dispatch::Shutdown => break,
        }
    }
    debug!("dispatcher stopped");
}

fn notify(observer: &dyn CounterObserver, event: &Event) {
    match event {
        Event::Added(name) => observer.on_counter_added(name),
        Event::Removed(name) => observer.on_counter_removed(name),
        Event::Renamed { old, new } => observer.on_counter_renamed(old, new),
        Event::Decremented { name, removed } => observer.on_counter_decremented(name, *removed),
        Event::SummaryChanged(summary) => observer.on_summary_changed(summary),
    }
}

/// Calls `f` for each observer registered at the start of delivery that is still
/// registered when its turn comes, restricted to `only` when given.
fn deliver(
    registry: &SharedRegistry,
    only: Option<&[ObserverId]>,
    mut f: impl FnMut(&dyn CounterObserver),
) {
    let snapshot = lock(registry).snapshot();
    for (id, observer) in snapshot {
        if only.is_some_and(|ids| !ids.contains(&id)) {
            continue;
        }
        if lock(registry).contains(id) {
            f(observer.as_ref());
        }
    }
}

pub(crate) fn lock(registry: &SharedRegistry) -> std::sync::MutexGuard<'_, ObserverRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}
