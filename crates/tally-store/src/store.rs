//! The live counter state store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use tally_core::{
    BucketWindow, Calendar, CounterMetadata, CounterName, CounterSummary, DEFAULT_CATEGORY,
    Entry, Interval,
};
use tally_db::Database;
use tokio::sync::{OwnedMutexGuard, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cell::{SummaryCell, SummarySnapshot};
use crate::error::StoreError;
use crate::observer::{
    CounterObserver, Dispatch, Event, ObserverId, SharedRegistry, lock, run_dispatcher,
};

/// Settings for a [`StateStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Time zone and week start used for bucketing.
    pub calendar: Calendar,
    /// Interval of counters created by an import without settings.
    pub default_interval: Interval,
    /// Category of counters created by an import without settings.
    pub default_category: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            calendar: Calendar::default(),
            default_interval: Interval::default(),
            default_category: DEFAULT_CATEGORY.to_string(),
        }
    }
}

impl StoreConfig {
    /// Metadata for a counter that appears without any settings.
    pub fn placeholder(&self, name: CounterName) -> CounterMetadata {
        CounterMetadata::new(name)
            .with_interval(self.default_interval)
            .with_category(self.default_category.clone())
    }
}

/// Buckets of a counter's chart together with the number of entries in each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartData {
    pub window: BucketWindow,
    pub counts: Vec<usize>,
}

/// Per-counter FIFO locks. Operations on one name run one at a time, in the order
/// they first asked for the lock.
///
/// An entry lives only while some task holds or waits for its lock.
#[derive(Default)]
struct KeyLocks(Mutex<HashMap<CounterName, Arc<tokio::sync::Mutex<()>>>>);

impl KeyLocks {
    fn handle(&self, name: &CounterName) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(name.clone()).or_default())
    }

    async fn lock(&self, name: &CounterName) -> KeyGuard<'_> {
        let guard = self.handle(name).lock_owned().await;
        KeyGuard {
            locks: self,
            name: name.clone(),
            guard: Some(guard),
        }
    }

    /// Locks several names in sorted order, so multi-name operations cannot deadlock.
    async fn lock_all(&self, names: &[CounterName]) -> Vec<KeyGuard<'_>> {
        let mut sorted: Vec<&CounterName> = names.iter().collect();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for name in sorted {
            guards.push(self.lock(name).await);
        }
        guards
    }

    /// Drops the entry for `name` unless another task still holds a handle to it.
    fn prune(&self, name: &CounterName) {
        let mut locks = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(name)
            .is_some_and(|handle| Arc::strong_count(handle) == 1)
        {
            locks.remove(name);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Held lock on one counter name.
pub(crate) struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    name: CounterName,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Release first so our own handle no longer counts.
        self.guard.take();
        self.locks.prune(&self.name);
    }
}

pub(crate) struct Inner {
    db: Arc<Mutex<Database>>,
    pub(crate) config: StoreConfig,
    cells: RwLock<HashMap<CounterName, Arc<SummaryCell>>>,
    locks: KeyLocks,
    registry: SharedRegistry,
    dispatch: mpsc::UnboundedSender<Dispatch>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    loaded: watch::Sender<bool>,
}

/// Single in-memory authority for the current summary of every counter.
///
/// Cloning is cheap and every clone refers to the same store. Mutations of one
/// counter are applied and published in the order they were issued; different
/// counters proceed independently. Database work runs on blocking worker
/// threads and observers are called from one dispatcher task.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) inner: Arc<Inner>,
}

impl StateStore {
    /// Opens the store over `db`.
    ///
    /// A pending cell is created for every persisted counter right away; their
    /// summaries are computed in the background. See [`Self::wait_until_loaded`].
    pub async fn open(db: Database, config: StoreConfig) -> Result<Self, StoreError> {
        let db = Arc::new(Mutex::new(db));
        let names = run_blocking(&db, |db| Ok(db.counter_names()?)).await?;
        let cells = names
            .iter()
            .map(|name| (name.clone(), Arc::new(SummaryCell::pending())))
            .collect();

        let registry = SharedRegistry::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(run_dispatcher(rx, Arc::clone(&registry)));
        let (loaded, _) = watch::channel(false);

        let store = Self {
            inner: Arc::new(Inner {
                db,
                config,
                cells: RwLock::new(cells),
                locks: KeyLocks::default(),
                registry,
                dispatch: tx,
                dispatcher: Mutex::new(Some(dispatcher)),
                loaded,
            }),
        };
        info!(counters = names.len(), "opened state store");

        let loader = store.clone();
        tokio::spawn(async move { loader.load_initial(names).await });
        Ok(store)
    }

    async fn load_initial(&self, names: Vec<CounterName>) {
        for name in names {
            let Ok(cell) = self.cell(&name) else {
                continue;
            };
            match self.recompute(&cell, &name).await {
                Ok((token, summary)) => {
                    self.publish(&cell, token, summary);
                }
                Err(StoreError::CounterNotFound(_)) => {
                    debug!(counter = %name, "counter removed during initial load");
                }
                Err(err) => error!(counter = %name, %err, "failed to compute initial summary"),
            }
        }
        {
            let mut registry = lock(&self.inner.registry);
            registry.mark_loaded();
            self.send(Dispatch::Initial(registry.ids()));
        }
        self.inner.loaded.send_replace(true);
        info!("initial summaries loaded");
    }

    /// Resolves once every counter present at open time has its first summary.
    pub async fn wait_until_loaded(&self) {
        let mut rx = self.inner.loaded.subscribe();
        let _ = rx.wait_for(|loaded| *loaded).await;
    }

    /// Registers an observer. If the initial load already finished, the observer
    /// is told so right away.
    pub fn observe(&self, observer: Arc<dyn CounterObserver>) -> ObserverId {
        let mut registry = lock(&self.inner.registry);
        let id = registry.insert(observer);
        if registry.is_loaded() {
            self.send(Dispatch::Initial(vec![id]));
        }
        id
    }

    /// Unregisters an observer. Safe to call from inside an observer callback.
    pub fn unobserve(&self, id: ObserverId) -> bool {
        lock(&self.inner.registry).remove(id)
    }

    /// Resolves once every notification queued so far has been delivered.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(Dispatch::Flush(tx));
        let _ = rx.await;
    }

    /// Delivers pending notifications and stops the dispatcher task.
    pub async fn close(self) {
        self.wait_until_loaded().await;
        self.flush().await;
        self.send(Dispatch::Shutdown);
        let handle = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(%err, "dispatcher task failed");
            }
        }
        info!("closed state store");
    }

    /// Creates a counter.
    ///
    /// The empty cell is registered and announced first; its first summary is
    /// published as a separate step.
    pub async fn add_counter(
        &self,
        metadata: CounterMetadata,
    ) -> Result<Arc<CounterSummary>, StoreError> {
        metadata.validate()?;
        let name = metadata.name.clone();
        let _guard = self.inner.locks.lock(&name).await;
        if self.cell(&name).is_ok() {
            return Err(StoreError::NameConflict(name));
        }

        self.blocking(move |db| Ok(db.insert_counter(&metadata)?))
            .await?;
        let cell = Arc::new(SummaryCell::pending());
        {
            let mut cells = self.write_cells();
            cells.insert(name.clone(), Arc::clone(&cell));
            self.send_event(Event::Added(name.clone()), None);
        }
        info!(counter = %name, "added counter");

        let (token, summary) = self.recompute(&cell, &name).await?;
        Ok(self.publish(&cell, token, summary))
    }

    /// Records `step` entries at the current time.
    pub async fn increment(&self, name: &CounterName) -> Result<Arc<CounterSummary>, StoreError> {
        self.increment_at(name, Utc::now()).await
    }

    /// Records `step` entries at `at`.
    pub async fn increment_at(
        &self,
        name: &CounterName,
        at: DateTime<Utc>,
    ) -> Result<Arc<CounterSummary>, StoreError> {
        let _guard = self.inner.locks.lock(name).await;
        let cell = self.cell(name)?;
        let counter = name.clone();
        let ((), summary) = self
            .apply(&cell, name, move |db| {
                let metadata = db
                    .counter(&counter)?
                    .ok_or_else(|| StoreError::CounterNotFound(counter.clone()))?;
                let step = usize::try_from(metadata.step).unwrap_or(1);
                db.bulk_insert(&vec![Entry::new(counter, at); step])?;
                Ok(())
            })
            .await?;
        debug!(counter = %name, total = summary.total_count, "incremented");
        Ok(summary)
    }

    /// Removes the most recent entry. Returns its timestamp, or `None` if the
    /// counter had no entries.
    pub async fn decrement(&self, name: &CounterName) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.remove_latest(name, None).await
    }

    /// Removes the most recent entry only if it was recorded within `limit` of now.
    pub async fn decrement_within(
        &self,
        name: &CounterName,
        limit: Duration,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let since = Utc::now()
            .checked_sub_signed(limit)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.remove_latest(name, Some(since)).await
    }

    async fn remove_latest(
        &self,
        name: &CounterName,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let _guard = self.inner.locks.lock(name).await;
        let cell = self.cell(name)?;
        let counter = name.clone();
        let (removed, _) = self
            .apply(&cell, name, move |db| {
                let removed = match since {
                    Some(since) => db.delete_most_recent_entry_since(&counter, since)?,
                    None => db.delete_most_recent_entry(&counter)?,
                };
                Ok(removed)
            })
            .await?;
        if let Some(removed) = removed {
            self.send_event(
                Event::Decremented {
                    name: name.clone(),
                    removed,
                },
                Some(&cell),
            );
        }
        debug!(counter = %name, removed = removed.is_some(), "decremented");
        Ok(removed)
    }

    /// Deletes every entry but keeps the counter. Returns how many entries were removed.
    pub async fn reset_counter(&self, name: &CounterName) -> Result<usize, StoreError> {
        let _guard = self.inner.locks.lock(name).await;
        let cell = self.cell(name)?;
        let counter = name.clone();
        let (removed, _) = self
            .apply(&cell, name, move |db| Ok(db.delete_all_entries(&counter)?))
            .await?;
        info!(counter = %name, removed, "reset counter");
        Ok(removed)
    }

    /// Replaces a counter's settings. The name selects the counter and is not changed.
    pub async fn update_metadata(
        &self,
        metadata: CounterMetadata,
    ) -> Result<Arc<CounterSummary>, StoreError> {
        metadata.validate()?;
        let name = metadata.name.clone();
        let _guard = self.inner.locks.lock(&name).await;
        let cell = self.cell(&name)?;
        let ((), summary) = self
            .apply(&cell, &name, move |db| Ok(db.update_counter(&metadata)?))
            .await?;
        Ok(summary)
    }

    /// Changes a counter's settings in place.
    ///
    /// `edit` sees the stored settings while the counter's lock is held, so
    /// concurrent edits of different fields all survive. The name cannot be
    /// changed this way; use [`Self::rename`].
    pub async fn edit_metadata<F>(
        &self,
        name: &CounterName,
        edit: F,
    ) -> Result<Arc<CounterSummary>, StoreError>
    where
        F: FnOnce(&mut CounterMetadata) + Send + 'static,
    {
        let _guard = self.inner.locks.lock(name).await;
        let cell = self.cell(name)?;
        let counter = name.clone();
        let ((), summary) = self
            .apply(&cell, name, move |db| {
                let mut metadata = db
                    .counter(&counter)?
                    .ok_or_else(|| StoreError::CounterNotFound(counter.clone()))?;
                edit(&mut metadata);
                metadata.name = counter;
                metadata.validate()?;
                Ok(db.update_counter(&metadata)?)
            })
            .await?;
        Ok(summary)
    }

    /// Renames a counter, moving its settings, entries and cell.
    ///
    /// Readers and observers see either the old name with its last state or the
    /// new name with the renamed state, never neither. Fails with
    /// [`StoreError::NameConflict`] and changes nothing if `new` is taken.
    pub async fn rename(
        &self,
        old: &CounterName,
        new: &CounterName,
    ) -> Result<Arc<CounterSummary>, StoreError> {
        let _guards = self
            .inner
            .locks
            .lock_all(&[old.clone(), new.clone()])
            .await;
        let cell = self.cell(old)?;
        if old == new || self.cell(new).is_ok() {
            return Err(StoreError::NameConflict(new.clone()));
        }

        let calendar = self.inner.config.calendar;
        let (token, summary) = self
            .blocking({
                let cell = Arc::clone(&cell);
                let (old, new) = (old.clone(), new.clone());
                move |db| {
                    db.rename_counter(&old, &new)?;
                    let token = cell.next_token();
                    Ok((token, summarize(db, &calendar, &new)?))
                }
            })
            .await?;

        let summary = {
            let mut cells = self.write_cells();
            cells.remove(old);
            cells.insert(new.clone(), Arc::clone(&cell));
            self.send_event(
                Event::Renamed {
                    old: old.clone(),
                    new: new.clone(),
                },
                None,
            );
            self.publish(&cell, token, summary)
        };
        info!(%old, %new, "renamed counter");
        Ok(summary)
    }

    /// Deletes a counter and all of its entries. Returns how many entries were removed.
    pub async fn delete_counter(&self, name: &CounterName) -> Result<usize, StoreError> {
        let _guard = self.inner.locks.lock(name).await;
        let cell = self.cell(name)?;
        let counter = name.clone();
        let removed = self
            .blocking(move |db| Ok(db.delete_counter(&counter)?))
            .await?;
        {
            let mut cells = self.write_cells();
            cells.remove(name);
            cell.retire();
            self.send_event(Event::Removed(name.clone()), None);
        }
        info!(counter = %name, entries = removed, "deleted counter");
        Ok(removed)
    }

    /// Recomputes and republishes every summary, e.g. after an interval rolled over.
    pub async fn refresh_all(&self) -> Result<(), StoreError> {
        let mut names: Vec<CounterName> = self.read_cells().keys().cloned().collect();
        names.sort();
        for name in names {
            let _guard = self.inner.locks.lock(&name).await;
            let Ok(cell) = self.cell(&name) else {
                continue;
            };
            self.apply(&cell, &name, |_| Ok(())).await?;
        }
        debug!("refreshed all summaries");
        Ok(())
    }

    /// Latest published summary, `None` while the first computation is pending.
    pub fn summary(&self, name: &CounterName) -> Result<SummarySnapshot, StoreError> {
        Ok(self.cell(name)?.current())
    }

    /// Subscribes to a counter's summary. The receiver can be read without locking the store.
    pub fn watch(&self, name: &CounterName) -> Result<watch::Receiver<SummarySnapshot>, StoreError> {
        Ok(self.cell(name)?.subscribe())
    }

    /// Published summaries in display order. Pending counters are skipped.
    pub async fn summaries(&self) -> Result<Vec<Arc<CounterSummary>>, StoreError> {
        let names = self.counter_names().await?;
        Ok(names
            .iter()
            .filter_map(|name| self.summary(name).ok().flatten())
            .collect())
    }

    pub fn counter_exists(&self, name: &CounterName) -> bool {
        self.read_cells().contains_key(name)
    }

    /// Counter names in display order.
    pub async fn counter_names(&self) -> Result<Vec<CounterName>, StoreError> {
        self.blocking(|db| Ok(db.counter_names()?)).await
    }

    /// Moves the listed counters to the front of the display order. Repeated
    /// names keep their first position.
    pub async fn reorder(&self, names: Vec<CounterName>) -> Result<(), StoreError> {
        self.blocking(move |db| Ok(db.set_order(&names)?)).await
    }

    /// Distinct categories in use.
    pub async fn categories(&self) -> Result<Vec<String>, StoreError> {
        self.blocking(|db| Ok(db.categories()?)).await
    }

    pub async fn metadata(&self, name: &CounterName) -> Result<CounterMetadata, StoreError> {
        let counter = name.clone();
        self.blocking(move |db| {
            db.counter(&counter)?
                .ok_or_else(|| StoreError::CounterNotFound(counter.clone()))
        })
        .await
    }

    /// Entries of a counter in `[since, until)`, ascending.
    pub async fn entries_in_range(
        &self,
        name: &CounterName,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Entry>, StoreError> {
        self.cell(name)?;
        let counter = name.clone();
        self.blocking(move |db| Ok(db.entries_in_range(&counter, since, until)?))
            .await
    }

    /// Chart buckets of a counter and their entry counts.
    ///
    /// `interval` defaults to the counter's chart-displayable interval.
    pub async fn chart(
        &self,
        name: &CounterName,
        interval: Option<Interval>,
        now: DateTime<Utc>,
    ) -> Result<ChartData, StoreError> {
        self.cell(name)?;
        let counter = name.clone();
        let calendar = self.inner.config.calendar;
        self.blocking(move |db| {
            let metadata = db
                .counter(&counter)?
                .ok_or_else(|| StoreError::CounterNotFound(counter.clone()))?;
            let interval = interval.unwrap_or_else(|| metadata.interval.chart_interval());
            let window = BucketWindow::new(
                calendar,
                interval,
                db.least_recent_entry(&counter)?,
                db.most_recent_entry(&counter)?,
                now,
            );
            let since = window.bucket_range(0).start;
            let until = window.bucket_range(window.bucket_count() - 1).end;
            let entries = db.entries_in_range(&counter, since, until)?;
            let counts = window.tally(&entries);
            Ok(ChartData { window, counts })
        })
        .await
    }

    /// Runs `op` and recomputes the summary in one database session, then publishes it.
    ///
    /// The caller must hold the counter's key lock.
    async fn apply<T, F>(
        &self,
        cell: &Arc<SummaryCell>,
        name: &CounterName,
        op: F,
    ) -> Result<(T, Arc<CounterSummary>), StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> Result<T, StoreError> + Send + 'static,
    {
        let calendar = self.inner.config.calendar;
        let (value, token, summary) = self
            .blocking({
                let cell = Arc::clone(cell);
                let name = name.clone();
                move |db| {
                    let value = op(db)?;
                    let token = cell.next_token();
                    let summary = summarize(db, &calendar, &name)?;
                    Ok((value, token, summary))
                }
            })
            .await?;
        Ok((value, self.publish(cell, token, summary)))
    }

    async fn recompute(
        &self,
        cell: &Arc<SummaryCell>,
        name: &CounterName,
    ) -> Result<(u64, CounterSummary), StoreError> {
        let calendar = self.inner.config.calendar;
        let cell = Arc::clone(cell);
        let name = name.clone();
        self.blocking(move |db| {
            let token = cell.next_token();
            Ok((token, summarize(db, &calendar, &name)?))
        })
        .await
    }

    /// Publishes a computed summary and queues its notification.
    pub(crate) fn publish(
        &self,
        cell: &Arc<SummaryCell>,
        token: u64,
        summary: CounterSummary,
    ) -> Arc<CounterSummary> {
        let summary = Arc::new(summary);
        let accepted = cell.publish(token, Arc::clone(&summary), |published| {
            self.send_event(Event::SummaryChanged(published), Some(cell));
        });
        if !accepted {
            warn!(counter = %summary.name, token, "discarded stale summary");
        }
        summary
    }

    pub(crate) async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> Result<T, StoreError> + Send + 'static,
    {
        run_blocking(&self.inner.db, f).await
    }

    pub(crate) async fn lock_names(&self, names: &[CounterName]) -> Vec<KeyGuard<'_>> {
        self.inner.locks.lock_all(names).await
    }

    pub(crate) fn cell(&self, name: &CounterName) -> Result<Arc<SummaryCell>, StoreError> {
        self.read_cells()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::CounterNotFound(name.clone()))
    }

    fn read_cells(&self) -> RwLockReadGuard<'_, HashMap<CounterName, Arc<SummaryCell>>> {
        self.inner
            .cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_cells(&self) -> RwLockWriteGuard<'_, HashMap<CounterName, Arc<SummaryCell>>> {
        self.inner
            .cells
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn send_event(&self, event: Event, cell: Option<&Arc<SummaryCell>>) {
        self.send(Dispatch::Event {
            event,
            cell: cell.cloned(),
        });
    }

    fn send(&self, message: Dispatch) {
        if self.inner.dispatch.send(message).is_err() {
            debug!("dispatcher stopped, notification dropped");
        }
    }
}

async fn run_blocking<T, F>(db: &Arc<Mutex<Database>>, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&mut Database) -> Result<T, StoreError> + Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || {
        let mut db = db.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut db)
    })
    .await?
}

/// Reads a counter's metadata and entries and computes its summary as of now.
pub(crate) fn summarize(
    db: &Database,
    calendar: &Calendar,
    name: &CounterName,
) -> Result<CounterSummary, StoreError> {
    let metadata = db
        .counter(name)?
        .ok_or_else(|| StoreError::CounterNotFound(name.clone()))?;
    let entries = db.entries(name)?;
    Ok(CounterSummary::compute(&metadata, &entries, calendar, Utc::now()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn name(s: &str) -> CounterName {
        CounterName::new(s).unwrap()
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    /// Records notifications as short strings.
    #[derive(Default)]
    pub(crate) struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        pub(crate) fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl CounterObserver for Recorder {
        fn on_initial_counters_loaded(&self) {
            self.push("loaded".to_string());
        }

        fn on_counter_added(&self, name: &CounterName) {
            self.push(format!("added {name}"));
        }

        fn on_counter_removed(&self, name: &CounterName) {
            self.push(format!("removed {name}"));
        }

        fn on_counter_renamed(&self, old: &CounterName, new: &CounterName) {
            self.push(format!("renamed {old} -> {new}"));
        }

        fn on_counter_decremented(&self, name: &CounterName, _removed: DateTime<Utc>) {
            self.push(format!("decremented {name}"));
        }

        fn on_summary_changed(&self, summary: &CounterSummary) {
            self.push(format!("summary {} {}", summary.name, summary.total_count));
        }
    }

    pub(crate) fn config() -> StoreConfig {
        StoreConfig {
            calendar: Calendar::utc(),
            ..StoreConfig::default()
        }
    }

    pub(crate) async fn observed_store() -> (StateStore, Arc<Recorder>) {
        let store = StateStore::open(Database::open_in_memory().unwrap(), config())
            .await
            .unwrap();
        store.wait_until_loaded().await;
        let recorder = Arc::new(Recorder::default());
        store.observe(recorder.clone());
        store.flush().await;
        recorder.take();
        (store, recorder)
    }

    async fn with_counter(store: &StateStore, recorder: &Recorder, counter: &str) {
        store
            .add_counter(CounterMetadata::new(name(counter)))
            .await
            .unwrap();
        store.flush().await;
        recorder.take();
    }

    fn total(store: &StateStore, counter: &str) -> usize {
        store.summary(&name(counter)).unwrap().unwrap().total_count
    }

    #[tokio::test]
    async fn add_counter_announces_cell_before_first_summary() {
        let (store, recorder) = observed_store().await;
        let summary = store
            .add_counter(CounterMetadata::new(name("water")))
            .await
            .unwrap();
        assert_eq!(summary.total_count, 0);
        store.flush().await;
        assert_eq!(recorder.take(), vec!["added water", "summary water 0"]);
        assert!(store.counter_exists(&name("water")));
    }

    #[tokio::test]
    async fn add_counter_rejects_duplicates_and_invalid_metadata() {
        let (store, recorder) = observed_store().await;
        with_counter(&store, &recorder, "water").await;

        let err = store
            .add_counter(CounterMetadata::new(name("water")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NameConflict(_)));

        let mut bad = CounterMetadata::new(name("tea"));
        bad.step = 0;
        let err = store.add_counter(bad).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(!store.counter_exists(&name("tea")));
    }

    #[tokio::test]
    async fn increment_and_decrement_on_one_counter_publish_in_issue_order() {
        let (store, recorder) = observed_store().await;
        with_counter(&store, &recorder, "x").await;
        let x = name("x");

        let (inc, dec) = tokio::join!(store.increment(&x), store.decrement(&x));
        assert_eq!(inc.unwrap().total_count, 1);
        assert!(dec.unwrap().is_some());
        store.flush().await;

        let summaries: Vec<String> = recorder
            .take()
            .into_iter()
            .filter(|e| e.starts_with("summary"))
            .collect();
        assert_eq!(summaries, vec!["summary x 1", "summary x 0"]);
        assert_eq!(total(&store, "x"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_interleave_on_one_counter() {
        let (store, recorder) = observed_store().await;
        with_counter(&store, &recorder, "x").await;

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let x = name("x");
                for _ in 0..5 {
                    store.increment(&x).await.unwrap();
                    assert!(store.decrement(&x).await.unwrap().is_some());
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        store.flush().await;

        assert_eq!(total(&store, "x"), 0);
        let totals: Vec<i64> = recorder
            .take()
            .iter()
            .filter_map(|e| e.strip_prefix("summary x "))
            .map(|n| n.parse().unwrap())
            .collect();
        assert_eq!(totals.len(), 160);
        assert!(totals.windows(2).all(|w| (w[0] - w[1]).abs() == 1));
        assert_eq!(totals.last(), Some(&0));
    }

    #[tokio::test]
    async fn different_counters_are_independent() {
        let (store, recorder) = observed_store().await;
        with_counter(&store, &recorder, "a").await;
        with_counter(&store, &recorder, "b").await;

        let (a, b) = (name("a"), name("b"));
        let (first, second) = tokio::join!(store.increment(&a), store.increment(&b));
        first.unwrap();
        second.unwrap();
        assert_eq!(total(&store, "a"), 1);
        assert_eq!(total(&store, "b"), 1);
    }

    #[tokio::test]
    async fn increment_records_step_entries() {
        let (store, recorder) = observed_store().await;
        with_counter(&store, &recorder, "pushups").await;
        let mut meta = store.metadata(&name("pushups")).await.unwrap();
        meta.step = 3;
        store.update_metadata(meta).await.unwrap();

        assert_eq!(store.increment(&name("pushups")).await.unwrap().total_count, 3);
        store.decrement(&name("pushups")).await.unwrap();
        assert_eq!(total(&store, "pushups"), 2);
    }

    #[tokio::test]
    async fn concurrent_edits_keep_both_changes() {
        let (store, recorder) = observed_store().await;
        with_counter(&store, &recorder, "water").await;
        let water = name("water");

        let (goal, category) = tokio::join!(
            store.edit_metadata(&water, |meta| meta.goal = 8),
            store.edit_metadata(&water, |meta| meta.category = "Health".to_string()),
        );
        goal.unwrap();
        let latest = category.unwrap();
        assert_eq!(latest.goal, 8);
        assert_eq!(latest.category, "Health");

        let stored = store.metadata(&water).await.unwrap();
        assert_eq!(stored.goal, 8);
        assert_eq!(stored.category, "Health");
    }

    #[tokio::test]
    async fn edit_keeps_the_name() {
        let (store, recorder) = observed_store().await;
        with_counter(&store, &recorder, "water").await;
        store
            .edit_metadata(&name("water"), |meta| {
                meta.name = name("juice");
                meta.goal = 2;
            })
            .await
            .unwrap();
        assert!(!store.counter_exists(&name("juice")));
        assert_eq!(store.metadata(&name("water")).await.unwrap().goal, 2);
    }

    #[tokio::test]
    async fn edit_of_missing_counter_fails() {
        let (store, _recorder) = observed_store().await;
        let err = store
            .edit_metadata(&name("nope"), |meta| meta.goal = 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CounterNotFound(_)));
    }

    #[tokio::test]
    async fn finished_operations_release_name_locks() {
        let (store, recorder) = observed_store().await;
        with_counter(&store, &recorder, "a").await;
        let (a, missing) = (name("a"), name("missing"));

        let (inc, err) = tokio::join!(store.increment(&a), store.increment(&missing));
        inc.unwrap();
        assert!(err.is_err());
        assert_eq!(store.inner.locks.len(), 0);

        store.rename(&a, &name("b")).await.unwrap();
        assert_eq!(store.inner.locks.len(), 0);
        store.delete_counter(&name("b")).await.unwrap();
        assert_eq!(store.inner.locks.len(), 0);
    }

    #[tokio::test]
    async fn decrement_on_empty_counter_removes_nothing() {
        let (store, recorder) = observed_store().await;
        with_counter(&store, &recorder, "x").await;
        assert_eq!(store.decrement(&name("x")).await.unwrap(), None);
        store.flush().await;
        assert_eq!(recorder.take(), vec!["summary x 0"]);
    }

    #[tokio::test]
    async fn decrement_within_only_removes_recent_entries() {
        let (store, recorder) = observed_store().await;
        with_counter(&store, &recorder, "x").await;
        let x = name("x");

        store
            .increment_at(&x, Utc::now() - Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(
            store.decrement_within(&x, Duration::minutes(5)).await.unwrap(),
            None
        );
        assert_eq!(total(&store, "x"), 1);

        store.increment(&x).await.unwrap();
        assert!(
            store
                .decrement_within(&x, Duration::minutes(5))
                .await
                .unwrap()
                .is_some()
        );
        assert_eq!(total(&store, "x"), 1);
        store.flush().await;
        assert!(recorder.take().contains(&"decremented x".to_string()));
    }

    #[tokio::test]
    async fn reset_keeps_counter() {
        let (store, recorder) = observed_store().await;
        with_counter(&store, &recorder, "x").await;
        store.increment(&name("x")).await.unwrap();
        store.increment(&name("x")).await.unwrap();

        assert_eq!(store.reset_counter(&name("x")).await.unwrap(), 2);
        assert_eq!(total(&store, "x"), 0);
        assert!(store.counter_exists(&name("x")));
    }

    #[tokio::test]
    async fn rename_announces_new_name_with_state() {
        let (store, recorder) = observed_store().await;
        with_counter(&store, &recorder, "old").await;
        store.increment(&name("old")).await.unwrap();
        store.flush().await;
        recorder.take();

        let summary = store.rename(&name("old"), &name("new")).await.unwrap();
        assert_eq!(summary.name, name("new"));
        assert_eq!(summary.total_count, 1);
        store.flush().await;

        assert_eq!(recorder.take(), vec!["renamed old -> new", "summary new 1"]);
        assert!(matches!(
            store.summary(&name("old")),
            Err(StoreError::CounterNotFound(_))
        ));
        assert_eq!(total(&store, "new"), 1);
        assert_eq!(store.counter_names().await.unwrap(), vec![name("new")]);
    }

    #[tokio::test]
    async fn rename_keeps_watchers_attached() {
        let (store, recorder) = observed_store().await;
        with_counter(&store, &recorder, "old").await;
        let rx = store.watch(&name("old")).unwrap();

        store.rename(&name("old"), &name("new")).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow().as_ref().unwrap().name, name("new"));
    }

    #[tokio::test]
    async fn rename_to_existing_name_changes_nothing() {
        let (store, recorder) = observed_store().await;
        with_counter(&store, &recorder, "a").await;
        with_counter(&store, &recorder, "b").await;
        store.increment(&name("a")).await.unwrap();
        store.flush().await;
        recorder.take();

        let err = store.rename(&name("a"), &name("b")).await.unwrap_err();
        assert!(matches!(err, StoreError::NameConflict(n) if n == name("b")));
        let err = store.rename(&name("a"), &name("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::NameConflict(_)));

        store.flush().await;
        assert!(recorder.take().is_empty());
        assert_eq!(total(&store, "a"), 1);
        assert_eq!(total(&store, "b"), 0);
        assert_eq!(
            store.counter_names().await.unwrap(),
            vec![name("a"), name("b")]
        );
    }

    #[tokio::test]
    async fn deleted_counter_rejects_further_mutations() {
        let (store, recorder) = observed_store().await;
        with_counter(&store, &recorder, "x").await;
        store.increment(&name("x")).await.unwrap();
        store.flush().await;
        recorder.take();

        assert_eq!(store.delete_counter(&name("x")).await.unwrap(), 1);
        store.flush().await;
        assert_eq!(recorder.take(), vec!["removed x"]);

        assert!(matches!(
            store.increment(&name("x")).await,
            Err(StoreError::CounterNotFound(_))
        ));
        assert!(matches!(
            store.decrement(&name("x")).await,
            Err(StoreError::CounterNotFound(_))
        ));
        assert!(matches!(
            store.delete_counter(&name("x")).await,
            Err(StoreError::CounterNotFound(_))
        ));

        // Re-adding starts from scratch.
        store
            .add_counter(CounterMetadata::new(name("x")))
            .await
            .unwrap();
        assert_eq!(total(&store, "x"), 0);
    }

    #[derive(Default)]
    struct Unsubscriber {
        handle: Mutex<Option<(StateStore, ObserverId)>>,
        calls: AtomicUsize,
    }

    impl CounterObserver for Unsubscriber {
        fn on_summary_changed(&self, _summary: &CounterSummary) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((store, id)) = self.handle.lock().unwrap().take() {
                assert!(store.unobserve(id));
            }
        }
    }

    #[tokio::test]
    async fn observer_may_unregister_itself_during_callback() {
        let (store, recorder) = observed_store().await;
        let quitter = Arc::new(Unsubscriber::default());
        let id = store.observe(quitter.clone());
        *quitter.handle.lock().unwrap() = Some((store.clone(), id));

        with_counter(&store, &recorder, "x").await;
        store.increment(&name("x")).await.unwrap();
        store.increment(&name("x")).await.unwrap();
        store.flush().await;

        assert_eq!(quitter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.take(), vec!["summary x 1", "summary x 2"]);
        assert!(!store.unobserve(id));
    }

    #[tokio::test]
    async fn initial_load_notifies_each_observer_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.db");
        {
            let mut db = Database::open(&path).unwrap();
            db.insert_counter(&CounterMetadata::new(name("water")))
                .unwrap();
            db.bulk_insert(&[
                Entry::new(name("water"), at("2024-01-01T08:00:00Z")),
                Entry::new(name("water"), at("2024-01-02T08:00:00Z")),
            ])
            .unwrap();
        }

        let store = StateStore::open(Database::open(&path).unwrap(), config())
            .await
            .unwrap();
        assert!(store.counter_exists(&name("water")));
        let early = Arc::new(Recorder::default());
        store.observe(early.clone());
        store.wait_until_loaded().await;
        store.flush().await;

        let loaded = early.take().iter().filter(|e| *e == "loaded").count();
        assert_eq!(loaded, 1);
        assert_eq!(total(&store, "water"), 2);

        let late = Arc::new(Recorder::default());
        store.observe(late.clone());
        store.flush().await;
        assert_eq!(late.take(), vec!["loaded"]);
        assert!(early.take().is_empty());
    }

    #[tokio::test]
    async fn refresh_all_republishes_every_counter() {
        let (store, recorder) = observed_store().await;
        with_counter(&store, &recorder, "b").await;
        with_counter(&store, &recorder, "a").await;

        store.refresh_all().await.unwrap();
        store.flush().await;
        assert_eq!(recorder.take(), vec!["summary a 0", "summary b 0"]);
    }

    #[tokio::test]
    async fn chart_counts_entries_per_bucket() {
        let (store, recorder) = observed_store().await;
        with_counter(&store, &recorder, "coffee").await;
        let coffee = name("coffee");
        for t in [
            "2024-01-01T08:00:00Z",
            "2024-01-01T14:00:00Z",
            "2024-01-03T09:00:00Z",
        ] {
            store.increment_at(&coffee, at(t)).await.unwrap();
        }

        let chart = store
            .chart(&coffee, None, at("2024-01-04T12:00:00Z"))
            .await
            .unwrap();
        assert_eq!(chart.window.interval(), Interval::Day);
        assert_eq!(chart.counts, vec![2, 0, 1, 0]);

        let weekly = store
            .chart(&coffee, Some(Interval::Week), at("2024-01-04T12:00:00Z"))
            .await
            .unwrap();
        assert_eq!(weekly.counts, vec![3]);

        let range = chart.window.bucket_range(0);
        let entries = store
            .entries_in_range(&coffee, range.start, range.end)
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn reorder_and_categories() {
        let (store, _recorder) = observed_store().await;
        for (counter, category) in [("a", "work"), ("b", "health"), ("c", "work")] {
            store
                .add_counter(CounterMetadata::new(name(counter)).with_category(category))
                .await
                .unwrap();
        }
        store
            .reorder(vec![name("c"), name("a"), name("c")])
            .await
            .unwrap();
        assert_eq!(
            store.counter_names().await.unwrap(),
            vec![name("c"), name("a"), name("b")]
        );
        let names: Vec<_> = store
            .summaries()
            .await
            .unwrap()
            .iter()
            .map(|s| s.name.clone())
            .collect();
        assert_eq!(names, vec![name("c"), name("a"), name("b")]);
        assert_eq!(store.categories().await.unwrap(), vec!["health", "work"]);
    }

    #[tokio::test]
    async fn close_delivers_pending_notifications() {
        let (store, recorder) = observed_store().await;
        store
            .add_counter(CounterMetadata::new(name("x")))
            .await
            .unwrap();
        store.close().await;
        assert_eq!(recorder.take(), vec!["added x", "summary x 0"]);
    }
}
