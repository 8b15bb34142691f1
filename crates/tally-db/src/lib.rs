//! Storage layer for tally.
//!
//! Persists counter metadata and entries using `rusqlite`.
//!
//! # Thread Safety
//!
//! The [`Database`] type wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! A `Database` can be moved between threads but must be wrapped in a `Mutex` to be
//! shared. The async state store does exactly that and only touches it from blocking
//! worker threads.
//!
//! # Schema
//!
//! ## Timestamp Format
//!
//! Entry timestamps are stored as INTEGER epoch milliseconds, the same unit the
//! transfer format uses, so range scans are plain integer comparisons on an index.
//!
//! ## Counter Order
//!
//! The `position` column holds the user's display order. New counters are appended
//! at the end; [`Database::set_order`] rewrites it.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use tally_core::{CounterKind, CounterMetadata, CounterName, Entry, Interval};
use thiserror::Error;
use tracing::debug;

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored value could not be decoded.
    #[error("invalid {column} for counter {counter}: {message}")]
    InvalidColumn {
        counter: String,
        column: &'static str,
        message: String,
    },
    /// A counter with this name already exists.
    #[error("counter already exists: {0}")]
    CounterExists(CounterName),
    /// No counter with this name exists.
    #[error("counter not found: {0}")]
    CounterNotFound(CounterName),
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        debug!(path = %path.display(), "opened database");
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS counters (
                name TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                interval TEXT NOT NULL,
                goal INTEGER NOT NULL DEFAULT 0,
                color TEXT NOT NULL,
                category TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'standard',
                formula TEXT,
                step INTEGER NOT NULL DEFAULT 1
            );

            -- timestamp_ms: epoch milliseconds, duplicates allowed
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                counter TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_entries_counter_time
                ON entries(counter, timestamp_ms);
            ",
        )?;
        Ok(())
    }

    /// Adds a counter at the end of the display order.
    pub fn insert_counter(&mut self, metadata: &CounterMetadata) -> Result<(), DbError> {
        let tx = self.conn.transaction()?;
        insert_counter_tx(&tx, metadata)?;
        tx.commit()?;
        Ok(())
    }

    /// Replaces the settings of an existing counter. The name is the key and is not changed.
    pub fn update_counter(&mut self, metadata: &CounterMetadata) -> Result<(), DbError> {
        let updated = update_counter_stmt(&self.conn, metadata)?;
        if updated == 0 {
            return Err(DbError::CounterNotFound(metadata.name.clone()));
        }
        Ok(())
    }

    /// Removes a counter and all of its entries.
    pub fn delete_counter(&mut self, name: &CounterName) -> Result<usize, DbError> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute("DELETE FROM counters WHERE name = ?", [name.as_str()])?;
        if removed == 0 {
            return Err(DbError::CounterNotFound(name.clone()));
        }
        let entries = tx.execute("DELETE FROM entries WHERE counter = ?", [name.as_str()])?;
        tx.commit()?;
        debug!(counter = %name, entries, "deleted counter");
        Ok(entries)
    }

    /// Renames a counter together with its entries, keeping its display position.
    pub fn rename_counter(&mut self, old: &CounterName, new: &CounterName) -> Result<(), DbError> {
        let tx = self.conn.transaction()?;
        if counter_exists_tx(&tx, new)? {
            return Err(DbError::CounterExists(new.clone()));
        }
        let renamed = tx.execute(
            "UPDATE counters SET name = ? WHERE name = ?",
            [new.as_str(), old.as_str()],
        )?;
        if renamed == 0 {
            return Err(DbError::CounterNotFound(old.clone()));
        }
        rename_entries_tx(&tx, old, new)?;
        tx.commit()?;
        Ok(())
    }

    /// Moves entries from one counter name to another without touching metadata.
    pub fn rename_entries(&mut self, old: &CounterName, new: &CounterName) -> Result<usize, DbError> {
        let tx = self.conn.transaction()?;
        let moved = rename_entries_tx(&tx, old, new)?;
        tx.commit()?;
        Ok(moved)
    }

    pub fn counter_exists(&self, name: &CounterName) -> Result<bool, DbError> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM counters WHERE name = ?)",
            [name.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Loads the metadata of one counter.
    pub fn counter(&self, name: &CounterName) -> Result<Option<CounterMetadata>, DbError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {COUNTER_COLUMNS} FROM counters WHERE name = ?"),
                [name.as_str()],
                CounterRow::from_row,
            )
            .optional()?;
        row.map(CounterRow::into_metadata).transpose()
    }

    /// Lists all counters in display order.
    pub fn list_counters(&self) -> Result<Vec<CounterMetadata>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COUNTER_COLUMNS} FROM counters ORDER BY position ASC, name ASC"
        ))?;
        let rows = stmt.query_map([], CounterRow::from_row)?;
        let mut counters = Vec::new();
        for row in rows {
            counters.push(row?.into_metadata()?);
        }
        Ok(counters)
    }

    /// Counter names in display order.
    pub fn counter_names(&self) -> Result<Vec<CounterName>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM counters ORDER BY position ASC, name ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            let name = row?;
            names.push(decode_name(name)?);
        }
        Ok(names)
    }

    /// Rewrites the display order.
    ///
    /// Listed counters come first in the given order; unlisted ones keep their relative
    /// order after them. Unknown names are ignored.
    pub fn set_order(&mut self, names: &[CounterName]) -> Result<(), DbError> {
        let mut ordered: Vec<CounterName> = Vec::new();
        for name in names {
            if !ordered.contains(name) {
                ordered.push(name.clone());
            }
        }
        for name in self.counter_names()? {
            if !ordered.contains(&name) {
                ordered.push(name);
            }
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE counters SET position = ? WHERE name = ?")?;
            for (position, name) in ordered.iter().enumerate() {
                stmt.execute(params![to_sql_int(position), name.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Distinct categories in use, sorted.
    pub fn categories(&self) -> Result<Vec<String>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT category FROM counters ORDER BY category ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut categories = Vec::new();
        for row in rows {
            categories.push(row?);
        }
        Ok(categories)
    }

    pub fn insert_entry(&mut self, entry: &Entry) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO entries (counter, timestamp_ms) VALUES (?, ?)",
            params![entry.counter.as_str(), entry.timestamp.timestamp_millis()],
        )?;
        Ok(())
    }

    /// Inserts many entries in one transaction.
    pub fn bulk_insert(&mut self, entries: &[Entry]) -> Result<usize, DbError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let inserted = insert_entries_tx(&tx, entries)?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Applies a parsed import in one transaction.
    ///
    /// `created` counters are inserted, `updated` counters get their settings replaced
    /// and all `entries` are appended. Nothing is written if any step fails.
    pub fn apply_import(
        &mut self,
        created: &[CounterMetadata],
        updated: &[CounterMetadata],
        entries: &[Entry],
    ) -> Result<usize, DbError> {
        let tx = self.conn.transaction()?;
        for metadata in created {
            insert_counter_tx(&tx, metadata)?;
        }
        for metadata in updated {
            if update_counter_stmt(&tx, metadata)? == 0 {
                return Err(DbError::CounterNotFound(metadata.name.clone()));
            }
        }
        let inserted = insert_entries_tx(&tx, entries)?;
        tx.commit()?;
        debug!(
            created = created.len(),
            updated = updated.len(),
            inserted,
            "applied import"
        );
        Ok(inserted)
    }

    /// Removes the most recent entry of a counter, returning its timestamp.
    pub fn delete_most_recent_entry(
        &mut self,
        name: &CounterName,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        self.delete_most_recent_entry_since(name, DateTime::<Utc>::MIN_UTC)
    }

    /// Removes the most recent entry if it is not older than `since`.
    pub fn delete_most_recent_entry_since(
        &mut self,
        name: &CounterName,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let tx = self.conn.transaction()?;
        let newest: Option<(i64, i64)> = tx
            .query_row(
                "
                SELECT id, timestamp_ms FROM entries
                WHERE counter = ?
                ORDER BY timestamp_ms DESC, id DESC
                LIMIT 1
                ",
                [name.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((id, millis)) = newest else {
            return Ok(None);
        };
        if millis < since.timestamp_millis() {
            return Ok(None);
        }
        tx.execute("DELETE FROM entries WHERE id = ?", [id])?;
        tx.commit()?;
        decode_timestamp(name, millis).map(Some)
    }

    /// Removes every entry of a counter.
    pub fn delete_all_entries(&mut self, name: &CounterName) -> Result<usize, DbError> {
        let removed = self
            .conn
            .execute("DELETE FROM entries WHERE counter = ?", [name.as_str()])?;
        Ok(removed)
    }

    /// All entries of a counter, ascending by timestamp.
    pub fn entries(&self, name: &CounterName) -> Result<Vec<Entry>, DbError> {
        self.entries_in_range(name, DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)
    }

    /// Entries in `[since, until)`, ascending by timestamp.
    pub fn entries_in_range(
        &self,
        name: &CounterName,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Entry>, DbError> {
        if until <= since {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "
            SELECT timestamp_ms FROM entries
            WHERE counter = ? AND timestamp_ms >= ? AND timestamp_ms < ?
            ORDER BY timestamp_ms ASC, id ASC
            ",
        )?;
        let rows = stmt.query_map(
            params![
                name.as_str(),
                since.timestamp_millis(),
                // MAX_UTC itself would be excluded by the half-open bound.
                if until == DateTime::<Utc>::MAX_UTC {
                    i64::MAX
                } else {
                    until.timestamp_millis()
                }
            ],
            |row| row.get::<_, i64>(0),
        )?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(Entry::new(name.clone(), decode_timestamp(name, row?)?));
        }
        Ok(entries)
    }

    pub fn entry_count(&self, name: &CounterName) -> Result<usize, DbError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE counter = ?",
            [name.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub fn most_recent_entry(&self, name: &CounterName) -> Result<Option<DateTime<Utc>>, DbError> {
        self.boundary_entry(name, "MAX")
    }

    pub fn least_recent_entry(&self, name: &CounterName) -> Result<Option<DateTime<Utc>>, DbError> {
        self.boundary_entry(name, "MIN")
    }

    fn boundary_entry(
        &self,
        name: &CounterName,
        aggregate: &str,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let millis: Option<i64> = self.conn.query_row(
            &format!("SELECT {aggregate}(timestamp_ms) FROM entries WHERE counter = ?"),
            [name.as_str()],
            |row| row.get(0),
        )?;
        millis.map(|ms| decode_timestamp(name, ms)).transpose()
    }
}

const COUNTER_COLUMNS: &str = "name, interval, goal, color, category, kind, formula, step";

/// A `counters` row before its text columns are decoded.
#[derive(Debug)]
struct CounterRow {
    name: String,
    interval: String,
    goal: i64,
    color: String,
    category: String,
    kind: String,
    formula: Option<String>,
    step: i64,
}

impl CounterRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            interval: row.get(1)?,
            goal: row.get(2)?,
            color: row.get(3)?,
            category: row.get(4)?,
            kind: row.get(5)?,
            formula: row.get(6)?,
            step: row.get(7)?,
        })
    }

    fn into_metadata(self) -> Result<CounterMetadata, DbError> {
        let invalid = |column: &'static str, message: String| DbError::InvalidColumn {
            counter: self.name.clone(),
            column,
            message,
        };
        let interval: Interval = self
            .interval
            .parse()
            .map_err(|err: tally_core::UnknownInterval| invalid("interval", err.to_string()))?;
        let goal = u32::try_from(self.goal).map_err(|err| invalid("goal", err.to_string()))?;
        let color = self
            .color
            .parse()
            .map_err(|err: tally_core::ValidationError| invalid("color", err.to_string()))?;
        let kind: CounterKind = self
            .kind
            .parse()
            .map_err(|err: tally_core::ValidationError| invalid("kind", err.to_string()))?;
        let step = u32::try_from(self.step).map_err(|err| invalid("step", err.to_string()))?;
        let name = decode_name(self.name.clone())?;

        Ok(CounterMetadata {
            name,
            interval,
            goal,
            color,
            category: self.category,
            kind,
            formula: self.formula,
            step,
        })
    }
}

fn insert_counter_tx(tx: &Transaction<'_>, metadata: &CounterMetadata) -> Result<(), DbError> {
    if counter_exists_tx(tx, &metadata.name)? {
        return Err(DbError::CounterExists(metadata.name.clone()));
    }
    let next_position: i64 = tx.query_row(
        "SELECT COALESCE(MAX(position) + 1, 0) FROM counters",
        [],
        |row| row.get(0),
    )?;
    tx.execute(
        "
        INSERT INTO counters (name, position, interval, goal, color, category, kind, formula, step)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
        params![
            metadata.name.as_str(),
            next_position,
            metadata.interval.as_str(),
            metadata.goal,
            metadata.color.to_string(),
            metadata.category,
            metadata.kind.as_str(),
            metadata.formula,
            metadata.step,
        ],
    )?;
    Ok(())
}

fn update_counter_stmt(conn: &Connection, metadata: &CounterMetadata) -> Result<usize, DbError> {
    let updated = conn.execute(
        "
        UPDATE counters
        SET interval = ?, goal = ?, color = ?, category = ?, kind = ?, formula = ?, step = ?
        WHERE name = ?
        ",
        params![
            metadata.interval.as_str(),
            metadata.goal,
            metadata.color.to_string(),
            metadata.category,
            metadata.kind.as_str(),
            metadata.formula,
            metadata.step,
            metadata.name.as_str(),
        ],
    )?;
    Ok(updated)
}

fn counter_exists_tx(conn: &Connection, name: &CounterName) -> Result<bool, DbError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM counters WHERE name = ?)",
        [name.as_str()],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn rename_entries_tx(
    tx: &Transaction<'_>,
    old: &CounterName,
    new: &CounterName,
) -> Result<usize, DbError> {
    let moved = tx.execute(
        "UPDATE entries SET counter = ? WHERE counter = ?",
        [new.as_str(), old.as_str()],
    )?;
    Ok(moved)
}

fn insert_entries_tx(tx: &Transaction<'_>, entries: &[Entry]) -> Result<usize, DbError> {
    let mut stmt = tx.prepare("INSERT INTO entries (counter, timestamp_ms) VALUES (?, ?)")?;
    let mut inserted = 0;
    for entry in entries {
        inserted += stmt.execute(params![
            entry.counter.as_str(),
            entry.timestamp.timestamp_millis()
        ])?;
    }
    Ok(inserted)
}

fn decode_name(name: String) -> Result<CounterName, DbError> {
    CounterName::new(name.clone()).map_err(|err| DbError::InvalidColumn {
        counter: name,
        column: "name",
        message: err.to_string(),
    })
}

fn decode_timestamp(name: &CounterName, millis: i64) -> Result<DateTime<Utc>, DbError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| DbError::InvalidColumn {
        counter: name.to_string(),
        column: "timestamp_ms",
        message: format!("{millis} is out of range"),
    })
}

fn to_sql_int(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
