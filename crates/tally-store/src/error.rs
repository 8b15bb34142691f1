use std::io;

use tally_core::{CounterName, ParseError, ReadError, ValidationError};
use tally_db::DbError;
use thiserror::Error;

/// Errors surfaced by [`StateStore`](crate::StateStore) operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The target name is already taken by another counter.
    #[error("a counter named {0} already exists")]
    NameConflict(CounterName),

    #[error("counter not found: {0}")]
    CounterNotFound(CounterName),

    /// A malformed import line. Nothing was written.
    #[error("import aborted: {0}")]
    ImportParse(#[from] ParseError),

    #[error("stream I/O failed: {0}")]
    StreamIo(#[from] io::Error),

    #[error(transparent)]
    Db(DbError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::CounterExists(name) => Self::NameConflict(name),
            DbError::CounterNotFound(name) => Self::CounterNotFound(name),
            other => Self::Db(other),
        }
    }
}

impl From<ReadError> for StoreError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Io(err) => Self::StreamIo(err),
            ReadError::Parse(err) => Self::ImportParse(err),
        }
    }
}
