//! Database layer for the wiki mirror, backed by redb.

/// Append-only activity storage (votes, revisions, users).
pub mod activity;
/// Owner lock helpers.
pub mod lock;
/// Page identity, temporal versions and attributions.
pub mod pages;
/// Dirty-page work queue.
pub mod queue;
/// Derived aggregate storage.
pub mod stats;
/// redb table definitions.
pub mod tables;
/// Batch-task watermarks.
pub mod tasks;
/// Atomic cross-table operations.
pub mod transactions;

use crate::error::AppError;
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Arc;

pub use pages::{IntegrityDefect, RepairReport, SupersedeOutcome};
pub use queue::QueueCounts;
pub use transactions::TransactionOps;

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, AppError> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, AppError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Database handle with per-concern table accessors.
pub struct Database {
    pub db: Arc<redb::Database>,
    pub pages: pages::PageDb,
    pub activity: activity::ActivityDb,
    pub queue: queue::DirtyQueueDb,
    pub stats: stats::StatsDb,
    pub tasks: tasks::TaskDb,
}

#[cfg(test)]
mod tests;

impl Database {
    /// Build a database handle from an already-open redb instance.
    ///
    /// # Returns
    /// A new [`Database`] wrapper sharing the underlying redb instance.
    ///
    /// # Errors
    /// Returns an error if table initialization fails.
    pub fn from_shared(db: Arc<redb::Database>) -> Result<Self, AppError> {
        Ok(Self {
            pages: pages::PageDb::new(db.clone())?,
            activity: activity::ActivityDb::new(db.clone())?,
            queue: queue::DirtyQueueDb::new(db.clone())?,
            stats: stats::StatsDb::new(db.clone())?,
            tasks: tasks::TaskDb::new(db.clone())?,
            db,
        })
    }

    /// Clone this handle for another worker in the same process.
    ///
    /// # Errors
    /// Returns an error if table initialization fails.
    pub fn share(&self) -> Result<Self, AppError> {
        Self::from_shared(self.db.clone())
    }

    /// Open (or create) the database in directory `path`.
    ///
    /// # Returns
    /// A fully initialized [`Database`].
    ///
    /// # Errors
    /// Returns [`AppError::StorageMessage`] when `path` is not a directory and
    /// [`AppError::Locked`] when another process has the file open.
    pub fn new(path: &str) -> Result<Self, AppError> {
        let dir = Path::new(path);
        if dir.exists() && !dir.is_dir() {
            return Err(AppError::StorageMessage(format!(
                "Database path '{}' exists and is not a directory",
                dir.display()
            )));
        }
        std::fs::create_dir_all(dir)?;
        let file = dir.join(tables::REDB_FILE_NAME);
        let db = match redb::Database::create(&file) {
            Ok(db) => db,
            Err(redb::DatabaseError::DatabaseAlreadyOpen) => {
                return Err(AppError::Locked(format!(
                    "Database '{}' is already open in another process",
                    file.display()
                )));
            }
            Err(err) => return Err(err.into()),
        };
        tracing::debug!(path = %file.display(), "Opened database");
        Self::from_shared(Arc::new(db))
    }
}
