//! Batch-task watermarks.

use super::tables::TASK_WATERMARKS;
use super::{decode, encode};
use crate::error::AppError;
use crate::models::stats::TaskWatermark;
use redb::{ReadableDatabase, ReadableTable};
use std::sync::Arc;

/// Accessor for the watermark table.
pub struct TaskDb {
    db: Arc<redb::Database>,
}

impl TaskDb {
    /// Initialize the watermark table if it does not exist yet.
    ///
    /// # Errors
    /// Returns an error when redb transaction/table initialization fails.
    pub fn new(db: Arc<redb::Database>) -> Result<Self, AppError> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(TASK_WATERMARKS)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Insert or overwrite the watermark for `mark.task`.
    pub fn set(&self, mark: &TaskWatermark) -> Result<(), AppError> {
        let encoded = encode(mark)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TASK_WATERMARKS)?;
            table.insert(mark.task.as_str(), encoded.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get(&self, task: &str) -> Result<Option<TaskWatermark>, AppError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TASK_WATERMARKS)?;
        match table.get(task)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    /// Every watermark in task-name order.
    pub fn list(&self) -> Result<Vec<TaskWatermark>, AppError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TASK_WATERMARKS)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            out.push(decode(value.value())?);
        }
        Ok(out)
    }
}
