//! Owner lock enforcing a single active sync process per database.

use crate::error::AppError;
use crate::DB_OWNER_LOCK_FILE_NAME;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;

/// Result of probing the owner lock without taking it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockProbe {
    Free,
    Held,
    Unknown,
}

/// Process-lifetime owner lock guard.
///
/// Keeping this value alive holds an exclusive OS lock on `db.owner.lock`.
pub struct OwnerLockGuard {
    file: File,
    lock_path: PathBuf,
}

impl OwnerLockGuard {
    pub fn path(&self) -> &std::path::Path {
        &self.lock_path
    }
}

impl Drop for OwnerLockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            tracing::warn!(
                "Failed to release owner lock {:?} during drop: {}",
                self.lock_path,
                err
            );
        }
    }
}

/// Return the owner lock file path for a database directory.
pub fn owner_lock_path(db_path: &str) -> PathBuf {
    PathBuf::from(db_path).join(DB_OWNER_LOCK_FILE_NAME)
}

fn open_lock_file(lock_path: &std::path::Path) -> std::io::Result<File> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
}

fn lock_conflict(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::PermissionDenied
    ) || matches!(err.raw_os_error(), Some(32 | 33))
}

/// Acquire and hold the exclusive owner lock.
///
/// # Returns
/// [`OwnerLockGuard`] that keeps the lock held until dropped.
///
/// # Errors
/// Returns [`AppError::Locked`] when another process holds the lock and
/// [`AppError::StorageMessage`] when the lock file cannot be opened.
pub fn acquire_owner_lock(db_path: &str) -> Result<OwnerLockGuard, AppError> {
    let lock_path = owner_lock_path(db_path);
    let file = open_lock_file(&lock_path).map_err(|err| {
        AppError::StorageMessage(format!(
            "Failed to open owner lock '{}': {}",
            lock_path.display(),
            err
        ))
    })?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(OwnerLockGuard { file, lock_path }),
        Err(err) if lock_conflict(&err) => Err(AppError::Locked(format!(
            "Database owner lock '{}' is already held by another sync process",
            lock_path.display()
        ))),
        Err(err) => Err(AppError::StorageMessage(format!(
            "Failed to acquire owner lock '{}': {}",
            lock_path.display(),
            err
        ))),
    }
}

/// Probe whether another process currently holds the owner lock.
///
/// This probe never fails; uncertainty is reported as [`LockProbe::Unknown`].
pub fn probe_owner_lock(db_path: &str) -> LockProbe {
    let lock_path = owner_lock_path(db_path);
    let file = match open_lock_file(&lock_path) {
        Ok(file) => file,
        Err(err) => {
            tracing::warn!(
                "Owner-lock probe failed opening '{}': {}",
                lock_path.display(),
                err
            );
            return LockProbe::Unknown;
        }
    };
    match file.try_lock_exclusive() {
        Ok(()) => match file.unlock() {
            Ok(()) => LockProbe::Free,
            Err(err) => {
                tracing::warn!(
                    "Owner-lock probe failed releasing '{}': {}",
                    lock_path.display(),
                    err
                );
                LockProbe::Unknown
            }
        },
        Err(err) if lock_conflict(&err) => LockProbe::Held,
        Err(err) => {
            tracing::warn!(
                "Owner-lock probe failed locking '{}': {}",
                lock_path.display(),
                err
            );
            LockProbe::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn probe_reports_free_when_nobody_holds_the_lock() {
        let dir = TempDir::new().expect("temp dir");
        let db_path = dir.path().join("db");
        assert_eq!(probe_owner_lock(&db_path.to_string_lossy()), LockProbe::Free);
    }

    #[test]
    fn second_owner_is_rejected_while_first_is_alive() {
        let dir = TempDir::new().expect("temp dir");
        let db_path = dir.path().join("db").to_string_lossy().to_string();
        let guard = acquire_owner_lock(&db_path).expect("first owner");
        assert!(guard.path().ends_with(DB_OWNER_LOCK_FILE_NAME));
        assert_ne!(probe_owner_lock(&db_path), LockProbe::Free);
        match acquire_owner_lock(&db_path) {
            Err(AppError::Locked(message)) => assert!(message.contains("already held")),
            Err(other) => panic!("unexpected error: {:?}", other),
            Ok(_) => panic!("second owner must not acquire the lock"),
        }
        drop(guard);
        assert!(acquire_owner_lock(&db_path).is_ok());
    }

    #[test]
    fn probe_is_unknown_when_db_path_is_a_file() {
        let dir = TempDir::new().expect("temp dir");
        let db_file = dir.path().join("db-as-file");
        std::fs::write(&db_file, b"not a directory").expect("seed file");
        assert_eq!(probe_owner_lock(&db_file.to_string_lossy()), LockProbe::Unknown);
    }
}
