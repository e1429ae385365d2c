//! Durable crawl checkpoints.
//!
//! Each save lands in a new, uniquely named slot under `<root>/<kind>/`, written
//! to a temp file first and renamed into place so an interrupted write never
//! damages an older slot. Loads scan newest-first and skip slots that fail to
//! parse or validate.

pub mod payload;

use crate::constants::{CHECKPOINT_EXTENSION, CHECKPOINT_TMP_PREFIX};
use crate::error::AppError;
use chrono::{DateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub use payload::{
    CheckpointEnvelope, CheckpointKind, CheckpointPayload, ContentCrawlCheckpoint,
    PageListingCheckpoint, PagePartial,
};

/// Location of a written checkpoint slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointHandle {
    pub kind: CheckpointKind,
    pub path: PathBuf,
    pub saved_at: DateTime<Utc>,
}

/// Summary of one slot, valid or not.
#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub path: PathBuf,
    pub saved_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Leading timestamp of a slot file name.
fn slot_stamp(path: &Path) -> Option<i64> {
    let name = path.file_name()?.to_str()?;
    name.split('-').next()?.parse().ok()
}

/// Filesystem-backed checkpoint store.
///
/// Clones share one save lock, so slot stamps stay strictly ordered across
/// threads saving through the same store.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
    save_lock: Arc<Mutex<()>>,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            save_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kind_dir(&self, kind: CheckpointKind) -> PathBuf {
        self.root.join(kind.as_str())
    }

    /// Write `payload` to a fresh slot.
    ///
    /// # Errors
    /// Returns an error when the payload does not validate or the slot cannot
    /// be written durably. Older slots are untouched either way.
    pub fn save(&self, payload: &CheckpointPayload) -> Result<CheckpointHandle, AppError> {
        payload.validate()?;
        let kind = payload.kind();
        let dir = self.kind_dir(kind);
        fs::create_dir_all(&dir)?;

        let saved_at = Utc::now();
        let envelope = CheckpointEnvelope::new(payload.clone(), saved_at);
        let data = serde_json::to_vec_pretty(&envelope)?;

        let _guard = self
            .save_lock
            .lock()
            .map_err(|_| AppError::StorageMessage("Checkpoint save lock poisoned".to_string()))?;
        // Slot order must follow save order even within one millisecond.
        let now_ms = saved_at.timestamp_millis().max(0);
        let stamp = match self.slot_paths(kind)?.first().and_then(|path| slot_stamp(path)) {
            Some(last) if last >= now_ms => last + 1,
            _ => now_ms,
        };
        let name = format!(
            "{:020}-{}.{}",
            stamp,
            uuid::Uuid::new_v4().simple(),
            CHECKPOINT_EXTENSION
        );
        let path = dir.join(&name);
        let tmp_path = dir.join(format!("{}{}", CHECKPOINT_TMP_PREFIX, name));

        let write_result = (|| -> Result<(), AppError> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&data)?;
            file.sync_all()?;
            fs::rename(&tmp_path, &path)?;
            Ok(())
        })();
        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        tracing::debug!(kind = kind.as_str(), path = %path.display(), "Saved checkpoint");
        Ok(CheckpointHandle {
            kind,
            path,
            saved_at,
        })
    }

    /// Slot paths for `kind`, newest first. Temp files are excluded.
    fn slot_paths(&self, kind: CheckpointKind) -> Result<Vec<PathBuf>, AppError> {
        let dir = self.kind_dir(kind);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if name.starts_with(CHECKPOINT_TMP_PREFIX) {
                continue;
            }
            if path.extension().and_then(|ext| ext.to_str()) == Some(CHECKPOINT_EXTENSION) {
                paths.push(path);
            }
        }
        // Slot names start with a zero-padded timestamp.
        paths.sort();
        paths.reverse();
        Ok(paths)
    }

    fn read_slot(path: &Path, kind: CheckpointKind) -> Result<CheckpointEnvelope, AppError> {
        let data = fs::read(path)?;
        let envelope: CheckpointEnvelope = serde_json::from_slice(&data)?;
        envelope.validate(kind)?;
        Ok(envelope)
    }

    /// Newest valid payload for `kind`.
    ///
    /// # Returns
    /// `Ok(None)` when no slot exists or every slot is corrupt.
    ///
    /// # Errors
    /// Only when the checkpoint directory itself cannot be listed.
    pub fn load(&self, kind: CheckpointKind) -> Result<Option<CheckpointPayload>, AppError> {
        for path in self.slot_paths(kind)? {
            match Self::read_slot(&path, kind) {
                Ok(envelope) => {
                    tracing::info!(
                        kind = kind.as_str(),
                        path = %path.display(),
                        saved_at = %envelope.saved_at,
                        "Resuming from checkpoint"
                    );
                    return Ok(Some(envelope.payload));
                }
                Err(err) => {
                    tracing::warn!(
                        kind = kind.as_str(),
                        path = %path.display(),
                        error = %err,
                        "Skipping unreadable checkpoint"
                    );
                }
            }
        }
        Ok(None)
    }

    /// Describe every slot of `kind`, newest first.
    pub fn list(&self, kind: CheckpointKind) -> Result<Vec<SlotInfo>, AppError> {
        Ok(self
            .slot_paths(kind)?
            .into_iter()
            .map(|path| match Self::read_slot(&path, kind) {
                Ok(envelope) => SlotInfo {
                    path,
                    saved_at: Some(envelope.saved_at),
                    error: None,
                },
                Err(err) => SlotInfo {
                    path,
                    saved_at: None,
                    error: Some(err.to_string()),
                },
            })
            .collect())
    }

    /// Delete all but the `keep` newest valid slots of `kind`, plus every
    /// invalid slot and leftover temp file.
    ///
    /// # Returns
    /// Number of files removed.
    pub fn prune(&self, kind: CheckpointKind, keep: usize) -> Result<usize, AppError> {
        let mut kept = 0;
        let mut removed = 0;
        for path in self.slot_paths(kind)? {
            let valid = Self::read_slot(&path, kind).is_ok();
            if valid && kept < keep {
                kept += 1;
                continue;
            }
            fs::remove_file(&path)?;
            removed += 1;
        }

        if let Ok(entries) = fs::read_dir(self.kind_dir(kind)) {
            for entry in entries.flatten() {
                let is_tmp = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(CHECKPOINT_TMP_PREFIX));
                if is_tmp && fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }

        tracing::debug!(kind = kind.as_str(), kept, removed, "Pruned checkpoints");
        Ok(removed)
    }
}
