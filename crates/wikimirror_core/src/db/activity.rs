//! Append-only vote, revision and user storage.
//!
//! Every insert is keyed by the natural identity of the observation, so
//! re-recording the same history (crash-retry, overlapping pagination) never
//! produces duplicate rows.

use super::tables::{REVISIONS, USERS, VOTES};
use super::{decode, encode};
use crate::error::AppError;
use crate::models::activity::{Revision, User, Vote};
use chrono::{DateTime, Utc};
use redb::{ReadableDatabase, ReadableTable};
use std::sync::Arc;

/// Accessor for activity tables.
pub struct ActivityDb {
    db: Arc<redb::Database>,
}

impl ActivityDb {
    /// Initialize activity tables if they do not exist yet.
    ///
    /// # Errors
    /// Returns an error when redb transaction/table initialization fails.
    pub fn new(db: Arc<redb::Database>) -> Result<Self, AppError> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(VOTES)?;
        write_txn.open_table(REVISIONS)?;
        write_txn.open_table(USERS)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Store vote observations for one page.
    ///
    /// Two observations by one user at the same instant keep the higher
    /// direction, matching live-vote resolution.
    ///
    /// # Returns
    /// Number of rows inserted or replaced.
    pub fn record_votes(&self, votes: &[Vote]) -> Result<usize, AppError> {
        let write_txn = self.db.begin_write()?;
        let mut written = 0;
        {
            let mut table = write_txn.open_table(VOTES)?;
            for vote in votes {
                let key = (
                    vote.page_url.as_str(),
                    vote.user_id.as_str(),
                    vote.cast_at.timestamp_millis(),
                );
                let existing = match table.get(key)? {
                    Some(guard) => Some(decode::<Vote>(guard.value())?),
                    None => None,
                };
                let replace =
                    existing.map_or(true, |existing| vote.direction > existing.direction);
                if replace {
                    let encoded = encode(vote)?;
                    table.insert(key, encoded.as_slice())?;
                    written += 1;
                }
            }
        }
        write_txn.commit()?;
        Ok(written)
    }

    /// Every vote observation for `url`.
    pub fn votes_for_page(&self, url: &str) -> Result<Vec<Vote>, AppError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(VOTES)?;
        let mut out = Vec::new();
        for item in table.range((url, "", i64::MIN)..)? {
            let (key, value) = item?;
            if key.value().0 != url {
                break;
            }
            out.push(decode(value.value())?);
        }
        Ok(out)
    }

    /// Every stored vote observation.
    pub fn all_votes(&self) -> Result<Vec<Vote>, AppError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(VOTES)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            out.push(decode(value.value())?);
        }
        Ok(out)
    }

    /// Store revisions; an existing revision number is left untouched.
    ///
    /// # Returns
    /// Number of new rows.
    pub fn record_revisions(&self, revisions: &[Revision]) -> Result<usize, AppError> {
        let write_txn = self.db.begin_write()?;
        let mut inserted = 0;
        {
            let mut table = write_txn.open_table(REVISIONS)?;
            for revision in revisions {
                let key = (revision.page_url.as_str(), revision.number);
                if table.get(key)?.is_some() {
                    continue;
                }
                let encoded = encode(revision)?;
                table.insert(key, encoded.as_slice())?;
                inserted += 1;
            }
        }
        write_txn.commit()?;
        Ok(inserted)
    }

    /// Revisions of `url` ordered by revision number.
    pub fn revisions_for_page(&self, url: &str) -> Result<Vec<Revision>, AppError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(REVISIONS)?;
        let mut out = Vec::new();
        for item in table.range((url, 0u32)..=(url, u32::MAX))? {
            let (_, value) = item?;
            out.push(decode(value.value())?);
        }
        Ok(out)
    }

    /// Create or refresh users seen at `seen_at`.
    ///
    /// A known user keeps its name unless a non-empty one is supplied.
    pub fn upsert_users(
        &self,
        users: &[(String, Option<String>)],
        seen_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        if users.is_empty() {
            return Ok(());
        }
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(USERS)?;
            for (id, name) in users {
                let name = name.as_deref().map(str::trim).filter(|n| !n.is_empty());
                let mut user = match table.get(id.as_str())? {
                    Some(guard) => decode::<User>(guard.value())?,
                    None => User {
                        id: id.clone(),
                        name: name.unwrap_or(id.as_str()).to_string(),
                        first_seen_at: seen_at,
                        last_seen_at: seen_at,
                    },
                };
                if let Some(name) = name {
                    user.name = name.to_string();
                }
                user.first_seen_at = user.first_seen_at.min(seen_at);
                user.last_seen_at = user.last_seen_at.max(seen_at);
                let encoded = encode(&user)?;
                table.insert(id.as_str(), encoded.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>, AppError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS)?;
        match table.get(id)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    /// Every known user in id order.
    pub fn list_users(&self) -> Result<Vec<User>, AppError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            out.push(decode(value.value())?);
        }
        Ok(out)
    }
}
