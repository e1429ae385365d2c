//! Dirty-page queue storage.
//!
//! Every state change runs inside one redb write transaction that reads the
//! row, applies a [`DirtyPage`] transition and rewrites both the row and the
//! `(state, url)` index. redb serializes write transactions, so a claim is an
//! atomic compare-and-set: two workers can never hold the same page in the
//! same phase.

use super::tables::{DIRTY_BY_STATE, DIRTY_PAGES};
use super::{decode, encode};
use crate::error::AppError;
use crate::models::queue::{Claim, DirtyPage, DriftReason, Phase, PhaseState};
use chrono::{DateTime, Duration, Utc};
use redb::{ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use std::sync::Arc;

/// Number of queue records per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub clean: u64,
    pub needs_b: u64,
    pub in_b: u64,
    pub needs_c: u64,
    pub in_c: u64,
}

impl QueueCounts {
    /// Pages still owed phase B or phase C work.
    pub fn outstanding(&self) -> u64 {
        self.needs_b + self.in_b + self.needs_c + self.in_c
    }

    fn bump(&mut self, state: PhaseState) {
        match state {
            PhaseState::Clean => self.clean += 1,
            PhaseState::NeedsB => self.needs_b += 1,
            PhaseState::InB => self.in_b += 1,
            PhaseState::NeedsC => self.needs_c += 1,
            PhaseState::InC => self.in_c += 1,
        }
    }
}

/// Read, mutate and rewrite one queue row inside `txn`.
///
/// A missing row is created clean before `apply` runs. The row is only
/// written when `apply` succeeds.
pub(crate) fn update_in_txn<R, F>(
    txn: &WriteTransaction,
    url: &str,
    now: DateTime<Utc>,
    apply: F,
) -> Result<(DirtyPage, R), AppError>
where
    F: FnOnce(&mut DirtyPage) -> Result<R, AppError>,
{
    let mut rows = txn.open_table(DIRTY_PAGES)?;
    let mut index = txn.open_table(DIRTY_BY_STATE)?;
    let existing = match rows.get(url)? {
        Some(guard) => Some(decode::<DirtyPage>(guard.value())?),
        None => None,
    };
    let before = existing.as_ref().map(|row| row.state);
    let mut row = existing.unwrap_or_else(|| DirtyPage::new(url, now));
    let result = apply(&mut row)?;
    if before != Some(row.state) {
        if let Some(before) = before {
            index.remove((before.code(), url))?;
        }
        index.insert((row.state.code(), url), ())?;
    }
    let encoded = encode(&row)?;
    rows.insert(url, encoded.as_slice())?;
    Ok((row, result))
}

/// Flag `url` for phase B inside `txn`.
pub(crate) fn mark_needs_b_in_txn(
    txn: &WriteTransaction,
    url: &str,
    reasons: &[DriftReason],
    now: DateTime<Utc>,
) -> Result<DirtyPage, AppError> {
    let (row, ()) = update_in_txn(txn, url, now, |row| row.mark_needs_b(reasons, now))?;
    Ok(row)
}

/// Accessor for the dirty-page queue tables.
pub struct DirtyQueueDb {
    db: Arc<redb::Database>,
}

impl DirtyQueueDb {
    /// Initialize queue tables if they do not exist yet.
    ///
    /// # Errors
    /// Returns an error when redb transaction/table initialization fails.
    pub fn new(db: Arc<redb::Database>) -> Result<Self, AppError> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(DIRTY_PAGES)?;
        write_txn.open_table(DIRTY_BY_STATE)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    pub fn get(&self, url: &str) -> Result<Option<DirtyPage>, AppError> {
        let read_txn = self.db.begin_read()?;
        let rows = read_txn.open_table(DIRTY_PAGES)?;
        match rows.get(url)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn update<R, F>(&self, url: &str, now: DateTime<Utc>, apply: F) -> Result<(DirtyPage, R), AppError>
    where
        F: FnOnce(&mut DirtyPage) -> Result<R, AppError>,
    {
        let write_txn = self.db.begin_write()?;
        let out = update_in_txn(&write_txn, url, now, apply)?;
        write_txn.commit()?;
        Ok(out)
    }

    /// Flag `url` for a content fetch, creating the record if needed.
    ///
    /// # Errors
    /// Returns [`AppError::InvalidTransition`] for transitions the state
    /// machine forbids.
    pub fn mark_needs_b(
        &self,
        url: &str,
        reasons: &[DriftReason],
        now: DateTime<Utc>,
    ) -> Result<DirtyPage, AppError> {
        let write_txn = self.db.begin_write()?;
        let row = mark_needs_b_in_txn(&write_txn, url, reasons, now)?;
        write_txn.commit()?;
        Ok(row)
    }

    /// Flag `url` for deep reconciliation.
    pub fn mark_needs_c(
        &self,
        url: &str,
        reason: DriftReason,
        now: DateTime<Utc>,
    ) -> Result<DirtyPage, AppError> {
        let (row, ()) = self.update(url, now, |row| row.mark_needs_c(reason, now))?;
        Ok(row)
    }

    fn candidate_in(
        index: &impl ReadableTable<(u8, &'static str), ()>,
        rows: &impl ReadableTable<&'static str, &'static [u8]>,
        state: PhaseState,
        phase: Phase,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<DirtyPage>, AppError> {
        let code = state.code();
        for item in index.range((code, "")..)? {
            let (key, _) = item?;
            let (row_code, url) = key.value();
            if row_code != code {
                break;
            }
            let Some(guard) = rows.get(url)? else {
                continue;
            };
            let row: DirtyPage = decode(guard.value())?;
            if row.is_claimable(phase, now, lease) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// Atomically claim the next page waiting for `phase`.
    ///
    /// Pending pages are preferred; in-flight pages whose lease has expired
    /// are taken over otherwise.
    ///
    /// # Returns
    /// `Ok(None)` when no page is claimable.
    pub fn claim_next(
        &self,
        phase: Phase,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Claim>, AppError> {
        let write_txn = self.db.begin_write()?;
        let candidate = {
            let rows = write_txn.open_table(DIRTY_PAGES)?;
            let index = write_txn.open_table(DIRTY_BY_STATE)?;
            match Self::candidate_in(&index, &rows, phase.pending_state(), phase, now, lease)? {
                Some(row) => Some(row),
                None => Self::candidate_in(
                    &index,
                    &rows,
                    phase.in_flight_state(),
                    phase,
                    now,
                    lease,
                )?,
            }
        };
        let Some(candidate) = candidate else {
            return Ok(None);
        };
        let (_, info) = update_in_txn(&write_txn, &candidate.url, now, |row| {
            row.claim(phase, now, lease)
        })?;
        write_txn.commit()?;
        tracing::debug!(url = %candidate.url, phase = phase.as_str(), "Claimed dirty page");
        Ok(Some(Claim {
            url: candidate.url,
            phase,
            token: info.token,
        }))
    }

    /// Atomically claim `url` for `phase`.
    ///
    /// # Returns
    /// `Ok(None)` when the page is missing or not claimable (for example
    /// because another worker holds it).
    pub fn claim(
        &self,
        url: &str,
        phase: Phase,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<Claim>, AppError> {
        let write_txn = self.db.begin_write()?;
        let claimable = {
            let rows = write_txn.open_table(DIRTY_PAGES)?;
            let row = match rows.get(url)? {
                Some(guard) => Some(decode::<DirtyPage>(guard.value())?),
                None => None,
            };
            row.is_some_and(|row| row.is_claimable(phase, now, lease))
        };
        if !claimable {
            return Ok(None);
        }
        let (_, info) = update_in_txn(&write_txn, url, now, |row| row.claim(phase, now, lease))?;
        write_txn.commit()?;
        Ok(Some(Claim {
            url: url.to_string(),
            phase,
            token: info.token,
        }))
    }

    fn finish<F>(&self, claim: &Claim, now: DateTime<Utc>, apply: F) -> Result<bool, AppError>
    where
        F: FnOnce(&mut DirtyPage) -> Result<bool, AppError>,
    {
        let write_txn = self.db.begin_write()?;
        let exists = {
            let rows = write_txn.open_table(DIRTY_PAGES)?;
            let found = rows.get(claim.url.as_str())?.is_some();
            found
        };
        if !exists {
            return Ok(false);
        }
        let (_, applied) = update_in_txn(&write_txn, &claim.url, now, apply)?;
        if !applied {
            // Nothing changed; drop the transaction without committing.
            return Ok(false);
        }
        write_txn.commit()?;
        Ok(true)
    }

    /// Complete a claimed phase.
    ///
    /// # Returns
    /// `Ok(false)` when the claim is no longer held; repeated completion is a
    /// no-op.
    pub fn complete(
        &self,
        claim: &Claim,
        needs_reconcile: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let done = self.finish(claim, now, |row| {
            row.complete(claim.phase, claim.token, needs_reconcile, now)
        })?;
        if !done {
            tracing::warn!(
                url = %claim.url,
                phase = claim.phase.as_str(),
                "Completion ignored; claim no longer held"
            );
        }
        Ok(done)
    }

    /// Return a claimed page to its pending state after a failure.
    pub fn release(&self, claim: &Claim, error: &str, now: DateTime<Utc>) -> Result<bool, AppError> {
        self.finish(claim, now, |row| row.release(claim.phase, claim.token, error, now))
    }

    /// Urls currently in `state`, in url order.
    pub fn urls_in_state(&self, state: PhaseState) -> Result<Vec<String>, AppError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(DIRTY_BY_STATE)?;
        let code = state.code();
        let mut out = Vec::new();
        for item in index.range((code, "")..)? {
            let (key, _) = item?;
            let (row_code, url) = key.value();
            if row_code != code {
                break;
            }
            out.push(url.to_string());
        }
        Ok(out)
    }

    /// Record counts per state.
    pub fn counts(&self) -> Result<QueueCounts, AppError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(DIRTY_BY_STATE)?;
        let mut counts = QueueCounts::default();
        for item in index.iter()? {
            let (key, _) = item?;
            let (code, _) = key.value();
            if let Some(state) = PhaseState::ALL.iter().find(|s| s.code() == code) {
                counts.bump(*state);
            }
        }
        Ok(counts)
    }
}
