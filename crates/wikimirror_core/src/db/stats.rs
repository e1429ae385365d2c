//! Storage for derived aggregates.
//!
//! Aggregates are never merged: each aggregation run replaces every table in
//! one write transaction, so readers see either the previous run or the new
//! one and concurrent runs resolve last-writer-wins.

use super::tables::{PAGE_SCORES, SERIES_STATS, SITE_STATS, SITE_STATS_KEY, USER_STATS};
use super::{decode, encode};
use crate::error::AppError;
use crate::models::stats::{PageScores, SeriesStats, SiteStats, UserStats};
use redb::{ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use std::sync::Arc;

/// Full output of one aggregation run.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSet {
    pub users: Vec<UserStats>,
    pub series: Vec<SeriesStats>,
    pub scores: Vec<PageScores>,
    pub site: SiteStats,
}

fn reset<K: redb::Key + 'static>(
    txn: &WriteTransaction,
    table: TableDefinition<K, &'static [u8]>,
) -> Result<(), AppError> {
    txn.delete_table(table)?;
    txn.open_table(table)?;
    Ok(())
}

/// Accessor for derived aggregate tables.
pub struct StatsDb {
    db: Arc<redb::Database>,
}

impl StatsDb {
    /// Initialize aggregate tables if they do not exist yet.
    ///
    /// # Errors
    /// Returns an error when redb transaction/table initialization fails.
    pub fn new(db: Arc<redb::Database>) -> Result<Self, AppError> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(USER_STATS)?;
        write_txn.open_table(SERIES_STATS)?;
        write_txn.open_table(PAGE_SCORES)?;
        write_txn.open_table(SITE_STATS)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Replace every aggregate table with `set`.
    ///
    /// # Errors
    /// Returns an error when storage access or serialization fails; the
    /// previous aggregates stay visible in that case.
    pub fn replace_all(&self, set: &AggregateSet) -> Result<(), AppError> {
        let write_txn = self.db.begin_write()?;
        reset(&write_txn, USER_STATS)?;
        reset(&write_txn, SERIES_STATS)?;
        reset(&write_txn, PAGE_SCORES)?;
        reset(&write_txn, SITE_STATS)?;
        {
            let mut users = write_txn.open_table(USER_STATS)?;
            for row in &set.users {
                let encoded = encode(row)?;
                users.insert(row.user_id.as_str(), encoded.as_slice())?;
            }
            let mut series = write_txn.open_table(SERIES_STATS)?;
            for row in &set.series {
                let encoded = encode(row)?;
                series.insert(row.series, encoded.as_slice())?;
            }
            let mut scores = write_txn.open_table(PAGE_SCORES)?;
            for row in &set.scores {
                let encoded = encode(row)?;
                scores.insert(row.page_url.as_str(), encoded.as_slice())?;
            }
            let mut site = write_txn.open_table(SITE_STATS)?;
            let encoded = encode(&set.site)?;
            site.insert(SITE_STATS_KEY, encoded.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn user(&self, user_id: &str) -> Result<Option<UserStats>, AppError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USER_STATS)?;
        match table.get(user_id)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    /// Every user stats row in user-id order.
    pub fn users(&self) -> Result<Vec<UserStats>, AppError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USER_STATS)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            out.push(decode(value.value())?);
        }
        Ok(out)
    }

    /// Every series row in series order.
    pub fn series(&self) -> Result<Vec<SeriesStats>, AppError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SERIES_STATS)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            out.push(decode(value.value())?);
        }
        Ok(out)
    }

    pub fn page_scores(&self, url: &str) -> Result<Option<PageScores>, AppError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PAGE_SCORES)?;
        match table.get(url)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    /// Every page-score row in url order.
    pub fn all_page_scores(&self) -> Result<Vec<PageScores>, AppError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PAGE_SCORES)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            out.push(decode(value.value())?);
        }
        Ok(out)
    }

    pub fn site(&self) -> Result<Option<SiteStats>, AppError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SITE_STATS)?;
        match table.get(SITE_STATS_KEY)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    /// Everything written by the last aggregation run.
    ///
    /// # Returns
    /// `Ok(None)` before the first run.
    pub fn snapshot(&self) -> Result<Option<AggregateSet>, AppError> {
        let Some(site) = self.site()? else {
            return Ok(None);
        };
        Ok(Some(AggregateSet {
            users: self.users()?,
            series: self.series()?,
            scores: self.all_page_scores()?,
            site,
        }))
    }
}
