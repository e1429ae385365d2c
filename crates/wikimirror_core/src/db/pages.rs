//! Page identity, temporal version chains and per-version attributions.
//!
//! Versions are never edited in place except to close them. The open version
//! of each page is tracked in `CURRENT_VERSIONS`; superseding closes it at the
//! new version's start time inside the same write transaction.

use super::tables::{ATTRIBUTIONS, CURRENT_VERSIONS, PAGES, PAGE_VERSIONS};
use super::{decode, encode};
use crate::error::AppError;
use crate::models::activity::Attribution;
use crate::models::page::{Page, PageSnapshot, PageVersion, VersionSource};
use chrono::{DateTime, Utc};
use redb::{ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use std::sync::Arc;

type VersionKey = (&'static str, u32);
type AttributionKey = (&'static str, u32, &'static str, &'static str);

/// Result of offering a snapshot to a page's version chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupersedeOutcome {
    /// First version of the page.
    Created { seq: u32 },
    /// Snapshot matched the open version; nothing written.
    Unchanged { seq: u32 },
    /// The open version was closed and a new one opened.
    Superseded { closed_seq: u32, new_seq: u32 },
}

impl SupersedeOutcome {
    /// Sequence number of the version open after the call.
    pub fn current_seq(self) -> u32 {
        match self {
            Self::Created { seq } | Self::Unchanged { seq } => seq,
            Self::Superseded { new_seq, .. } => new_seq,
        }
    }

    pub fn wrote_version(self) -> bool {
        !matches!(self, Self::Unchanged { .. })
    }
}

/// Version-chain integrity defect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "defect", rename_all = "snake_case")]
pub enum IntegrityDefect {
    /// Version `after_seq` ends before its successor starts.
    Gap { url: String, after_seq: u32, millis: i64 },
    /// Version `after_seq` ends after its successor starts (or never ends).
    Overlap { url: String, after_seq: u32, millis: i64 },
    /// More than one version is open.
    MultipleOpen { url: String, open: u32 },
    /// The page has versions but none is open.
    NoOpenVersion { url: String },
}

impl IntegrityDefect {
    pub fn url(&self) -> &str {
        match self {
            Self::Gap { url, .. }
            | Self::Overlap { url, .. }
            | Self::MultipleOpen { url, .. }
            | Self::NoOpenVersion { url } => url,
        }
    }
}

/// Changes made by [`PageDb::repair_boundaries`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub url: String,
    /// Versions whose start or end time was rewritten.
    pub adjusted: u32,
}

impl RepairReport {
    pub fn changed(&self) -> bool {
        self.adjusted > 0
    }
}

/// Inspect a seq-ordered version chain.
///
/// Boundary differences within `tolerance_ms` are treated as clock skew.
pub fn find_defects(url: &str, versions: &[PageVersion], tolerance_ms: i64) -> Vec<IntegrityDefect> {
    let mut defects = Vec::new();
    if versions.is_empty() {
        return defects;
    }
    for pair in versions.windows(2) {
        let (prior, next) = (&pair[0], &pair[1]);
        match prior.valid_to {
            Some(valid_to) => {
                let millis = (next.valid_from - valid_to).num_milliseconds();
                if millis > tolerance_ms {
                    defects.push(IntegrityDefect::Gap {
                        url: url.to_string(),
                        after_seq: prior.seq,
                        millis,
                    });
                } else if -millis > tolerance_ms {
                    defects.push(IntegrityDefect::Overlap {
                        url: url.to_string(),
                        after_seq: prior.seq,
                        millis: -millis,
                    });
                }
            }
            None => {
                let millis = next
                    .valid_to
                    .map(|end| (end - next.valid_from).num_milliseconds())
                    .unwrap_or(0);
                defects.push(IntegrityDefect::Overlap {
                    url: url.to_string(),
                    after_seq: prior.seq,
                    millis,
                });
            }
        }
    }
    let open = versions.iter().filter(|v| v.is_open()).count() as u32;
    if open > 1 {
        defects.push(IntegrityDefect::MultipleOpen {
            url: url.to_string(),
            open,
        });
    } else if open == 0 {
        defects.push(IntegrityDefect::NoOpenVersion {
            url: url.to_string(),
        });
    }
    defects
}

fn versions_in<T>(table: &T, url: &str) -> Result<Vec<PageVersion>, AppError>
where
    T: ReadableTable<VersionKey, &'static [u8]>,
{
    let mut versions = Vec::new();
    for item in table.range((url, 0u32)..=(url, u32::MAX))? {
        let (_, value) = item?;
        versions.push(decode::<PageVersion>(value.value())?);
    }
    Ok(versions)
}

fn attributions_in<T>(table: &T, url: &str, seq: u32) -> Result<Vec<Attribution>, AppError>
where
    T: ReadableTable<AttributionKey, &'static [u8]>,
{
    let mut attributions = Vec::new();
    for item in table.range((url, seq, "", "")..)? {
        let (key, value) = item?;
        let (row_url, row_seq, _, _) = key.value();
        if row_url != url || row_seq != seq {
            break;
        }
        attributions.push(decode::<Attribution>(value.value())?);
    }
    attributions.sort_by_key(|a| (a.order_index, a.role, a.user_id.clone()));
    Ok(attributions)
}

fn replace_attributions(
    table: &mut redb::Table<AttributionKey, &'static [u8]>,
    url: &str,
    seq: u32,
    attributions: &[Attribution],
) -> Result<(), AppError> {
    let existing: Vec<(String, String)> = attributions_in(&*table, url, seq)?
        .into_iter()
        .map(|a| (a.user_id, a.role.as_str().to_string()))
        .collect();
    for (user_id, role) in &existing {
        table.remove((url, seq, user_id.as_str(), role.as_str()))?;
    }
    for attribution in attributions {
        let mut row = attribution.clone();
        row.page_url = url.to_string();
        row.version_seq = seq;
        let encoded = encode(&row)?;
        table.insert(
            (url, seq, row.user_id.as_str(), row.role.as_str()),
            encoded.as_slice(),
        )?;
    }
    Ok(())
}

/// Create or refresh the page row inside `txn`.
pub(crate) fn observe_page_in_txn(
    txn: &WriteTransaction,
    url: &str,
    seen_at: DateTime<Utc>,
    upstream_id: Option<u64>,
    created_at: Option<DateTime<Utc>>,
) -> Result<Page, AppError> {
    let mut pages = txn.open_table(PAGES)?;
    let mut page = match pages.get(url)? {
        Some(guard) => decode::<Page>(guard.value())?,
        None => Page::new(url, seen_at),
    };
    page.last_seen_at = page.last_seen_at.max(seen_at);
    page.first_seen_at = page.first_seen_at.min(seen_at);
    if upstream_id.is_some() {
        page.upstream_id = upstream_id;
    }
    if created_at.is_some() {
        page.created_at = created_at;
    }
    let encoded = encode(&page)?;
    pages.insert(url, encoded.as_slice())?;
    Ok(page)
}

/// Offer `snapshot` to the version chain of `url` inside `txn`.
///
/// `attributions` of `None` carries the previous version's attributions
/// forward onto a newly opened version.
pub(crate) fn supersede_in_txn(
    txn: &WriteTransaction,
    url: &str,
    snapshot: PageSnapshot,
    observed_at: DateTime<Utc>,
    source: VersionSource,
    attributions: Option<&[Attribution]>,
) -> Result<SupersedeOutcome, AppError> {
    let mut versions = txn.open_table(PAGE_VERSIONS)?;
    let mut current = txn.open_table(CURRENT_VERSIONS)?;
    let mut attribution_table = txn.open_table(ATTRIBUTIONS)?;

    let open = match current.get(url)? {
        Some(seq) => {
            let seq = seq.value();
            match versions.get((url, seq))? {
                Some(guard) => Some(decode::<PageVersion>(guard.value())?),
                None => None,
            }
        }
        None => None,
    };

    if let Some(open) = &open {
        if !snapshot.differs_from(open) {
            if let Some(attributions) = attributions {
                replace_attributions(&mut attribution_table, url, open.seq, attributions)?;
            }
            return Ok(SupersedeOutcome::Unchanged { seq: open.seq });
        }
    }

    let last_seq = match versions.range((url, 0u32)..=(url, u32::MAX))?.next_back() {
        Some(item) => Some(item?.0.value().1),
        None => None,
    };
    let new_seq = last_seq.map(|seq| seq.saturating_add(1)).unwrap_or(0);

    let (outcome, valid_from, previous_seq) = match open {
        Some(mut open) => {
            let valid_from = observed_at.max(open.valid_from);
            open.valid_to = Some(valid_from);
            let encoded = encode(&open)?;
            versions.insert((url, open.seq), encoded.as_slice())?;
            (
                SupersedeOutcome::Superseded {
                    closed_seq: open.seq,
                    new_seq,
                },
                valid_from,
                Some(open.seq),
            )
        }
        None => (SupersedeOutcome::Created { seq: new_seq }, observed_at, last_seq),
    };

    let version = snapshot.into_version(url, new_seq, valid_from, source);
    let encoded = encode(&version)?;
    versions.insert((url, new_seq), encoded.as_slice())?;
    current.insert(url, new_seq)?;

    let carried;
    let fresh = match attributions {
        Some(fresh) => fresh,
        None => {
            carried = match previous_seq {
                Some(seq) => attributions_in(&attribution_table, url, seq)?,
                None => Vec::new(),
            };
            carried.as_slice()
        }
    };
    replace_attributions(&mut attribution_table, url, new_seq, fresh)?;
    Ok(outcome)
}

/// Accessor for page, version and attribution tables.
pub struct PageDb {
    db: Arc<redb::Database>,
}

impl PageDb {
    /// Initialize page tables if they do not exist yet.
    ///
    /// # Errors
    /// Returns an error when redb transaction/table initialization fails.
    pub fn new(db: Arc<redb::Database>) -> Result<Self, AppError> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(PAGES)?;
        write_txn.open_table(PAGE_VERSIONS)?;
        write_txn.open_table(CURRENT_VERSIONS)?;
        write_txn.open_table(ATTRIBUTIONS)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    pub fn get(&self, url: &str) -> Result<Option<Page>, AppError> {
        let read_txn = self.db.begin_read()?;
        let pages = read_txn.open_table(PAGES)?;
        match pages.get(url)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    /// Every stored page in url order.
    pub fn list(&self) -> Result<Vec<Page>, AppError> {
        let read_txn = self.db.begin_read()?;
        let pages = read_txn.open_table(PAGES)?;
        let mut out = Vec::new();
        for item in pages.iter()? {
            let (_, value) = item?;
            out.push(decode(value.value())?);
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<u64, AppError> {
        let read_txn = self.db.begin_read()?;
        let pages = read_txn.open_table(PAGES)?;
        let mut count = 0;
        for item in pages.iter()? {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Record that `url` was seen upstream at `seen_at`.
    ///
    /// # Returns
    /// The stored page row after the update.
    pub fn observe(
        &self,
        url: &str,
        seen_at: DateTime<Utc>,
        upstream_id: Option<u64>,
        created_at: Option<DateTime<Utc>>,
    ) -> Result<Page, AppError> {
        let write_txn = self.db.begin_write()?;
        let page = observe_page_in_txn(&write_txn, url, seen_at, upstream_id, created_at)?;
        write_txn.commit()?;
        Ok(page)
    }

    /// The open version of `url`, if any.
    pub fn current_version(&self, url: &str) -> Result<Option<PageVersion>, AppError> {
        let read_txn = self.db.begin_read()?;
        let current = read_txn.open_table(CURRENT_VERSIONS)?;
        let Some(seq) = current.get(url)? else {
            return Ok(None);
        };
        let versions = read_txn.open_table(PAGE_VERSIONS)?;
        let seq = seq.value();
        match versions.get((url, seq))? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    /// Full version chain of `url`, ordered by sequence number.
    pub fn versions(&self, url: &str) -> Result<Vec<PageVersion>, AppError> {
        let read_txn = self.db.begin_read()?;
        let versions = read_txn.open_table(PAGE_VERSIONS)?;
        versions_in(&versions, url)
    }

    /// Open versions of every page, in url order.
    pub fn current_versions(&self) -> Result<Vec<PageVersion>, AppError> {
        let read_txn = self.db.begin_read()?;
        let current = read_txn.open_table(CURRENT_VERSIONS)?;
        let versions = read_txn.open_table(PAGE_VERSIONS)?;
        let mut out = Vec::new();
        for item in current.iter()? {
            let (url, seq) = item?;
            let url = url.value();
            if let Some(value) = versions.get((url, seq.value()))? {
                out.push(decode(value.value())?);
            }
        }
        Ok(out)
    }

    /// Offer a snapshot observed at `observed_at` to the version chain.
    ///
    /// # Returns
    /// Which version is open afterwards and whether one was written.
    ///
    /// # Errors
    /// Returns an error when storage access or serialization fails.
    pub fn supersede(
        &self,
        url: &str,
        snapshot: PageSnapshot,
        observed_at: DateTime<Utc>,
        source: VersionSource,
        attributions: Option<&[Attribution]>,
    ) -> Result<SupersedeOutcome, AppError> {
        let write_txn = self.db.begin_write()?;
        observe_page_in_txn(&write_txn, url, observed_at, None, None)?;
        let outcome =
            supersede_in_txn(&write_txn, url, snapshot, observed_at, source, attributions)?;
        write_txn.commit()?;
        if let SupersedeOutcome::Superseded {
            closed_seq,
            new_seq,
        } = outcome
        {
            tracing::debug!(url, closed_seq, new_seq, source = ?source, "Superseded page version");
        }
        Ok(outcome)
    }

    /// Attributions recorded on version `seq` of `url`.
    pub fn attributions(&self, url: &str, seq: u32) -> Result<Vec<Attribution>, AppError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ATTRIBUTIONS)?;
        attributions_in(&table, url, seq)
    }

    /// Every attribution row, in key order.
    pub fn all_attributions(&self) -> Result<Vec<Attribution>, AppError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ATTRIBUTIONS)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            out.push(decode(value.value())?);
        }
        Ok(out)
    }

    /// Integrity defects in the version chain of `url`.
    pub fn check_integrity(
        &self,
        url: &str,
        tolerance_ms: i64,
    ) -> Result<Vec<IntegrityDefect>, AppError> {
        Ok(find_defects(url, &self.versions(url)?, tolerance_ms))
    }

    /// Integrity defects across every stored page.
    pub fn check_all_integrity(&self, tolerance_ms: i64) -> Result<Vec<IntegrityDefect>, AppError> {
        let read_txn = self.db.begin_read()?;
        let versions = read_txn.open_table(PAGE_VERSIONS)?;
        let mut defects = Vec::new();
        let mut chain: Vec<PageVersion> = Vec::new();
        for item in versions.iter()? {
            let (_, value) = item?;
            let version: PageVersion = decode(value.value())?;
            if chain
                .last()
                .is_some_and(|last| last.page_url != version.page_url)
            {
                defects.extend(find_defects(&chain[0].page_url, &chain, tolerance_ms));
                chain.clear();
            }
            chain.push(version);
        }
        if let Some(first) = chain.first() {
            defects.extend(find_defects(&first.page_url, &chain, tolerance_ms));
        }
        Ok(defects)
    }

    /// Make the version chain of `url` contiguous with exactly one open version.
    ///
    /// Start times are clamped so they never precede the prior version's start,
    /// each prior end is set to its successor's start, and only the last
    /// version stays open. Running it twice changes nothing the second time.
    ///
    /// # Errors
    /// Returns an error when storage access or serialization fails.
    pub fn repair_boundaries(&self, url: &str) -> Result<RepairReport, AppError> {
        let write_txn = self.db.begin_write()?;
        let mut report = RepairReport {
            url: url.to_string(),
            adjusted: 0,
        };
        {
            let mut versions = write_txn.open_table(PAGE_VERSIONS)?;
            let mut current = write_txn.open_table(CURRENT_VERSIONS)?;
            let original = versions_in(&versions, url)?;
            if original.is_empty() {
                return Ok(report);
            }
            let mut repaired = original.clone();
            for i in 1..repaired.len() {
                let floor = repaired[i - 1].valid_from;
                if repaired[i].valid_from < floor {
                    repaired[i].valid_from = floor;
                }
            }
            let last = repaired.len() - 1;
            for i in 0..last {
                repaired[i].valid_to = Some(repaired[i + 1].valid_from);
            }
            repaired[last].valid_to = None;

            for (before, after) in original.iter().zip(&repaired) {
                if before != after {
                    let encoded = encode(after)?;
                    versions.insert((url, after.seq), encoded.as_slice())?;
                    report.adjusted += 1;
                }
            }
            let open_seq = repaired[last].seq;
            let pointer = current.get(url)?.map(|seq| seq.value());
            if pointer != Some(open_seq) {
                current.insert(url, open_seq)?;
            }
        }
        write_txn.commit()?;
        if report.changed() {
            tracing::info!(url, adjusted = report.adjusted, "Repaired version boundaries");
        }
        Ok(report)
    }
}
