//! Atomic cross-table operations used by discovery.

use super::pages::{observe_page_in_txn, supersede_in_txn, SupersedeOutcome};
use super::queue::mark_needs_b_in_txn;
use super::Database;
use crate::error::AppError;
use crate::models::page::{PageSnapshot, VersionSource};
use crate::models::queue::{DirtyPage, DriftReason};
use chrono::{DateTime, Utc};

/// Operations that write page, version and queue rows together.
pub struct TransactionOps;

/// Identity fields reported by the listing alongside a snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListingIdentity {
    pub upstream_id: Option<u64>,
    pub created_at: Option<DateTime<Utc>>,
}

impl TransactionOps {
    /// Record a page seen for the first time: page row, first version and a
    /// `NeedsB` queue entry commit together.
    ///
    /// # Arguments
    /// - `db`: Open database handle.
    /// - `url`: Canonical page url.
    /// - `snapshot`: Lightweight state from the listing.
    /// - `identity`: Upstream id and creation time, when known.
    /// - `seen_at`: Observation time.
    ///
    /// # Returns
    /// The version outcome and the queue record.
    ///
    /// # Errors
    /// Returns an error when storage access or serialization fails; nothing is
    /// written in that case.
    pub fn discover_new_page(
        db: &Database,
        url: &str,
        snapshot: PageSnapshot,
        identity: ListingIdentity,
        seen_at: DateTime<Utc>,
    ) -> Result<(SupersedeOutcome, DirtyPage), AppError> {
        Self::apply_listing_drift(db, url, snapshot, &[DriftReason::NewPage], identity, seen_at)
    }

    /// Record listing drift on a known page: the merged lightweight snapshot
    /// supersedes the open version and the page is queued for phase B.
    ///
    /// # Returns
    /// The version outcome and the queue record.
    ///
    /// # Errors
    /// Returns an error when storage access or serialization fails, or when
    /// the queue transition is illegal; nothing is written in either case.
    pub fn apply_listing_drift(
        db: &Database,
        url: &str,
        snapshot: PageSnapshot,
        reasons: &[DriftReason],
        identity: ListingIdentity,
        seen_at: DateTime<Utc>,
    ) -> Result<(SupersedeOutcome, DirtyPage), AppError> {
        let write_txn = db.db.begin_write()?;
        observe_page_in_txn(&write_txn, url, seen_at, identity.upstream_id, identity.created_at)?;
        let outcome =
            supersede_in_txn(&write_txn, url, snapshot, seen_at, VersionSource::Listing, None)?;
        let row = mark_needs_b_in_txn(&write_txn, url, reasons, seen_at)?;
        write_txn.commit()?;
        Ok((outcome, row))
    }
}
