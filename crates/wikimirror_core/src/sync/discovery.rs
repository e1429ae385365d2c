//! Listing crawl: upsert lightweight versions and queue drifted pages.

use super::{Stage, StageOutcome, StageReport, SyncEngine};
use crate::checkpoint::{CheckpointKind, CheckpointPayload, PageListingCheckpoint};
use crate::db::transactions::{ListingIdentity, TransactionOps};
use crate::error::AppError;
use crate::models::page::{PageSnapshot, PageVersion};
use crate::models::queue::DriftReason;
use crate::upstream::ListedPage;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

fn tag_set(tags: &[String]) -> BTreeSet<String> {
    tags.iter().map(|tag| tag.trim().to_lowercase()).collect()
}

/// Snapshot for a page seen for the first time.
pub(crate) fn snapshot_from_listing(listed: &ListedPage) -> PageSnapshot {
    PageSnapshot {
        title: listed.title.clone(),
        tags: listed.tags.clone(),
        rating: listed.rating,
        vote_count: listed.vote_count,
        revision_count: listed.revision_count,
        is_deleted: listed.is_deleted,
        ..PageSnapshot::default()
    }
}

/// Metadata drift between the open version and a listing entry.
///
/// Rating and vote count compare with a missing value equal to zero, so a
/// structural page whose counters are null-or-zero on both sides never
/// drifts. A listing without a revision count is not a change.
pub(crate) fn drift_reasons(current: &PageVersion, listed: &ListedPage) -> Vec<DriftReason> {
    let mut reasons = Vec::new();
    if current.title != listed.title {
        reasons.push(DriftReason::Title);
    }
    if tag_set(&current.tags) != tag_set(&listed.tags) {
        reasons.push(DriftReason::Tags);
    }
    if current.rating.unwrap_or(0) != listed.rating.unwrap_or(0) {
        reasons.push(DriftReason::Rating);
    }
    if current.vote_count.unwrap_or(0) != listed.vote_count.unwrap_or(0) {
        reasons.push(DriftReason::VoteCount);
    }
    if listed
        .revision_count
        .is_some_and(|count| current.revision_count != Some(count))
    {
        reasons.push(DriftReason::RevisionCount);
    }
    if current.is_deleted != listed.is_deleted {
        reasons.push(DriftReason::Deleted);
    }
    reasons
}

/// Fold listing metadata into the open version's state.
///
/// Content is kept; the vote split is cleared whenever the counters moved
/// because it no longer describes the new totals.
pub(crate) fn merge_listing(current: &PageVersion, listed: &ListedPage) -> PageSnapshot {
    let mut snapshot = PageSnapshot::from_version(current);
    snapshot.title = listed.title.clone();
    snapshot.tags = listed.tags.clone();
    snapshot.is_deleted = listed.is_deleted;
    let rating_moved = current.rating.unwrap_or(0) != listed.rating.unwrap_or(0);
    let votes_moved = current.vote_count.unwrap_or(0) != listed.vote_count.unwrap_or(0);
    if rating_moved {
        snapshot.rating = listed.rating;
    }
    if votes_moved {
        snapshot.vote_count = listed.vote_count;
    }
    if rating_moved || votes_moved {
        snapshot.upvotes = None;
        snapshot.downvotes = None;
    }
    if listed.revision_count.is_some() {
        snapshot.revision_count = listed.revision_count;
    }
    snapshot
}

impl SyncEngine {
    /// Phase A: walk the upstream listing and queue pages whose metadata drifted.
    ///
    /// Resumes from the newest unfinished listing checkpoint. After a full
    /// pass, stored live pages missing from the listing are queued as
    /// disappeared.
    ///
    /// # Returns
    /// A [`StageReport`]; `Aborted` when the listing stayed unavailable and
    /// `Cancelled` when the token fired. Progress is checkpointed in both cases.
    ///
    /// # Errors
    /// Returns an error when storage or checkpoint access fails.
    pub fn discover(&self) -> Result<StageReport, AppError> {
        let started = Utc::now();
        let mut report = StageReport::new(Stage::Discovery);
        let mut state = match self.checkpoints.load(CheckpointKind::PageListing)? {
            Some(CheckpointPayload::PageListing(saved)) if !saved.complete => {
                tracing::info!(
                    cursor = ?saved.cursor,
                    seen = saved.seen.len(),
                    "Resuming listing crawl from checkpoint"
                );
                saved
            }
            _ => PageListingCheckpoint::fresh(started),
        };
        let page_size = self.tuning.listing_page_size.max(1);
        let mut since_save = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                self.save_listing(&state)?;
                tracing::info!(seen = state.seen.len(), "Discovery cancelled");
                report.outcome = StageOutcome::Cancelled;
                return Ok(report);
            }
            let cursor = state.cursor.clone();
            let batch = match self
                .fetcher
                .call("list", || self.upstream.list_pages(cursor.as_deref(), page_size))
            {
                Ok(batch) => batch,
                Err(err) => {
                    self.save_listing(&state)?;
                    tracing::error!(cursor = ?cursor, reason = err.code(), "Listing unavailable; discovery aborted");
                    report.outcome = StageOutcome::Aborted;
                    report.note = Some(err.to_string());
                    return Ok(report);
                }
            };

            let now = Utc::now();
            for listed in &batch.items {
                self.observe_listed(listed, now, &mut report)?;
                state.seen.insert(listed.url.clone());
                state.processed += 1;
            }
            since_save += batch.items.len();

            match batch.next_cursor {
                Some(next) if state.cursor.as_deref() == Some(next.as_str()) => {
                    self.save_listing(&state)?;
                    tracing::error!(cursor = %next, "Listing cursor did not advance; discovery aborted");
                    report.outcome = StageOutcome::Aborted;
                    report.note = Some(format!("cursor '{}' did not advance", next));
                    return Ok(report);
                }
                Some(next) => state.cursor = Some(next),
                None => break,
            }
            if since_save >= self.tuning.checkpoint_interval.max(1) {
                self.save_listing(&state)?;
                since_save = 0;
            }
            self.fetcher.pause(self.tuning.batch_pause());
        }

        self.flag_disappeared(&state.seen, Utc::now(), &mut report)?;
        state.cursor = None;
        state.complete = true;
        self.save_listing(&state)?;
        self.checkpoints
            .prune(CheckpointKind::PageListing, self.tuning.checkpoint_keep)?;
        self.finish_stage(&report, started)?;
        Ok(report)
    }

    fn save_listing(&self, state: &PageListingCheckpoint) -> Result<(), AppError> {
        self.checkpoints
            .save(&CheckpointPayload::PageListing(state.clone()))?;
        Ok(())
    }

    fn observe_listed(
        &self,
        listed: &ListedPage,
        now: DateTime<Utc>,
        report: &mut StageReport,
    ) -> Result<(), AppError> {
        report.processed += 1;
        let identity = ListingIdentity {
            upstream_id: listed.upstream_id,
            created_at: listed.created_at,
        };
        let Some(current) = self.db.pages.current_version(&listed.url)? else {
            TransactionOps::discover_new_page(
                &self.db,
                &listed.url,
                snapshot_from_listing(listed),
                identity,
                now,
            )?;
            tracing::debug!(url = %listed.url, "Discovered new page");
            report.changed += 1;
            report.flagged += 1;
            return Ok(());
        };

        let reasons = drift_reasons(&current, listed);
        if reasons.is_empty() {
            self.db
                .pages
                .observe(&listed.url, now, identity.upstream_id, identity.created_at)?;
            return Ok(());
        }
        let (outcome, _) = TransactionOps::apply_listing_drift(
            &self.db,
            &listed.url,
            merge_listing(&current, listed),
            &reasons,
            identity,
            now,
        )?;
        tracing::debug!(url = %listed.url, reasons = ?reasons, "Listing drift detected");
        report.flagged += 1;
        if outcome.wrote_version() {
            report.changed += 1;
        }
        Ok(())
    }

    /// Queue stored live pages that a full listing pass did not see.
    fn flag_disappeared(
        &self,
        seen: &BTreeSet<String>,
        now: DateTime<Utc>,
        report: &mut StageReport,
    ) -> Result<(), AppError> {
        let live: Vec<PageVersion> = self
            .db
            .pages
            .current_versions()?
            .into_iter()
            .filter(|version| !version.is_deleted)
            .collect();
        if seen.is_empty() && !live.is_empty() {
            tracing::warn!(
                stored = live.len(),
                "Listing pass returned no pages; skipping disappearance check"
            );
            return Ok(());
        }
        for version in live.iter().filter(|v| !seen.contains(&v.page_url)) {
            self.db
                .queue
                .mark_needs_b(&version.page_url, &[DriftReason::Disappeared], now)?;
            tracing::info!(url = %version.page_url, "Page missing from listing; queued");
            report.flagged += 1;
        }
        Ok(())
    }
}
