//! Deep reconciliation of pages flagged by the content stage.

use super::{Stage, StageOutcome, StageReport, SyncEngine};
use crate::error::AppError;
use crate::models::page::{PageSnapshot, VersionSource};
use crate::models::queue::Phase;
use crate::votes;
use chrono::{DateTime, Utc};

impl SyncEngine {
    /// Phase C: repair version boundaries and recount votes from full history
    /// for every page waiting in `NeedsC`.
    ///
    /// Structural pages (fragments, components) keep empty tallies and are
    /// only boundary-repaired.
    ///
    /// # Errors
    /// Returns an error when storage access fails; the page being processed is
    /// released back to `NeedsC` first.
    pub fn reconcile(&self) -> Result<StageReport, AppError> {
        let started = Utc::now();
        let mut report = StageReport::new(Stage::Reconcile);
        let lease = self.tuning.claim_lease();
        loop {
            if self.cancel.is_cancelled() {
                report.outcome = StageOutcome::Cancelled;
                return Ok(report);
            }
            let Some(claim) = self.db.queue.claim_next(Phase::Reconcile, Utc::now(), lease)? else {
                break;
            };
            report.processed += 1;
            match self.reconcile_page(&claim.url, Utc::now()) {
                Ok(changed) => {
                    if changed {
                        report.changed += 1;
                    }
                    self.db.queue.complete(&claim, false, Utc::now())?;
                }
                Err(err) => {
                    self.db.queue.release(&claim, &err.to_string(), Utc::now())?;
                    return Err(err);
                }
            }
        }
        self.finish_stage(&report, started)?;
        Ok(report)
    }

    /// Returns `true` when boundaries were rewritten or a version was written.
    fn reconcile_page(&self, url: &str, now: DateTime<Utc>) -> Result<bool, AppError> {
        let repair = self.db.pages.repair_boundaries(url)?;
        let Some(current) = self.db.pages.current_version(url)? else {
            return Ok(repair.changed());
        };
        if current.is_structural() {
            tracing::debug!(url, "Structural page; skipping vote recount");
            return Ok(repair.changed());
        }

        let tally = votes::reconcile_page(url, &self.db.activity.votes_for_page(url)?);
        let mut changed = repair.changed();
        if current.upvotes != Some(tally.upvotes) || current.downvotes != Some(tally.downvotes) {
            let mut snapshot = PageSnapshot::from_version(&current);
            snapshot.upvotes = Some(tally.upvotes);
            snapshot.downvotes = Some(tally.downvotes);
            let outcome = self.db.pages.supersede(
                url,
                snapshot,
                now,
                VersionSource::Reconciliation,
                None,
            )?;
            changed |= outcome.wrote_version();
        }
        if !current.is_deleted && current.rating.is_some_and(|rating| rating != tally.rating()) {
            tracing::warn!(
                url,
                upstream = current.rating,
                reconciled = tally.rating(),
                "Rating still differs after full-history recount"
            );
        }
        let revisions = self.db.activity.revisions_for_page(url)?.len();
        if current
            .revision_count
            .is_some_and(|count| count as usize != revisions)
        {
            tracing::warn!(
                url,
                upstream = current.revision_count,
                stored = revisions,
                "Revision count differs from stored history"
            );
        }
        Ok(changed)
    }
}
