//! Content stage: full detail, vote and revision fetch for queued pages.
//!
//! Workers share one [`Fetcher`], so throttle state and the rate budget are
//! global to the run. Each worker claims a page, fetches it, writes the new
//! version and its history, then completes or releases the claim.

use super::{Stage, StageOutcome, StageReport, SyncEngine};
use crate::checkpoint::{CheckpointKind, CheckpointPayload, ContentCrawlCheckpoint, PagePartial};
use crate::constants::BOUNDARY_SKEW_TOLERANCE_MS;
use crate::error::AppError;
use crate::fetch::{FetchOutcome, FetchReason, FetchRequest, Fetcher};
use crate::models::activity::{Attribution, AttributionRole, Revision, Vote, VoteDirection};
use crate::models::page::{PageSnapshot, VersionSource};
use crate::models::queue::{Claim, DriftReason, Phase, PhaseState};
use crate::upstream::{PageDetail, Paginated, Response, RevisionRecord, UpstreamError, VoteRecord};
use crate::votes;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Result of processing one claimed page.
#[derive(Debug)]
enum PageResult {
    Done {
        changed: bool,
        reconcile: Vec<DriftReason>,
    },
    Failed(String),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared by the content workers of one run.
struct ContentRun {
    pending: Mutex<VecDeque<String>>,
    checkpoint: Mutex<ContentCrawlCheckpoint>,
    report: Mutex<StageReport>,
    since_save: Mutex<usize>,
}

impl ContentRun {
    fn new(pending: VecDeque<String>, checkpoint: ContentCrawlCheckpoint) -> Self {
        Self {
            pending: Mutex::new(pending),
            checkpoint: Mutex::new(checkpoint),
            report: Mutex::new(StageReport::new(Stage::Content)),
            since_save: Mutex::new(0),
        }
    }

    fn next_url(&self) -> Option<String> {
        lock(&self.pending).pop_front()
    }

    fn partial(&self, url: &str) -> PagePartial {
        lock(&self.checkpoint)
            .partials
            .get(url)
            .cloned()
            .unwrap_or_default()
    }

    /// Remember pagination progress for `url`; empty progress drops the entry.
    fn store_partial(&self, url: &str, partial: &PagePartial) {
        let mut checkpoint = lock(&self.checkpoint);
        checkpoint.completed.remove(url);
        if partial.vote_cursor.is_none() && partial.revision_cursor.is_none() {
            checkpoint.partials.remove(url);
        } else {
            checkpoint.partials.insert(url.to_string(), partial.clone());
        }
    }

    fn finish(&self, url: &str, changed: bool, flagged: bool) {
        {
            let mut checkpoint = lock(&self.checkpoint);
            checkpoint.partials.remove(url);
            checkpoint.completed.insert(url.to_string());
        }
        let mut report = lock(&self.report);
        report.processed += 1;
        if changed {
            report.changed += 1;
        }
        if flagged {
            report.flagged += 1;
        }
    }

    fn fail(&self) {
        let mut report = lock(&self.report);
        report.processed += 1;
        report.failed += 1;
    }

    /// `true` once `interval` pages finished since the last save.
    fn due_for_save(&self, interval: usize) -> bool {
        let mut since = lock(&self.since_save);
        *since += 1;
        if *since >= interval.max(1) {
            *since = 0;
            return true;
        }
        false
    }

    fn snapshot(&self) -> ContentCrawlCheckpoint {
        lock(&self.checkpoint).clone()
    }
}

/// Drain a cursor-paginated history into `acc`.
///
/// `cursor` and `acc` hold the progress made so far, so an error leaves them
/// ready to resume from the failing page.
fn collect_history<T, F>(
    fetcher: &Fetcher,
    cursor: &mut Option<String>,
    acc: &mut Vec<T>,
    mut page: F,
) -> Result<Response<Vec<T>>, UpstreamError>
where
    F: FnMut(Option<&str>) -> Result<Response<Paginated<T>>, UpstreamError>,
{
    if cursor.is_none() {
        acc.clear();
    }
    loop {
        let response = page(cursor.as_deref())?;
        fetcher.observe_budget(response.budget);
        let Paginated {
            items, next_cursor, ..
        } = response.data;
        acc.extend(items);
        match next_cursor {
            Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                *cursor = None;
                acc.clear();
                return Err(UpstreamError::Malformed(format!(
                    "history cursor '{}' did not advance",
                    next
                )));
            }
            Some(next) => {
                *cursor = Some(next);
                fetcher.pace();
            }
            None => {
                *cursor = None;
                return Ok(Response::new(std::mem::take(acc)));
            }
        }
    }
}

/// Attributions from page detail; the creator becomes the submitter when the
/// upstream lists none.
fn attributions_from_detail(detail: &PageDetail) -> Vec<Attribution> {
    let mut out: Vec<Attribution> = Vec::new();
    for entry in &detail.attributions {
        let Some(role) = AttributionRole::parse(&entry.role) else {
            tracing::debug!(url = %detail.url, role = %entry.role, "Skipping unknown attribution role");
            continue;
        };
        if out
            .iter()
            .any(|a| a.user_id == entry.user_id && a.role == role)
        {
            continue;
        }
        out.push(Attribution {
            page_url: detail.url.clone(),
            version_seq: 0,
            user_id: entry.user_id.clone(),
            role,
            order_index: entry.order,
            date: entry.date,
        });
    }
    if out.is_empty() {
        if let Some(creator) = &detail.created_by {
            out.push(Attribution {
                page_url: detail.url.clone(),
                version_seq: 0,
                user_id: creator.id.clone(),
                role: AttributionRole::Submitter,
                order_index: 0,
                date: detail.created_at,
            });
        }
    }
    out
}

fn votes_from_records(url: &str, records: &[VoteRecord]) -> Vec<Vote> {
    records
        .iter()
        .filter_map(|record| match VoteDirection::from_value(record.direction) {
            Some(direction) => Some(Vote {
                page_url: url.to_string(),
                user_id: record.user_id.clone(),
                direction,
                cast_at: record.cast_at,
                version_seq: None,
            }),
            None => {
                tracing::warn!(
                    url,
                    user = %record.user_id,
                    direction = record.direction,
                    "Dropping vote with out-of-range direction"
                );
                None
            }
        })
        .collect()
}

fn users_seen(
    detail: &PageDetail,
    votes: &[VoteRecord],
    revisions: &[RevisionRecord],
) -> Vec<(String, Option<String>)> {
    let mut users: Vec<(String, Option<String>)> = Vec::new();
    let mut push = |id: &str, name: Option<&String>| {
        if id.is_empty() {
            return;
        }
        match users.iter_mut().find(|(known, _)| known == id) {
            Some((_, known_name)) => {
                if known_name.is_none() {
                    *known_name = name.cloned();
                }
            }
            None => users.push((id.to_string(), name.cloned())),
        }
    };
    if let Some(creator) = &detail.created_by {
        push(&creator.id, creator.name.as_ref());
    }
    for entry in &detail.attributions {
        push(&entry.user_id, entry.user_name.as_ref());
    }
    for vote in votes {
        push(&vote.user_id, vote.user_name.as_ref());
    }
    for revision in revisions {
        if let Some(id) = &revision.user_id {
            push(id, revision.user_name.as_ref());
        }
    }
    users
}

/// New collection data and whether a fallback was taken.
fn history_data<T>(outcome: FetchOutcome<Vec<T>>) -> Result<(Vec<T>, bool), FetchReason> {
    match outcome {
        FetchOutcome::Accepted { data, complete, .. } => Ok((data, !complete)),
        FetchOutcome::UseExisting { reason } => Ok((Vec::new(), reason != FetchReason::Unchanged)),
        FetchOutcome::Failed { reason, .. } => Err(reason),
    }
}

impl SyncEngine {
    /// Phase B: fetch full data for every page waiting in `NeedsB` (and pages
    /// whose `InB` lease expired).
    ///
    /// Pages are offered to the queue one claim at a time, so a page held by
    /// another worker is skipped. Failed pages are released and wait for the
    /// next run.
    ///
    /// # Errors
    /// Returns an error when storage or checkpoint access fails.
    pub fn content(&self) -> Result<StageReport, AppError> {
        let started = Utc::now();
        let checkpoint = match self.checkpoints.load(CheckpointKind::ContentCrawl)? {
            Some(CheckpointPayload::ContentCrawl(saved)) => saved,
            _ => ContentCrawlCheckpoint::default(),
        };
        let mut pending: VecDeque<String> =
            self.db.queue.urls_in_state(PhaseState::NeedsB)?.into();
        pending.extend(self.db.queue.urls_in_state(PhaseState::InB)?);
        tracing::info!(
            pending = pending.len(),
            resumed_partials = checkpoint.partials.len(),
            "Starting content stage"
        );

        let run = ContentRun::new(pending, checkpoint);
        let workers = self.tuning.content_concurrency.max(1);
        let results: Vec<Result<(), AppError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| scope.spawn(|| self.content_worker(&run)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(AppError::StorageMessage(
                            "content worker panicked".to_string(),
                        ))
                    })
                })
                .collect()
        });

        let failure = results.into_iter().find_map(Result::err);
        if failure.is_some() || self.cancel.is_cancelled() {
            self.checkpoints
                .save(&CheckpointPayload::ContentCrawl(run.snapshot()))?;
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let mut report = lock(&run.report).clone();
        if self.cancel.is_cancelled() {
            tracing::info!(processed = report.processed, "Content stage cancelled");
            report.outcome = StageOutcome::Cancelled;
            return Ok(report);
        }
        self.checkpoints
            .save(&CheckpointPayload::ContentCrawl(ContentCrawlCheckpoint::default()))?;
        self.checkpoints
            .prune(CheckpointKind::ContentCrawl, self.tuning.checkpoint_keep)?;
        self.finish_stage(&report, started)?;
        Ok(report)
    }

    fn content_worker(&self, run: &ContentRun) -> Result<(), AppError> {
        let lease = self.tuning.claim_lease();
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let Some(url) = run.next_url() else {
                return Ok(());
            };
            let Some(claim) = self.db.queue.claim(&url, Phase::Content, Utc::now(), lease)? else {
                tracing::debug!(url = %url, "Page not claimable; skipping");
                continue;
            };
            match self.process_page(&claim, run) {
                Ok(PageResult::Done { changed, reconcile }) => {
                    for reason in &reconcile {
                        self.db.queue.mark_needs_c(&url, *reason, Utc::now())?;
                    }
                    self.db
                        .queue
                        .complete(&claim, !reconcile.is_empty(), Utc::now())?;
                    run.finish(&url, changed, !reconcile.is_empty());
                }
                Ok(PageResult::Failed(message)) => {
                    tracing::warn!(url = %url, reason = %message, "Content fetch failed; page released");
                    self.db.queue.release(&claim, &message, Utc::now())?;
                    run.fail();
                }
                Err(err) => {
                    tracing::error!(url = %url, error = %err, "Content processing failed; page released");
                    self.db.queue.release(&claim, &err.to_string(), Utc::now())?;
                    run.fail();
                }
            }
            if run.due_for_save(self.tuning.checkpoint_interval) {
                self.checkpoints
                    .save(&CheckpointPayload::ContentCrawl(run.snapshot()))?;
            }
        }
    }

    fn process_page(&self, claim: &Claim, run: &ContentRun) -> Result<PageResult, AppError> {
        let url = claim.url.as_str();
        let detail_key = format!("detail:{}", url);
        let detail = match self
            .fetcher
            .call(&detail_key, || self.upstream.page_detail(url))
        {
            Ok(detail) => detail,
            Err(UpstreamError::NotFound) => return self.record_missing(url),
            Err(err) => return Ok(PageResult::Failed(format!("detail: {}", err))),
        };

        let stored_votes = self.db.activity.votes_for_page(url)?;
        let stored_tally = votes::reconcile_page(url, &stored_votes);
        let stored_revisions = self.db.activity.revisions_for_page(url)?.len() as u64;
        let page_size = self.tuning.history_page_size.max(1);
        let mut partial = run.partial(url);

        let vote_key = format!("votes:{}", url);
        let mut vote_request = FetchRequest::new(
            &vote_key,
            detail.vote_count.map(u64::from),
            u64::from(stored_tally.vote_count()),
        );
        if detail.rating.is_some_and(|rating| rating != stored_tally.rating()) {
            vote_request = vote_request.always_fetch();
        }
        let vote_outcome = self.fetcher.fetch(&vote_request, |_| {
            let result = collect_history(
                &self.fetcher,
                &mut partial.vote_cursor,
                &mut partial.votes,
                |cursor| self.upstream.page_votes(url, cursor, page_size),
            );
            if result.is_err() {
                run.store_partial(url, &partial);
            }
            result
        });
        let (vote_records, votes_fallback) = match history_data(vote_outcome) {
            Ok(found) => found,
            Err(reason) => return Ok(PageResult::Failed(format!("votes: {}", reason.code()))),
        };
        if let Some(reason) = self.fetcher.take_protection(&vote_key) {
            tracing::warn!(url, reason = reason.code(), "Kept stored votes over an incomplete fetch");
        }

        let revision_key = format!("revisions:{}", url);
        let revision_request = FetchRequest::new(
            &revision_key,
            detail.revision_count.map(u64::from),
            stored_revisions,
        );
        let revision_outcome = self.fetcher.fetch(&revision_request, |_| {
            let result = collect_history(
                &self.fetcher,
                &mut partial.revision_cursor,
                &mut partial.revisions,
                |cursor| self.upstream.page_revisions(url, cursor, page_size),
            );
            if result.is_err() {
                run.store_partial(url, &partial);
            }
            result
        });
        let (revision_records, revisions_fallback) = match history_data(revision_outcome) {
            Ok(found) => found,
            Err(reason) => {
                return Ok(PageResult::Failed(format!("revisions: {}", reason.code())))
            }
        };
        if let Some(reason) = self.fetcher.take_protection(&revision_key) {
            tracing::warn!(url, reason = reason.code(), "Kept stored revisions over an incomplete fetch");
        }

        let now = Utc::now();
        let fresh_votes = votes_from_records(url, &vote_records);
        let tally = votes::reconcile_page(url, stored_votes.iter().chain(fresh_votes.iter()));
        let attributions = attributions_from_detail(&detail);
        self.db.activity.upsert_users(
            &users_seen(&detail, &vote_records, &revision_records),
            now,
        )?;
        self.db
            .pages
            .observe(url, now, detail.upstream_id, detail.created_at)?;

        let snapshot = PageSnapshot {
            title: detail.title.clone(),
            tags: detail.tags.clone(),
            rating: detail.rating,
            vote_count: detail.vote_count,
            upvotes: Some(tally.upvotes),
            downvotes: Some(tally.downvotes),
            revision_count: detail.revision_count,
            content: detail.content.clone(),
            is_deleted: detail.is_deleted,
        };
        let structural = snapshot.is_structural();
        let outcome = self.db.pages.supersede(
            url,
            snapshot,
            now,
            VersionSource::Content,
            Some(&attributions),
        )?;
        let seq = outcome.current_seq();

        let fresh_votes: Vec<Vote> = fresh_votes
            .into_iter()
            .map(|vote| Vote {
                version_seq: Some(seq),
                ..vote
            })
            .collect();
        self.db.activity.record_votes(&fresh_votes)?;
        let revisions: Vec<Revision> = revision_records
            .into_iter()
            .map(|record| Revision {
                page_url: url.to_string(),
                number: record.number,
                created_at: record.created_at,
                user_id: record.user_id,
                comment: record.comment,
                kind: record.kind,
                version_seq: Some(seq),
            })
            .collect();
        self.db.activity.record_revisions(&revisions)?;

        let mut reconcile = Vec::new();
        if votes_fallback || revisions_fallback {
            reconcile.push(DriftReason::FetchFallback);
        }
        let rating_mismatch = detail
            .rating
            .is_some_and(|rating| rating != tally.rating());
        if rating_mismatch && !structural && !detail.is_deleted {
            tracing::warn!(
                url,
                upstream = detail.rating,
                reconciled = tally.rating(),
                "Reconciled rating differs from upstream"
            );
            reconcile.push(DriftReason::CountMismatch);
        }
        if !self
            .db
            .pages
            .check_integrity(url, BOUNDARY_SKEW_TOLERANCE_MS)?
            .is_empty()
        {
            reconcile.push(DriftReason::BoundaryDefect);
        }
        Ok(PageResult::Done {
            changed: outcome.wrote_version(),
            reconcile,
        })
    }

    /// The upstream no longer has `url`: close the chain with a deleted version.
    fn record_missing(&self, url: &str) -> Result<PageResult, AppError> {
        let Some(current) = self.db.pages.current_version(url)? else {
            return Ok(PageResult::Done {
                changed: false,
                reconcile: Vec::new(),
            });
        };
        if current.is_deleted {
            return Ok(PageResult::Done {
                changed: false,
                reconcile: Vec::new(),
            });
        }
        let mut snapshot = PageSnapshot::from_version(&current);
        snapshot.is_deleted = true;
        let outcome =
            self.db
                .pages
                .supersede(url, snapshot, Utc::now(), VersionSource::Content, None)?;
        tracing::info!(url, seq = outcome.current_seq(), "Page gone upstream; recorded deletion");
        Ok(PageResult::Done {
            changed: outcome.wrote_version(),
            reconcile: Vec::new(),
        })
    }
}
