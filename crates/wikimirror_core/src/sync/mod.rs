//! Sync pipeline: discovery (A), content (B), reconciliation (C) and the
//! post-sync aggregation pass.
//!
//! Stages are idempotent and may be interrupted at any point. Discovery and
//! content persist their progress through the [`CheckpointStore`]; the
//! dirty-page queue carries work between stages.

/// Phase B: full content, vote and revision fetch.
pub mod content;
/// Phase A: listing crawl and drift detection.
pub mod discovery;
/// Phase C: boundary repair and full-history recount.
pub mod reconcile;

use crate::aggregate::AggregationEngine;
use crate::checkpoint::CheckpointStore;
use crate::config::SyncTuning;
use crate::db::Database;
use crate::error::AppError;
use crate::fetch::Fetcher;
use crate::models::stats::TaskWatermark;
use crate::upstream::Upstream;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag polled between pages and batches.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Pipeline stage, also used as the watermark task name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovery,
    Content,
    Reconcile,
    Aggregate,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Content => "content",
            Self::Reconcile => "reconcile",
            Self::Aggregate => "aggregate",
        }
    }
}

/// How a stage run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    /// Stopped by the cancellation token; progress was checkpointed.
    Cancelled,
    /// The upstream stayed unavailable; progress was checkpointed.
    Aborted,
}

/// Counters reported by one stage run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub outcome: StageOutcome,
    /// Pages looked at.
    pub processed: u64,
    /// Pages whose version chain gained a version.
    pub changed: u64,
    /// Pages queued for a later phase.
    pub flagged: u64,
    /// Pages released back to the queue after a failure.
    pub failed: u64,
    pub note: Option<String>,
}

impl StageReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            outcome: StageOutcome::Completed,
            processed: 0,
            changed: 0,
            flagged: 0,
            failed: 0,
            note: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == StageOutcome::Completed
    }

    fn summary(&self) -> String {
        format!(
            "processed={} changed={} flagged={} failed={}",
            self.processed, self.changed, self.flagged, self.failed
        )
    }
}

/// Drives the sync stages against one database and upstream.
pub struct SyncEngine {
    db: Database,
    upstream: Arc<dyn Upstream>,
    fetcher: Arc<Fetcher>,
    checkpoints: CheckpointStore,
    tuning: SyncTuning,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(
        db: Database,
        upstream: Arc<dyn Upstream>,
        fetcher: Arc<Fetcher>,
        checkpoints: CheckpointStore,
        tuning: SyncTuning,
    ) -> Self {
        Self {
            db,
            upstream,
            fetcher,
            checkpoints,
            tuning,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the engine's cancellation token with a shared one.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Run discovery, content, reconciliation and aggregation in order.
    ///
    /// # Returns
    /// One report per stage that ran. The pipeline stops after the first
    /// stage that does not complete.
    ///
    /// # Errors
    /// Returns an error when storage or checkpoint access fails.
    pub fn run_all(&self) -> Result<Vec<StageReport>, AppError> {
        let mut reports = Vec::new();
        let stages: [fn(&Self) -> Result<StageReport, AppError>; 4] = [
            Self::discover,
            Self::content,
            Self::reconcile,
            Self::aggregate,
        ];
        for stage in stages {
            let report = stage(self)?;
            let completed = report.is_completed();
            reports.push(report);
            if !completed {
                break;
            }
        }
        Ok(reports)
    }

    /// Rebuild every derived aggregate from current versions and attributions.
    ///
    /// # Errors
    /// Returns an error when storage access fails.
    pub fn aggregate(&self) -> Result<StageReport, AppError> {
        let started = Utc::now();
        let mut report = StageReport::new(Stage::Aggregate);
        if self.cancel.is_cancelled() {
            report.outcome = StageOutcome::Cancelled;
            return Ok(report);
        }
        let set = AggregationEngine::run(&self.db, started)?;
        report.processed = set.site.total_pages;
        report.note = Some(format!(
            "users={} series={} scored_pages={}",
            set.users.len(),
            set.series.len(),
            set.scores.len()
        ));
        self.finish_stage(&report, started)?;
        Ok(report)
    }

    fn finish_stage(&self, report: &StageReport, started: DateTime<Utc>) -> Result<(), AppError> {
        let note = match &report.note {
            Some(extra) => format!("{} {}", report.summary(), extra),
            None => report.summary(),
        };
        self.db.tasks.set(&TaskWatermark {
            task: report.stage.as_str().to_string(),
            last_run_at: Utc::now(),
            cursor_at: Some(started),
            note: Some(note),
        })?;
        tracing::info!(
            stage = report.stage.as_str(),
            processed = report.processed,
            changed = report.changed,
            flagged = report.flagged,
            failed = report.failed,
            "Stage completed"
        );
        Ok(())
    }
}
