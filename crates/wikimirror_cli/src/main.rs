//! Command-line driver for the wikimirror sync engine.

mod upstream;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::HttpUpstream;
use wikimirror_core::checkpoint::{CheckpointKind, CheckpointStore, SlotInfo};
use wikimirror_core::db::lock::acquire_owner_lock;
use wikimirror_core::db::pages::{IntegrityDefect, RepairReport};
use wikimirror_core::db::queue::QueueCounts;
use wikimirror_core::fetch::{Fetcher, ThreadSleeper};
use wikimirror_core::models::stats::{SiteStats, TaskWatermark};
use wikimirror_core::sync::{CancellationToken, StageOutcome, StageReport, SyncEngine};
use wikimirror_core::{AppError, Config, Database, BOUNDARY_SKEW_TOLERANCE_MS};

#[derive(Parser, Debug)]
#[command(name = "wikimirror", about = "Incremental wiki mirror", version)]
struct Cli {
    /// Database directory (overrides WIKIMIRROR_DB_PATH)
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Checkpoint directory (overrides WIKIMIRROR_CHECKPOINT_DIR)
    #[arg(long, global = true)]
    checkpoint_dir: Option<String>,

    /// Upstream GraphQL endpoint (overrides WIKIMIRROR_ENDPOINT)
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Site to mirror (overrides WIKIMIRROR_SITE)
    #[arg(long, global = true)]
    site: Option<String>,

    /// Content-stage worker count (overrides WIKIMIRROR_CONCURRENCY)
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Request timeout in seconds
    #[arg(short = 't', long, global = true, default_value = "30")]
    timeout: u64,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Commands {
    /// Run discovery, content, reconciliation and aggregation
    Sync,
    /// Walk the upstream listing and queue drifted pages
    Discover,
    /// Fetch full content, votes and revisions for queued pages
    Content,
    /// Repair boundaries and recount votes for flagged pages
    Reconcile,
    /// Rebuild ratings, rankings and series statistics
    Aggregate,
    /// Show queue counts, task watermarks and site totals
    Status,
    /// Report version-chain integrity defects
    Diagnose,
    /// Repair version boundaries of defective pages
    Repair {
        /// Repair only this page
        #[arg(long)]
        url: Option<String>,
    },
    /// Inspect or prune crawl checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum CheckpointAction {
    /// List checkpoint slots, newest first
    Show,
    /// Delete all but the newest valid slots
    Prune {
        /// Slots to keep per kind (defaults to the configured retention)
        #[arg(long)]
        keep: Option<usize>,
    },
}

/// Apply command-line overrides on top of the environment configuration.
fn apply_overrides(mut config: Config, cli: &Cli) -> Config {
    if let Some(db_path) = &cli.db_path {
        config.db_path = db_path.clone();
    }
    if let Some(dir) = &cli.checkpoint_dir {
        config.checkpoint_dir = dir.clone();
    }
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(site) = &cli.site {
        config.site = site.clone();
    }
    if let Some(concurrency) = cli.concurrency {
        config.sync.content_concurrency = concurrency.max(1);
    }
    config
}

#[derive(Debug, Serialize)]
struct StatusReport {
    pages: u64,
    queue: QueueCounts,
    watermarks: Vec<TaskWatermark>,
    site: Option<SiteStats>,
}

#[derive(Debug, Serialize)]
struct SlotReport {
    kind: &'static str,
    path: String,
    saved_at: Option<String>,
    error: Option<String>,
}

fn outcome_label(outcome: StageOutcome) -> &'static str {
    match outcome {
        StageOutcome::Completed => "completed",
        StageOutcome::Cancelled => "cancelled",
        StageOutcome::Aborted => "aborted",
    }
}

fn format_stage_report(report: &StageReport) -> String {
    let mut line = format!(
        "{:<10} {:<9} processed={} changed={} flagged={} failed={}",
        report.stage.as_str(),
        outcome_label(report.outcome),
        report.processed,
        report.changed,
        report.flagged,
        report.failed
    );
    if let Some(note) = &report.note {
        line.push_str(&format!(" ({})", note));
    }
    line
}

/// Process exit status for a set of stage reports.
///
/// Cancellation maps to 130 like an interrupted shell job; an aborted stage
/// maps to 1.
fn exit_status(reports: &[StageReport]) -> u8 {
    if reports
        .iter()
        .any(|r| r.outcome == StageOutcome::Aborted)
    {
        1
    } else if reports
        .iter()
        .any(|r| r.outcome == StageOutcome::Cancelled)
    {
        130
    } else {
        0
    }
}

fn format_status(status: &StatusReport) -> String {
    let queue = &status.queue;
    let mut lines = vec![
        format!("pages: {}", status.pages),
        format!(
            "queue: clean={} needs_b={} in_b={} needs_c={} in_c={} outstanding={}",
            queue.clean,
            queue.needs_b,
            queue.in_b,
            queue.needs_c,
            queue.in_c,
            queue.outstanding()
        ),
    ];
    if status.watermarks.is_empty() {
        lines.push("tasks: never run".to_string());
    }
    for mark in &status.watermarks {
        lines.push(format!(
            "task {:<10} last_run={} {}",
            mark.task,
            mark.last_run_at.to_rfc3339(),
            mark.note.as_deref().unwrap_or("")
        ));
    }
    match &status.site {
        Some(site) => lines.push(format!(
            "site: total={} live={} deleted={} up={} down={} ranked_users={} generated={}",
            site.total_pages,
            site.live_pages,
            site.deleted_pages,
            site.live_upvotes,
            site.live_downvotes,
            site.ranked_users,
            site.generated_at.to_rfc3339()
        )),
        None => lines.push("site: not aggregated yet".to_string()),
    }
    lines.join("\n").trim_end().to_string()
}

fn format_defect(defect: &IntegrityDefect) -> String {
    match defect {
        IntegrityDefect::Gap {
            url,
            after_seq,
            millis,
        } => format!("gap       {} after seq {} ({} ms)", url, after_seq, millis),
        IntegrityDefect::Overlap {
            url,
            after_seq,
            millis,
        } => format!("overlap   {} after seq {} ({} ms)", url, after_seq, millis),
        IntegrityDefect::MultipleOpen { url, open } => {
            format!("multi     {} has {} open versions", url, open)
        }
        IntegrityDefect::NoOpenVersion { url } => format!("unopened  {} has no open version", url),
    }
}

fn format_defects(defects: &[IntegrityDefect]) -> String {
    if defects.is_empty() {
        return "No integrity defects found".to_string();
    }
    let mut lines: Vec<String> = defects.iter().map(format_defect).collect();
    lines.push(format!("{} defect(s)", defects.len()));
    lines.join("\n")
}

fn slot_reports(kind: CheckpointKind, slots: Vec<SlotInfo>) -> Vec<SlotReport> {
    slots
        .into_iter()
        .map(|slot| SlotReport {
            kind: kind.as_str(),
            path: slot.path.display().to_string(),
            saved_at: slot.saved_at.map(|at| at.to_rfc3339()),
            error: slot.error,
        })
        .collect()
}

fn format_slots(slots: &[SlotReport]) -> String {
    if slots.is_empty() {
        return "No checkpoints".to_string();
    }
    slots
        .iter()
        .map(|slot| match &slot.error {
            Some(error) => format!("{:<14} INVALID {} ({})", slot.kind, slot.path, error),
            None => format!(
                "{:<14} {} {}",
                slot.kind,
                slot.saved_at.as_deref().unwrap_or("-"),
                slot.path
            ),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn print_output<T: Serialize>(
    json: bool,
    value: &T,
    text: impl FnOnce() -> String,
) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}

/// Take the owner lock, open the database and run `f` while the lock is held.
fn with_database<T>(
    config: &Config,
    f: impl FnOnce(&Database) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let _owner_lock = acquire_owner_lock(&config.db_path)
        .with_context(|| format!("locking database at {}", config.db_path))?;
    let db = Database::new(&config.db_path)
        .with_context(|| format!("opening database at {}", config.db_path))?;
    f(&db)
}

fn status(db: &Database) -> Result<StatusReport, AppError> {
    Ok(StatusReport {
        pages: db.pages.count()?,
        queue: db.queue.counts()?,
        watermarks: db.tasks.list()?,
        site: db.stats.site()?,
    })
}

fn repair(db: &Database, url: Option<&str>) -> Result<Vec<RepairReport>, AppError> {
    let targets: Vec<String> = match url {
        Some(url) => vec![url.to_string()],
        None => {
            let mut urls: Vec<String> = db
                .pages
                .check_all_integrity(BOUNDARY_SKEW_TOLERANCE_MS)?
                .iter()
                .map(|defect| defect.url().to_string())
                .collect();
            urls.dedup();
            urls
        }
    };
    let mut reports = Vec::with_capacity(targets.len());
    for target in targets {
        reports.push(db.pages.repair_boundaries(&target)?);
    }
    Ok(reports)
}

fn run_checkpoints(action: CheckpointAction, config: &Config, json: bool) -> anyhow::Result<u8> {
    let store = CheckpointStore::new(&config.checkpoint_dir);
    match action {
        CheckpointAction::Show => {
            let mut slots = Vec::new();
            for kind in CheckpointKind::ALL {
                slots.extend(slot_reports(kind, store.list(kind)?));
            }
            print_output(json, &slots, || format_slots(&slots))?;
        }
        CheckpointAction::Prune { keep } => {
            let keep = keep.unwrap_or(config.sync.checkpoint_keep);
            let mut removed = 0;
            for kind in CheckpointKind::ALL {
                removed += store.prune(kind, keep)?;
            }
            let summary = serde_json::json!({ "removed": removed, "keep": keep });
            print_output(json, &summary, || {
                format!("Removed {} checkpoint file(s), kept up to {} per kind", removed, keep)
            })?;
        }
    }
    Ok(0)
}

fn run_stages<F>(
    config: &Config,
    timeout: Duration,
    cancel: CancellationToken,
    json: bool,
    stages: F,
) -> anyhow::Result<u8>
where
    F: FnOnce(&SyncEngine) -> Result<Vec<StageReport>, AppError>,
{
    with_database(config, |db| {
        let upstream = HttpUpstream::new(&config.endpoint, &config.site, timeout)
            .context("building upstream client")?;
        let fetcher = Fetcher::new(&config.fetch, Arc::new(ThreadSleeper));
        let engine = SyncEngine::new(
            db.share()?,
            Arc::new(upstream),
            Arc::new(fetcher),
            CheckpointStore::new(&config.checkpoint_dir),
            config.sync.clone(),
        )
        .with_cancellation(cancel);
        tracing::info!(endpoint = %config.endpoint, site = %config.site, "Starting sync");
        let reports = stages(&engine)?;
        print_output(json, &reports, || {
            reports
                .iter()
                .map(format_stage_report)
                .collect::<Vec<_>>()
                .join("\n")
        })?;
        Ok(exit_status(&reports))
    })
}

fn run(
    command: Commands,
    config: &Config,
    timeout: Duration,
    cancel: CancellationToken,
    json: bool,
) -> anyhow::Result<u8> {
    let single = |report: StageReport| vec![report];
    match command {
        Commands::Sync => run_stages(config, timeout, cancel, json, SyncEngine::run_all),
        Commands::Discover => run_stages(config, timeout, cancel, json, |engine| {
            engine.discover().map(single)
        }),
        Commands::Content => run_stages(config, timeout, cancel, json, |engine| {
            engine.content().map(single)
        }),
        Commands::Reconcile => run_stages(config, timeout, cancel, json, |engine| {
            engine.reconcile().map(single)
        }),
        Commands::Aggregate => run_stages(config, timeout, cancel, json, |engine| {
            engine.aggregate().map(single)
        }),
        Commands::Status => with_database(config, |db| {
            let report = status(db)?;
            print_output(json, &report, || format_status(&report))?;
            Ok(0)
        }),
        Commands::Diagnose => with_database(config, |db| {
            let defects = db.pages.check_all_integrity(BOUNDARY_SKEW_TOLERANCE_MS)?;
            print_output(json, &defects, || format_defects(&defects))?;
            Ok(u8::from(!defects.is_empty()))
        }),
        Commands::Repair { url } => with_database(config, |db| {
            let reports = repair(db, url.as_deref())?;
            print_output(json, &reports, || {
                let adjusted: u32 = reports.iter().map(|r| r.adjusted).sum();
                format!(
                    "Repaired {} page(s), {} version(s) adjusted",
                    reports.iter().filter(|r| r.changed()).count(),
                    adjusted
                )
            })?;
            Ok(0)
        }),
        Commands::Checkpoints { action } => run_checkpoints(action, config, json),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wikimirror=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = apply_overrides(Config::from_env().context("loading configuration")?, &cli);
    let timeout = Duration::from_secs(cli.timeout.max(1));
    let json = cli.json;
    let command = cli.command;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; stopping after the current page");
            interrupt.cancel();
        }
    });

    let status = tokio::task::spawn_blocking(move || run(command, &config, timeout, cancel, json))
        .await
        .context("command task failed")??;
    Ok(ExitCode::from(status))
}

#[cfg(test)]
mod tests;
