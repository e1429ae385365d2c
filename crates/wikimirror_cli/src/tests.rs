//! Unit tests for the `wikimirror` CLI entrypoint module.

use super::upstream::{
    classify_status, decode_envelope, detail_from, listing_from, rate_budget, retry_after,
    revisions_from, votes_from, DetailData, ListingData, RevisionsData, VotesData,
};
use super::{
    apply_overrides, exit_status, format_defects, format_slots, format_stage_report,
    format_status, repair, run_checkpoints, status, with_database, CheckpointAction, Cli,
    Commands, SlotReport, StatusReport,
};
use chrono::{TimeZone, Utc};
use clap::Parser;
use reqwest::header::{HeaderMap, HeaderValue};
use std::collections::HashMap;
use std::time::Duration;
use tempfile::TempDir;
use wikimirror_core::checkpoint::{
    CheckpointKind, CheckpointPayload, CheckpointStore, PageListingCheckpoint,
};
use wikimirror_core::db::pages::IntegrityDefect;
use wikimirror_core::db::queue::QueueCounts;
use wikimirror_core::models::page::{PageSnapshot, VersionSource};
use wikimirror_core::sync::{Stage, StageOutcome, StageReport};
use wikimirror_core::upstream::UpstreamError;
use wikimirror_core::Config;

fn test_config(dir: &TempDir) -> Config {
    let data_dir = dir.path().to_string_lossy().to_string();
    let vars: HashMap<&str, String> = HashMap::from([("WIKIMIRROR_DATA_DIR", data_dir)]);
    Config::from_lookup(|name| vars.get(name).cloned()).expect("config")
}

fn report(stage: Stage, outcome: StageOutcome) -> StageReport {
    StageReport {
        outcome,
        processed: 4,
        changed: 1,
        flagged: 2,
        failed: 0,
        ..StageReport::new(stage)
    }
}

#[test]
fn parses_global_overrides_after_subcommand() {
    let cli = Cli::try_parse_from([
        "wikimirror",
        "sync",
        "--db-path",
        "/tmp/wm-db",
        "--concurrency",
        "0",
        "--site",
        "http://example.wikidot.com",
        "--json",
    ])
    .expect("parse");
    assert_eq!(cli.command, Commands::Sync);
    assert!(cli.json);

    let dir = TempDir::new().expect("tempdir");
    let config = apply_overrides(test_config(&dir), &cli);
    assert_eq!(config.db_path, "/tmp/wm-db");
    assert_eq!(config.site, "http://example.wikidot.com");
    assert_eq!(config.sync.content_concurrency, 1);
    assert!(config.checkpoint_dir.ends_with("checkpoints"));
}

#[test]
fn parses_checkpoint_and_repair_subcommands() {
    let cli = Cli::try_parse_from(["wikimirror", "checkpoints", "prune", "--keep", "1"])
        .expect("parse");
    assert_eq!(
        cli.command,
        Commands::Checkpoints {
            action: CheckpointAction::Prune { keep: Some(1) }
        }
    );
    let cli = Cli::try_parse_from(["wikimirror", "repair", "--url", "http://site/a"])
        .expect("parse");
    assert_eq!(
        cli.command,
        Commands::Repair {
            url: Some("http://site/a".to_string())
        }
    );
    assert!(Cli::try_parse_from(["wikimirror", "checkpoints"]).is_err());
}

#[test]
fn exit_status_reflects_worst_outcome() {
    let completed = report(Stage::Discovery, StageOutcome::Completed);
    let cancelled = report(Stage::Content, StageOutcome::Cancelled);
    let aborted = report(Stage::Discovery, StageOutcome::Aborted);
    assert_eq!(exit_status(&[completed.clone()]), 0);
    assert_eq!(exit_status(&[completed.clone(), cancelled.clone()]), 130);
    assert_eq!(exit_status(&[aborted, cancelled]), 1);
    assert_eq!(exit_status(&[]), 0);
}

#[test]
fn stage_report_line_includes_counters_and_note() {
    let mut line = report(Stage::Content, StageOutcome::Aborted);
    line.note = Some("listing unavailable".to_string());
    let text = format_stage_report(&line);
    assert!(text.starts_with("content"));
    assert!(text.contains("aborted"));
    assert!(text.contains("processed=4 changed=1 flagged=2 failed=0"));
    assert!(text.ends_with("(listing unavailable)"));
}

#[test]
fn status_text_lists_queue_and_missing_aggregates() {
    let text = format_status(&StatusReport {
        pages: 3,
        queue: QueueCounts {
            clean: 1,
            needs_b: 1,
            in_b: 0,
            needs_c: 1,
            in_c: 0,
        },
        watermarks: Vec::new(),
        site: None,
    });
    assert!(text.contains("pages: 3"));
    assert!(text.contains("outstanding=2"));
    assert!(text.contains("tasks: never run"));
    assert!(text.contains("site: not aggregated yet"));
}

#[test]
fn defect_listing_names_each_page() {
    assert_eq!(format_defects(&[]), "No integrity defects found");
    let text = format_defects(&[
        IntegrityDefect::Gap {
            url: "http://site/a".to_string(),
            after_seq: 0,
            millis: 5000,
        },
        IntegrityDefect::NoOpenVersion {
            url: "http://site/b".to_string(),
        },
    ]);
    assert!(text.contains("gap       http://site/a after seq 0 (5000 ms)"));
    assert!(text.contains("http://site/b has no open version"));
    assert!(text.ends_with("2 defect(s)"));
}

#[test]
fn slot_listing_flags_invalid_slots() {
    assert_eq!(format_slots(&[]), "No checkpoints");
    let text = format_slots(&[SlotReport {
        kind: "page-listing",
        path: "/tmp/x.json".to_string(),
        saved_at: None,
        error: Some("bad json".to_string()),
    }]);
    assert!(text.contains("INVALID /tmp/x.json (bad json)"));
}

#[test]
fn status_and_repair_run_against_a_locked_database() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    let url = "http://site/scp-cn-002";

    let empty = with_database(&config, |db| Ok(status(db)?)).expect("status");
    assert_eq!(empty.pages, 0);
    assert!(empty.site.is_none());

    let at = |secs: i64| Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("ts");
    let reports = with_database(&config, |db| {
        db.pages.observe(url, at(0), None, None)?;
        db.pages.supersede(
            url,
            PageSnapshot {
                title: "A".to_string(),
                ..PageSnapshot::default()
            },
            at(0),
            VersionSource::Listing,
            None,
        )?;
        db.pages.supersede(
            url,
            PageSnapshot {
                title: "B".to_string(),
                ..PageSnapshot::default()
            },
            at(10),
            VersionSource::Listing,
            None,
        )?;
        Ok(repair(db, None)?)
    })
    .expect("repair");
    assert!(reports.is_empty());

    let after = with_database(&config, |db| Ok(status(db)?)).expect("status");
    assert_eq!(after.pages, 1);
    assert!(after.watermarks.is_empty());
}

#[test]
fn checkpoint_prune_keeps_requested_slots() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_config(&dir);
    let store = CheckpointStore::new(&config.checkpoint_dir);
    for _ in 0..3 {
        store
            .save(&CheckpointPayload::PageListing(PageListingCheckpoint::fresh(
                Utc::now(),
            )))
            .expect("save");
    }
    let code = run_checkpoints(CheckpointAction::Prune { keep: Some(1) }, &config, true)
        .expect("prune");
    assert_eq!(code, 0);
    assert_eq!(store.list(CheckpointKind::PageListing).expect("list").len(), 1);
}

#[test]
fn http_status_classification() {
    assert_eq!(
        classify_status(429, Some(Duration::from_secs(7)), ""),
        UpstreamError::RateLimited {
            retry_after: Some(Duration::from_secs(7))
        }
    );
    assert_eq!(classify_status(404, None, ""), UpstreamError::NotFound);
    assert!(classify_status(503, None, "busy").is_retryable());
    assert!(classify_status(408, None, "").is_retryable());
    let fatal = classify_status(401, None, "unauthorized");
    assert!(!fatal.is_retryable());
    assert!(fatal.to_string().contains("unauthorized"));
}

#[test]
fn rate_headers_become_a_budget() {
    let now = Utc.timestamp_opt(1_700_000_000, 0).single().expect("ts");
    let mut headers = HeaderMap::new();
    assert_eq!(rate_budget(&headers, now), None);
    headers.insert("x-ratelimit-remaining", HeaderValue::from_static("42"));
    headers.insert("x-ratelimit-reset", HeaderValue::from_static("30"));
    headers.insert("retry-after", HeaderValue::from_static("12"));
    let budget = rate_budget(&headers, now).expect("budget");
    assert_eq!(budget.remaining, 42);
    assert_eq!(budget.reset_at, Some(now + chrono::Duration::seconds(30)));
    assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));

    headers.insert("x-ratelimit-reset", HeaderValue::from_static("1700000500"));
    let budget = rate_budget(&headers, now).expect("budget");
    assert_eq!(
        budget.reset_at,
        Utc.timestamp_opt(1_700_000_500, 0).single()
    );
}

#[test]
fn graphql_errors_are_classified() {
    let body = r#"{"data":null,"errors":[{"message":"Rate limit exceeded"}]}"#;
    assert_eq!(
        decode_envelope::<ListingData>(body).err(),
        Some(UpstreamError::RateLimited { retry_after: None })
    );
    let body = r#"{"errors":[{"message":"Query timed out"}]}"#;
    assert!(matches!(
        decode_envelope::<ListingData>(body),
        Err(UpstreamError::Transient(_))
    ));
    let body = r#"{"errors":[{"message":"Unknown field"}]}"#;
    assert!(matches!(
        decode_envelope::<ListingData>(body),
        Err(UpstreamError::Fatal(_))
    ));
    assert!(matches!(
        decode_envelope::<ListingData>("<html>bad gateway</html>"),
        Err(UpstreamError::Malformed(_))
    ));
}

#[test]
fn listing_response_maps_pages_and_cursor() {
    let body = r#"{"data":{"pages":{
        "edges":[{"node":{"url":"http://site/scp-cn-002","wikidotId":12,"title":"SCP-CN-002",
            "tags":["原创","scp"],"rating":40,"voteCount":52,"revisionCount":9,
            "createdAt":"2020-01-01T00:00:00Z","isDeleted":false}},
                 {"node":{"url":"http://site/fragment:a","title":null,"tags":["fragment"],
            "rating":null,"voteCount":null}}],
        "pageInfo":{"hasNextPage":true,"endCursor":"abc"},
        "totalCount":2}}}"#;
    let listing = listing_from(decode_envelope(body).expect("decode")).expect("listing");
    assert_eq!(listing.items.len(), 2);
    assert_eq!(listing.next_cursor.as_deref(), Some("abc"));
    assert_eq!(listing.total, Some(2));
    assert_eq!(listing.items[0].upstream_id, Some(12));
    assert_eq!(listing.items[0].vote_count, Some(52));
    assert_eq!(listing.items[1].title, "");
    assert_eq!(listing.items[1].rating, None);

    let broken = r#"{"data":{"pages":{"edges":[],"pageInfo":{"hasNextPage":true,"endCursor":null}}}}"#;
    assert!(matches!(
        listing_from(decode_envelope(broken).expect("decode")),
        Err(UpstreamError::Malformed(_))
    ));
}

#[test]
fn detail_response_maps_creator_and_attributions() {
    let body = r#"{"data":{"page":{
        "url":"http://site/scp-cn-002","title":"SCP-CN-002","tags":["原创"],
        "rating":3,"voteCount":5,"revisionCount":2,"source":"text",
        "createdBy":{"id":1001,"name":"Alice"},
        "attributions":[{"user":{"id":"2002","name":"Bob"},"type":"author","order":null,"date":null}]
    }}}"#;
    let detail = detail_from(decode_envelope::<DetailData>(body).expect("decode")).expect("detail");
    assert_eq!(detail.content.as_deref(), Some("text"));
    let creator = detail.created_by.expect("creator");
    assert_eq!(creator.id, "1001");
    assert_eq!(detail.attributions.len(), 1);
    assert_eq!(detail.attributions[0].user_id, "2002");
    assert_eq!(detail.attributions[0].role, "author");
    assert_eq!(detail.attributions[0].order, 0);

    let missing = r#"{"data":{"page":null}}"#;
    assert_eq!(
        detail_from(decode_envelope::<DetailData>(missing).expect("decode")).err(),
        Some(UpstreamError::NotFound)
    );
}

#[test]
fn history_responses_drop_anonymous_votes() {
    let votes = r#"{"data":{"page":{"votes":{
        "edges":[{"node":{"user":{"id":"1","name":"A"},"direction":1,"timestamp":"2021-05-01T00:00:00Z"}},
                 {"node":{"user":null,"direction":-1,"timestamp":"2021-05-02T00:00:00Z"}}],
        "pageInfo":{"hasNextPage":false,"endCursor":"zz"}}}}}"#;
    let votes = votes_from(decode_envelope::<VotesData>(votes).expect("decode")).expect("votes");
    assert_eq!(votes.items.len(), 1);
    assert_eq!(votes.items[0].direction, 1);
    assert_eq!(votes.next_cursor, None);

    let revisions = r#"{"data":{"page":{"revisions":{
        "edges":[{"node":{"index":0,"timestamp":"2020-01-01T00:00:00Z","user":null,"comment":null,"type":"source"}}],
        "pageInfo":{"hasNextPage":false,"endCursor":null}}}}}"#;
    let revisions = revisions_from(decode_envelope::<RevisionsData>(revisions).expect("decode"))
        .expect("revisions");
    assert_eq!(revisions.items[0].user_id, None);
    assert_eq!(revisions.items[0].comment, "");
    assert_eq!(revisions.items[0].kind, "source");
}
