use super::*;
use crate::models::activity::AttributionRole;
use crate::models::page::{PageSnapshot, VersionSource};
use crate::test_support::{at, setup_temp_db};

fn version(slug: &str, tags: &[&str], rating: i64) -> PageVersion {
    PageSnapshot {
        title: slug.to_uppercase(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        rating: Some(rating),
        ..PageSnapshot::default()
    }
    .into_version(&format!("http://site/{}", slug), 0, at(0), VersionSource::Content)
}

fn credit(slug: &str, user: &str, role: AttributionRole) -> Attribution {
    Attribution {
        page_url: format!("http://site/{}", slug),
        version_seq: 0,
        user_id: user.to_string(),
        role,
        order_index: 0,
        date: None,
    }
}

fn vote(slug: &str, user: &str, direction: VoteDirection, secs: i64) -> Vote {
    Vote {
        page_url: format!("http://site/{}", slug),
        user_id: user.to_string(),
        direction,
        cast_at: at(secs),
        version_seq: None,
    }
}

fn user_row<'a>(set: &'a AggregateSet, user: &str) -> &'a UserStats {
    set.users
        .iter()
        .find(|row| row.user_id == user)
        .expect("user stats row")
}

#[test]
fn every_author_gets_full_rating_once_per_page() {
    let versions = vec![version("scp-cn-100", &["原创", "scp"], 40)];
    let attributions = vec![
        credit("scp-cn-100", "alice", AttributionRole::Author),
        credit("scp-cn-100", "alice", AttributionRole::Submitter),
        credit("scp-cn-100", "bob", AttributionRole::CoAuthor),
        credit("scp-cn-100", "carol", AttributionRole::Maintainer),
    ];
    let set = AggregationEngine::compute(&versions, &attributions, &[], &[], at(100));
    let alice = user_row(&set, "alice").category(Category::Scp);
    assert_eq!(alice.page_count, 1);
    assert_eq!(alice.rating, 40);
    assert_eq!(user_row(&set, "bob").category(Category::Overall).rating, 40);
    assert!(set.users.iter().all(|row| row.user_id != "carol"));
}

#[test]
fn deleted_fragment_and_superseded_attributions_are_ignored() {
    let mut deleted = version("scp-cn-101", &["原创", "scp"], 90);
    deleted.is_deleted = true;
    let mut current = version("scp-cn-102", &["原创", "scp"], 10);
    current.seq = 1;
    let versions = vec![
        deleted,
        current,
        version("frag-1", &["fragment", "原创"], 30),
    ];
    let attributions = vec![
        credit("scp-cn-101", "alice", AttributionRole::Author),
        credit("scp-cn-102", "alice", AttributionRole::Author),
        Attribution {
            version_seq: 1,
            ..credit("scp-cn-102", "bob", AttributionRole::Author)
        },
        credit("frag-1", "bob", AttributionRole::Author),
    ];
    let set = AggregationEngine::compute(&versions, &attributions, &[], &[], at(100));
    assert!(set.users.iter().all(|row| row.user_id != "alice"));
    let bob = user_row(&set, "bob").category(Category::Overall);
    assert_eq!((bob.page_count, bob.rating), (1, 10));
    assert_eq!(set.site.total_pages, 3);
    assert_eq!(set.site.deleted_pages, 1);
    assert_eq!(set.site.live_pages, 2);
    assert_eq!(set.scores.len(), 1);
}

#[test]
fn ranks_break_ties_by_user_id_and_skip_non_positive() {
    let versions = vec![
        version("a", &["原创"], 25),
        version("b", &["原创"], 25),
        version("c", &["原创"], 50),
        version("d", &["原创"], -5),
    ];
    let attributions = vec![
        credit("a", "zed", AttributionRole::Author),
        credit("b", "amy", AttributionRole::Author),
        credit("c", "max", AttributionRole::Author),
        credit("d", "neg", AttributionRole::Author),
    ];
    let set = AggregationEngine::compute(&versions, &attributions, &[], &[], at(0));
    let rank = |user: &str| user_row(&set, user).category(Category::Original).rank;
    assert_eq!(rank("max"), Some(1));
    assert_eq!(rank("amy"), Some(2));
    assert_eq!(rank("zed"), Some(3));
    assert_eq!(rank("neg"), None);
    assert_eq!(set.site.ranked_users, 3);
}

#[test]
fn translations_and_votes_cast_are_tracked() {
    let versions = vec![version("scp-173", &["scp", "euclid"], 12)];
    let attributions = vec![credit("scp-173", "tr", AttributionRole::Translator)];
    let history = vec![
        vote("scp-173", "v1", VoteDirection::Up, 1),
        vote("scp-173", "v1", VoteDirection::Down, 2),
        vote("scp-173", "v2", VoteDirection::Up, 1),
        vote("scp-173", "v3", VoteDirection::Up, 1),
        vote("scp-173", "v3", VoteDirection::Neutral, 5),
    ];
    let users = vec![User {
        id: "tr".to_string(),
        name: "Translator".to_string(),
        first_seen_at: at(0),
        last_seen_at: at(0),
    }];
    let set = AggregationEngine::compute(&versions, &attributions, &history, &users, at(9));
    let translator = user_row(&set, "tr");
    assert_eq!(translator.name.as_deref(), Some("Translator"));
    assert_eq!(translator.category(Category::Translation).rating, 12);
    assert_eq!(translator.category(Category::Original).page_count, 0);

    let v1 = user_row(&set, "v1");
    assert_eq!((v1.votes_cast_up, v1.votes_cast_down), (0, 1));
    let v3 = user_row(&set, "v3");
    assert_eq!((v3.votes_cast_up, v3.votes_cast_down), (0, 0));

    assert_eq!(set.scores[0].upvotes, 1);
    assert_eq!(set.scores[0].downvotes, 1);
    assert_eq!(set.site.live_upvotes, 1);
    assert_eq!(set.site.live_downvotes, 1);
}

#[test]
fn series_occupancy_comes_from_live_slugs() {
    let mut versions: Vec<PageVersion> = (2..=951)
        .map(|n| version(&format!("scp-cn-{:03}", n), &["原创", "scp"], 1))
        .collect();
    let mut gone = version("scp-cn-960", &["原创", "scp"], 1);
    gone.is_deleted = true;
    versions.push(gone);
    let set = AggregationEngine::compute(&versions, &[], &[], &[], at(0));
    assert_eq!(set.series.len(), 1);
    assert_eq!(set.series[0].used_slots, 950);
    assert!((set.series[0].usage_percent - 95.19).abs() < 0.01);
    assert!(set.series[0].is_open);
}

#[test]
fn rerun_without_changes_is_identical() {
    let (db, _temp) = setup_temp_db();
    let url = "http://site/scp-cn-005";
    let snapshot = PageSnapshot {
        title: "SCP-CN-005".to_string(),
        tags: vec!["原创".to_string(), "scp".to_string()],
        rating: Some(3),
        ..PageSnapshot::default()
    };
    let attribution = credit("scp-cn-005", "alice", AttributionRole::Author);
    db.pages
        .supersede(
            url,
            snapshot,
            at(0),
            VersionSource::Content,
            Some(std::slice::from_ref(&attribution)),
        )
        .expect("supersede");
    db.activity
        .record_votes(&[
            vote("scp-cn-005", "v1", VoteDirection::Up, 1),
            vote("scp-cn-005", "v2", VoteDirection::Up, 2),
            vote("scp-cn-005", "v3", VoteDirection::Up, 3),
        ])
        .expect("votes");

    let first = AggregationEngine::run(&db, at(10)).expect("first run");
    let stored_first = db.stats.snapshot().expect("snapshot").expect("aggregates");
    let second = AggregationEngine::run(&db, at(10)).expect("second run");
    let stored_second = db.stats.snapshot().expect("snapshot").expect("aggregates");

    assert_eq!(first, second);
    assert_eq!(stored_first, stored_second);
    assert_eq!(stored_first.users, first.users);
    assert_eq!(stored_first.series, first.series);
    assert_eq!(
        user_row(&stored_first, "alice").category(Category::Scp).rank,
        Some(1)
    );
}
