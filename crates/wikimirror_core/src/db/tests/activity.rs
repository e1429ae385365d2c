//! Vote, revision and user storage tests.

use super::*;

const URL: &str = "http://site/scp-173";

fn vote(user: &str, direction: VoteDirection, secs: i64) -> Vote {
    Vote {
        page_url: URL.to_string(),
        user_id: user.to_string(),
        direction,
        cast_at: at(secs),
        version_seq: Some(0),
    }
}

#[test]
fn recording_the_same_votes_twice_adds_no_rows() {
    let (db, _temp) = setup_temp_db();
    let votes = vec![
        vote("a", VoteDirection::Up, 1),
        vote("a", VoteDirection::Down, 2),
        vote("b", VoteDirection::Up, 3),
    ];
    assert_eq!(db.activity.record_votes(&votes).expect("first"), 3);
    assert_eq!(db.activity.record_votes(&votes).expect("second"), 0);
    assert_eq!(db.activity.votes_for_page(URL).expect("votes").len(), 3);
}

#[test]
fn votes_are_scoped_to_their_page() {
    let (db, _temp) = setup_temp_db();
    let mut other = vote("a", VoteDirection::Up, 1);
    other.page_url = "http://site/scp-173-j".to_string();
    db.activity
        .record_votes(&[vote("a", VoteDirection::Down, 1), other])
        .expect("record");
    let votes = db.activity.votes_for_page(URL).expect("votes");
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0].direction, VoteDirection::Down);
    assert_eq!(db.activity.all_votes().expect("all").len(), 2);
}

#[test]
fn simultaneous_observations_resolve_deterministically() {
    let (db, _temp) = setup_temp_db();
    db.activity
        .record_votes(&[vote("a", VoteDirection::Up, 5)])
        .expect("up");
    db.activity
        .record_votes(&[vote("a", VoteDirection::Down, 5)])
        .expect("down");
    let votes = db.activity.votes_for_page(URL).expect("votes");
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0].direction, VoteDirection::Up);
}

#[test]
fn revisions_are_append_only() {
    let (db, _temp) = setup_temp_db();
    let revision = Revision {
        page_url: URL.to_string(),
        number: 1,
        created_at: at(0),
        user_id: Some("a".to_string()),
        comment: "first".to_string(),
        kind: "source".to_string(),
        version_seq: Some(0),
    };
    let mut edited = revision.clone();
    edited.comment = "rewritten".to_string();
    assert_eq!(db.activity.record_revisions(&[revision]).expect("first"), 1);
    assert_eq!(db.activity.record_revisions(&[edited]).expect("second"), 0);
    let stored = db.activity.revisions_for_page(URL).expect("revisions");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].comment, "first");
}

#[test]
fn users_keep_first_seen_and_refresh_names() {
    let (db, _temp) = setup_temp_db();
    db.activity
        .upsert_users(&[("u1".to_string(), None)], at(10))
        .expect("first");
    assert_eq!(db.activity.get_user("u1").expect("get").expect("user").name, "u1");
    db.activity
        .upsert_users(&[("u1".to_string(), Some("Alice".to_string()))], at(20))
        .expect("rename");
    db.activity
        .upsert_users(&[("u1".to_string(), Some("  ".to_string()))], at(5))
        .expect("blank");
    let user = db.activity.get_user("u1").expect("get").expect("user");
    assert_eq!(user.name, "Alice");
    assert_eq!(user.first_seen_at, at(5));
    assert_eq!(user.last_seen_at, at(20));
    assert_eq!(db.activity.list_users().expect("list").len(), 1);
}
