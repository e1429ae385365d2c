//! Temporal version chain tests.

use super::*;

const URL: &str = "http://site/scp-173";

#[test]
fn first_snapshot_creates_open_version() {
    let (db, _temp) = setup_temp_db();
    let outcome = db
        .pages
        .supersede(URL, snapshot("SCP-173", 10), at(0), VersionSource::Listing, None)
        .expect("supersede");
    assert_eq!(outcome, SupersedeOutcome::Created { seq: 0 });
    let current = db.pages.current_version(URL).expect("current").expect("open");
    assert!(current.is_open());
    assert_eq!(current.valid_from, at(0));
    assert!(db.pages.get(URL).expect("page").is_some());
}

#[test]
fn identical_snapshot_is_not_a_new_version() {
    let (db, _temp) = setup_temp_db();
    db.pages
        .supersede(URL, snapshot("SCP-173", 10), at(0), VersionSource::Listing, None)
        .expect("first");
    let outcome = db
        .pages
        .supersede(URL, snapshot("SCP-173", 10), at(5), VersionSource::Content, None)
        .expect("second");
    assert_eq!(outcome, SupersedeOutcome::Unchanged { seq: 0 });
    assert_eq!(db.pages.versions(URL).expect("versions").len(), 1);
}

#[test]
fn superseding_keeps_boundaries_contiguous() {
    let (db, _temp) = setup_temp_db();
    for (i, rating) in [10, 11, 9, 15].into_iter().enumerate() {
        db.pages
            .supersede(
                URL,
                snapshot("SCP-173", rating),
                at(i as i64 * 60),
                VersionSource::Content,
                None,
            )
            .expect("supersede");
    }
    let versions = db.pages.versions(URL).expect("versions");
    assert_eq!(versions.len(), 4);
    assert_versions_contiguous(&versions);
    assert_eq!(versions[1].valid_to, Some(at(120)));
    assert!(db.pages.check_integrity(URL, 0).expect("check").is_empty());
}

#[test]
fn observation_older_than_open_version_does_not_overlap() {
    let (db, _temp) = setup_temp_db();
    db.pages
        .supersede(URL, snapshot("SCP-173", 10), at(100), VersionSource::Listing, None)
        .expect("first");
    let outcome = db
        .pages
        .supersede(URL, snapshot("SCP-173", 12), at(50), VersionSource::Content, None)
        .expect("late");
    assert_eq!(
        outcome,
        SupersedeOutcome::Superseded {
            closed_seq: 0,
            new_seq: 1
        }
    );
    let versions = db.pages.versions(URL).expect("versions");
    assert_eq!(versions[1].valid_from, at(100));
    assert_versions_contiguous(&versions);
}

#[test]
fn attributions_carry_forward_when_not_supplied() {
    let (db, _temp) = setup_temp_db();
    let authors = [
        attribution("alice", AttributionRole::Author),
        attribution("bob", AttributionRole::Translator),
    ];
    db.pages
        .supersede(URL, snapshot("SCP-173", 10), at(0), VersionSource::Content, Some(&authors))
        .expect("first");
    db.pages
        .supersede(URL, snapshot("SCP-173", 20), at(10), VersionSource::Reconciliation, None)
        .expect("second");
    let carried = db.pages.attributions(URL, 1).expect("attributions");
    assert_eq!(carried.len(), 2);
    assert!(carried.iter().all(|a| a.version_seq == 1 && a.page_url == URL));

    let replaced = [attribution("carol", AttributionRole::Author)];
    db.pages
        .supersede(URL, snapshot("SCP-173", 20), at(20), VersionSource::Content, Some(&replaced))
        .expect("same snapshot, new attributions");
    let current = db.pages.attributions(URL, 1).expect("attributions");
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].user_id, "carol");
    assert_eq!(db.pages.attributions(URL, 0).expect("old").len(), 2);
}

fn corrupt_chain(db: &Database) {
    let write_txn = db.db.begin_write().expect("txn");
    {
        let mut versions = write_txn.open_table(tables::PAGE_VERSIONS).expect("table");
        let mut current = write_txn.open_table(tables::CURRENT_VERSIONS).expect("table");
        let mut v0 = snapshot("SCP-173", 1).into_version(URL, 0, at(0), VersionSource::Listing);
        v0.valid_to = Some(at(10));
        let mut v1 = snapshot("SCP-173", 2).into_version(URL, 1, at(30), VersionSource::Content);
        v1.valid_to = None;
        let v2 = snapshot("SCP-173", 3).into_version(URL, 2, at(20), VersionSource::Content);
        for v in [&v0, &v1, &v2] {
            let encoded = encode(v).expect("encode");
            versions.insert((URL, v.seq), encoded.as_slice()).expect("insert");
        }
        current.insert(URL, 1u32).expect("pointer");
    }
    write_txn.commit().expect("commit");
}

#[test]
fn integrity_check_reports_gaps_overlaps_and_open_versions() {
    let (db, _temp) = setup_temp_db();
    corrupt_chain(&db);
    let defects = db.pages.check_integrity(URL, 1_000).expect("check");
    assert!(defects.contains(&IntegrityDefect::Gap {
        url: URL.to_string(),
        after_seq: 0,
        millis: 20_000
    }));
    assert!(defects
        .iter()
        .any(|d| matches!(d, IntegrityDefect::Overlap { after_seq: 1, .. })));
    assert!(defects.contains(&IntegrityDefect::MultipleOpen {
        url: URL.to_string(),
        open: 2
    }));
    assert_eq!(db.pages.check_all_integrity(1_000).expect("all"), defects);
}

#[test]
fn repair_is_idempotent_and_restores_invariants() {
    let (db, _temp) = setup_temp_db();
    corrupt_chain(&db);
    let first = db.pages.repair_boundaries(URL).expect("repair");
    assert!(first.changed());
    let versions = db.pages.versions(URL).expect("versions");
    assert_versions_contiguous(&versions);
    assert_eq!(versions[2].valid_from, at(30));
    assert_eq!(
        db.pages.current_version(URL).expect("current").map(|v| v.seq),
        Some(2)
    );
    assert!(db.pages.check_integrity(URL, 0).expect("check").is_empty());

    let second = db.pages.repair_boundaries(URL).expect("repair again");
    assert!(!second.changed());
    assert_eq!(db.pages.versions(URL).expect("versions"), versions);
}

#[test]
fn repair_of_unknown_page_is_a_noop() {
    let (db, _temp) = setup_temp_db();
    let report = db.pages.repair_boundaries("http://site/none").expect("repair");
    assert_eq!(report.adjusted, 0);
}

#[test]
fn discovery_transaction_writes_page_version_and_queue_row() {
    let (db, _temp) = setup_temp_db();
    let (outcome, row) = TransactionOps::discover_new_page(
        &db,
        URL,
        snapshot("SCP-173", 3),
        transactions::ListingIdentity {
            upstream_id: Some(173),
            created_at: Some(at(-100)),
        },
        at(0),
    )
    .expect("discover");
    assert_eq!(outcome, SupersedeOutcome::Created { seq: 0 });
    assert_eq!(row.state, PhaseState::NeedsB);
    assert_eq!(row.reasons, vec![DriftReason::NewPage]);
    let page = db.pages.get(URL).expect("page").expect("exists");
    assert_eq!(page.upstream_id, Some(173));
    assert_eq!(page.created_at, Some(at(-100)));
    assert_eq!(
        db.pages.current_version(URL).expect("current").map(|v| v.source),
        Some(VersionSource::Listing)
    );
}
