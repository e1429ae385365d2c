//! Database open and handle-sharing tests.

use super::*;
use tempfile::TempDir;

#[test]
fn reopening_preserves_rows() {
    let temp = TempDir::new().expect("temp dir");
    let path = temp.path().join("db");
    let path = path.to_str().expect("path");
    {
        let db = Database::new(path).expect("open");
        db.pages
            .supersede("http://site/a", snapshot("A", 1), at(0), VersionSource::Listing, None)
            .expect("write");
    }
    let db = Database::new(path).expect("reopen");
    assert_eq!(db.pages.count().expect("count"), 1);
    assert!(temp.path().join("db").join(tables::REDB_FILE_NAME).exists());
}

#[test]
fn file_in_place_of_directory_is_rejected() {
    let temp = TempDir::new().expect("temp dir");
    let path = temp.path().join("not-a-dir");
    std::fs::write(&path, b"x").expect("seed");
    match Database::new(path.to_str().expect("path")) {
        Err(AppError::StorageMessage(message)) => assert!(message.contains("not a directory")),
        Err(other) => panic!("unexpected error: {:?}", other),
        Ok(_) => panic!("file path must not open"),
    }
}

#[test]
fn shared_handles_see_each_others_writes() {
    let (db, _temp) = setup_temp_db();
    let other = db.share().expect("share");
    other
        .queue
        .mark_needs_b("http://site/a", &[DriftReason::Manual], at(0))
        .expect("mark");
    assert!(db.queue.get("http://site/a").expect("get").is_some());
}
