use kvpage_engine::{Db, EngineError};

fn fresh_db(name: &str) -> (Db, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::create_in(dir.path(), name).unwrap();
    (db, dir)
}

#[test]
fn insert_search_delete_round_trip() {
    let (mut db, _dir) = fresh_db("basic");

    db.insert(1, b"one").unwrap();
    db.insert(2, b"two").unwrap();
    db.insert(3, b"three").unwrap();

    let (value, found) = db.search(2).unwrap();
    assert!(found);
    assert_eq!(value, b"two");

    let (_, found) = db.search(42).unwrap();
    assert!(!found);

    db.delete(2).unwrap();
    let (_, found) = db.search(2).unwrap();
    assert!(!found);

    db.close().unwrap();
}

#[test]
fn duplicate_insert_does_not_grow_total_data_size() {
    let (mut db, _dir) = fresh_db("dup");

    db.insert(7, b"first-value").unwrap();
    let size_after_first = db.total_data_size();

    db.insert(7, b"a-totally-different-second-value").unwrap();
    assert_eq!(db.total_data_size(), size_after_first);

    let (value, found) = db.search(7).unwrap();
    assert!(found);
    assert_eq!(value, b"first-value");
}

#[test]
fn delete_of_absent_key_fails_with_key_not_found() {
    let (mut db, _dir) = fresh_db("missing");

    let err = db.delete(99).unwrap_err();
    let engine_err = err.downcast_ref::<EngineError>().expect("should be an EngineError");
    assert!(matches!(engine_err, EngineError::KeyNotFound(99)));
}

#[test]
fn close_then_reopen_preserves_data() {
    let dir = tempfile::tempdir().unwrap();

    let mut db = Db::create_in(dir.path(), "persisted").unwrap();
    for k in 0..50u32 {
        db.insert(k, format!("value-{k}").as_bytes()).unwrap();
    }
    db.close().unwrap();

    let mut reopened = Db::open_in(dir.path(), "persisted").unwrap();
    for k in 0..50u32 {
        let (value, found) = reopened.search(k).unwrap();
        assert!(found, "key {k} should have survived close/reopen");
        assert_eq!(value, format!("value-{k}").as_bytes());
    }
    reopened.close().unwrap();
}

#[test]
fn many_inserts_and_deletes_keep_the_tree_consistent() {
    let (mut db, _dir) = fresh_db("stress");

    for k in 0..500u32 {
        db.insert(k, format!("v{k}").as_bytes()).unwrap();
    }
    for k in (0..500u32).step_by(2) {
        db.delete(k).unwrap();
    }
    for k in 0..500u32 {
        let (value, found) = db.search(k).unwrap();
        if k % 2 == 0 {
            assert!(!found, "key {k} should have been deleted");
        } else {
            assert!(found, "key {k} should still be present");
            assert_eq!(value, format!("v{k}").as_bytes());
        }
    }

    let expected: u64 = (0..500u32)
        .filter(|k| k % 2 != 0)
        .map(|k| format!("v{k}").len() as u64)
        .sum();
    assert_eq!(
        db.total_data_size(),
        expected,
        "total_data_size must track surviving values exactly, including across node merges"
    );
}

#[test]
fn visualize_reports_every_page() {
    let (mut db, _dir) = fresh_db("viz");
    db.insert(1, b"a").unwrap();
    db.insert(2, b"b").unwrap();

    let report = db.visualize().unwrap();
    assert!(report.contains("FileHeader"));
    assert!(report.contains("Node"));
    assert!(report.contains("Data"));
}
