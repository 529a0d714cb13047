mod test_utils;

use std::sync::Arc;

use shoal_db::{
    utils::CancelToken, IndexKey, IndexSpec, KeyComponent, KeySchema, KeyType,
    ShoalError,
};
use test_utils::{collect_keys, insert_ints, int_index, open_db, str_index};

#[test]
fn test_point_ops_and_range() {
    // insert alice/bob/charlie, delete bob, range over the rest
    let t = open_db();
    let index = str_index(&t.db, "people");

    index.insert(&IndexKey::str("alice"), b"30").unwrap();
    index.insert(&IndexKey::str("bob"), b"25").unwrap();
    index.insert(&IndexKey::str("charlie"), b"45").unwrap();

    assert_eq!(
        index.search(&IndexKey::str("bob")).unwrap().unwrap(),
        &b"25"[..]
    );
    index.delete(&IndexKey::str("bob")).unwrap();
    assert!(index.search(&IndexKey::str("bob")).unwrap().is_none());

    let a = IndexKey::str("a");
    let z = IndexKey::str("z");
    let got = collect_keys(index.range(Some(&a), true, Some(&z), true).unwrap());
    assert_eq!(
        got,
        vec![
            (IndexKey::str("alice"), b"30".to_vec()),
            (IndexKey::str("charlie"), b"45".to_vec()),
        ]
    );
}

#[test]
fn test_range_early_termination_touches_few_pages() {
    let t = open_db();
    let index = int_index(&t.db, "early", true);

    insert_ints(&index, 1..=10_000);
    let height = index.height().unwrap();

    let lo = IndexKey::int(4000);
    let hi = IndexKey::int(4005);
    let before = t.db.pool().stats().fetches;
    let got = collect_keys(index.range(Some(&lo), true, Some(&hi), true).unwrap());
    let after = t.db.pool().stats().fetches;

    assert_eq!(got.len(), 6);
    for (i, (key, _)) in got.iter().enumerate() {
        assert_eq!(key, &IndexKey::int(4000 + i as i64));
    }

    // one root-to-leaf descent plus at most two leaves; anything more
    // means the scan kept walking past the bound
    assert!(
        after - before <= height as u64 + 2,
        "range touched {} pages, height {}",
        after - before,
        height
    );
}

#[test]
fn test_compound_key_prefix_scan() {
    let t = open_db();
    let index = t
        .db
        .index(IndexSpec {
            name: "dept_salary".to_string(),
            table: "emp".to_string(),
            columns: vec!["dept_id".to_string(), "salary".to_string()],
            schema: KeySchema::new(vec![KeyType::Int, KeyType::Int]),
            unique: true,
        })
        .unwrap();

    let key = |dept: i64, salary: i64| {
        IndexKey::new(vec![KeyComponent::Int(dept), KeyComponent::Int(salary)])
    };
    index.insert(&key(1, 75_000), b"Alice").unwrap();
    index.insert(&key(1, 80_000), b"Eve").unwrap();
    index.insert(&key(2, 60_000), b"Bob").unwrap();

    let got = collect_keys(index.prefix(&IndexKey::int(1)).unwrap());
    assert_eq!(
        got,
        vec![
            (key(1, 75_000), b"Alice".to_vec()),
            (key(1, 80_000), b"Eve".to_vec()),
        ]
    );

    let dept2 = collect_keys(index.prefix(&IndexKey::int(2)).unwrap());
    assert_eq!(dept2, vec![(key(2, 60_000), b"Bob".to_vec())]);

    assert!(collect_keys(index.prefix(&IndexKey::int(3)).unwrap()).is_empty());
}

#[test]
fn test_range_bound_inclusion_flags() {
    let t = open_db();
    let index = int_index(&t.db, "bounds", true);
    insert_ints(&index, 0..20);

    let lo = IndexKey::int(5);
    let hi = IndexKey::int(10);

    let inclusive = collect_keys(index.range(Some(&lo), true, Some(&hi), true).unwrap());
    assert_eq!(inclusive.len(), 6);

    let exclusive =
        collect_keys(index.range(Some(&lo), false, Some(&hi), false).unwrap());
    assert_eq!(exclusive.len(), 4);
    assert_eq!(exclusive[0].0, IndexKey::int(6));
    assert_eq!(exclusive[3].0, IndexKey::int(9));
}

#[test]
fn test_empty_and_inverted_ranges() {
    let t = open_db();
    let index = int_index(&t.db, "empty", true);
    insert_ints(&index, 0..10);

    let lo = IndexKey::int(8);
    let hi = IndexKey::int(3);
    assert!(collect_keys(index.range(Some(&lo), true, Some(&hi), true).unwrap()).is_empty());

    let lo = IndexKey::int(100);
    assert!(collect_keys(index.range(Some(&lo), true, None, true).unwrap()).is_empty());
}

#[test]
fn test_cursor_restart_resumes_after_last_key() {
    let t = open_db();
    let index = int_index(&t.db, "restart", true);
    insert_ints(&index, 0..100);

    let mut cursor = index.scan_all().unwrap();
    let mut seen = Vec::new();
    for _ in 0..40 {
        let (k, _) = cursor.next().unwrap().unwrap();
        seen.push(k);
    }
    cursor.restart();
    for item in cursor {
        let (k, _) = item.unwrap();
        seen.push(k);
    }

    assert_eq!(seen.len(), 100);
    for (i, k) in seen.iter().enumerate() {
        assert_eq!(k, &IndexKey::int(i as i64));
    }
}

#[test]
fn test_cancelled_scan_stops() {
    let t = open_db();
    let index = int_index(&t.db, "cancel", true);
    insert_ints(&index, 0..1000);

    let cancel = CancelToken::new();
    let mut cursor = index.scan_all().unwrap().with_cancel(cancel.clone());

    // drain one buffered leaf, then cancel
    let first = cursor.next().unwrap().unwrap();
    assert_eq!(first.0, IndexKey::int(0));
    cancel.cancel();

    let outcome = cursor.find_map(|item| item.err());
    assert!(matches!(outcome, Some(ShoalError::Cancelled)));
}

#[test]
fn test_concurrent_readers_during_writes() {
    let t = open_db();
    let index = int_index(&t.db, "concurrent", true);
    insert_ints(&index, 0..500);

    let mut readers = Vec::new();
    for _ in 0..4 {
        let index: Arc<_> = Arc::clone(&index);
        readers.push(std::thread::spawn(move || {
            for i in 0..500 {
                let value = index.search(&IndexKey::int(i)).unwrap();
                assert!(value.is_some());
            }
        }));
    }
    // one writer appending beyond the readers' window
    let writer = {
        let index = Arc::clone(&index);
        std::thread::spawn(move || {
            insert_ints(&index, 500..800);
        })
    };

    for r in readers {
        r.join().unwrap();
    }
    writer.join().unwrap();
    index.check_integrity(true);
    assert_eq!(collect_keys(index.scan_all().unwrap()).len(), 800);
}
