mod test_utils;

use std::collections::BTreeSet;

use rand::seq::SliceRandom;
use shoal_db::{DeleteOutcome, IndexKey};
use test_utils::{collect_keys, insert_ints, int_index, open_db};

#[test]
fn test_delete_missing_key() {
    let t = open_db();
    let index = int_index(&t.db, "missing", true);

    insert_ints(&index, 0..10);
    assert_eq!(
        index.delete(&IndexKey::int(99)).unwrap(),
        DeleteOutcome::NotFound
    );
    assert_eq!(
        index.delete(&IndexKey::int(5)).unwrap(),
        DeleteOutcome::Deleted
    );
    assert!(index.search(&IndexKey::int(5)).unwrap().is_none());
}

#[test]
fn test_delete_triggers_redistribution_and_merge() {
    let t = open_db();
    let index = int_index(&t.db, "merge", true);

    insert_ints(&index, 0..1000);
    let tall = index.height().unwrap();
    assert!(tall >= 2);

    // drain most of the tree; every removal keeps the invariants
    for i in 0..900 {
        assert_eq!(
            index.delete(&IndexKey::int(i)).unwrap(),
            DeleteOutcome::Deleted
        );
        if i % 100 == 99 {
            index.check_integrity(true);
        }
    }
    index.check_integrity(true);

    let remaining = collect_keys(index.scan_all().unwrap());
    assert_eq!(remaining.len(), 100);
    assert_eq!(remaining[0].0, IndexKey::int(900));
}

#[test]
fn test_delete_everything_collapses_to_single_leaf() {
    let t = open_db();
    let index = int_index(&t.db, "collapse", true);

    insert_ints(&index, 0..600);
    assert!(index.height().unwrap() >= 2);

    for i in 0..600 {
        index.delete(&IndexKey::int(i)).unwrap();
    }
    assert_eq!(index.height().unwrap(), 1, "empty tree is a lone leaf root");
    assert!(collect_keys(index.scan_all().unwrap()).is_empty());

    // the tree remains usable after a full drain
    insert_ints(&index, 0..50);
    assert_eq!(collect_keys(index.scan_all().unwrap()).len(), 50);
    index.check_integrity(true);
}

#[test]
fn test_random_insert_delete_interleave_matches_oracle() {
    let t = open_db();
    let index = int_index(&t.db, "chaos", true);

    let mut rng = rand::thread_rng();
    let mut oracle = BTreeSet::new();
    let mut ops: Vec<i64> = (0..1500).collect();
    ops.shuffle(&mut rng);

    for (step, k) in ops.iter().enumerate() {
        if step % 3 == 2 {
            // delete a key inserted earlier (maybe absent)
            let target = k / 2;
            let expect = oracle.remove(&target);
            let outcome = index.delete(&IndexKey::int(target)).unwrap();
            assert_eq!(outcome == DeleteOutcome::Deleted, expect);
        } else {
            index.insert(&IndexKey::int(*k), b"v").unwrap();
            oracle.insert(*k);
        }
    }
    index.check_integrity(false);

    let keys: Vec<i64> = oracle.iter().copied().collect();
    let scanned = collect_keys(index.scan_all().unwrap());
    assert_eq!(scanned.len(), keys.len());
    for ((got, _), want) in scanned.iter().zip(keys.iter()) {
        assert_eq!(got, &IndexKey::int(*want));
    }
}

#[test]
fn test_range_completeness_with_deletions() {
    let t = open_db();
    let index = int_index(&t.db, "range_complete", true);

    insert_ints(&index, 0..400);
    for i in (0..400).step_by(3) {
        index.delete(&IndexKey::int(i)).unwrap();
    }

    let lo = IndexKey::int(50);
    let hi = IndexKey::int(250);
    let got = collect_keys(index.range(Some(&lo), true, Some(&hi), true).unwrap());
    let want: Vec<i64> = (50..=250).filter(|i| i % 3 != 0).collect();
    assert_eq!(got.len(), want.len());
    for ((key, _), w) in got.iter().zip(want.iter()) {
        assert_eq!(key, &IndexKey::int(*w));
    }
}
