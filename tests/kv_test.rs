mod test_utils;

use std::time::Duration;

use shoal_db::{
    kv::{pubsub::KvEvent, store::LwwStore},
    DbConfig, HlcTimestamp, KvEvictionPolicy,
};
use test_utils::{open_db, open_db_with, TestDb};

fn replicate_key(from: &LwwStore, to: &LwwStore, key: &[u8]) {
    if let Some((value, ts)) = from.get_with_ts(key).unwrap() {
        to.merge_remote(key, Some(&value), ts).unwrap();
    }
    if let Some(tomb) = from.tombstone_ts(key) {
        to.merge_remote(key, None, tomb).unwrap();
    }
}

#[test]
fn test_set_get_delete() {
    let t = open_db();
    let kv = t.db.kv();

    assert!(kv.set(b"name", b"alice", None).unwrap());
    assert_eq!(kv.get(b"name").unwrap().unwrap(), &b"alice"[..]);
    assert!(kv.exists(b"name").unwrap());

    assert!(kv.delete(b"name").unwrap());
    assert!(kv.get(b"name").unwrap().is_none());
    assert!(!kv.exists(b"name").unwrap());
    // the delete left a tombstone for future merges
    assert!(kv.tombstone_ts(b"name").is_some());

    // a later write reintroduces the key past the tombstone
    assert!(kv.set(b"name", b"bob", None).unwrap());
    assert_eq!(kv.get(b"name").unwrap().unwrap(), &b"bob"[..]);
    assert!(kv.tombstone_ts(b"name").is_none());
}

#[test]
fn test_stale_merge_is_dropped() {
    let t = open_db();
    let kv = t.db.kv();

    kv.set(b"x", b"fresh", None).unwrap();
    let (_, ts) = kv.get_with_ts(b"x").unwrap().unwrap();

    // a remote write with an older stamp loses
    let stale = HlcTimestamp::new(ts.physical.saturating_sub(1_000_000), 0);
    assert!(!kv.merge_remote(b"x", Some(b"stale"), stale).unwrap());
    assert_eq!(kv.get(b"x").unwrap().unwrap(), &b"fresh"[..]);
}

#[test]
fn test_two_replicas_converge() {
    // concurrent writes to the same key on two replicas; after swapping
    // merges both sides agree on the greater (ts, value)
    let a = open_db();
    let b = open_db();
    let kv_a = a.db.kv();
    let kv_b = b.db.kv();

    kv_a.set(b"x", b"v1", None).unwrap();
    kv_b.set(b"x", b"v2", None).unwrap();

    replicate_key(kv_a, kv_b, b"x");
    replicate_key(kv_b, kv_a, b"x");
    // one more round so the loser's state can't linger anywhere
    replicate_key(kv_a, kv_b, b"x");

    let va = kv_a.get(b"x").unwrap().unwrap();
    let vb = kv_b.get(b"x").unwrap().unwrap();
    assert_eq!(va, vb, "replicas diverged");
}

#[test]
fn test_delete_wins_over_older_write_after_merge() {
    let a = open_db();
    let b = open_db();
    let kv_a = a.db.kv();
    let kv_b = b.db.kv();

    kv_a.set(b"k", b"old", None).unwrap();
    replicate_key(kv_a, kv_b, b"k");
    assert_eq!(kv_b.get(b"k").unwrap().unwrap(), &b"old"[..]);

    // B deletes later; the tombstone must erase the key on A too
    kv_b.delete(b"k").unwrap();
    replicate_key(kv_b, kv_a, b"k");
    assert!(kv_a.get(b"k").unwrap().is_none());
}

#[test]
fn test_merge_is_commutative_associative_idempotent() {
    // the same batch of remote writes, applied in any order and any
    // multiplicity, must produce identical state
    let writes: Vec<(&[u8], Option<&[u8]>, HlcTimestamp)> = vec![
        (b"k1", Some(b"a"), HlcTimestamp::new(1_000_000, 0)),
        (b"k1", Some(b"b"), HlcTimestamp::new(1_000_000, 2)),
        (b"k1", None, HlcTimestamp::new(1_000_000, 1)),
        (b"k2", Some(b"x"), HlcTimestamp::new(2_000_000, 0)),
        (b"k2", None, HlcTimestamp::new(2_000_001, 0)),
        // exact timestamp tie on k3: byte-lex on the value decides
        (b"k3", Some(b"small"), HlcTimestamp::new(3_000_000, 5)),
        (b"k3", Some(b"tall"), HlcTimestamp::new(3_000_000, 5)),
    ];

    let orders: Vec<Vec<usize>> = vec![
        (0..writes.len()).collect(),
        (0..writes.len()).rev().collect(),
        vec![3, 0, 6, 1, 4, 2, 5],
        // idempotence: everything twice
        (0..writes.len()).chain(0..writes.len()).collect(),
    ];

    let mut finals: Vec<Vec<Option<Vec<u8>>>> = Vec::new();
    for order in orders {
        let t = open_db();
        let kv = t.db.kv();
        for i in order {
            let (key, value, ts) = &writes[i];
            kv.merge_remote(key, *value, *ts).unwrap();
        }
        finals.push(
            [&b"k1"[..], b"k2", b"k3"]
                .iter()
                .map(|k| kv.get(k).unwrap().map(|v| v.to_vec()))
                .collect(),
        );
    }

    for state in &finals[1..] {
        assert_eq!(state, &finals[0]);
    }
    assert_eq!(finals[0][0], Some(b"b".to_vec()));
    assert_eq!(finals[0][1], None);
    assert_eq!(finals[0][2], Some(b"tall".to_vec()));
}

#[test]
fn test_tombstone_gc_safety() {
    let t = open_db();
    let kv = t.db.kv();

    kv.set(b"gone", b"v", None).unwrap();
    kv.delete(b"gone").unwrap();
    let tomb = kv.tombstone_ts(b"gone").unwrap();

    // watermark above the tombstone collects it
    let watermark = HlcTimestamp::new(tomb.physical + 1, 0);
    assert_eq!(kv.cleanup_tombstones(watermark), 1);
    assert!(kv.tombstone_ts(b"gone").is_none());

    // the key stays dead until a strictly newer write reintroduces it
    assert!(kv.get(b"gone").unwrap().is_none());
    kv.set(b"gone", b"back", None).unwrap();
    assert_eq!(kv.get(b"gone").unwrap().unwrap(), &b"back"[..]);
}

#[test]
fn test_passive_expiry_on_get() {
    let t = open_db();
    let kv = t.db.kv();

    kv.set(b"short", b"v", Some(Duration::from_millis(30)))
        .unwrap();
    assert_eq!(kv.get(b"short").unwrap().unwrap(), &b"v"[..]);

    std::thread::sleep(Duration::from_millis(60));
    assert!(kv.get(b"short").unwrap().is_none());
    // an expiry is a delete: it leaves a tombstone
    assert!(kv.tombstone_ts(b"short").is_some());
}

#[test]
fn test_active_expiry_by_sweeper() {
    let t = open_db();
    let kv = t.db.kv();

    kv.set(b"sweep_me", b"v", Some(Duration::from_millis(20)))
        .unwrap();
    std::thread::sleep(Duration::from_millis(40));

    // one sweeper pass expires the key without any read touching it
    let expired = kv.sweep_expired(100).unwrap();
    assert_eq!(expired, 1);
    assert!(kv.tombstone_ts(b"sweep_me").is_some());
}

#[test]
fn test_background_sweeper_publishes_expiry() {
    let t = open_db();
    let kv = t.db.kv();
    let events = kv.publisher().subscribe(b"bg:*");

    t.db.start_background();
    kv.set(b"bg:key", b"v", Some(Duration::from_millis(30)))
        .unwrap();
    // drain the Set event, then wait for the sweeper's Expire
    let first = events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(first, KvEvent::Set { .. }));
    let second = events.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(second, KvEvent::Expire { .. }));

    t.db.shutdown().unwrap();
}

#[test]
fn test_ttl_expire_persist() {
    let t = open_db();
    let kv = t.db.kv();

    kv.set(b"k", b"v", None).unwrap();
    assert!(kv.ttl(b"k").unwrap().is_none());

    assert!(kv.expire(b"k", Duration::from_secs(100)).unwrap());
    let remaining = kv.ttl(b"k").unwrap().unwrap();
    assert!(remaining <= Duration::from_secs(100));
    assert!(remaining > Duration::from_secs(90));

    assert!(kv.persist(b"k").unwrap());
    assert!(kv.ttl(b"k").unwrap().is_none());

    assert!(matches!(
        kv.ttl(b"absent"),
        Err(shoal_db::ShoalError::NotFound)
    ));
    assert!(!kv.expire(b"absent", Duration::from_secs(1)).unwrap());
}

#[test]
fn test_scan_with_glob_pattern() {
    let t = open_db();
    let kv = t.db.kv();

    for i in 0..5 {
        kv.set(format!("user:{}", i).as_bytes(), b"u", None).unwrap();
    }
    for i in 0..3 {
        kv.set(format!("session:{}", i).as_bytes(), b"s", None)
            .unwrap();
    }

    // walk the cursor to the end, filtering on the pattern
    let mut cursor = Vec::new();
    let mut matched = Vec::new();
    loop {
        let (next, keys) = kv.scan(&cursor, Some(b"user:*"), 3).unwrap();
        matched.extend(keys);
        if next.is_empty() {
            break;
        }
        cursor = next;
    }
    assert_eq!(matched.len(), 5);
    for key in &matched {
        assert!(key.starts_with(b"user:"));
    }
}

fn eviction_db(policy: KvEvictionPolicy) -> TestDb {
    open_db_with(DbConfig {
        bptree_order: 32,
        max_memory_bytes: 2_000,
        eviction_policy: policy,
        ..DbConfig::default()
    })
}

#[test]
fn test_lru_eviction_under_memory_pressure() {
    let t = eviction_db(KvEvictionPolicy::Lru);
    let kv = t.db.kv();

    for i in 0..60 {
        kv.set(format!("k{:03}", i).as_bytes(), b"vvvvvvvv", None)
            .unwrap();
    }

    assert!(kv.memory_used() <= 2_000, "memory budget enforced");
    let (_, keys) = kv.scan(b"", None, 1_000).unwrap();
    assert!(keys.len() < 60, "some keys were evicted");
    assert!(!keys.is_empty());
    // cache eviction is not a delete: no tombstones appear
    assert_eq!(kv.tombstone_count(), 0);
}

#[test]
fn test_volatile_eviction_spares_persistent_keys() {
    let t = eviction_db(KvEvictionPolicy::VolatileLru);
    let kv = t.db.kv();

    for i in 0..8 {
        kv.set(format!("keep{}", i).as_bytes(), b"p", None).unwrap();
    }
    for i in 0..60 {
        kv.set(
            format!("temp{:03}", i).as_bytes(),
            b"vvvvvvvv",
            Some(Duration::from_secs(3600)),
        )
        .unwrap();
    }

    // only TTL-carrying keys are eviction candidates
    for i in 0..8 {
        assert!(
            kv.get(format!("keep{}", i).as_bytes()).unwrap().is_some(),
            "persistent key evicted"
        );
    }
}

#[test]
fn test_arc_and_random_eviction_hold_the_budget() {
    for policy in [KvEvictionPolicy::Arc, KvEvictionPolicy::Random, KvEvictionPolicy::Lfu] {
        let t = eviction_db(policy);
        let kv = t.db.kv();
        for i in 0..80 {
            kv.set(format!("k{:03}", i).as_bytes(), b"vvvvvvvv", None)
                .unwrap();
        }
        assert!(
            kv.memory_used() <= 2_000,
            "{:?} blew the memory budget",
            policy
        );
        assert_eq!(kv.tombstone_count(), 0);
    }
}

#[test]
fn test_pubsub_set_and_delete_events() {
    let t = open_db();
    let kv = t.db.kv();

    let user_events = kv.publisher().subscribe(b"user:*");
    let all_events = kv.publisher().subscribe(b"*");

    kv.set(b"user:1", b"alice", None).unwrap();
    kv.set(b"other", b"x", None).unwrap();
    kv.delete(b"user:1").unwrap();

    let e1 = user_events.try_recv().unwrap();
    assert!(matches!(e1, KvEvent::Set { .. }));
    let e2 = user_events.try_recv().unwrap();
    assert!(matches!(e2, KvEvent::Delete { .. }));
    assert!(user_events.try_recv().is_err());

    assert_eq!(all_events.len(), 3);
}

#[test]
fn test_durability_across_reopen() {
    test_utils::setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shoal.db");
    let config = DbConfig {
        bptree_order: 32,
        ..DbConfig::default()
    };

    {
        let db = shoal_db::Database::open(&path, config.clone()).unwrap();
        db.kv().set(b"persisted", b"value", None).unwrap();
        db.shutdown().unwrap();
    }

    let db = shoal_db::Database::open(&path, config).unwrap();
    assert_eq!(
        db.kv().get(b"persisted").unwrap().unwrap(),
        &b"value"[..]
    );
}
