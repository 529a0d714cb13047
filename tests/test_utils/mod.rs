use std::sync::{Arc, Once};

use shoal_db::{
    utils::init_log, BTreeIndex, Database, DbConfig, IndexKey, IndexSpec, KeySchema,
    KeyType,
};

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(init_log);
}

/// A database on a throwaway directory; dropping the struct removes the
/// files.
pub struct TestDb {
    pub db: Database,
    _dir: tempfile::TempDir,
}

pub fn open_db() -> TestDb {
    open_db_with(small_tree_config())
}

pub fn open_db_with(config: DbConfig) -> TestDb {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("shoal.db"), config).unwrap();
    TestDb { db, _dir: dir }
}

/// A low order keeps trees deep enough to exercise splits and merges with
/// modest row counts.
pub fn small_tree_config() -> DbConfig {
    DbConfig {
        bptree_order: 32,
        ..DbConfig::default()
    }
}

pub fn int_index(db: &Database, name: &str, unique: bool) -> Arc<BTreeIndex> {
    db.index(IndexSpec {
        name: name.to_string(),
        table: "t".to_string(),
        columns: vec!["id".to_string()],
        schema: KeySchema::single(KeyType::Int),
        unique,
    })
    .unwrap()
}

pub fn str_index(db: &Database, name: &str) -> Arc<BTreeIndex> {
    db.index(IndexSpec {
        name: name.to_string(),
        table: "t".to_string(),
        columns: vec!["name".to_string()],
        schema: KeySchema::single(KeyType::Str),
        unique: true,
    })
    .unwrap()
}

pub fn insert_ints(index: &BTreeIndex, range: impl Iterator<Item = i64>) {
    for i in range {
        index
            .insert(&IndexKey::int(i), format!("v{}", i).as_bytes())
            .unwrap();
    }
}

pub fn collect_keys(
    cursor: shoal_db::btree::cursor::RangeCursor<'_>,
) -> Vec<(IndexKey, Vec<u8>)> {
    cursor
        .map(|item| {
            let (k, v) = item.unwrap();
            (k, v.to_vec())
        })
        .collect()
}
