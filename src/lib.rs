pub mod btree;
pub mod config;
pub mod database;
pub mod error;
pub mod hlc;
pub mod io;
pub mod kv;
pub mod storage;
pub mod types;
pub mod utils;

pub use crate::{
    btree::{
        catalog::{IndexCatalog, IndexMeta, IndexSpec},
        key::{IndexKey, KeyComponent, KeySchema, KeyType},
        tree::{BTreeIndex, DeleteOutcome, InsertOutcome},
    },
    config::{DbConfig, EvictionWeights, FsyncPolicy, KvEvictionPolicy},
    database::Database,
    error::ShoalError,
    hlc::{HlcTimestamp, HybridLogicalClock},
    kv::store::LwwStore,
    types::{Pod, ShoalResult},
};
