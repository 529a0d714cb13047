use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use log::info;

use crate::{
    btree::{
        catalog::{IndexCatalog, IndexSpec},
        key::{KeySchema, KeyType},
        tree::BTreeIndex,
    },
    config::{DbConfig, FsyncPolicy},
    error::ShoalError,
    hlc::HybridLogicalClock,
    kv::{
        store::LwwStore,
        sweeper::{start_background, BackgroundHandles},
    },
    storage::{buffer_pool::BufferPool, page_file::PageFile},
    types::ShoalResult,
};

/// Reserved index backing the key-value store.
const KV_INDEX_NAME: &str = "__kv_registers";

/// The assembled storage core: page file, buffer pool, index catalog,
/// clock, and the key-value store on top. One context object, handed to
/// whoever needs it; nothing here is a process-wide global.
pub struct Database {
    config: DbConfig,
    file: Arc<PageFile>,
    pool: Arc<BufferPool>,
    catalog: IndexCatalog,
    hlc: Arc<HybridLogicalClock>,
    kv: Arc<LwwStore>,
    background: Mutex<Option<BackgroundHandles>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P, config: DbConfig) -> ShoalResult<Self> {
        config
            .validate()
            .map_err(ShoalError::InvalidKey)?;

        let file = Arc::new(PageFile::open(&path, config.page_size)?);
        let pool = Arc::new(BufferPool::new(
            Arc::clone(&file),
            config.buffer_pool_frames,
            config.eviction_weights,
        ));
        let catalog = IndexCatalog::open(
            Arc::clone(&pool),
            config.bptree_order,
            config.fsync_policy == FsyncPolicy::Always,
        )?;

        let kv_index = match catalog.lookup_index(KV_INDEX_NAME)? {
            Some(index) => index,
            None => catalog.register_index(IndexSpec {
                name: KV_INDEX_NAME.to_string(),
                table: KV_INDEX_NAME.to_string(),
                columns: vec!["key".to_string()],
                schema: KeySchema::single(KeyType::Bytes),
                unique: true,
            })?,
        };

        let hlc = Arc::new(HybridLogicalClock::new());
        let kv = Arc::new(LwwStore::new(
            kv_index,
            Arc::clone(&pool),
            Arc::clone(&hlc),
            config.clone(),
        ));

        info!(
            "database opened at {:?}, {} pages",
            path.as_ref(),
            file.page_count()
        );
        Ok(Self {
            config,
            file,
            pool,
            catalog,
            hlc,
            kv,
            background: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn page_file(&self) -> &Arc<PageFile> {
        &self.file
    }

    pub fn catalog(&self) -> &IndexCatalog {
        &self.catalog
    }

    pub fn clock(&self) -> &Arc<HybridLogicalClock> {
        &self.hlc
    }

    pub fn kv(&self) -> &Arc<LwwStore> {
        &self.kv
    }

    /// Convenience: register-or-open an index by name.
    pub fn index(&self, spec: IndexSpec) -> ShoalResult<Arc<BTreeIndex>> {
        match self.catalog.lookup_index(&spec.name)? {
            Some(index) => Ok(index),
            None => self.catalog.register_index(spec),
        }
    }

    /// Start the TTL sweeper and flusher actors. Idempotent.
    pub fn start_background(&self) {
        let mut slot = self.background.lock().unwrap();
        if slot.is_none() {
            *slot = Some(start_background(&self.kv));
        }
    }

    /// Cancel background actors, flush everything, and sync.
    pub fn shutdown(&self) -> ShoalResult<()> {
        if let Some(handles) = self.background.lock().unwrap().take() {
            handles.stop();
        }
        self.pool.flush_all()?;
        self.file.sync()
    }
}
