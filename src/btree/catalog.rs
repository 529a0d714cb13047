use std::{
    collections::HashMap,
    io::{Cursor, Read},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, RwLock,
    },
};

use log::info;

use crate::{
    btree::{key::KeySchema, node::LeafNode, tree::BTreeIndex},
    error::ShoalError,
    io::{Decodeable, Encodeable, ShoalWriter},
    storage::{
        buffer_pool::BufferPool,
        page::{PageId, PageKind},
        page_file::PageFile,
    },
    types::{ConcurrentHashMap, ShoalResult},
    utils::Latched,
};

pub type IndexId = u32;

/// Persisted description of one index: the catalog record plus the root
/// pointer the tree hangs from.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMeta {
    pub id: IndexId,
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub schema: KeySchema,
    pub unique: bool,
    pub order: usize,
    pub root: PageId,
}

impl Encodeable for IndexMeta {
    fn encode(&self) -> Vec<u8> {
        let mut w = ShoalWriter::new();
        w.write(&self.id);
        w.write(&self.root);
        w.write(&(self.order as u32));
        w.write(&self.unique);
        w.write(&self.name);
        w.write(&self.table);
        w.write(&(self.columns.len() as u16));
        for c in &self.columns {
            w.write(c);
        }
        w.write(&self.schema);
        w.to_bytes()
    }
}

impl Decodeable for IndexMeta {
    fn decode_from<R: Read>(reader: &mut R) -> ShoalResult<Self> {
        let id = IndexId::decode_from(reader)?;
        let root = PageId::decode_from(reader)?;
        let order = u32::decode_from(reader)? as usize;
        let unique = bool::decode_from(reader)?;
        let name = String::decode_from(reader)?;
        let table = String::decode_from(reader)?;
        let column_count = u16::decode_from(reader)?;
        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            columns.push(String::decode_from(reader)?);
        }
        let schema = KeySchema::decode_from(reader)?;
        Ok(Self {
            id,
            name,
            table,
            columns,
            schema,
            unique,
            order,
            root,
        })
    }
}

/// What a caller hands to `register_index`; everything else in `IndexMeta`
/// is assigned by the catalog.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub schema: KeySchema,
    pub unique: bool,
}

/// Shared persistence state: the meta records and the file that stores
/// them. Trees hold one of these to write their root pointer through.
pub struct CatalogState {
    file: Arc<PageFile>,
    metas: RwLock<HashMap<IndexId, IndexMeta>>,
}

impl CatalogState {
    /// Registry blob in the meta page: count (4B) | meta records.
    fn persist(&self) -> ShoalResult<()> {
        let metas = self.metas.latch_read();
        let mut w = ShoalWriter::new();
        w.write(&(metas.len() as u32));
        let mut ids: Vec<&IndexId> = metas.keys().collect();
        ids.sort();
        for id in ids {
            w.write(&metas[id]);
        }
        drop(metas);
        self.file.set_registry_blob(w.to_bytes())
    }

    pub fn set_root(&self, id: IndexId, root: PageId) -> ShoalResult<()> {
        {
            let mut metas = self.metas.latch_write();
            let meta = metas.get_mut(&id).ok_or(ShoalError::NotFound)?;
            meta.root = root;
        }
        self.persist()
    }
}

/// The root-index registry exposed to the schema-catalog collaborator:
/// `register_index` and `lookup_index`, with records persisted in the page
/// file's meta page.
pub struct IndexCatalog {
    state: Arc<CatalogState>,
    pool: Arc<BufferPool>,
    open_indexes: ConcurrentHashMap<String, Arc<BTreeIndex>>,
    next_id: AtomicU32,
    default_order: usize,
    structural_sync: bool,
}

impl IndexCatalog {
    pub fn open(
        pool: Arc<BufferPool>,
        default_order: usize,
        structural_sync: bool,
    ) -> ShoalResult<Self> {
        let file = Arc::clone(pool.page_file());
        let blob = file.registry_blob();

        let mut metas = HashMap::new();
        let mut next_id = 1;
        if !blob.is_empty() {
            let mut reader = Cursor::new(blob);
            let count = u32::decode_from(&mut reader)?;
            for _ in 0..count {
                let meta = IndexMeta::decode_from(&mut reader)?;
                next_id = next_id.max(meta.id + 1);
                metas.insert(meta.id, meta);
            }
        }
        info!("catalog opened with {} indexes", metas.len());

        Ok(Self {
            state: Arc::new(CatalogState {
                file,
                metas: RwLock::new(metas),
            }),
            pool,
            open_indexes: ConcurrentHashMap::new(),
            next_id: AtomicU32::new(next_id),
            default_order,
            structural_sync,
        })
    }

    /// Create and persist a new index with an empty root leaf.
    pub fn register_index(&self, spec: IndexSpec) -> ShoalResult<Arc<BTreeIndex>> {
        if self.meta_by_name(&spec.name).is_some() {
            return Err(ShoalError::UniqueViolation);
        }

        let (root, guard) = self.pool.new_page(PageKind::Leaf)?;
        LeafNode::empty().encode(&mut guard.page().latch_write())?;
        drop(guard);
        self.pool.flush(root)?;

        let meta = IndexMeta {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            name: spec.name.clone(),
            table: spec.table,
            columns: spec.columns,
            schema: spec.schema,
            unique: spec.unique,
            order: self.default_order,
            root,
        };
        self.state.metas.latch_write().insert(meta.id, meta.clone());
        self.state.persist()?;
        info!("registered index {} (id {})", meta.name, meta.id);

        let index = Arc::new(BTreeIndex::new(
            meta,
            Arc::clone(&self.pool),
            Arc::clone(&self.state),
            self.structural_sync,
        ));
        self.open_indexes.insert(spec.name, Arc::clone(&index));
        Ok(index)
    }

    pub fn lookup_index(&self, name: &str) -> ShoalResult<Option<Arc<BTreeIndex>>> {
        if let Some(index) = self.open_indexes.get(&name.to_string()) {
            return Ok(Some(index));
        }
        let meta = match self.meta_by_name(name) {
            Some(m) => m,
            None => return Ok(None),
        };
        let pool = Arc::clone(&self.pool);
        let state = Arc::clone(&self.state);
        let structural_sync = self.structural_sync;
        let index = self.open_indexes.get_or_insert(&name.to_string(), move |_| {
            Ok(Arc::new(BTreeIndex::new(
                meta.clone(),
                pool,
                state,
                structural_sync,
            )))
        })?;
        Ok(Some(index))
    }

    pub fn index_names(&self) -> Vec<String> {
        self.state
            .metas
            .latch_read()
            .values()
            .map(|m| m.name.clone())
            .collect()
    }

    fn meta_by_name(&self, name: &str) -> Option<IndexMeta> {
        self.state
            .metas
            .latch_read()
            .values()
            .find(|m| m.name == name)
            .cloned()
    }
}
