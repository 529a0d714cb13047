use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use itertools::Itertools;
use log::debug;

use crate::{
    btree::{
        catalog::{CatalogState, IndexId, IndexMeta},
        key::{IndexKey, KeySchema},
        node::{InternalNode, LeafNode, ValueRef, ValueSlot},
    },
    error::ShoalError,
    storage::{
        buffer_pool::BufferPool,
        page::{PageId, PageKind, FLAG_VALUE_CHAIN, PAGE_HEADER_SIZE, SLOT_ENTRY_SIZE},
    },
    types::ShoalResult,
    utils::{CancelToken, Latched},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Updated,
    UniqueViolation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// A persistent B+ tree over buffer-pool pages.
///
/// Readers descend with one page latch at a time; structural writers
/// serialize on the tree latch and take per-page write latches, so a reader
/// observes every page either before or after a modification, never mid-way.
pub struct BTreeIndex {
    id: IndexId,
    name: String,
    schema: KeySchema,
    unique: bool,
    order: usize,
    root: RwLock<PageId>,
    pool: Arc<BufferPool>,
    catalog: Arc<CatalogState>,
    /// One structural writer at a time.
    tree_latch: Mutex<()>,
    /// Flush split/merge pages (sibling before parent) and sync, so a crash
    /// mid-modification leaves at worst a leaf reachable only through the
    /// sibling chain.
    structural_sync: bool,
}

impl BTreeIndex {
    pub fn new(
        meta: IndexMeta,
        pool: Arc<BufferPool>,
        catalog: Arc<CatalogState>,
        structural_sync: bool,
    ) -> Self {
        Self {
            id: meta.id,
            name: meta.name,
            schema: meta.schema,
            unique: meta.unique,
            order: meta.order,
            root: RwLock::new(meta.root),
            pool,
            catalog,
            tree_latch: Mutex::new(()),
            structural_sync,
        }
    }

    pub fn id(&self) -> IndexId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &KeySchema {
        &self.schema
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn root(&self) -> PageId {
        *self.root.latch_read()
    }

    fn set_root(&self, pid: PageId) -> ShoalResult<()> {
        *self.root.latch_write() = pid;
        self.catalog.set_root(self.id, pid)
    }

    fn min_entries(&self) -> usize {
        (self.order + 1) / 2
    }

    /// Keys are capped at a quarter page so a post-split half always fits.
    fn check_key_size(&self, key: &IndexKey) -> ShoalResult<()> {
        let cap = self.pool.page_size() / 4;
        if key.encoded_size() > cap {
            return Err(ShoalError::InvalidKey(format!(
                "key of {} bytes exceeds the {}-byte cap",
                key.encoded_size(),
                cap
            )));
        }
        Ok(())
    }

    /// Inline values up to this many bytes; larger ones go to value-chain
    /// pages.
    fn inline_threshold(&self) -> usize {
        self.pool.page_size() / 16
    }

    // ------------------------------------------------------------------
    // descent
    // ------------------------------------------------------------------

    /// Walk from the root to the leaf responsible for `key`, holding one
    /// read latch at a time. Returns the leaf and the internal path as
    /// (page, child index taken) pairs, root first.
    pub(crate) fn descend(
        &self,
        key: &IndexKey,
    ) -> ShoalResult<(PageId, Vec<(PageId, usize)>)> {
        let mut pid = self.root();
        let mut path = Vec::new();
        loop {
            let next = {
                let guard = self.pool.fetch(pid)?;
                let page = guard.page().latch_read();
                match page.kind()? {
                    PageKind::Leaf => None,
                    PageKind::Internal => {
                        let node = InternalNode::decode(&page)?;
                        let idx = node.child_for(key);
                        Some((node.child_at(idx), idx))
                    }
                    other => {
                        return Err(ShoalError::Corruption {
                            page_id: pid,
                            detail: format!("{} page in tree descent", other),
                        })
                    }
                }
            };
            match next {
                None => return Ok((pid, path)),
                Some((child, idx)) => {
                    path.push((pid, idx));
                    pid = child;
                }
            }
        }
    }

    /// Leaf holding the smallest keys.
    pub(crate) fn leftmost_leaf(&self) -> ShoalResult<PageId> {
        let mut pid = self.root();
        loop {
            let next = {
                let guard = self.pool.fetch(pid)?;
                let page = guard.page().latch_read();
                match page.kind()? {
                    PageKind::Leaf => None,
                    _ => Some(InternalNode::decode(&page)?.child_at(0)),
                }
            };
            match next {
                None => return Ok(pid),
                Some(child) => pid = child,
            }
        }
    }

    /// Number of levels, counted by walking the leftmost spine.
    pub fn height(&self) -> ShoalResult<usize> {
        let mut pid = self.root();
        let mut height = 1;
        loop {
            let next = {
                let guard = self.pool.fetch(pid)?;
                let page = guard.page().latch_read();
                match page.kind()? {
                    PageKind::Leaf => None,
                    _ => Some(InternalNode::decode(&page)?.child_at(0)),
                }
            };
            match next {
                None => return Ok(height),
                Some(child) => {
                    height += 1;
                    pid = child;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // point reads
    // ------------------------------------------------------------------

    /// Point lookup. Non-unique indexes return the first stored value; use
    /// `search_all` for the whole list.
    pub fn search(&self, key: &IndexKey) -> ShoalResult<Option<Bytes>> {
        Ok(self.search_all(key)?.into_iter().next())
    }

    pub fn search_all(&self, key: &IndexKey) -> ShoalResult<Vec<Bytes>> {
        self.schema.check(key)?;
        let (leaf_pid, _) = self.descend(key)?;
        let slots = {
            let guard = self.pool.fetch(leaf_pid)?;
            let page = guard.page().latch_read();
            let node = LeafNode::decode(&page)?;
            match node.keys.binary_search(key) {
                Ok(i) => node.values[i].clone(),
                Err(_) => return Ok(Vec::new()),
            }
        };
        slots.iter().map(|s| self.read_value(s)).collect()
    }

    pub fn contains(&self, key: &IndexKey) -> ShoalResult<bool> {
        Ok(!self.search_all(key)?.is_empty())
    }

    // ------------------------------------------------------------------
    // insert
    // ------------------------------------------------------------------

    /// Insert a value. A duplicate key is a `UniqueViolation` outcome on a
    /// unique index (the tree is untouched) and a value-list append
    /// otherwise.
    pub fn insert(&self, key: &IndexKey, value: &[u8]) -> ShoalResult<InsertOutcome> {
        self.insert_inner(key, value, false)
    }

    /// Insert-or-replace. An existing key has its whole value list replaced
    /// and reports `Updated`.
    pub fn upsert(&self, key: &IndexKey, value: &[u8]) -> ShoalResult<InsertOutcome> {
        self.insert_inner(key, value, true)
    }

    fn insert_inner(
        &self,
        key: &IndexKey,
        value: &[u8],
        replace: bool,
    ) -> ShoalResult<InsertOutcome> {
        self.schema.check(key)?;
        self.check_key_size(key)?;
        let _latch = self.tree_latch.lock().unwrap();

        let (leaf_pid, path) = self.descend(key)?;
        let guard = self.pool.fetch_for_write(leaf_pid)?;
        let mut node = {
            let page = guard.page().latch_read();
            LeafNode::decode(&page)?
        };

        let outcome = match node.keys.binary_search(key) {
            Ok(i) => {
                if replace {
                    let old = std::mem::replace(
                        &mut node.values[i],
                        vec![self.store_value(value)?],
                    );
                    self.free_value_slots(&old)?;
                    InsertOutcome::Updated
                } else if self.unique {
                    return Ok(InsertOutcome::UniqueViolation);
                } else {
                    node.values[i].push(self.store_value(value)?);
                    InsertOutcome::Inserted
                }
            }
            Err(i) => {
                node.keys.insert(i, key.clone());
                node.values.insert(i, vec![self.store_value(value)?]);
                InsertOutcome::Inserted
            }
        };

        if node.len() <= self.order && node.fits(self.pool.page_size()) {
            node.encode(&mut guard.page().latch_write())?;
            drop(guard);
        } else {
            self.split_leaf(leaf_pid, guard, node, path)?;
        }
        Ok(outcome)
    }

    fn split_leaf(
        &self,
        leaf_pid: PageId,
        guard: crate::storage::buffer_pool::PageGuard,
        mut node: LeafNode,
        path: Vec<(PageId, usize)>,
    ) -> ShoalResult<()> {
        let at = node.split_point();
        let right_keys = node.keys.split_off(at);
        let right_values = node.values.split_off(at);

        let (right_pid, right_guard) = self.pool.new_page(PageKind::Leaf)?;
        let right = LeafNode {
            keys: right_keys,
            values: right_values,
            next_leaf: node.next_leaf,
        };
        node.next_leaf = Some(right_pid);

        let separator = right.keys[0].clone();
        right.encode(&mut right_guard.page().latch_write())?;
        node.encode(&mut guard.page().latch_write())?;
        drop(right_guard);
        drop(guard);

        debug!(
            "split leaf {} -> {} at key {}",
            leaf_pid, right_pid, separator
        );

        // the new sibling hits disk before the old leaf's new sibling link,
        // and both before the parent learns the separator
        self.structural_flush(&[right_pid, leaf_pid])?;

        self.insert_into_parent(path, leaf_pid, separator, right_pid)
    }

    fn insert_into_parent(
        &self,
        mut path: Vec<(PageId, usize)>,
        mut left_pid: PageId,
        mut separator: IndexKey,
        mut right_pid: PageId,
    ) -> ShoalResult<()> {
        loop {
            let (parent_pid, child_idx) = match path.pop() {
                None => {
                    // the old root split: grow the tree by one level
                    let (new_root, guard) = self.pool.new_page(PageKind::Internal)?;
                    InternalNode::new(vec![separator], vec![left_pid, right_pid])
                        .encode(&mut guard.page().latch_write())?;
                    drop(guard);
                    self.structural_flush(&[new_root])?;
                    self.set_root(new_root)?;
                    debug!("new root {} for index {}", new_root, self.name);
                    return Ok(());
                }
                Some(p) => p,
            };

            let guard = self.pool.fetch_for_write(parent_pid)?;
            let mut node = {
                let page = guard.page().latch_read();
                InternalNode::decode(&page)?
            };
            node.keys.insert(child_idx, separator.clone());
            node.children.insert(child_idx + 1, right_pid);

            if node.child_count() <= self.order && node.fits(self.pool.page_size()) {
                node.encode(&mut guard.page().latch_write())?;
                drop(guard);
                self.structural_flush(&[parent_pid])?;
                return Ok(());
            }

            // split the internal node; the middle key moves up
            let mid = node.split_point();
            let push_up = node.keys[mid].clone();
            let right_keys = node.keys.split_off(mid + 1);
            node.keys.pop();
            let right_children = node.children.split_off(mid + 1);

            let (new_pid, new_guard) = self.pool.new_page(PageKind::Internal)?;
            InternalNode::new(right_keys, right_children)
                .encode(&mut new_guard.page().latch_write())?;
            node.encode(&mut guard.page().latch_write())?;
            drop(new_guard);
            drop(guard);
            self.structural_flush(&[new_pid, parent_pid])?;

            left_pid = parent_pid;
            separator = push_up;
            right_pid = new_pid;
        }
    }

    // ------------------------------------------------------------------
    // delete
    // ------------------------------------------------------------------

    pub fn delete(&self, key: &IndexKey) -> ShoalResult<DeleteOutcome> {
        self.schema.check(key)?;
        let _latch = self.tree_latch.lock().unwrap();

        let (leaf_pid, path) = self.descend(key)?;
        let guard = self.pool.fetch_for_write(leaf_pid)?;
        let mut node = {
            let page = guard.page().latch_read();
            LeafNode::decode(&page)?
        };

        let i = match node.keys.binary_search(key) {
            Ok(i) => i,
            Err(_) => return Ok(DeleteOutcome::NotFound),
        };
        node.keys.remove(i);
        let removed = node.values.remove(i);
        node.encode(&mut guard.page().latch_write())?;
        drop(guard);

        self.free_value_slots(&removed)?;
        self.rebalance(leaf_pid, path)?;
        Ok(DeleteOutcome::Deleted)
    }

    /// Walk back up the recorded path fixing underfull nodes by
    /// redistribution, then merge; merges may cascade and shrink the tree.
    fn rebalance(&self, mut pid: PageId, mut path: Vec<(PageId, usize)>) -> ShoalResult<()> {
        loop {
            let (parent_pid, child_idx) = match path.pop() {
                None => {
                    // root: an internal root with a single child hands the
                    // root role to that child
                    loop {
                        let single_child = {
                            let guard = self.pool.fetch(pid)?;
                            let page = guard.page().latch_read();
                            match page.kind()? {
                                PageKind::Internal => {
                                    let node = InternalNode::decode(&page)?;
                                    if node.child_count() == 1 {
                                        Some(node.child_at(0))
                                    } else {
                                        None
                                    }
                                }
                                _ => None,
                            }
                        };
                        match single_child {
                            Some(child) => {
                                self.set_root(child)?;
                                self.free_tree_page(pid)?;
                                debug!("root collapsed to {}", child);
                                pid = child;
                            }
                            None => return Ok(()),
                        }
                    }
                }
                Some(p) => p,
            };

            let underfull = {
                let guard = self.pool.fetch(pid)?;
                let page = guard.page().latch_read();
                match page.kind()? {
                    PageKind::Leaf => LeafNode::decode(&page)?.len() < self.min_entries(),
                    _ => InternalNode::decode(&page)?.child_count() < self.min_entries(),
                }
            };
            if !underfull {
                return Ok(());
            }

            let parent_guard = self.pool.fetch_for_write(parent_pid)?;
            let mut parent = {
                let page = parent_guard.page().latch_read();
                InternalNode::decode(&page)?
            };

            let kind = {
                let guard = self.pool.fetch(pid)?;
                let page = guard.page().latch_read();
                page.kind()?
            };
            let changed = match kind {
                PageKind::Leaf => self.fix_leaf(&mut parent, child_idx, pid)?,
                _ => self.fix_internal(&mut parent, child_idx, pid)?,
            };
            if changed {
                parent.encode(&mut parent_guard.page().latch_write())?;
                drop(parent_guard);
                self.structural_flush(&[parent_pid])?;
                pid = parent_pid;
                continue;
            }
            return Ok(());
        }
    }

    /// Fix an underfull leaf. Returns whether the parent node was modified
    /// (and the climb should continue).
    fn fix_leaf(
        &self,
        parent: &mut InternalNode,
        child_idx: usize,
        child_pid: PageId,
    ) -> ShoalResult<bool> {
        let page_size = self.pool.page_size();
        let min = self.min_entries();

        let child_guard = self.pool.fetch_for_write(child_pid)?;
        let mut child = {
            let page = child_guard.page().latch_read();
            LeafNode::decode(&page)?
        };

        // 1. borrow from the left sibling
        if child_idx > 0 {
            let left_pid = parent.child_at(child_idx - 1);
            let left_guard = self.pool.fetch_for_write(left_pid)?;
            let mut left = {
                let page = left_guard.page().latch_read();
                LeafNode::decode(&page)?
            };
            if left.len() > min {
                let moved = LeafNode::entry_size(
                    &left.keys[left.len() - 1],
                    &left.values[left.len() - 1],
                );
                if child.encoded_size() + moved <= page_size {
                    if let (Some(k), Some(v)) = (left.keys.pop(), left.values.pop()) {
                        child.keys.insert(0, k);
                        child.values.insert(0, v);
                    }
                    parent.keys[child_idx - 1] = child.keys[0].clone();
                    left.encode(&mut left_guard.page().latch_write())?;
                    child.encode(&mut child_guard.page().latch_write())?;
                    drop(left_guard);
                    drop(child_guard);
                    self.structural_flush(&[left_pid, child_pid])?;
                    debug!("leaf {} borrowed from left {}", child_pid, left_pid);
                    return Ok(true);
                }
            }
        }

        // 2. borrow from the right sibling
        if child_idx + 1 < parent.child_count() {
            let right_pid = parent.child_at(child_idx + 1);
            let right_guard = self.pool.fetch_for_write(right_pid)?;
            let mut right = {
                let page = right_guard.page().latch_read();
                LeafNode::decode(&page)?
            };
            if right.len() > min {
                let moved = LeafNode::entry_size(&right.keys[0], &right.values[0]);
                if child.encoded_size() + moved <= page_size {
                    child.keys.push(right.keys.remove(0));
                    child.values.push(right.values.remove(0));
                    parent.keys[child_idx] = right.keys[0].clone();
                    right.encode(&mut right_guard.page().latch_write())?;
                    child.encode(&mut child_guard.page().latch_write())?;
                    drop(right_guard);
                    drop(child_guard);
                    self.structural_flush(&[right_pid, child_pid])?;
                    debug!("leaf {} borrowed from right {}", child_pid, right_pid);
                    return Ok(true);
                }
            }
        }

        // 3. merge with the left sibling
        if child_idx > 0 {
            let left_pid = parent.child_at(child_idx - 1);
            let left_guard = self.pool.fetch_for_write(left_pid)?;
            let mut left = {
                let page = left_guard.page().latch_read();
                LeafNode::decode(&page)?
            };
            if left.encoded_size() + child.encoded_size() - PAGE_HEADER_SIZE <= page_size {
                left.keys.append(&mut child.keys);
                left.values.append(&mut child.values);
                left.next_leaf = child.next_leaf;
                left.encode(&mut left_guard.page().latch_write())?;
                parent.keys.remove(child_idx - 1);
                parent.children.remove(child_idx);
                drop(left_guard);
                drop(child_guard);
                self.structural_flush(&[left_pid])?;
                self.free_tree_page(child_pid)?;
                debug!("leaf {} merged into {}", child_pid, left_pid);
                return Ok(true);
            }
        }

        // 4. merge the right sibling into this leaf
        if child_idx + 1 < parent.child_count() {
            let right_pid = parent.child_at(child_idx + 1);
            let right_guard = self.pool.fetch_for_write(right_pid)?;
            let mut right = {
                let page = right_guard.page().latch_read();
                LeafNode::decode(&page)?
            };
            if child.encoded_size() + right.encoded_size() - PAGE_HEADER_SIZE <= page_size {
                child.keys.append(&mut right.keys);
                child.values.append(&mut right.values);
                child.next_leaf = right.next_leaf;
                child.encode(&mut child_guard.page().latch_write())?;
                parent.keys.remove(child_idx);
                parent.children.remove(child_idx + 1);
                drop(right_guard);
                drop(child_guard);
                self.structural_flush(&[child_pid])?;
                self.free_tree_page(right_pid)?;
                debug!("leaf {} absorbed right {}", child_pid, right_pid);
                return Ok(true);
            }
        }

        // neither redistribution nor merge fits; leave the leaf underfull
        Ok(false)
    }

    /// Fix an underfull internal node by rotating entries through the
    /// parent separator, else merging.
    fn fix_internal(
        &self,
        parent: &mut InternalNode,
        child_idx: usize,
        child_pid: PageId,
    ) -> ShoalResult<bool> {
        let page_size = self.pool.page_size();
        let min = self.min_entries();

        let child_guard = self.pool.fetch_for_write(child_pid)?;
        let mut child = {
            let page = child_guard.page().latch_read();
            InternalNode::decode(&page)?
        };

        if child_idx > 0 {
            let left_pid = parent.child_at(child_idx - 1);
            let left_guard = self.pool.fetch_for_write(left_pid)?;
            let mut left = {
                let page = left_guard.page().latch_read();
                InternalNode::decode(&page)?
            };
            // the falling separator occupies a fresh slot in the child
            let gained =
                SLOT_ENTRY_SIZE + parent.keys[child_idx - 1].encoded_size() + 8;
            if left.child_count() > min && child.encoded_size() + gained <= page_size {
                // rotate right: parent separator falls down, left's last
                // key climbs up
                child
                    .keys
                    .insert(0, parent.keys[child_idx - 1].clone());
                if let (Some(sep), Some(c)) = (left.keys.pop(), left.children.pop()) {
                    child.children.insert(0, c);
                    parent.keys[child_idx - 1] = sep;
                }
                left.encode(&mut left_guard.page().latch_write())?;
                child.encode(&mut child_guard.page().latch_write())?;
                drop(left_guard);
                drop(child_guard);
                self.structural_flush(&[left_pid, child_pid])?;
                return Ok(true);
            }
        }

        if child_idx + 1 < parent.child_count() {
            let right_pid = parent.child_at(child_idx + 1);
            let right_guard = self.pool.fetch_for_write(right_pid)?;
            let mut right = {
                let page = right_guard.page().latch_read();
                InternalNode::decode(&page)?
            };
            let gained = SLOT_ENTRY_SIZE + parent.keys[child_idx].encoded_size() + 8;
            if right.child_count() > min && child.encoded_size() + gained <= page_size {
                child.keys.push(parent.keys[child_idx].clone());
                child.children.push(right.children.remove(0));
                parent.keys[child_idx] = right.keys.remove(0);
                right.encode(&mut right_guard.page().latch_write())?;
                child.encode(&mut child_guard.page().latch_write())?;
                drop(right_guard);
                drop(child_guard);
                self.structural_flush(&[right_pid, child_pid])?;
                return Ok(true);
            }
        }

        if child_idx > 0 {
            let left_pid = parent.child_at(child_idx - 1);
            let left_guard = self.pool.fetch_for_write(left_pid)?;
            let mut left = {
                let page = left_guard.page().latch_read();
                InternalNode::decode(&page)?
            };
            let sep = parent.keys[child_idx - 1].clone();
            // the separator falls down into a fresh slot: directory entry +
            // key bytes + child pointer
            let merged_size = left.encoded_size() + child.encoded_size()
                - PAGE_HEADER_SIZE
                + SLOT_ENTRY_SIZE
                + sep.encoded_size()
                + 8;
            if merged_size <= page_size {
                left.keys.push(sep);
                left.keys.append(&mut child.keys);
                left.children.append(&mut child.children);
                left.encode(&mut left_guard.page().latch_write())?;
                parent.keys.remove(child_idx - 1);
                parent.children.remove(child_idx);
                drop(left_guard);
                drop(child_guard);
                self.structural_flush(&[left_pid])?;
                self.free_tree_page(child_pid)?;
                return Ok(true);
            }
        }

        if child_idx + 1 < parent.child_count() {
            let right_pid = parent.child_at(child_idx + 1);
            let right_guard = self.pool.fetch_for_write(right_pid)?;
            let mut right = {
                let page = right_guard.page().latch_read();
                InternalNode::decode(&page)?
            };
            let sep = parent.keys[child_idx].clone();
            let merged_size = child.encoded_size() + right.encoded_size()
                - PAGE_HEADER_SIZE
                + SLOT_ENTRY_SIZE
                + sep.encoded_size()
                + 8;
            if merged_size <= page_size {
                child.keys.push(sep);
                child.keys.append(&mut right.keys);
                child.children.append(&mut right.children);
                child.encode(&mut child_guard.page().latch_write())?;
                parent.keys.remove(child_idx);
                parent.children.remove(child_idx + 1);
                drop(right_guard);
                drop(child_guard);
                self.structural_flush(&[child_pid])?;
                self.free_tree_page(right_pid)?;
                return Ok(true);
            }
        }

        Ok(false)
    }

    // ------------------------------------------------------------------
    // bulk load
    // ------------------------------------------------------------------

    /// Bottom-up build from presorted pairs, replacing the current tree.
    /// Leaves are packed to `fill_factor` of the order; internal levels the
    /// same. Much faster than repeated inserts.
    pub fn bulk_load(
        &self,
        pairs: Vec<(IndexKey, Vec<u8>)>,
        fill_factor: f64,
        cancel: &CancelToken,
    ) -> ShoalResult<()> {
        let _latch = self.tree_latch.lock().unwrap();

        // group values per key, rejecting disorder and unique violations
        let mut grouped: Vec<(IndexKey, Vec<Vec<u8>>)> = Vec::new();
        for (key, value) in pairs {
            self.schema.check(&key)?;
            match grouped.last_mut() {
                Some((last, values)) if *last == key => {
                    if self.unique {
                        return Err(ShoalError::UniqueViolation);
                    }
                    values.push(value);
                }
                Some((last, _)) if *last > key => return Err(ShoalError::NotSorted),
                _ => grouped.push((key, vec![value])),
            }
        }

        // the old tree is garbage after a successful build
        let old_pages = self.collect_tree_pages()?;

        let per_node = ((self.order as f64 * fill_factor) as usize)
            .max(2)
            .min(self.order);

        // leaf level
        let mut level: Vec<(IndexKey, PageId)> = Vec::new();
        let mut prev: Option<(PageId, LeafNode)> = None;
        if grouped.is_empty() {
            let (pid, guard) = self.pool.new_page(PageKind::Leaf)?;
            LeafNode::empty().encode(&mut guard.page().latch_write())?;
            drop(guard);
            self.finish_bulk_load(pid, old_pages)?;
            return Ok(());
        }

        // store values once up front so a chunk boundary never re-spills a
        // chain
        let mut entries: Vec<(IndexKey, Vec<ValueSlot>)> =
            Vec::with_capacity(grouped.len());
        for (key, values) in grouped {
            cancel.check()?;
            let mut slots = Vec::with_capacity(values.len());
            for v in &values {
                slots.push(self.store_value(v)?);
            }
            entries.push((key, slots));
        }

        let mut start = 0;
        while start < entries.len() {
            cancel.check()?;
            let mut node = LeafNode::empty();
            let mut end = start;
            while end < entries.len() && end - start < per_node {
                let (key, slots) = &entries[end];
                if !node.is_empty()
                    && node.encoded_size() + LeafNode::entry_size(key, slots)
                        > self.pool.page_size()
                {
                    break;
                }
                node.keys.push(key.clone());
                node.values.push(slots.clone());
                end += 1;
            }
            start = end;

            let (pid, guard) = self.pool.new_page(PageKind::Leaf)?;
            level.push((node.keys[0].clone(), pid));
            if let Some((prev_pid, mut prev_node)) = prev.take() {
                prev_node.next_leaf = Some(pid);
                let prev_guard = self.pool.fetch_for_write(prev_pid)?;
                prev_node.encode(&mut prev_guard.page().latch_write())?;
            }
            node.encode(&mut guard.page().latch_write())?;
            prev = Some((pid, node));
        }
        drop(prev);

        // internal levels, chunked by count and by bytes
        while level.len() > 1 {
            cancel.check()?;
            let mut next_level: Vec<(IndexKey, PageId)> = Vec::new();
            let mut start = 0;
            while start < level.len() {
                let mut node = InternalNode::new(Vec::new(), vec![level[start].1]);
                let mut end = start + 1;
                while end < level.len() && end - start < per_node {
                    let extra =
                        SLOT_ENTRY_SIZE + level[end].0.encoded_size() + 8;
                    if node.encoded_size() + extra > self.pool.page_size() {
                        break;
                    }
                    node.keys.push(level[end].0.clone());
                    node.children.push(level[end].1);
                    end += 1;
                }
                let (pid, guard) = self.pool.new_page(PageKind::Internal)?;
                node.encode(&mut guard.page().latch_write())?;
                next_level.push((level[start].0.clone(), pid));
                start = end;
            }
            level = next_level;
        }

        let new_root = level[0].1;
        self.finish_bulk_load(new_root, old_pages)?;
        Ok(())
    }

    fn finish_bulk_load(&self, new_root: PageId, old_pages: Vec<PageId>) -> ShoalResult<()> {
        self.pool.flush_all()?;
        if self.structural_sync {
            self.pool.page_file().sync()?;
        }
        self.set_root(new_root)?;
        for pid in old_pages {
            self.free_tree_page(pid)?;
        }
        Ok(())
    }

    /// Every page reachable from the current root: tree pages plus the
    /// value chains hanging off the leaves.
    fn collect_tree_pages(&self) -> ShoalResult<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut stack = vec![self.root()];
        while let Some(pid) = stack.pop() {
            pages.push(pid);
            let guard = self.pool.fetch(pid)?;
            let page = guard.page().latch_read();
            match page.kind()? {
                PageKind::Internal => {
                    let node = InternalNode::decode(&page)?;
                    stack.extend(node.children.iter().copied());
                }
                PageKind::Leaf => {
                    let node = LeafNode::decode(&page)?;
                    for slots in &node.values {
                        for slot in slots {
                            if let ValueSlot::Ref(r) = slot {
                                stack.push(r.page);
                            }
                        }
                    }
                }
                _ => {}
            }
            if page.kind()? == PageKind::Meta {
                // value chain page: follow the chain
                if let Some(next) = page.right_sibling() {
                    stack.push(next);
                }
            }
        }
        Ok(pages)
    }

    // ------------------------------------------------------------------
    // values
    // ------------------------------------------------------------------

    pub(crate) fn store_value(&self, value: &[u8]) -> ShoalResult<ValueSlot> {
        if value.len() <= self.inline_threshold() {
            return Ok(ValueSlot::Inline(value.to_vec()));
        }

        // spill to a chain of value pages, linked through right_sibling;
        // built back to front so each page already knows its successor
        let seg_cap = self.pool.page_size() - PAGE_HEADER_SIZE;
        let chunks: Vec<&[u8]> = value.chunks(seg_cap).collect();
        let mut next: Option<PageId> = None;
        for chunk in chunks.iter().rev() {
            let (pid, guard) = self.pool.new_page(PageKind::Meta)?;
            let mut page = guard.page().latch_write();
            page.set_flags(FLAG_VALUE_CHAIN);
            page.set_right_sibling_opt(next);
            page.set_free_offset((PAGE_HEADER_SIZE + chunk.len()) as u16);
            page.data_mut()[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + chunk.len()]
                .copy_from_slice(chunk);
            drop(page);
            next = Some(pid);
        }

        // chunks is never empty here: the value exceeded the threshold
        let first = match next {
            Some(pid) => pid,
            None => {
                return Err(ShoalError::Corruption {
                    page_id: crate::storage::page::NO_PAGE,
                    detail: "empty value chain".to_string(),
                })
            }
        };
        Ok(ValueSlot::Ref(ValueRef {
            page: first,
            offset: PAGE_HEADER_SIZE as u16,
            len: value.len() as u32,
        }))
    }

    pub(crate) fn read_value(&self, slot: &ValueSlot) -> ShoalResult<Bytes> {
        match slot {
            ValueSlot::Inline(bytes) => Ok(Bytes::copy_from_slice(bytes)),
            ValueSlot::Ref(r) => {
                let mut out = Vec::with_capacity(r.len as usize);
                let mut pid = Some(r.page);
                while out.len() < r.len as usize {
                    let cur = pid.ok_or_else(|| ShoalError::Corruption {
                        page_id: r.page,
                        detail: "value chain ended early".to_string(),
                    })?;
                    let guard = self.pool.fetch(cur)?;
                    let page = guard.page().latch_read();
                    if page.kind()? != PageKind::Meta
                        || page.flags() & FLAG_VALUE_CHAIN == 0
                    {
                        return Err(ShoalError::Corruption {
                            page_id: cur,
                            detail: "not a value chain page".to_string(),
                        });
                    }
                    let seg_len = page.free_offset() as usize - PAGE_HEADER_SIZE;
                    let want = (r.len as usize - out.len()).min(seg_len);
                    out.extend_from_slice(
                        &page.data()[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + want],
                    );
                    pid = page.right_sibling();
                }
                Ok(Bytes::from(out))
            }
        }
    }

    pub(crate) fn free_value_slots(&self, slots: &[ValueSlot]) -> ShoalResult<()> {
        for slot in slots {
            if let ValueSlot::Ref(r) = slot {
                let mut pid = Some(r.page);
                while let Some(cur) = pid {
                    pid = {
                        let guard = self.pool.fetch(cur)?;
                        let page = guard.page().latch_read();
                        page.right_sibling()
                    };
                    self.free_tree_page(cur)?;
                }
            }
        }
        Ok(())
    }

    fn free_tree_page(&self, pid: PageId) -> ShoalResult<()> {
        self.pool.discard(pid);
        self.pool.page_file().free_page(pid)
    }

    fn structural_flush(&self, pids: &[PageId]) -> ShoalResult<()> {
        if !self.structural_sync {
            return Ok(());
        }
        for &pid in pids {
            self.pool.flush(pid)?;
        }
        self.pool.page_file().sync()
    }

    // ------------------------------------------------------------------
    // debugging / validation
    // ------------------------------------------------------------------

    /// One line per level, for eyeballing small trees in tests.
    pub fn draw(&self) -> ShoalResult<String> {
        let mut lines = Vec::new();
        let mut level = vec![self.root()];
        while !level.is_empty() {
            let mut next_level = Vec::new();
            let mut cells = Vec::new();
            for &pid in &level {
                let guard = self.pool.fetch(pid)?;
                let page = guard.page().latch_read();
                match page.kind()? {
                    PageKind::Leaf => {
                        let node = LeafNode::decode(&page)?;
                        cells.push(format!(
                            "[{}: {}]",
                            pid,
                            node.keys.iter().map(|k| k.to_string()).join(" ")
                        ));
                    }
                    _ => {
                        let node = InternalNode::decode(&page)?;
                        cells.push(format!(
                            "({}: {})",
                            pid,
                            node.keys.iter().map(|k| k.to_string()).join(" ")
                        ));
                        next_level.extend(node.children.iter().copied());
                    }
                }
            }
            lines.push(cells.join("  "));
            level = next_level;
        }
        Ok(lines.join("\n"))
    }

    /// Walk the whole tree asserting the structural invariants: sorted
    /// separators, sorted leaves, fanout bounds, and a sibling chain that
    /// visits every leaf in global key order. Test-support only.
    pub fn check_integrity(&self, check_occupancy: bool) {
        let root = self.root();
        let mut leaves = Vec::new();
        self.check_subtree(root, None, None, root, check_occupancy, &mut leaves);

        // the sibling chain must enumerate exactly the leaves found by the
        // descent, in order
        let mut chained = Vec::new();
        let mut pid = Some(self.leftmost_leaf().unwrap());
        while let Some(cur) = pid {
            chained.push(cur);
            let guard = self.pool.fetch(cur).unwrap();
            let page = guard.page().latch_read();
            pid = page.right_sibling();
        }
        assert_eq!(chained, leaves, "sibling chain disagrees with tree order");
    }

    fn check_subtree(
        &self,
        pid: PageId,
        lower: Option<&IndexKey>,
        upper: Option<&IndexKey>,
        root: PageId,
        check_occupancy: bool,
        leaves: &mut Vec<PageId>,
    ) {
        let guard = self.pool.fetch(pid).unwrap();
        let page = guard.page().latch_read();
        match page.kind().unwrap() {
            PageKind::Leaf => {
                let node = LeafNode::decode(&page).unwrap();
                drop(page);
                drop(guard);
                for pair in node.keys.windows(2) {
                    assert!(pair[0] < pair[1], "leaf keys out of order");
                }
                if let Some(lower) = lower {
                    if let Some(first) = node.keys.first() {
                        assert!(lower <= first, "leaf key below subtree bound");
                    }
                }
                if let Some(upper) = upper {
                    if let Some(last) = node.keys.last() {
                        assert!(last < upper, "leaf key above subtree bound");
                    }
                }
                if check_occupancy && pid != root {
                    assert!(
                        node.len() >= self.min_entries(),
                        "leaf {} under-occupied: {} < {}",
                        pid,
                        node.len(),
                        self.min_entries()
                    );
                }
                assert!(node.len() <= self.order, "leaf over-occupied");
                leaves.push(pid);
            }
            _ => {
                let node = InternalNode::decode(&page).unwrap();
                drop(page);
                drop(guard);
                for pair in node.keys.windows(2) {
                    assert!(pair[0] < pair[1], "separators out of order");
                }
                if check_occupancy && pid != root {
                    assert!(node.child_count() >= self.min_entries());
                }
                assert!(node.child_count() <= self.order, "fanout exceeded");
                for (i, &child) in node.children.iter().enumerate() {
                    let lo = if i == 0 { lower } else { Some(&node.keys[i - 1]) };
                    let hi = if i == node.keys.len() {
                        upper
                    } else {
                        Some(&node.keys[i])
                    };
                    self.check_subtree(child, lo, hi, root, check_occupancy, leaves);
                }
            }
        }
    }
}
