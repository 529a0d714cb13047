use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, RwLock, RwLockWriteGuard},
};

use crate::{error::ShoalError, utils::Latched};

// Type alias, not a new type, cannot define methods on it
pub type Pod<T> = Arc<RwLock<T>>;

pub type ResultPod<T> = Result<Pod<T>, ShoalError>;
pub type ShoalResult<T> = Result<T, ShoalError>;

/// A HashMap behind a RwLock. Read-mostly maps (frame table, tombstones,
/// TTL registry) go through this so callers never hold the raw lock.
pub struct ConcurrentHashMap<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> ConcurrentHashMap<K, V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.latch_read().get(key).cloned()
    }

    pub fn get_or_insert(
        &self,
        key: &K,
        constructor: impl FnOnce(&K) -> ShoalResult<V>,
    ) -> ShoalResult<V> {
        // fast path
        if let Some(v) = self.inner.latch_read().get(key) {
            return Ok(v.clone());
        }

        let mut inner = self.inner.latch_write();
        if let Some(v) = inner.get(key) {
            return Ok(v.clone());
        }
        let v = constructor(key)?;
        inner.insert(key.clone(), v.clone());
        Ok(v)
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner.latch_write().insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.latch_write().remove(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.latch_read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.latch_read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.latch_read().is_empty()
    }

    pub fn clear(&self) {
        self.inner.latch_write().clear()
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.latch_read().keys().cloned().collect()
    }

    /// Snapshot of the entries. The sweeper iterates over this instead of
    /// holding the read lock across its whole pass.
    pub fn entries(&self) -> Vec<(K, V)> {
        self.inner
            .latch_read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn retain(&self, f: impl FnMut(&K, &mut V) -> bool) {
        self.inner.latch_write().retain(f)
    }

    pub fn get_inner_wl(&self) -> RwLockWriteGuard<'_, HashMap<K, V>> {
        self.inner.latch_write()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for ConcurrentHashMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
