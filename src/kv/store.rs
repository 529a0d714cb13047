use std::{
    io::Cursor,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use log::{debug, warn};
use rand::seq::SliceRandom;

use crate::{
    btree::{key::IndexKey, tree::BTreeIndex},
    config::{DbConfig, FsyncPolicy, KvEvictionPolicy},
    error::ShoalError,
    hlc::{wall_clock_micros, HlcTimestamp, HybridLogicalClock},
    io::{Decodeable, Encodeable},
    kv::{
        arc_cache::ArcState,
        glob::glob_match,
        pubsub::{KvEvent, Publisher},
        register::{lww_wins, LwwRegister},
    },
    storage::buffer_pool::BufferPool,
    types::{ConcurrentHashMap, ShoalResult},
    utils::CancelToken,
};

/// Redis-style eviction samples this many keys per round.
const EVICTION_SAMPLE: usize = 5;

/// Flat bookkeeping cost charged per key on top of key and value bytes.
const ENTRY_OVERHEAD: usize = 64;

/// Conflict-resolution discipline of a register. Only last-writer-wins is
/// implemented today; the parameter keeps the wire and call shape stable
/// for other register kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrdtKind {
    Lww,
}

#[derive(Debug, Clone, Copy, Default)]
struct KeyAccess {
    last_access_us: u64,
    access_count: u64,
}

/// The replicated register map: LWW registers with tombstones over a
/// unique B+ tree index, stamped by the hybrid logical clock.
///
/// Local writes are stamped with `hlc.now()`; remote writes arrive through
/// `merge_remote`, which folds the remote timestamp into the clock and
/// keeps whichever `(ts, value)` is greatest. Deletes are tombstones so the
/// same rule applies to them.
pub struct LwwStore {
    index: Arc<BTreeIndex>,
    pool: Arc<BufferPool>,
    hlc: Arc<HybridLogicalClock>,
    config: DbConfig,

    tombstones: ConcurrentHashMap<Vec<u8>, HlcTimestamp>,
    /// key -> absolute expiry, wall-clock microseconds
    ttl: ConcurrentHashMap<Vec<u8>, u64>,
    access: ConcurrentHashMap<Vec<u8>, KeyAccess>,
    arc_state: Mutex<ArcState>,
    publisher: Publisher,
    mem_used: AtomicUsize,
    cancel: CancelToken,
}

impl LwwStore {
    pub fn new(
        index: Arc<BTreeIndex>,
        pool: Arc<BufferPool>,
        hlc: Arc<HybridLogicalClock>,
        config: DbConfig,
    ) -> Self {
        let arc_capacity = (config.max_memory_bytes / ENTRY_OVERHEAD).max(16);
        Self {
            index,
            pool,
            hlc,
            config,
            tombstones: ConcurrentHashMap::new(),
            ttl: ConcurrentHashMap::new(),
            access: ConcurrentHashMap::new(),
            arc_state: Mutex::new(ArcState::new(arc_capacity)),
            publisher: Publisher::new(),
            mem_used: AtomicUsize::new(0),
            cancel: CancelToken::new(),
        }
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn clock(&self) -> &Arc<HybridLogicalClock> {
        &self.hlc
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn memory_used(&self) -> usize {
        self.mem_used.load(Ordering::SeqCst)
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    // ------------------------------------------------------------------
    // writes
    // ------------------------------------------------------------------

    pub fn set(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> ShoalResult<bool> {
        self.set_with(key, value, ttl, CrdtKind::Lww)
    }

    /// Returns false when the write lost to a newer entry or tombstone
    /// (a concurrent remote merge) and was silently dropped.
    pub fn set_with(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Option<Duration>,
        _kind: CrdtKind,
    ) -> ShoalResult<bool> {
        self.cancel.check()?;
        let ts = self.hlc.now();
        if !self.apply_value(key, value, ts)? {
            debug!("set of {:?} lost to a newer write", String::from_utf8_lossy(key));
            return Ok(false);
        }

        match ttl {
            Some(d) => {
                self.ttl
                    .insert(key.to_vec(), wall_clock_micros() + d.as_micros() as u64);
            }
            None => {
                self.ttl.remove(&key.to_vec());
            }
        }
        self.publisher.publish(&KvEvent::Set {
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
        });
        self.maybe_evict()?;
        self.durability_barrier()?;
        Ok(true)
    }

    /// Tombstone the key at `hlc.now()`. Returns whether a live value was
    /// removed.
    pub fn delete(&self, key: &[u8]) -> ShoalResult<bool> {
        self.cancel.check()?;
        let ts = self.hlc.now();
        let existed = self.remove_entry(key)?;
        self.tombstones.insert(key.to_vec(), ts);
        if existed {
            self.publisher.publish(&KvEvent::Delete {
                key: Bytes::copy_from_slice(key),
            });
        }
        self.durability_barrier()?;
        Ok(existed)
    }

    // ------------------------------------------------------------------
    // reads
    // ------------------------------------------------------------------

    /// Live value, or `None` when absent, tombstoned, or expired. Expiry is
    /// checked passively on every read.
    pub fn get(&self, key: &[u8]) -> ShoalResult<Option<Bytes>> {
        if self.is_past_expiry(key) {
            self.expire_key_now(key)?;
            return Ok(None);
        }
        let reg = match self.load_register(key)? {
            Some(r) => r,
            None => return Ok(None),
        };
        if let Some(tomb) = self.tombstones.get(&key.to_vec()) {
            if tomb > reg.ts {
                return Ok(None);
            }
        }
        self.record_access(key);
        Ok(Some(reg.value))
    }

    pub fn exists(&self, key: &[u8]) -> ShoalResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Live value together with its stamp; what a replicator ships to
    /// peers.
    pub fn get_with_ts(&self, key: &[u8]) -> ShoalResult<Option<(Bytes, HlcTimestamp)>> {
        match self.get(key)? {
            Some(_) => {
                let reg = match self.load_register(key)? {
                    Some(r) => r,
                    None => return Ok(None),
                };
                Ok(Some((reg.value, reg.ts)))
            }
            None => Ok(None),
        }
    }

    /// The key's tombstone stamp, if one is retained.
    pub fn tombstone_ts(&self, key: &[u8]) -> Option<HlcTimestamp> {
        self.tombstones.get(&key.to_vec())
    }

    /// Cursor scan: pass the returned cursor back in to continue; an empty
    /// cursor means the iteration is complete. `pattern` is a glob filter
    /// applied to the examined window.
    pub fn scan(
        &self,
        cursor: &[u8],
        pattern: Option<&[u8]>,
        limit: usize,
    ) -> ShoalResult<(Vec<u8>, Vec<Bytes>)> {
        let start = if cursor.is_empty() {
            None
        } else {
            Some(IndexKey::bytes(cursor))
        };
        let it = self
            .index
            .range(start.as_ref(), false, None, false)?
            .with_cancel(self.cancel.clone());

        let mut keys = Vec::new();
        let mut next_cursor = Vec::new();
        let mut examined = 0usize;
        for item in it {
            let (key, _) = item?;
            let raw = key_bytes(&key)?;
            examined += 1;
            let live = !self.is_past_expiry(&raw) && !self.is_tombstoned_now(&raw);
            if live && pattern.map_or(true, |p| glob_match(p, &raw)) {
                keys.push(Bytes::from(raw.clone()));
            }
            if examined >= limit.max(1) {
                next_cursor = raw;
                break;
            }
        }
        Ok((next_cursor, keys))
    }

    // ------------------------------------------------------------------
    // replication
    // ------------------------------------------------------------------

    /// Fold in a write observed on another replica. `remote_value` is
    /// `None` for a remote tombstone. Returns whether local state changed.
    pub fn merge_remote(
        &self,
        key: &[u8],
        remote_value: Option<&[u8]>,
        remote_ts: HlcTimestamp,
    ) -> ShoalResult<bool> {
        self.cancel.check()?;
        self.hlc.update(remote_ts)?;

        let local_reg = self.load_register(key)?;
        let local_tomb = self.tombstones.get(&key.to_vec());

        // effective local state: the register unless a strictly newer
        // tombstone shadows it
        let local: Option<(HlcTimestamp, Option<Bytes>)> = match (&local_reg, local_tomb) {
            (Some(reg), Some(tomb)) => {
                if tomb > reg.ts {
                    Some((tomb, None))
                } else {
                    Some((reg.ts, Some(reg.value.clone())))
                }
            }
            (Some(reg), None) => Some((reg.ts, Some(reg.value.clone()))),
            (None, Some(tomb)) => Some((tomb, None)),
            (None, None) => None,
        };

        let remote_wins = match &local {
            None => true,
            Some((local_ts, local_value)) => beats(
                remote_ts,
                remote_value,
                *local_ts,
                local_value.as_deref(),
            ),
        };
        if !remote_wins {
            return Ok(false);
        }

        match remote_value {
            Some(value) => {
                let changed = local_reg.as_ref().map(|r| &r.value[..]) != Some(value)
                    || local_reg.as_ref().map(|r| r.ts) != Some(remote_ts);
                self.write_register(key, value, remote_ts)?;
                self.tombstones.remove(&key.to_vec());
                if changed {
                    // re-publish so local subscribers converge too
                    self.publisher.publish(&KvEvent::Set {
                        key: Bytes::copy_from_slice(key),
                        value: Bytes::copy_from_slice(value),
                    });
                }
                self.durability_barrier()?;
                Ok(changed)
            }
            None => {
                let existed = self.remove_entry(key)?;
                let tomb_changed = self.tombstones.insert(key.to_vec(), remote_ts)
                    != Some(remote_ts);
                if existed {
                    self.publisher.publish(&KvEvent::Delete {
                        key: Bytes::copy_from_slice(key),
                    });
                }
                self.durability_barrier()?;
                Ok(existed || tomb_changed)
            }
        }
    }

    /// Drop tombstones strictly older than the watermark. The caller must
    /// guarantee no in-flight message carries a smaller timestamp, so a
    /// late older write can never resurrect a collected delete.
    pub fn cleanup_tombstones(&self, watermark: HlcTimestamp) -> usize {
        let before = self.tombstones.len();
        self.tombstones.retain(|_, ts| *ts >= watermark);
        let removed = before - self.tombstones.len();
        if removed > 0 {
            debug!("collected {} tombstones below {}", removed, watermark);
        }
        removed
    }

    // ------------------------------------------------------------------
    // ttl
    // ------------------------------------------------------------------

    /// Remaining lifetime; `Ok(None)` for a live key without a TTL,
    /// `NotFound` when the key is not live.
    pub fn ttl(&self, key: &[u8]) -> ShoalResult<Option<Duration>> {
        if !self.is_live(key)? {
            return Err(ShoalError::NotFound);
        }
        Ok(self.ttl.get(&key.to_vec()).map(|expire_at| {
            Duration::from_micros(expire_at.saturating_sub(wall_clock_micros()))
        }))
    }

    pub fn expire(&self, key: &[u8], ttl: Duration) -> ShoalResult<bool> {
        if !self.is_live(key)? {
            return Ok(false);
        }
        self.ttl
            .insert(key.to_vec(), wall_clock_micros() + ttl.as_micros() as u64);
        Ok(true)
    }

    /// Strip the TTL, making the key permanent. Returns whether a TTL was
    /// present.
    pub fn persist(&self, key: &[u8]) -> ShoalResult<bool> {
        if !self.is_live(key)? {
            return Ok(false);
        }
        Ok(self.ttl.remove(&key.to_vec()).is_some())
    }

    /// One active-expiry pass: examine at most `max_keys` TTL entries,
    /// expiring the overdue ones. Returns how many were expired.
    pub fn sweep_expired(&self, max_keys: usize) -> ShoalResult<usize> {
        let now = wall_clock_micros();
        let snapshot = self.ttl.entries();
        let mut expired = 0;
        for (key, expire_at) in snapshot.into_iter().take(max_keys) {
            self.cancel.check()?;
            if expire_at <= now {
                self.expire_key_now(&key)?;
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Flush dirty pages and issue a durability barrier.
    pub fn flush_now(&self) -> ShoalResult<()> {
        self.pool.flush_all()?;
        self.pool.page_file().sync()
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn load_register(&self, key: &[u8]) -> ShoalResult<Option<LwwRegister>> {
        match self.index.search(&IndexKey::bytes(key))? {
            Some(bytes) => Ok(Some(LwwRegister::decode_from(&mut Cursor::new(
                &bytes[..],
            ))?)),
            None => Ok(None),
        }
    }

    fn apply_value(&self, key: &[u8], value: &[u8], ts: HlcTimestamp) -> ShoalResult<bool> {
        if let Some(tomb) = self.tombstones.get(&key.to_vec()) {
            // a tombstone only shadows the write when strictly newer
            if tomb > ts {
                return Ok(false);
            }
        }
        if let Some(cur) = self.load_register(key)? {
            if !lww_wins(ts, value, cur.ts, &cur.value) {
                return Ok(false);
            }
        }
        self.write_register(key, value, ts)?;
        self.tombstones.remove(&key.to_vec());
        Ok(true)
    }

    fn write_register(&self, key: &[u8], value: &[u8], ts: HlcTimestamp) -> ShoalResult<()> {
        let old_size = self.load_register(key)?.map(|r| r.value.len());
        let reg = LwwRegister::new(Bytes::copy_from_slice(value), ts);
        self.index.upsert(&IndexKey::bytes(key), &reg.encode())?;

        let new_mem = entry_mem(key.len(), value.len());
        match old_size {
            Some(old) => {
                let old_mem = entry_mem(key.len(), old);
                if new_mem >= old_mem {
                    self.mem_used.fetch_add(new_mem - old_mem, Ordering::SeqCst);
                } else {
                    self.mem_used.fetch_sub(old_mem - new_mem, Ordering::SeqCst);
                }
            }
            None => {
                self.mem_used.fetch_add(new_mem, Ordering::SeqCst);
            }
        }
        self.record_access(key);
        Ok(())
    }

    /// Remove the index entry and all per-key bookkeeping except the
    /// tombstone map (callers decide whether a tombstone is written).
    fn remove_entry(&self, key: &[u8]) -> ShoalResult<bool> {
        let existed = match self.load_register(key)? {
            Some(reg) => {
                self.index.delete(&IndexKey::bytes(key))?;
                self.mem_used
                    .fetch_sub(entry_mem(key.len(), reg.value.len()), Ordering::SeqCst);
                true
            }
            None => false,
        };
        self.ttl.remove(&key.to_vec());
        self.access.remove(&key.to_vec());
        self.arc_state.lock().unwrap().remove(key);
        Ok(existed)
    }

    /// An expiry is a delete: it must win over older remote writes, so it
    /// leaves a tombstone (unlike memory-pressure eviction).
    fn expire_key_now(&self, key: &[u8]) -> ShoalResult<()> {
        let ts = self.hlc.now();
        let existed = self.remove_entry(key)?;
        self.tombstones.insert(key.to_vec(), ts);
        if existed {
            debug!("expired {:?}", String::from_utf8_lossy(key));
            self.publisher.publish(&KvEvent::Expire {
                key: Bytes::copy_from_slice(key),
            });
        }
        Ok(())
    }

    fn is_past_expiry(&self, key: &[u8]) -> bool {
        match self.ttl.get(&key.to_vec()) {
            Some(expire_at) => expire_at <= wall_clock_micros(),
            None => false,
        }
    }

    fn is_tombstoned_now(&self, key: &[u8]) -> bool {
        self.tombstones.contains_key(&key.to_vec())
            && match (
                self.tombstones.get(&key.to_vec()),
                self.load_register(key).ok().flatten(),
            ) {
                (Some(tomb), Some(reg)) => tomb > reg.ts,
                (Some(_), None) => true,
                _ => false,
            }
    }

    fn is_live(&self, key: &[u8]) -> ShoalResult<bool> {
        if self.is_past_expiry(key) {
            self.expire_key_now(key)?;
            return Ok(false);
        }
        let reg = match self.load_register(key)? {
            Some(r) => r,
            None => return Ok(false),
        };
        if let Some(tomb) = self.tombstones.get(&key.to_vec()) {
            if tomb > reg.ts {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn record_access(&self, key: &[u8]) {
        let now = wall_clock_micros();
        let mut entry = self.access.get(&key.to_vec()).unwrap_or_default();
        entry.last_access_us = now;
        entry.access_count += 1;
        self.access.insert(key.to_vec(), entry);
        if self.config.eviction_policy == KvEvictionPolicy::Arc {
            self.arc_state.lock().unwrap().on_access(key);
        }
    }

    // ------------------------------------------------------------------
    // eviction
    // ------------------------------------------------------------------

    fn maybe_evict(&self) -> ShoalResult<()> {
        while self.mem_used.load(Ordering::SeqCst) > self.config.max_memory_bytes {
            let victim = match self.pick_victim() {
                Some(v) => v,
                None => {
                    warn!(
                        "memory over budget ({} > {}) with no evictable key",
                        self.mem_used.load(Ordering::SeqCst),
                        self.config.max_memory_bytes
                    );
                    return Ok(());
                }
            };
            debug!("evicting {:?}", String::from_utf8_lossy(&victim));
            // cache eviction, not a CRDT delete: no tombstone
            self.remove_entry(&victim)?;
        }
        Ok(())
    }

    fn pick_victim(&self) -> Option<Vec<u8>> {
        if self.config.eviction_policy == KvEvictionPolicy::Arc {
            return self.arc_state.lock().unwrap().victim();
        }

        let volatile = matches!(
            self.config.eviction_policy,
            KvEvictionPolicy::VolatileLru | KvEvictionPolicy::VolatileLfu
        );
        let candidates: Vec<(Vec<u8>, KeyAccess)> = if volatile {
            self.ttl
                .keys()
                .into_iter()
                .map(|k| {
                    let access = self.access.get(&k).unwrap_or_default();
                    (k, access)
                })
                .collect()
        } else {
            self.access.entries()
        };
        if candidates.is_empty() {
            return None;
        }

        let mut rng = rand::thread_rng();
        let sample: Vec<&(Vec<u8>, KeyAccess)> = candidates
            .choose_multiple(&mut rng, EVICTION_SAMPLE)
            .collect();

        let victim = match self.config.eviction_policy {
            KvEvictionPolicy::Random => sample.first().copied(),
            KvEvictionPolicy::Lru | KvEvictionPolicy::VolatileLru => sample
                .iter()
                .min_by_key(|(_, a)| a.last_access_us)
                .copied(),
            KvEvictionPolicy::Lfu | KvEvictionPolicy::VolatileLfu => sample
                .iter()
                .min_by_key(|(_, a)| a.access_count)
                .copied(),
            KvEvictionPolicy::Arc => unreachable!("handled above"),
        };
        victim.map(|(k, _)| k.clone())
    }

    fn durability_barrier(&self) -> ShoalResult<()> {
        match self.config.fsync_policy {
            FsyncPolicy::Always => self.flush_now(),
            FsyncPolicy::EverySecond | FsyncPolicy::Never => Ok(()),
        }
    }
}

fn entry_mem(key_len: usize, value_len: usize) -> usize {
    key_len + value_len + ENTRY_OVERHEAD
}

fn key_bytes(key: &IndexKey) -> ShoalResult<Vec<u8>> {
    match key.components().first() {
        Some(crate::btree::key::KeyComponent::Bytes(b)) => Ok(b.clone()),
        _ => Err(ShoalError::InvalidKey(
            "store keys are single byte-string components".to_string(),
        )),
    }
}

/// LWW comparison between two optional values at given timestamps.
/// Timestamps first; on an exact tie a value beats a tombstone, two values
/// fall back to byte-lex.
fn beats(
    a_ts: HlcTimestamp,
    a_value: Option<&[u8]>,
    b_ts: HlcTimestamp,
    b_value: Option<&[u8]>,
) -> bool {
    if a_ts != b_ts {
        return a_ts > b_ts;
    }
    match (a_value, b_value) {
        (Some(a), Some(b)) => a > b,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => false,
    }
}
