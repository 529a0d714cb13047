use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    thread,
    time::Duration,
};

use bit_vec::BitVec;
use log::{debug, error};

use crate::{
    config::EvictionWeights,
    error::ShoalError,
    hlc::wall_clock_micros,
    storage::{
        page::{Page, PageId, PageKind},
        page_file::PageFile,
    },
    types::{Pod, ShoalResult},
    utils::Latched,
};

/// How long a fetch waits for a pin to be released before giving up with
/// `OutOfMemory`.
const PIN_WAIT_ROUNDS: usize = 50;
const PIN_WAIT_STEP: Duration = Duration::from_millis(1);

/// One resident page slot. The page content sits behind its own
/// reader-writer latch; the bookkeeping fields are atomics so the eviction
/// scan never takes the content latch.
#[derive(Debug)]
pub struct Frame {
    page: Pod<Page>,
    pin_count: AtomicUsize,
    dirty: AtomicBool,
    last_access_us: AtomicU64,
    access_count: AtomicU64,
}

impl Frame {
    fn new(page_size: usize) -> Self {
        Self {
            page: Arc::new(RwLock::new(Page::new_empty(
                crate::storage::page::NO_PAGE,
                page_size,
                PageKind::Free,
            ))),
            pin_count: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
            last_access_us: AtomicU64::new(0),
            access_count: AtomicU64::new(0),
        }
    }

    pub fn page(&self) -> &Pod<Page> {
        &self.page
    }

    pub fn pin_count(&self) -> usize {
        self.pin_count.load(Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::SeqCst);
    }

    fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "unpin without pin");
    }

    fn record_access(&self) {
        self.access_count.fetch_add(1, Ordering::SeqCst);
        self.last_access_us
            .store(wall_clock_micros(), Ordering::SeqCst);
    }

    fn reset_stats(&self) {
        self.access_count.store(0, Ordering::SeqCst);
        self.dirty.store(false, Ordering::SeqCst);
    }
}

/// RAII pin. Holding one keeps the frame resident; drop unpins.
#[derive(Debug)]
pub struct PageGuard {
    frame: Arc<Frame>,
}

impl PageGuard {
    fn new(frame: Arc<Frame>) -> Self {
        Self { frame }
    }

    /// The pinned page, behind its content latch. Readers take
    /// `latch_read()`, the pinning writer takes `latch_write()`.
    pub fn page(&self) -> &Pod<Page> {
        &self.frame.page
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.frame.unpin();
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BufferPoolStats {
    pub fetches: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub flushes: u64,
}

/// Bounded page cache between the B+ trees and the page file.
///
/// Eviction uses the hybrid frequency/recency score from the config:
/// the unpinned frame with the minimum
/// `w_f * access_count + w_t * seconds_since_access` is replaced.
pub struct BufferPool {
    page_file: Arc<PageFile>,
    frames: Vec<Arc<Frame>>,
    page_table: RwLock<HashMap<PageId, usize>>,
    /// true = frame is unmapped and reusable
    free_frames: Mutex<BitVec>,
    dirty_set: Mutex<HashSet<PageId>>,
    weights: EvictionWeights,

    fetches: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    flushes: AtomicU64,
}

impl BufferPool {
    pub fn new(page_file: Arc<PageFile>, frame_count: usize, weights: EvictionWeights) -> Self {
        assert!(frame_count > 0, "buffer pool needs at least one frame");
        let page_size = page_file.page_size();
        let frames = (0..frame_count)
            .map(|_| Arc::new(Frame::new(page_size)))
            .collect();
        Self {
            page_file,
            frames,
            page_table: RwLock::new(HashMap::new()),
            free_frames: Mutex::new(BitVec::from_elem(frame_count, true)),
            dirty_set: Mutex::new(HashSet::new()),
            weights,
            fetches: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn page_file(&self) -> &Arc<PageFile> {
        &self.page_file
    }

    pub fn page_size(&self) -> usize {
        self.page_file.page_size()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn resident_count(&self) -> usize {
        self.page_table.latch_read().len()
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            fetches: self.fetches.load(Ordering::SeqCst),
            hits: self.hits.load(Ordering::SeqCst),
            misses: self.misses.load(Ordering::SeqCst),
            evictions: self.evictions.load(Ordering::SeqCst),
            flushes: self.flushes.load(Ordering::SeqCst),
        }
    }

    /// Immutable pinned access to a page, loading it on a miss.
    pub fn fetch(&self, pid: PageId) -> ShoalResult<PageGuard> {
        self.fetch_inner(pid, false)
    }

    /// Mutable pinned access. The frame is marked dirty up front so a dirty
    /// page can never be observed as clean between mutation and unpin.
    pub fn fetch_for_write(&self, pid: PageId) -> ShoalResult<PageGuard> {
        self.fetch_inner(pid, true)
    }

    fn fetch_inner(&self, pid: PageId, for_write: bool) -> ShoalResult<PageGuard> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        // fast path: already resident
        {
            let table = self.page_table.latch_read();
            if let Some(&idx) = table.get(&pid) {
                let frame = Arc::clone(&self.frames[idx]);
                frame.pin();
                frame.record_access();
                drop(table);
                self.hits.fetch_add(1, Ordering::SeqCst);
                if for_write {
                    self.mark_dirty(&frame, pid);
                }
                return Ok(PageGuard::new(frame));
            }
        }
        self.misses.fetch_add(1, Ordering::SeqCst);

        let mut rounds = 0;
        loop {
            {
                let mut table = self.page_table.latch_write();
                // somebody else may have loaded it while we waited
                if let Some(&idx) = table.get(&pid) {
                    let frame = Arc::clone(&self.frames[idx]);
                    frame.pin();
                    frame.record_access();
                    drop(table);
                    if for_write {
                        self.mark_dirty(&frame, pid);
                    }
                    return Ok(PageGuard::new(frame));
                }

                if let Some(idx) = self.grab_frame(&mut table)? {
                    let frame = Arc::clone(&self.frames[idx]);

                    // transient read failures get exactly one retry before
                    // the frame is handed back
                    let first = self.page_file.read_page(pid);
                    let read = match first {
                        Err(ShoalError::Io { .. }) => self.page_file.read_page(pid),
                        other => other,
                    };
                    let bytes = match read {
                        Ok(b) => b,
                        Err(e) => {
                            self.release_frame(idx);
                            return Err(e);
                        }
                    };
                    let page = match Page::from_bytes(pid, bytes) {
                        Ok(p) => p,
                        Err(e) => {
                            // quarantine: the frame stays unmapped and is
                            // not returned to the free list
                            error!("quarantined frame {} for page {}: {}", idx, pid, e);
                            return Err(e);
                        }
                    };

                    *frame.page.latch_write() = page;
                    frame.reset_stats();
                    frame.pin();
                    frame.record_access();
                    table.insert(pid, idx);
                    drop(table);

                    if for_write {
                        self.mark_dirty(&frame, pid);
                    }
                    return Ok(PageGuard::new(frame));
                }
            }

            // every frame is pinned: wait briefly for a pin release
            rounds += 1;
            if rounds > PIN_WAIT_ROUNDS {
                return Err(ShoalError::OutOfMemory);
            }
            thread::sleep(PIN_WAIT_STEP);
        }
    }

    /// Allocate a fresh page and return it pinned for write.
    pub fn new_page(&self, kind: PageKind) -> ShoalResult<(PageId, PageGuard)> {
        let pid = self.page_file.allocate_page()?;

        let mut rounds = 0;
        loop {
            {
                let mut table = self.page_table.latch_write();
                if let Some(idx) = self.grab_frame(&mut table)? {
                    let frame = Arc::clone(&self.frames[idx]);
                    *frame.page.latch_write() =
                        Page::new_empty(pid, self.page_file.page_size(), kind);
                    frame.reset_stats();
                    frame.pin();
                    frame.record_access();
                    table.insert(pid, idx);
                    drop(table);

                    self.mark_dirty(&frame, pid);
                    return Ok((pid, PageGuard::new(frame)));
                }
            }

            rounds += 1;
            if rounds > PIN_WAIT_ROUNDS {
                // hand the page id back so it is not leaked
                let _ = self.page_file.free_page(pid);
                return Err(ShoalError::OutOfMemory);
            }
            thread::sleep(PIN_WAIT_STEP);
        }
    }

    /// Write one dirty page back, leaving it resident.
    pub fn flush(&self, pid: PageId) -> ShoalResult<()> {
        let table = self.page_table.latch_read();
        let idx = match table.get(&pid) {
            Some(&idx) => idx,
            None => return Ok(()),
        };
        let frame = Arc::clone(&self.frames[idx]);
        drop(table);

        if !frame.is_dirty() {
            return Ok(());
        }
        {
            let page = frame.page.latch_read();
            self.page_file.write_page(pid, page.data())?;
        }
        frame.dirty.store(false, Ordering::SeqCst);
        self.dirty_set.lock().unwrap().remove(&pid);
        self.flushes.fetch_add(1, Ordering::SeqCst);
        debug!("flushed page {}", pid);
        Ok(())
    }

    /// Write back every dirty page. Pages stay resident and clean.
    pub fn flush_all(&self) -> ShoalResult<()> {
        let dirty: Vec<PageId> = self.dirty_set.lock().unwrap().iter().copied().collect();
        for pid in dirty {
            self.flush(pid)?;
        }
        Ok(())
    }

    /// Drop a page from the cache without write-back. Used for pages that
    /// were structurally freed; the caller must already own them.
    pub fn discard(&self, pid: PageId) {
        let mut table = self.page_table.latch_write();
        if let Some(idx) = table.remove(&pid) {
            let frame = &self.frames[idx];
            debug_assert_eq!(frame.pin_count(), 0, "discarding a pinned page");
            frame.reset_stats();
            self.dirty_set.lock().unwrap().remove(&pid);
            self.free_frames.lock().unwrap().set(idx, true);
        }
    }

    pub fn is_dirty(&self, pid: PageId) -> bool {
        self.dirty_set.lock().unwrap().contains(&pid)
    }

    fn mark_dirty(&self, frame: &Frame, pid: PageId) {
        frame.dirty.store(true, Ordering::SeqCst);
        self.dirty_set.lock().unwrap().insert(pid);
    }

    fn release_frame(&self, idx: usize) {
        self.free_frames.lock().unwrap().set(idx, true);
    }

    /// Find a reusable frame: a free one, else the unpinned resident frame
    /// with the minimum hybrid score (write-back first when dirty).
    /// Returns `None` when every frame is pinned.
    ///
    /// Runs under the page-table write lock, so no new pin can appear on
    /// the chosen victim while we evict it.
    fn grab_frame(&self, table: &mut HashMap<PageId, usize>) -> ShoalResult<Option<usize>> {
        {
            let mut free = self.free_frames.lock().unwrap();
            if let Some(idx) = free.iter().position(|b| b) {
                free.set(idx, false);
                return Ok(Some(idx));
            }
        }

        let now_us = wall_clock_micros();
        let mut victim: Option<(PageId, usize, f64)> = None;
        for (&pid, &idx) in table.iter() {
            let frame = &self.frames[idx];
            if frame.pin_count() > 0 {
                continue;
            }
            let count = frame.access_count.load(Ordering::SeqCst) as f64;
            let age_secs = now_us.saturating_sub(frame.last_access_us.load(Ordering::SeqCst))
                as f64
                / 1_000_000.0;
            // the age term enters negatively: rarely used AND long untouched
            // gives the minimum score
            let score = self.weights.w_frequency * count - self.weights.w_recency * age_secs;
            let better = match victim {
                Some((_, _, best)) => score < best,
                None => true,
            };
            if better {
                victim = Some((pid, idx, score));
            }
        }

        let (vpid, idx, score) = match victim {
            Some(v) => v,
            None => return Ok(None),
        };

        let frame = &self.frames[idx];
        if frame.is_dirty() {
            // a dirty page is never reused before its write-back completes
            let page = frame.page.latch_read();
            self.page_file.write_page(vpid, page.data())?;
            drop(page);
            frame.dirty.store(false, Ordering::SeqCst);
            self.dirty_set.lock().unwrap().remove(&vpid);
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }
        table.remove(&vpid);
        self.evictions.fetch_add(1, Ordering::SeqCst);
        debug!("evicted page {} (score {:.3})", vpid, score);
        Ok(Some(idx))
    }
}
