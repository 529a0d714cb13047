use std::collections::VecDeque;

use bytes::Bytes;
use log::debug;

use crate::{
    btree::{key::IndexKey, node::LeafNode, tree::BTreeIndex},
    storage::page::PageId,
    types::ShoalResult,
    utils::{CancelToken, Latched},
};

/// Where an ascending scan stops.
#[derive(Debug, Clone)]
pub enum UpperBound {
    Unbounded,
    Key { key: IndexKey, inclusive: bool },
    /// Stop at the first key that no longer extends the prefix.
    Prefix(IndexKey),
}

impl UpperBound {
    fn is_beyond(&self, key: &IndexKey) -> bool {
        match self {
            UpperBound::Unbounded => false,
            UpperBound::Key { key: end, inclusive } => {
                if *inclusive {
                    key > end
                } else {
                    key >= end
                }
            }
            UpperBound::Prefix(prefix) => !key.starts_with(prefix),
        }
    }
}

/// Lazy ascending range scan over the leaf chain.
///
/// The cursor holds no page latch between `next` calls; each leaf is read
/// in one go and its qualifying entries buffered. Scanning stops the moment
/// the first key beyond the upper bound is seen, without touching further
/// leaves. `restart` re-seeks after the last emitted key, which makes the
/// sequence resumable after interference or cancellation.
pub struct RangeCursor<'a> {
    tree: &'a BTreeIndex,
    lower: Option<(IndexKey, bool)>,
    upper: UpperBound,
    cancel: CancelToken,

    pending: VecDeque<(IndexKey, Bytes)>,
    next_leaf: Option<PageId>,
    last_emitted: Option<IndexKey>,
    started: bool,
    done: bool,
}

impl<'a> RangeCursor<'a> {
    pub(crate) fn new(
        tree: &'a BTreeIndex,
        lower: Option<(IndexKey, bool)>,
        upper: UpperBound,
    ) -> Self {
        // an inverted range yields nothing
        let done = match (&lower, &upper) {
            (Some((start, _)), UpperBound::Key { key: end, .. }) => start > end,
            _ => false,
        };
        Self {
            tree,
            lower,
            upper,
            cancel: CancelToken::new(),
            pending: VecDeque::new(),
            next_leaf: None,
            last_emitted: None,
            started: false,
            done,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Re-seek after the last emitted pair. Entries already returned are
    /// not repeated.
    pub fn restart(&mut self) {
        if let Some(last) = self.last_emitted.take() {
            self.lower = Some((last, false));
        }
        self.pending.clear();
        self.next_leaf = None;
        self.started = false;
        self.done = false;
        debug!("cursor restarted at {:?}", self.lower);
    }

    fn passes_lower(&self, key: &IndexKey) -> bool {
        match &self.lower {
            None => true,
            Some((start, inclusive)) => {
                if *inclusive {
                    key >= start
                } else {
                    key > start
                }
            }
        }
    }

    fn seek(&mut self) -> ShoalResult<()> {
        self.started = true;
        let leaf = match &self.lower {
            None => self.tree.leftmost_leaf()?,
            Some((start, _)) => self.tree.descend(start)?.0,
        };
        self.next_leaf = Some(leaf);
        Ok(())
    }

    /// Pull the next leaf's qualifying entries into the buffer. Returns
    /// false once the scan is exhausted.
    fn fill(&mut self) -> ShoalResult<bool> {
        loop {
            if self.done {
                return Ok(false);
            }
            self.cancel.check()?;

            let pid = match self.next_leaf.take() {
                Some(pid) => pid,
                None => {
                    self.done = true;
                    return Ok(false);
                }
            };

            // read the leaf under its latch, materialize values after
            let (entries, next) = {
                let guard = self.tree.pool().fetch(pid)?;
                let page = guard.page().latch_read();
                let node = LeafNode::decode(&page)?;
                let mut entries = Vec::new();
                let mut hit_upper = false;
                for (key, slots) in node.keys.iter().zip(node.values.iter()) {
                    if !self.passes_lower(key) {
                        continue;
                    }
                    if self.upper.is_beyond(key) {
                        hit_upper = true;
                        break;
                    }
                    entries.push((key.clone(), slots.clone()));
                }
                let next = if hit_upper { None } else { node.next_leaf };
                (entries, next)
            };

            if next.is_none() {
                // either the chain ended or the bound was hit: both stop
                // the scan without touching another leaf
                self.done = self.pending.is_empty() && entries.is_empty();
                self.next_leaf = None;
            } else {
                self.next_leaf = next;
            }

            if entries.is_empty() {
                if self.next_leaf.is_none() {
                    self.done = true;
                    return Ok(false);
                }
                continue;
            }

            for (key, slots) in entries {
                for slot in &slots {
                    let value = self.tree.read_value(slot)?;
                    self.pending.push_back((key.clone(), value));
                }
            }
            return Ok(true);
        }
    }
}

impl<'a> Iterator for RangeCursor<'a> {
    type Item = ShoalResult<(IndexKey, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done && self.pending.is_empty() {
            return None;
        }
        if !self.started {
            if let Err(e) = self.seek() {
                self.done = true;
                return Some(Err(e));
            }
        }
        while self.pending.is_empty() {
            match self.fill() {
                Ok(true) => break,
                Ok(false) => return None,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        let (key, value) = self.pending.pop_front()?;
        self.last_emitted = Some(key.clone());
        Some(Ok((key, value)))
    }
}

impl BTreeIndex {
    /// Ascending scan of `[start, end]` with per-bound inclusion flags.
    /// `None` bounds are open ends.
    pub fn range(
        &self,
        start: Option<&IndexKey>,
        start_inclusive: bool,
        end: Option<&IndexKey>,
        end_inclusive: bool,
    ) -> ShoalResult<RangeCursor<'_>> {
        if let Some(start) = start {
            self.schema().check_prefix(start)?;
        }
        if let Some(end) = end {
            self.schema().check_prefix(end)?;
        }
        let lower = start.map(|k| (k.clone(), start_inclusive));
        let upper = match end {
            None => UpperBound::Unbounded,
            Some(end) => UpperBound::Key {
                key: end.clone(),
                inclusive: end_inclusive,
            },
        };
        Ok(RangeCursor::new(self, lower, upper))
    }

    /// All entries whose leading key components equal `prefix`, in order.
    pub fn prefix(&self, prefix: &IndexKey) -> ShoalResult<RangeCursor<'_>> {
        self.schema().check_prefix(prefix)?;
        Ok(RangeCursor::new(
            self,
            Some((prefix.clone(), true)),
            UpperBound::Prefix(prefix.clone()),
        ))
    }

    /// Full ascending scan.
    pub fn scan_all(&self) -> ShoalResult<RangeCursor<'_>> {
        Ok(RangeCursor::new(self, None, UpperBound::Unbounded))
    }
}
