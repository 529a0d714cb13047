use std::collections::{HashMap, VecDeque};

/// Which ARC list a key currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    T1,
    T2,
    B1,
    B2,
}

/// Adaptive Replacement state over keys, used to pick eviction victims when
/// the store runs with the `arc` policy.
///
/// T1 holds keys seen once recently, T2 keys seen at least twice; B1/B2 are
/// the ghost lists remembering recent evictions from each side. Ghost hits
/// steer the target split `p` between recency and frequency.
pub struct ArcState {
    capacity: usize,
    /// Target size of T1.
    p: usize,
    t1: VecDeque<Vec<u8>>,
    t2: VecDeque<Vec<u8>>,
    b1: VecDeque<Vec<u8>>,
    b2: VecDeque<Vec<u8>>,
    directory: HashMap<Vec<u8>, ListKind>,
}

impl ArcState {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            p: capacity / 2,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            directory: HashMap::new(),
        }
    }

    pub fn tracked(&self) -> usize {
        self.t1.len() + self.t2.len()
    }

    /// Record an access (read or write) to `key`.
    pub fn on_access(&mut self, key: &[u8]) {
        match self.directory.get(key).copied() {
            Some(ListKind::T1) => {
                self.detach(key, ListKind::T1);
                self.attach(key.to_vec(), ListKind::T2);
            }
            Some(ListKind::T2) => {
                self.detach(key, ListKind::T2);
                self.attach(key.to_vec(), ListKind::T2);
            }
            Some(ListKind::B1) => {
                // recency ghost hit: grow T1's share
                let delta = (self.b2.len() / self.b1.len().max(1)).max(1);
                self.p = (self.p + delta).min(self.capacity);
                self.detach(key, ListKind::B1);
                self.attach(key.to_vec(), ListKind::T2);
            }
            Some(ListKind::B2) => {
                // frequency ghost hit: shrink T1's share
                let delta = (self.b1.len() / self.b2.len().max(1)).max(1);
                self.p = self.p.saturating_sub(delta);
                self.detach(key, ListKind::B2);
                self.attach(key.to_vec(), ListKind::T2);
            }
            None => {
                self.attach(key.to_vec(), ListKind::T1);
            }
        }
        self.trim_ghosts();
    }

    /// Pick an eviction victim and demote it to the matching ghost list.
    pub fn victim(&mut self) -> Option<Vec<u8>> {
        let from_t1 = !self.t1.is_empty()
            && (self.t1.len() > self.p.max(1) || self.t2.is_empty());
        let (key, ghost) = if from_t1 {
            (self.t1.pop_front()?, ListKind::B1)
        } else {
            (self.t2.pop_front()?, ListKind::B2)
        };
        self.directory.remove(&key);
        self.attach(key.clone(), ghost);
        self.trim_ghosts();
        Some(key)
    }

    /// Forget a key entirely (deleted or evicted by other means).
    pub fn remove(&mut self, key: &[u8]) {
        if let Some(kind) = self.directory.get(key).copied() {
            self.detach(key, kind);
        }
    }

    fn attach(&mut self, key: Vec<u8>, kind: ListKind) {
        self.directory.insert(key.clone(), kind);
        self.list_mut(kind).push_back(key);
    }

    fn detach(&mut self, key: &[u8], kind: ListKind) {
        self.list_mut(kind).retain(|k| k != key);
        self.directory.remove(key);
    }

    fn list_mut(&mut self, kind: ListKind) -> &mut VecDeque<Vec<u8>> {
        match kind {
            ListKind::T1 => &mut self.t1,
            ListKind::T2 => &mut self.t2,
            ListKind::B1 => &mut self.b1,
            ListKind::B2 => &mut self.b2,
        }
    }

    fn trim_ghosts(&mut self) {
        while self.b1.len() > self.capacity {
            if let Some(key) = self.b1.pop_front() {
                self.directory.remove(&key);
            }
        }
        while self.b2.len() > self.capacity {
            if let Some(key) = self.b2.pop_front() {
                self.directory.remove(&key);
            }
        }
    }
}
