use std::time::Duration;

/// When `sync` barriers are issued for writes going through the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Every write is followed by a durability barrier.
    Always,
    /// A background flusher batches barriers once per second.
    EverySecond,
    /// No barriers; durability is left to the operating system.
    Never,
}

/// Which keys the store evicts once `max_memory_bytes` is exceeded.
///
/// The `Volatile*` variants only consider keys that carry a TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEvictionPolicy {
    Lru,
    Lfu,
    Arc,
    Random,
    VolatileLru,
    VolatileLfu,
}

/// Weights of the hybrid buffer-pool eviction score:
///
/// score(f) = w_frequency * access_count(f) - w_recency * seconds_since_access(f)
///
/// The frame with the minimum score is evicted: rarely touched and long
/// untouched ranks lowest. When every frame was accessed once, the
/// least-recently-used frame loses. Note the two terms have incompatible
/// units (a count and seconds); the combination is kept as-is and the
/// weights are exposed here so deployments can rescale them.
#[derive(Debug, Clone, Copy)]
pub struct EvictionWeights {
    pub w_frequency: f64,
    pub w_recency: f64,
}

impl Default for EvictionWeights {
    fn default() -> Self {
        Self {
            w_frequency: 0.7,
            w_recency: 0.3,
        }
    }
}

/// All knobs of the storage core, passed explicitly into constructors.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// One of 4096, 8192, 16384.
    pub page_size: usize,
    pub buffer_pool_frames: usize,
    pub eviction_weights: EvictionWeights,
    /// Max children per internal node / entries per leaf. At least 4.
    pub bptree_order: usize,
    pub fsync_policy: FsyncPolicy,
    pub ttl_check_interval_ms: u64,
    pub max_keys_per_ttl_check: usize,
    pub max_memory_bytes: usize,
    pub eviction_policy: KvEvictionPolicy,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            buffer_pool_frames: 1024,
            eviction_weights: EvictionWeights::default(),
            bptree_order: 128,
            fsync_policy: FsyncPolicy::EverySecond,
            ttl_check_interval_ms: 100,
            max_keys_per_ttl_check: 20,
            max_memory_bytes: 64 * 1024 * 1024,
            eviction_policy: KvEvictionPolicy::Lru,
        }
    }
}

impl DbConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self.page_size {
            4096 | 8192 | 16384 => {}
            other => return Err(format!("unsupported page size: {}", other)),
        }
        if self.buffer_pool_frames == 0 {
            return Err("buffer_pool_frames must be positive".to_string());
        }
        if self.bptree_order < 4 {
            return Err(format!("bptree_order must be >= 4, got {}", self.bptree_order));
        }
        Ok(())
    }

    pub fn ttl_check_interval(&self) -> Duration {
        Duration::from_millis(self.ttl_check_interval_ms)
    }
}
