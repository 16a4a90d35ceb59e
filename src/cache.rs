//! Bounded cache of decoded chunks
//!
//! Capacity is limited both by slot count and by total bytes. Eviction
//! removes the oldest inserted entry first and always happens before an
//! insertion, so the limits hold as soon as an insert completes. A chunk
//! larger than the whole byte budget is handed back without being cached.

use crate::error::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

/// Default number of cache slots
pub const DEFAULT_SLOT_COUNT: usize = 521;

/// Default byte budget (1 MiB)
pub const DEFAULT_BYTE_BUDGET: u64 = 1024 * 1024;

/// Identity of a cached chunk: owning dataset plus scaled chunk coordinate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub dataset: u64,
    pub chunk: Vec<u64>,
}

impl ChunkKey {
    pub fn new(dataset: u64, chunk: Vec<u64>) -> Self {
        Self { dataset, chunk }
    }
}

impl From<Vec<u64>> for ChunkKey {
    fn from(chunk: Vec<u64>) -> Self {
        Self { dataset: 0, chunk }
    }
}

/// A cached chunk
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub bytes: Bytes,
    /// Monotonic insertion sequence, the eviction order
    pub inserted: u64,
    /// Last time the entry was served; informational only
    pub last_access: DateTime<Utc>,
}

/// Cache capacity settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCacheConfig {
    pub slot_count: usize,
    pub byte_budget: u64,
}

impl ChunkCacheConfig {
    pub fn new(slot_count: usize, byte_budget: u64) -> Self {
        Self {
            slot_count,
            byte_budget,
        }
    }

    /// Factory producing empty caches with these limits
    pub fn factory(self) -> ChunkCacheFactory {
        Arc::new(move || ChunkCache::new(self.slot_count, self.byte_budget))
    }
}

impl Default for ChunkCacheConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SLOT_COUNT, DEFAULT_BYTE_BUDGET)
    }
}

/// Creates the cache for a newly opened file handle
pub type ChunkCacheFactory = Arc<dyn Fn() -> ChunkCache + Send + Sync>;

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub pass_through: u64,
}

/// FIFO chunk cache
#[derive(Debug)]
pub struct ChunkCache {
    slot_count: usize,
    byte_budget: u64,
    consumed_bytes: u64,
    entries: HashMap<ChunkKey, CacheEntry>,
    order: VecDeque<ChunkKey>,
    next_insertion: u64,
    stats: CacheStats,
}

impl ChunkCache {
    pub fn new(slot_count: usize, byte_budget: u64) -> Self {
        Self {
            slot_count,
            byte_budget,
            consumed_bytes: 0,
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_insertion: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn byte_budget(&self) -> u64 {
        self.byte_budget
    }

    pub fn consumed_slots(&self) -> usize {
        self.entries.len()
    }

    pub fn consumed_bytes(&self) -> u64 {
        self.consumed_bytes
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entry(&self, key: &ChunkKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Return the chunk, invoking `loader` only on a miss
    pub fn get_chunk<F>(&mut self, key: impl Into<ChunkKey>, loader: F) -> Result<Bytes>
    where
        F: FnOnce() -> Result<Bytes>,
    {
        let key = key.into();

        if let Some(bytes) = self.get(&key) {
            return Ok(bytes);
        }

        let bytes = loader()?;
        self.insert(key, bytes.clone());
        Ok(bytes)
    }

    /// Look up a chunk, refreshing its access time on a hit
    pub fn get(&mut self, key: &ChunkKey) -> Option<Bytes> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = Utc::now();
                self.stats.hits += 1;
                trace!(chunk = ?key.chunk, dataset = key.dataset, "chunk cache hit");
                Some(entry.bytes.clone())
            }
            None => {
                self.stats.misses += 1;
                trace!(chunk = ?key.chunk, dataset = key.dataset, "chunk cache miss");
                None
            }
        }
    }

    /// Insert a freshly loaded chunk; returns whether it was cached
    pub fn insert(&mut self, key: ChunkKey, bytes: Bytes) -> bool {
        let len = bytes.len() as u64;

        if len > self.byte_budget || self.slot_count == 0 {
            self.stats.pass_through += 1;
            trace!(chunk = ?key.chunk, bytes = len, "chunk bypasses cache");
            return false;
        }

        // a concurrent reader may have loaded the same chunk
        self.remove(&key);

        while !self.order.is_empty()
            && (self.entries.len() >= self.slot_count || self.consumed_bytes + len > self.byte_budget)
        {
            self.evict_oldest();
        }

        self.consumed_bytes += len;
        self.order.push_back(key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                bytes,
                inserted: self.next_insertion,
                last_access: Utc::now(),
            },
        );
        self.next_insertion += 1;

        true
    }

    fn evict_oldest(&mut self) {
        if let Some(key) = self.order.pop_front() {
            if let Some(entry) = self.entries.remove(&key) {
                self.consumed_bytes -= entry.bytes.len() as u64;
                self.stats.evictions += 1;
                debug!(
                    chunk = ?key.chunk,
                    dataset = key.dataset,
                    bytes = entry.bytes.len(),
                    "evicted chunk"
                );
            }
        }
    }

    fn remove(&mut self, key: &ChunkKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.consumed_bytes -= entry.bytes.len() as u64;
            self.order.retain(|k| k != key);
        }
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.consumed_bytes = 0;
    }
}

impl Default for ChunkCache {
    fn default() -> Self {
        Self::new(DEFAULT_SLOT_COUNT, DEFAULT_BYTE_BUDGET)
    }
}
