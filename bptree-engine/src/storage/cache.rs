//! LRU cache of raw block buffers, keyed by file offset
//!
//! Cuts repeated descent reads without giving up coherence: every write goes
//! through the file first and then updates the cached bytes at that offset.
//! Header-only writes (32-byte pointer fixups) patch the prefix of a cached
//! full block instead of replacing it, and a read shorter than the cached
//! buffer is served from its prefix.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Default cache capacity in blocks
const DEFAULT_CAPACITY: usize = 256;

/// Cache statistics
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Block cache shared by all reads and writes of one tree file
pub struct BlockCache {
    inner: Mutex<LruCache<u64, Vec<u8>>>,
    stats: Mutex<CacheStats>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(16);
        BlockCache {
            inner: Mutex::new(LruCache::new(NonZeroUsize::new(capacity).unwrap())),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Look up `len` bytes at `offset`. A cached buffer at least `len` long
    /// serves the read from its prefix; a shorter one counts as a miss and
    /// will be replaced by the caller's full read.
    pub fn get(&self, offset: u64, len: usize) -> Option<Vec<u8>> {
        let mut cache = self.inner.lock();
        match cache.get(&offset) {
            Some(buf) if buf.len() >= len => {
                self.stats.lock().hits += 1;
                Some(buf[..len].to_vec())
            }
            _ => {
                self.stats.lock().misses += 1;
                None
            }
        }
    }

    /// Install the bytes at `offset`. If a longer buffer is already cached
    /// the new bytes patch its prefix, keeping full blocks intact across
    /// header-only writes.
    pub fn put(&self, offset: u64, data: &[u8]) {
        let mut cache = self.inner.lock();
        if let Some(existing) = cache.get_mut(&offset) {
            if existing.len() > data.len() {
                existing[..data.len()].copy_from_slice(data);
                return;
            }
        }
        if cache.len() == cache.cap().get() && !cache.contains(&offset) {
            self.stats.lock().evictions += 1;
        }
        cache.put(offset, data.to_vec());
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
