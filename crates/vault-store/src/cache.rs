use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use lru::LruCache;

use crate::error::StoreResult;
use crate::traits::BlockStore;

/// Hit/miss counters for a [`CachedBlockStore`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Read-through LRU cache in front of another block store.
///
/// A capacity of zero disables caching entirely; results are identical
/// either way, only the hit counters differ.
pub struct CachedBlockStore {
    inner: Arc<dyn BlockStore>,
    cache: Option<Mutex<LruCache<u64, Bytes>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedBlockStore {
    pub fn new(inner: Arc<dyn BlockStore>, capacity: usize) -> Self {
        Self {
            inner,
            cache: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Whether reads are served from a cache at all.
    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl BlockStore for CachedBlockStore {
    fn read(&self, index: u64) -> StoreResult<Option<Bytes>> {
        let Some(cache) = &self.cache else {
            return self.inner.read(index);
        };

        if let Some(hit) = cache.lock().expect("lock poisoned").get(&index).cloned() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(hit));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let data = self.inner.read(index)?;
        if let Some(data) = &data {
            cache.lock().expect("lock poisoned").put(index, data.clone());
        }
        Ok(data)
    }

    fn put(&self, index: u64, data: Bytes) -> StoreResult<()> {
        self.inner.put(index, data.clone())?;
        if let Some(cache) = &self.cache {
            cache.lock().expect("lock poisoned").put(index, data);
        }
        Ok(())
    }

    fn has(&self, index: u64) -> StoreResult<bool> {
        if let Some(cache) = &self.cache {
            if cache.lock().expect("lock poisoned").contains(&index) {
                return Ok(true);
            }
        }
        self.inner.has(index)
    }

    fn indices(&self) -> StoreResult<Vec<u64>> {
        self.inner.indices()
    }

    fn flush(&self) -> StoreResult<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlockStore;

    fn backing() -> Arc<dyn BlockStore> {
        let store = MemoryBlockStore::new();
        store.put(0, Bytes::from_static(b"zero")).unwrap();
        store.put(1, Bytes::from_static(b"one")).unwrap();
        Arc::new(store)
    }

    #[test]
    fn repeated_reads_hit_cache() {
        let cached = CachedBlockStore::new(backing(), 4);
        assert_eq!(cached.get(0).unwrap(), Bytes::from_static(b"zero"));
        assert_eq!(cached.get(0).unwrap(), Bytes::from_static(b"zero"));
        assert_eq!(cached.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[test]
    fn zero_capacity_disables_cache() {
        let cached = CachedBlockStore::new(backing(), 0);
        assert!(!cached.is_enabled());
        assert_eq!(cached.get(1).unwrap(), Bytes::from_static(b"one"));
        assert_eq!(cached.get(1).unwrap(), Bytes::from_static(b"one"));
        assert_eq!(cached.stats(), CacheStats::default());
    }

    #[test]
    fn eviction_keeps_results_identical() {
        let cached = CachedBlockStore::new(backing(), 1);
        for _ in 0..3 {
            assert_eq!(cached.get(0).unwrap(), Bytes::from_static(b"zero"));
            assert_eq!(cached.get(1).unwrap(), Bytes::from_static(b"one"));
        }
        assert_eq!(cached.stats().hits, 0);
    }

    #[test]
    fn writes_pass_through() {
        let inner = backing();
        let cached = CachedBlockStore::new(Arc::clone(&inner), 2);
        cached.put(2, Bytes::from_static(b"two")).unwrap();
        assert!(inner.has(2).unwrap());
        assert_eq!(cached.indices().unwrap(), vec![0, 1, 2]);
        assert!(cached.read(9).unwrap().is_none());
    }
}
