use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;

use crate::error::{StoreError, StoreResult};
use crate::traits::BlockStore;

/// In-memory, HashMap-based block store.
///
/// Intended for tests and embedding. Blocks are held behind a `RwLock` and
/// shared by reference count on read.
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<u64, Bytes>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
        }
    }

    /// Number of blocks currently stored.
    pub fn len(&self) -> usize {
        self.blocks.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().expect("lock poisoned").is_empty()
    }

    /// Total bytes across all stored blocks.
    pub fn total_bytes(&self) -> u64 {
        self.blocks
            .read()
            .expect("lock poisoned")
            .values()
            .map(|b| b.len() as u64)
            .sum()
    }
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemoryBlockStore {
    fn read(&self, index: u64) -> StoreResult<Option<Bytes>> {
        Ok(self.blocks.read().expect("lock poisoned").get(&index).cloned())
    }

    fn put(&self, index: u64, data: Bytes) -> StoreResult<()> {
        let mut map = self.blocks.write().expect("lock poisoned");
        match map.get(&index) {
            Some(existing) if *existing == data => Ok(()),
            Some(_) => Err(StoreError::Conflict { index }),
            None => {
                map.insert(index, data);
                Ok(())
            }
        }
    }

    fn has(&self, index: u64) -> StoreResult<bool> {
        Ok(self.blocks.read().expect("lock poisoned").contains_key(&index))
    }

    fn indices(&self) -> StoreResult<Vec<u64>> {
        let mut ids: Vec<u64> = self
            .blocks
            .read()
            .expect("lock poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

impl std::fmt::Debug for MemoryBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlockStore")
            .field("block_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_get() {
        let store = MemoryBlockStore::new();
        store.put(0, Bytes::from_static(b"hello")).unwrap();
        assert_eq!(store.get(0).unwrap(), Bytes::from_static(b"hello"));
        assert!(store.has(0).unwrap());
    }

    #[test]
    fn missing_block_is_not_found() {
        let store = MemoryBlockStore::new();
        assert!(store.read(3).unwrap().is_none());
        assert!(matches!(store.get(3), Err(StoreError::NotFound(3))));
    }

    #[test]
    fn sparse_out_of_order_writes() {
        let store = MemoryBlockStore::new();
        store.put(5, Bytes::from_static(b"five")).unwrap();
        store.put(1, Bytes::from_static(b"one")).unwrap();
        assert_eq!(store.indices().unwrap(), vec![1, 5]);
        assert!(!store.has(2).unwrap());
    }

    #[test]
    fn rewrite_same_bytes_is_noop() {
        let store = MemoryBlockStore::new();
        store.put(0, Bytes::from_static(b"x")).unwrap();
        store.put(0, Bytes::from_static(b"x")).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn rewrite_different_bytes_conflicts() {
        let store = MemoryBlockStore::new();
        store.put(0, Bytes::from_static(b"x")).unwrap();
        let err = store.put(0, Bytes::from_static(b"y")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { index: 0 }));
        assert_eq!(store.get(0).unwrap(), Bytes::from_static(b"x"));
    }

    #[test]
    fn total_bytes_and_debug() {
        let store = MemoryBlockStore::default();
        assert!(store.is_empty());
        store.put(0, Bytes::from_static(b"12345")).unwrap();
        store.put(1, Bytes::from_static(b"123")).unwrap();
        assert_eq!(store.total_bytes(), 8);
        assert!(format!("{store:?}").contains("block_count"));
    }

    #[test]
    fn concurrent_reads_are_safe() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(MemoryBlockStore::new());
        store.put(0, Bytes::from_static(b"shared")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    assert_eq!(store.get(0).unwrap(), Bytes::from_static(b"shared"));
                })
            })
            .collect();

        for h in handles {
            h.join().expect("thread should not panic");
        }
    }
}
