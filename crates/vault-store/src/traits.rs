use bytes::Bytes;

use crate::error::{StoreError, StoreResult};

/// Index-addressed, write-once block storage.
///
/// All implementations must satisfy these invariants:
/// - A block is immutable once written.
/// - Writes may arrive in any index order; unwritten indices read as absent.
/// - Concurrent reads are always safe.
/// - All I/O errors are propagated, never silently ignored.
pub trait BlockStore: Send + Sync {
    /// Read a block.
    ///
    /// Returns `Ok(None)` if the block was never written.
    fn read(&self, index: u64) -> StoreResult<Option<Bytes>>;

    /// Write a block.
    ///
    /// Writing the same bytes twice is a no-op; different bytes at an
    /// occupied index fail with [`StoreError::Conflict`].
    fn put(&self, index: u64, data: Bytes) -> StoreResult<()>;

    /// Check whether a block is present.
    fn has(&self, index: u64) -> StoreResult<bool>;

    /// Every present index, ascending.
    fn indices(&self) -> StoreResult<Vec<u64>>;

    /// Make previous writes durable.
    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Read a block that must exist.
    fn get(&self, index: u64) -> StoreResult<Bytes> {
        self.read(index)?.ok_or(StoreError::NotFound(index))
    }
}
