//! Block storage for Vault feeds.
//!
//! A feed's blocks and tree nodes live in index-addressed, write-once block
//! stores. Blocks may arrive out of order during replication, so every store
//! is sparse: `get` on an index never written reports `NotFound`, never
//! garbage.
//!
//! # Storage Backends
//!
//! All backends implement the [`BlockStore`] trait:
//!
//! - [`MemoryBlockStore`] -- `HashMap`-based store for tests and embedding
//! - [`FileBlockStore`] -- CRC-framed append-only record file with an offset
//!   index rebuilt on open
//! - [`CachedBlockStore`] -- bounded LRU in front of either; capacity 0
//!   disables the cache without changing results
//!
//! [`Storage`] is the root locator (memory or a directory) that hands out
//! named block stores and small header records per feed.
//!
//! # Design Rules
//!
//! 1. A block index is written at most once; rewriting identical bytes is a
//!    no-op, different bytes are a [`StoreError::Conflict`].
//! 2. Concurrent reads are always safe.
//! 3. All I/O errors are propagated, never silently ignored.

pub mod cache;
pub mod error;
pub mod file;
pub mod memory;
pub mod storage;
pub mod traits;

pub use cache::{CacheStats, CachedBlockStore};
pub use error::{StoreError, StoreResult};
pub use file::{FileBlockStore, SyncMode};
pub use memory::MemoryBlockStore;
pub use storage::Storage;
pub use traits::BlockStore;
