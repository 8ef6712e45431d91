use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::file::{FileBlockStore, SyncMode};
use crate::memory::MemoryBlockStore;
use crate::traits::BlockStore;

#[derive(Default)]
struct MemoryBackend {
    stores: Mutex<HashMap<String, Arc<MemoryBlockStore>>>,
    headers: Mutex<HashMap<String, Vec<u8>>>,
}

#[derive(Clone)]
enum Backend {
    Memory(Arc<MemoryBackend>),
    Directory { root: PathBuf, sync_mode: SyncMode },
}

/// Root storage locator for a drive.
///
/// Each feed gets a namespace (`metadata`, `content`) holding named block
/// stores (`data`, `tree`) and small header records (`key`, `secret_key`,
/// `root`, `link`). In directory mode these map to
/// `<root>/<feed>/<name>`; in memory mode they live for as long as any clone
/// of the `Storage` does, so reopening from the same value sees prior writes.
#[derive(Clone)]
pub struct Storage {
    backend: Backend,
}

impl Storage {
    /// Ephemeral in-process storage.
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(MemoryBackend::default())),
        }
    }

    /// Directory-backed storage rooted at `root`.
    ///
    /// The directory is created if missing. Fails with
    /// [`StoreError::Unavailable`] when it cannot be created or written.
    pub fn directory(root: impl AsRef<Path>) -> StoreResult<Self> {
        Self::directory_with(root, SyncMode::default())
    }

    pub fn directory_with(root: impl AsRef<Path>, sync_mode: SyncMode) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        let unavailable = |source: io::Error| StoreError::Unavailable {
            path: root.clone(),
            source,
        };
        fs::create_dir_all(&root).map_err(unavailable)?;
        // Probe writability up front so a read-only location fails at open.
        tempfile::NamedTempFile::new_in(&root).map_err(unavailable)?;

        debug!(root = %root.display(), "opened directory storage");
        Ok(Self {
            backend: Backend::Directory { root, sync_mode },
        })
    }

    pub fn is_memory(&self) -> bool {
        matches!(self.backend, Backend::Memory(_))
    }

    /// Directory root, if directory-backed.
    pub fn root(&self) -> Option<&Path> {
        match &self.backend {
            Backend::Memory(_) => None,
            Backend::Directory { root, .. } => Some(root),
        }
    }

    /// Open the block store `name` belonging to `feed`.
    pub fn open_blocks(&self, feed: &str, name: &str) -> StoreResult<Arc<dyn BlockStore>> {
        match &self.backend {
            Backend::Memory(mem) => {
                let mut stores = mem.stores.lock().expect("lock poisoned");
                let store = stores
                    .entry(format!("{feed}/{name}"))
                    .or_insert_with(|| Arc::new(MemoryBlockStore::new()));
                Ok(Arc::clone(store) as Arc<dyn BlockStore>)
            }
            Backend::Directory { root, sync_mode } => {
                let path = root.join(feed).join(name);
                Ok(Arc::new(FileBlockStore::open(&path, *sync_mode)?))
            }
        }
    }

    /// Read a header record; `Ok(None)` if it was never written.
    pub fn read_header(&self, feed: &str, name: &str) -> StoreResult<Option<Vec<u8>>> {
        match &self.backend {
            Backend::Memory(mem) => Ok(mem
                .headers
                .lock()
                .expect("lock poisoned")
                .get(&format!("{feed}/{name}"))
                .cloned()),
            Backend::Directory { root, .. } => match fs::read(root.join(feed).join(name)) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Replace a header record atomically.
    pub fn write_header(&self, feed: &str, name: &str, bytes: &[u8]) -> StoreResult<()> {
        match &self.backend {
            Backend::Memory(mem) => {
                mem.headers
                    .lock()
                    .expect("lock poisoned")
                    .insert(format!("{feed}/{name}"), bytes.to_vec());
                Ok(())
            }
            Backend::Directory { root, .. } => {
                let dir = root.join(feed);
                fs::create_dir_all(&dir).map_err(|source| StoreError::Unavailable {
                    path: dir.clone(),
                    source,
                })?;
                let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
                tmp.write_all(bytes)?;
                tmp.as_file().sync_all()?;
                tmp.persist(dir.join(name)).map_err(|e| StoreError::Io(e.error))?;
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.backend {
            Backend::Memory(_) => f.write_str("Storage(memory)"),
            Backend::Directory { root, .. } => write!(f, "Storage({})", root.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    #[test]
    fn memory_storage_shares_stores_across_opens() {
        let storage = Storage::memory();
        let a = storage.open_blocks("metadata", "data").unwrap();
        a.put(0, Bytes::from_static(b"x")).unwrap();

        let b = storage.clone().open_blocks("metadata", "data").unwrap();
        assert!(b.has(0).unwrap());

        let other = storage.open_blocks("content", "data").unwrap();
        assert!(!other.has(0).unwrap());
    }

    #[test]
    fn headers_roundtrip_in_memory() {
        let storage = Storage::memory();
        assert!(storage.read_header("metadata", "key").unwrap().is_none());
        storage.write_header("metadata", "key", b"abc").unwrap();
        assert_eq!(
            storage.read_header("metadata", "key").unwrap(),
            Some(b"abc".to_vec())
        );
    }

    #[test]
    fn directory_storage_persists() {
        let dir = TempDir::new().unwrap();
        {
            let storage = Storage::directory(dir.path()).unwrap();
            let blocks = storage.open_blocks("content", "data").unwrap();
            blocks.put(3, Bytes::from_static(b"three")).unwrap();
            storage.write_header("content", "key", b"k1").unwrap();
            storage.write_header("content", "key", b"k2").unwrap();
        }

        let storage = Storage::directory(dir.path()).unwrap();
        assert_eq!(storage.root(), Some(dir.path()));
        let blocks = storage.open_blocks("content", "data").unwrap();
        assert_eq!(blocks.get(3).unwrap(), Bytes::from_static(b"three"));
        assert_eq!(
            storage.read_header("content", "key").unwrap(),
            Some(b"k2".to_vec())
        );
        assert!(dir.path().join("content").join("data").exists());
    }

    #[test]
    fn directory_under_a_file_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("plain-file");
        fs::write(&blocker, b"").unwrap();

        let err = Storage::directory(blocker.join("drive")).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }));
    }

    #[test]
    fn debug_names_backend() {
        assert_eq!(format!("{:?}", Storage::memory()), "Storage(memory)");
        assert!(Storage::memory().is_memory());
    }
}
