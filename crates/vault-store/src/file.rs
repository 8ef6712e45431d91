use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::traits::BlockStore;

/// Record header: 8 bytes index + 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 16;

/// Largest payload a single record may carry.
pub const MAX_RECORD_SIZE: usize = u32::MAX as usize;

/// Flush/sync strategy for a block file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// `fsync` after every write (safest, highest latency).
    EveryWrite,
    /// Rely on OS page-cache buffering until [`BlockStore::flush`].
    #[default]
    OsDefault,
}

/// Location of one record's payload inside the file.
#[derive(Clone, Copy, Debug)]
struct Slot {
    offset: u64,
    len: u32,
}

struct FileState {
    file: File,
    /// End of the last valid record.
    end: u64,
    slots: HashMap<u64, Slot>,
}

/// Append-only, CRC-framed block file.
///
/// Blocks may be written in any index order; each write appends one record:
///
/// ```text
/// [8 bytes: block index (little-endian u64)]
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload]
/// ```
///
/// On open the file is scanned front-to-back to rebuild the index-to-offset
/// map. Records failing the CRC check are skipped; a torn tail left by a
/// crash is cut off so later appends start on a record boundary.
pub struct FileBlockStore {
    path: PathBuf,
    state: Mutex<FileState>,
    sync_mode: SyncMode,
}

impl FileBlockStore {
    /// Open (or create) a block file at the given path.
    pub fn open(path: &Path, sync_mode: SyncMode) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Unavailable {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|source| StoreError::Unavailable {
                path: path.to_path_buf(),
                source,
            })?;

        let (slots, end) = scan(&mut file)?;
        let file_len = file.metadata()?.len();
        if end < file_len {
            warn!(path = %path.display(), end, file_len, "truncating torn block record");
            file.set_len(end)?;
        }

        debug!(path = %path.display(), blocks = slots.len(), "opened block file");
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(FileState { file, end, slots }),
            sync_mode,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of blocks currently indexed.
    pub fn len(&self) -> usize {
        self.state.lock().expect("lock poisoned").slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_slot(file: &mut File, slot: Slot) -> io::Result<Vec<u8>> {
        file.seek(SeekFrom::Start(slot.offset))?;
        let mut buf = vec![0u8; slot.len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Rebuild the slot map; returns it with the end offset of the last good record.
fn scan(file: &mut File) -> StoreResult<(HashMap<u64, Slot>, u64)> {
    let file_len = file.metadata()?.len();
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(&mut *file);
    let mut slots = HashMap::new();
    let mut offset: u64 = 0;

    while offset + HEADER_SIZE as u64 <= file_len {
        let mut header = [0u8; HEADER_SIZE];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let index = u64::from_le_bytes(header[0..8].try_into().unwrap_or([0; 8]));
        let length = u32::from_le_bytes(header[8..12].try_into().unwrap_or([0; 4]));
        let expected_crc = u32::from_le_bytes(header[12..16].try_into().unwrap_or([0; 4]));

        let payload_offset = offset + HEADER_SIZE as u64;
        if payload_offset + length as u64 > file_len {
            warn!(offset, length, file_len, "truncated block record; stopping scan");
            break;
        }

        let mut payload = vec![0u8; length as usize];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(offset, "truncated block record; stopping scan");
                break;
            }
            Err(e) => return Err(e.into()),
        }

        if crc32fast::hash(&payload) == expected_crc {
            slots.entry(index).or_insert(Slot {
                offset: payload_offset,
                len: length,
            });
        } else {
            warn!(offset, index, "CRC mismatch in block record; skipping");
        }

        offset = payload_offset + length as u64;
    }

    Ok((slots, offset))
}

impl BlockStore for FileBlockStore {
    fn read(&self, index: u64) -> StoreResult<Option<Bytes>> {
        let mut state = self.state.lock().expect("lock poisoned");
        let Some(slot) = state.slots.get(&index).copied() else {
            return Ok(None);
        };
        let data = Self::read_slot(&mut state.file, slot)?;
        Ok(Some(Bytes::from(data)))
    }

    fn put(&self, index: u64, data: Bytes) -> StoreResult<()> {
        if data.len() > MAX_RECORD_SIZE {
            return Err(StoreError::TooLarge {
                size: data.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(slot) = state.slots.get(&index).copied() {
            let existing = Self::read_slot(&mut state.file, slot)?;
            return if existing == data.as_ref() {
                Ok(())
            } else {
                Err(StoreError::Conflict { index })
            };
        }

        let mut record = Vec::with_capacity(HEADER_SIZE + data.len());
        record.extend_from_slice(&index.to_le_bytes());
        record.extend_from_slice(&(data.len() as u32).to_le_bytes());
        record.extend_from_slice(&crc32fast::hash(&data).to_le_bytes());
        record.extend_from_slice(&data);

        state.file.write_all(&record)?;
        if self.sync_mode == SyncMode::EveryWrite {
            state.file.sync_data()?;
        }

        let slot = Slot {
            offset: state.end + HEADER_SIZE as u64,
            len: data.len() as u32,
        };
        state.end += record.len() as u64;
        state.slots.insert(index, slot);
        Ok(())
    }

    fn has(&self, index: u64) -> StoreResult<bool> {
        Ok(self
            .state
            .lock()
            .expect("lock poisoned")
            .slots
            .contains_key(&index))
    }

    fn indices(&self) -> StoreResult<Vec<u64>> {
        let mut ids: Vec<u64> = self
            .state
            .lock()
            .expect("lock poisoned")
            .slots
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn flush(&self) -> StoreResult<()> {
        self.state.lock().expect("lock poisoned").file.sync_all()?;
        Ok(())
    }
}

impl std::fmt::Debug for FileBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBlockStore")
            .field("path", &self.path)
            .field("sync_mode", &self.sync_mode)
            .finish()
    }
}
