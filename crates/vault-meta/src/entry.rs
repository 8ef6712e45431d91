//! Metadata log entries.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{MetaError, MetaResult};
use crate::path;

/// Default mode for files.
pub const FILE_MODE: u32 = 0o100644;
/// Default mode for directories.
pub const DIR_MODE: u32 = 0o040755;

/// Where a file's bytes live in the content feed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRange {
    /// First content block.
    pub start_block: u64,
    /// Number of content blocks.
    pub block_count: u64,
    /// Byte offset of the first block within the content feed.
    pub byte_offset: u64,
    /// Total file size in bytes.
    pub byte_length: u64,
}

impl ContentRange {
    pub fn end_block(&self) -> u64 {
        self.start_block + self.block_count
    }

    pub fn blocks(&self) -> std::ops::Range<u64> {
        self.start_block..self.end_block()
    }
}

/// What an entry does to its path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File { content: ContentRange, mode: u32 },
    Directory { mode: u32 },
    Delete,
}

/// One file-system mutation, stored as one metadata block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Normalized absolute path.
    pub path: String,
    pub kind: EntryKind,
    /// Milliseconds since the Unix epoch.
    pub mtime: i64,
}

impl Entry {
    pub fn file(path: &str, content: ContentRange) -> Self {
        Self::new(
            path,
            EntryKind::File {
                content,
                mode: FILE_MODE,
            },
        )
    }

    pub fn directory(path: &str) -> Self {
        Self::new(path, EntryKind::Directory { mode: DIR_MODE })
    }

    pub fn delete(path: &str) -> Self {
        Self::new(path, EntryKind::Delete)
    }

    fn new(path: &str, kind: EntryKind) -> Self {
        Self {
            path: path::normalize(path),
            kind,
            mtime: Utc::now().timestamp_millis(),
        }
    }

    /// The always-present root directory.
    pub fn root() -> Self {
        Self {
            path: path::ROOT.to_string(),
            kind: EntryKind::Directory { mode: DIR_MODE },
            mtime: 0,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File { .. })
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, EntryKind::Directory { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, EntryKind::Delete)
    }

    pub fn content(&self) -> Option<&ContentRange> {
        match &self.kind {
            EntryKind::File { content, .. } => Some(content),
            _ => None,
        }
    }

    pub fn mode(&self) -> u32 {
        match self.kind {
            EntryKind::File { mode, .. } | EntryKind::Directory { mode } => mode,
            EntryKind::Delete => 0,
        }
    }

    pub fn encode(&self) -> MetaResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| MetaError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> MetaResult<Self> {
        bincode::deserialize(bytes).map_err(|e| MetaError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_normalize_paths() {
        let entry = Entry::directory("docs/../notes/");
        assert_eq!(entry.path, "/notes");
        assert!(entry.is_directory());
        assert_eq!(entry.mode(), DIR_MODE);
    }

    #[test]
    fn file_entry_roundtrip() {
        let range = ContentRange {
            start_block: 4,
            block_count: 2,
            byte_offset: 100,
            byte_length: 70_000,
        };
        let entry = Entry::file("/a.txt", range);
        let decoded = Entry::decode(&entry.encode().unwrap()).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.content().unwrap().blocks(), 4..6);
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            Entry::decode(&[0xff]),
            Err(MetaError::Serialization(_))
        ));
    }

    #[test]
    fn root_entry_is_directory() {
        let root = Entry::root();
        assert_eq!(root.path, "/");
        assert!(root.is_directory());
        assert!(!root.is_delete());
        assert!(root.content().is_none());
    }
}
