//! The versioned path index over a metadata feed.
//!
//! [`MetadataIndex`] is fed `(index, Entry)` pairs as metadata blocks are
//! appended or downloaded, in any order. Every query takes a version `v`
//! and only considers entries with index `< v`, so a view at `v` never
//! changes as the feed grows. Within a path, the entry appended last wins.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use tracing::trace;

use crate::entry::{Entry, EntryKind, DIR_MODE};
use crate::error::{MetaError, MetaResult};
use crate::path;

/// A path resolved at some version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolved {
    /// Metadata block holding the entry; `None` for the root and for
    /// directories implied by their descendants.
    pub index: Option<u64>,
    pub entry: Entry,
}

/// Path index over all known metadata entries.
#[derive(Debug, Default)]
pub struct MetadataIndex {
    entries: BTreeMap<u64, Entry>,
    /// Path -> indices of its entries, ascending.
    chains: BTreeMap<String, Vec<u64>>,
    /// Every index below this one is known.
    contiguous: u64,
}

impl MetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the entry stored at metadata block `index`.
    ///
    /// Returns `false` if the index was already known.
    pub fn insert(&mut self, index: u64, entry: Entry) -> bool {
        if self.entries.contains_key(&index) {
            return false;
        }
        let chain = self.chains.entry(entry.path.clone()).or_default();
        let at = chain.partition_point(|i| *i < index);
        chain.insert(at, index);
        trace!(index, path = %entry.path, "indexed metadata entry");
        self.entries.insert(index, entry);
        while self.entries.contains_key(&self.contiguous) {
            self.contiguous += 1;
        }
        true
    }

    pub fn contains(&self, index: u64) -> bool {
        self.entries.contains_key(&index)
    }

    /// Number of known entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Largest version answerable without gaps.
    pub fn known(&self) -> u64 {
        self.contiguous
    }

    /// Unknown indices below `version`.
    pub fn missing(&self, version: u64) -> Vec<u64> {
        (self.contiguous..version)
            .filter(|i| !self.entries.contains_key(i))
            .collect()
    }

    /// Entry stored at `index`, if known.
    pub fn entry(&self, index: u64) -> Option<&Entry> {
        self.entries.get(&index)
    }

    /// Known entries in index order.
    pub fn entries(&self) -> impl Iterator<Item = (u64, &Entry)> {
        self.entries.iter().map(|(i, e)| (*i, e))
    }

    /// A view pinned at `version`.
    pub fn checkout(&self, version: u64) -> Checkout<'_> {
        Checkout {
            index: self,
            version,
        }
    }

    /// Resolve `path` at `version`.
    pub fn resolve(&self, path: &str, version: u64) -> MetaResult<Resolved> {
        self.ensure_known(version)?;
        let path = path::normalize(path);
        if path::is_root(&path) {
            return Ok(Resolved {
                index: None,
                entry: Entry::root(),
            });
        }
        if let Some((index, entry)) = self.live(&path, version) {
            return Ok(Resolved {
                index: Some(index),
                entry: entry.clone(),
            });
        }
        if self.has_live_descendant(&path, version) {
            return Ok(Resolved {
                index: None,
                entry: Entry {
                    path,
                    kind: EntryKind::Directory { mode: DIR_MODE },
                    mtime: 0,
                },
            });
        }
        Err(MetaError::NotFound(path))
    }

    pub fn exists(&self, path: &str, version: u64) -> MetaResult<bool> {
        match self.resolve(path, version) {
            Ok(_) => Ok(true),
            Err(MetaError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Sorted names of the immediate children of directory `path`.
    pub fn readdir(&self, path: &str, version: u64) -> MetaResult<Vec<String>> {
        let dir = self.resolve(path, version)?;
        if !dir.entry.is_directory() {
            return Err(MetaError::NotADirectory(dir.entry.path));
        }
        let prefix = path::child_prefix(&dir.entry.path);
        let mut names = BTreeSet::new();
        for (candidate, _) in self.under(&prefix) {
            if self.live(candidate, version).is_some() {
                if let Some(name) = candidate[prefix.len()..].split('/').next() {
                    names.insert(name.to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Every live file at `version`, in path order.
    pub fn files(&self, version: u64) -> MetaResult<Vec<Resolved>> {
        self.ensure_known(version)?;
        Ok(self
            .chains
            .keys()
            .filter_map(|p| self.live(p, version))
            .filter(|(_, e)| e.is_file())
            .map(|(index, entry)| Resolved {
                index: Some(index),
                entry: entry.clone(),
            })
            .collect())
    }

    fn ensure_known(&self, version: u64) -> MetaResult<()> {
        if version > self.contiguous {
            return Err(MetaError::Incomplete {
                version,
                known: self.contiguous,
            });
        }
        Ok(())
    }

    /// Latest entry for `path` below `version`.
    fn latest(&self, path: &str, version: u64) -> Option<(u64, &Entry)> {
        let chain = self.chains.get(path)?;
        let at = chain.partition_point(|i| *i < version);
        let index = *chain[..at].last()?;
        Some((index, self.entries.get(&index)?))
    }

    /// Latest entry for `path` below `version` unless it, or an ancestor
    /// after it, was deleted.
    fn live(&self, path: &str, version: u64) -> Option<(u64, &Entry)> {
        let (index, entry) = self.latest(path, version)?;
        if entry.is_delete() {
            return None;
        }
        let shadowed =
            path::ancestors(path).any(|ancestor| self.deleted_between(ancestor, index, version));
        (!shadowed).then_some((index, entry))
    }

    fn deleted_between(&self, path: &str, after: u64, before: u64) -> bool {
        self.chains.get(path).is_some_and(|chain| {
            chain.iter().any(|i| {
                *i > after && *i < before && self.entries.get(i).is_some_and(Entry::is_delete)
            })
        })
    }

    fn has_live_descendant(&self, dir: &str, version: u64) -> bool {
        let prefix = path::child_prefix(dir);
        let found = self
            .under(&prefix)
            .any(|(candidate, _)| self.live(candidate, version).is_some());
        found
    }

    /// Chains whose path starts with `prefix`.
    fn under<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a Vec<u64>)> + 'a {
        self.chains
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(p, _)| p.starts_with(prefix))
            .map(|(p, chain)| (p.as_str(), chain))
            .filter(move |(p, _)| p.len() > prefix.len())
    }
}

/// A read view of a [`MetadataIndex`] pinned at one version.
#[derive(Clone, Copy, Debug)]
pub struct Checkout<'a> {
    index: &'a MetadataIndex,
    version: u64,
}

impl<'a> Checkout<'a> {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn resolve(&self, path: &str) -> MetaResult<Resolved> {
        self.index.resolve(path, self.version)
    }

    pub fn readdir(&self, path: &str) -> MetaResult<Vec<String>> {
        self.index.readdir(path, self.version)
    }

    pub fn files(&self) -> MetaResult<Vec<Resolved>> {
        self.index.files(self.version)
    }

    pub fn exists(&self, path: &str) -> MetaResult<bool> {
        self.index.exists(path, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ContentRange;

    fn file(path: &str, start_block: u64) -> Entry {
        Entry::file(
            path,
            ContentRange {
                start_block,
                block_count: 1,
                byte_offset: start_block * 8,
                byte_length: 8,
            },
        )
    }

    fn build(entries: Vec<Entry>) -> MetadataIndex {
        let mut index = MetadataIndex::new();
        for (i, e) in entries.into_iter().enumerate() {
            assert!(index.insert(i as u64, e));
        }
        index
    }

    #[test]
    fn root_always_exists() {
        let index = MetadataIndex::new();
        let root = index.resolve("/", 0).unwrap();
        assert!(root.entry.is_directory());
        assert_eq!(root.index, None);
        assert!(index.readdir("/", 0).unwrap().is_empty());
        assert!(index.exists("..", 0).unwrap());
    }

    #[test]
    fn later_entry_shadows_earlier() {
        let index = build(vec![file("/a.txt", 0), file("/a.txt", 1)]);
        let latest = index.resolve("/a.txt", 2).unwrap();
        assert_eq!(latest.index, Some(1));
        let older = index.resolve("/a.txt", 1).unwrap();
        assert_eq!(older.index, Some(0));
        assert!(matches!(
            index.resolve("/a.txt", 0),
            Err(MetaError::NotFound(_))
        ));
    }

    #[test]
    fn delete_removes_path() {
        let index = build(vec![file("/gone.txt", 0), Entry::delete("/gone.txt")]);
        assert!(matches!(
            index.resolve("/gone.txt", 2),
            Err(MetaError::NotFound(_))
        ));
        assert!(index.resolve("/gone.txt", 1).is_ok());
        assert!(index.readdir("/", 2).unwrap().is_empty());
    }

    #[test]
    fn ancestor_delete_hides_descendants() {
        let index = build(vec![
            Entry::directory("/d"),
            file("/d/x", 0),
            Entry::delete("/d"),
            file("/d/y", 1),
        ]);
        assert!(!index.exists("/d/x", 4).unwrap());
        assert!(index.exists("/d/y", 4).unwrap());
        assert_eq!(index.readdir("/d", 4).unwrap(), vec!["y"]);
        assert!(index.exists("/d/x", 2).unwrap());
    }

    #[test]
    fn recreated_directory_does_not_revive_old_children() {
        let index = build(vec![
            file("/d/x", 0),
            Entry::delete("/d"),
            Entry::directory("/d"),
        ]);
        assert!(!index.exists("/d/x", 3).unwrap());
        assert!(index.readdir("/d", 3).unwrap().is_empty());
    }

    #[test]
    fn readdir_lists_implied_directories_sorted() {
        let index = build(vec![
            file("/b.txt", 0),
            file("/nested/deep/c.txt", 1),
            Entry::directory("/empty"),
            file("/a.txt", 2),
        ]);
        assert_eq!(
            index.readdir("/", 4).unwrap(),
            vec!["a.txt", "b.txt", "empty", "nested"]
        );
        assert_eq!(index.readdir("/nested", 4).unwrap(), vec!["deep"]);
        let implied = index.resolve("/nested/deep", 4).unwrap();
        assert!(implied.entry.is_directory());
        assert_eq!(implied.index, None);
    }

    #[test]
    fn readdir_on_file_fails() {
        let index = build(vec![file("/f", 0)]);
        assert!(matches!(
            index.readdir("/f", 1),
            Err(MetaError::NotADirectory(_))
        ));
    }

    #[test]
    fn sibling_prefix_is_not_a_child() {
        let index = build(vec![file("/ab/x", 0), file("/a/y", 1)]);
        assert_eq!(index.readdir("/a", 2).unwrap(), vec!["y"]);
    }

    #[test]
    fn gaps_are_reported_until_filled() {
        let mut index = MetadataIndex::new();
        index.insert(1, file("/late", 1));
        assert_eq!(index.known(), 0);
        assert_eq!(index.missing(2), vec![0]);
        assert!(matches!(
            index.resolve("/late", 2),
            Err(MetaError::Incomplete { version: 2, known: 0 })
        ));

        index.insert(0, file("/early", 0));
        assert_eq!(index.known(), 2);
        assert!(index.exists("/late", 2).unwrap());
        assert!(!index.insert(0, file("/again", 5)));
    }

    #[test]
    fn checkout_is_pinned() {
        let mut index = build(vec![file("/first.txt", 0), file("/second.txt", 1)]);
        let before: Vec<String> = index.checkout(1).readdir("/").unwrap();
        index.insert(2, file("/third.txt", 2));
        let view = index.checkout(1);
        assert_eq!(view.readdir("/").unwrap(), before);
        assert_eq!(view.version(), 1);
        assert!(!view.exists("/second.txt").unwrap());
        assert_eq!(index.checkout(3).files().unwrap().len(), 3);
    }

    #[test]
    fn files_skip_directories_and_deletes() {
        let index = build(vec![
            Entry::directory("/dir"),
            file("/dir/keep", 0),
            file("/drop", 1),
            Entry::delete("/drop"),
        ]);
        let files = index.files(4).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].entry.path, "/dir/keep");
    }
}
