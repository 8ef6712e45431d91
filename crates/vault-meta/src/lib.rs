//! Metadata log interpretation for Vault drives.
//!
//! Each metadata feed block holds one bincode-encoded [`Entry`]: a file
//! written, a directory created, or a path deleted. Folding the entries
//! below a version yields the drive's file tree at that version.
//!
//! # Key Types
//!
//! - [`Entry`] -- one file-system mutation
//! - [`ContentRange`] -- where a file's bytes live in the content feed
//! - [`MetadataIndex`] -- path -> entry chain, queried at any version
//! - [`Checkout`] -- a view pinned at one version

pub mod entry;
pub mod error;
pub mod index;
pub mod path;

pub use entry::{ContentRange, Entry, EntryKind, DIR_MODE, FILE_MODE};
pub use error::{MetaError, MetaResult};
pub use index::{Checkout, MetadataIndex, Resolved};
pub use path::normalize;
