//! Versioned, replicable file trees.
//!
//! A [`Drive`] keeps its file tree in two feeds: a metadata feed with one
//! entry per write, unlink or mkdir, and a content feed with the file
//! bytes. The drive version is the metadata length, and any past version
//! can be read through a [`Checkout`]. Replicas verify every block they
//! receive and, in sparse mode, fetch only what reads ask for.
//!
//! ```no_run
//! # async fn demo() -> vault_drive::DriveResult<()> {
//! use vault_drive::{Drive, DriveOptions, Storage};
//!
//! let drive = Drive::open(Storage::memory(), None, DriveOptions::default()).await?;
//! drive.write_file("/hello.txt", "world").await?;
//! assert_eq!(&drive.read_file("/hello.txt").await?[..], b"world");
//! # Ok(())
//! # }
//! ```

pub mod checkout;
pub mod config;
pub mod content;
pub mod drive;
pub mod error;

pub use checkout::Checkout;
pub use config::DriveOptions;
pub use content::{ContentLog, BLOCK_SIZE};
pub use drive::{Drive, DriveEvent, ReadOptions, Stat};
pub use error::{DriveError, DriveResult};

// Re-export the types callers need to open and connect drives.
pub use vault_crypto::{Keypair, PublicKey, SecretKey};
pub use vault_meta::Entry;
pub use vault_replicate::SessionHandle;
pub use vault_store::Storage;
