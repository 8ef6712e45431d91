use bytes::Bytes;
use tracing::info;

use crate::drive::{Drive, ReadOptions, Stat};
use crate::error::DriveResult;

/// A read-only view of a drive pinned at one version.
///
/// Later writes never change what a checkout sees.
#[derive(Clone, Debug)]
pub struct Checkout {
    drive: Drive,
    version: u64,
}

impl Checkout {
    pub(crate) fn new(drive: Drive, version: u64) -> Self {
        Self { drive, version }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub async fn read_file(&self, path: &str) -> DriveResult<Bytes> {
        self.read_file_with(path, ReadOptions::default()).await
    }

    pub async fn read_file_with(&self, path: &str, opts: ReadOptions) -> DriveResult<Bytes> {
        self.drive.read_file_at(path, self.version, opts).await
    }

    pub async fn readdir(&self, path: &str) -> DriveResult<Vec<String>> {
        self.drive.readdir_at(path, self.version).await
    }

    pub async fn stat(&self, path: &str) -> DriveResult<Stat> {
        self.drive.stat_at(path, self.version).await
    }

    pub async fn access(&self, path: &str) -> DriveResult<()> {
        self.drive.resolve_at(path, self.version).await.map(|_| ())
    }

    /// Fetch everything needed to read this version offline: the metadata
    /// entries below it and the content of every file live at it.
    pub async fn download(&self) -> DriveResult<()> {
        self.drive.ensure_indexed(self.version).await?;
        let files = self.drive.files_at(self.version).await?;
        if files.is_empty() {
            return Ok(());
        }
        let content = self.drive.content_ready().await?;
        let mut blocks = 0;
        for file in &files {
            if let Some(range) = file.entry.content() {
                content.download(range).await?;
                blocks += range.block_count;
            }
        }
        info!(version = self.version, files = files.len(), blocks, "checkout downloaded");
        Ok(())
    }
}
