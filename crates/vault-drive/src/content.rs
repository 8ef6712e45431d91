//! File bytes in the content feed.

use bytes::{Bytes, BytesMut};
use tracing::debug;
use vault_feed::{Feed, FeedError, GetOptions};
use vault_meta::ContentRange;

use crate::error::DriveResult;

/// Largest content block; files are split into blocks of this size.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// The content feed of a drive, addressed by [`ContentRange`]s.
#[derive(Clone)]
pub struct ContentLog {
    feed: Feed,
}

impl ContentLog {
    pub fn new(feed: Feed) -> Self {
        Self { feed }
    }

    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    /// Append `data` as consecutive blocks.
    ///
    /// Callers serialize appends, so the range is contiguous.
    pub async fn append(&self, data: Bytes) -> DriveResult<ContentRange> {
        let start_block = self.feed.length();
        let byte_offset = self.feed.byte_length();
        let mut block_count = 0;
        let mut at = 0;
        while at < data.len() {
            let end = (at + BLOCK_SIZE).min(data.len());
            self.feed.append(data.slice(at..end)).await?;
            block_count += 1;
            at = end;
        }
        let range = ContentRange {
            start_block,
            block_count,
            byte_offset,
            byte_length: data.len() as u64,
        };
        debug!(start = start_block, blocks = block_count, bytes = range.byte_length, "appended content");
        Ok(range)
    }

    /// Read a whole range.
    ///
    /// With `cached`, only locally stored blocks are used and a missing one
    /// fails with `BlockNotDownloaded`; otherwise missing blocks are fetched.
    pub async fn read(&self, range: &ContentRange, cached: bool) -> DriveResult<Bytes> {
        if range.block_count == 0 {
            return Ok(Bytes::new());
        }
        if cached {
            let length = self.feed.length();
            if length < range.end_block() {
                let index = range.start_block.max(length);
                return Err(FeedError::BlockNotDownloaded { index }.into());
            }
        } else {
            self.download(range).await?;
        }

        let mut out = BytesMut::with_capacity(range.byte_length as usize);
        for index in range.blocks() {
            out.extend_from_slice(&self.feed.get(index, GetOptions::cached()).await?);
        }
        Ok(out.freeze())
    }

    /// Fetch every block of `range`.
    pub async fn download(&self, range: &ContentRange) -> DriveResult<()> {
        if range.block_count == 0 {
            return Ok(());
        }
        self.feed.wait_for_length(range.end_block()).await?;
        self.feed.download(range.blocks()).await?;
        Ok(())
    }

    /// Whether every block of `range` is stored locally.
    pub fn has(&self, range: &ContentRange) -> bool {
        range.blocks().all(|i| self.feed.has(i))
    }
}

impl std::fmt::Debug for ContentLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentLog")
            .field("key", &self.feed.key())
            .field("length", &self.feed.length())
            .finish()
    }
}
