use std::path::Path;

use serde::{Deserialize, Serialize};
use vault_crypto::SecretKey;
use vault_feed::FeedOptions;

use crate::error::{DriveError, DriveResult};

/// Options for opening a drive.
///
/// Every field has a default, so a TOML file only needs the keys it
/// changes.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveOptions {
    /// Cached metadata blocks; 0 disables the cache.
    pub metadata_cache_size: usize,
    /// Cached content blocks; 0 disables the cache.
    pub content_cache_size: usize,
    /// Cached hash tree nodes per feed; 0 disables the cache.
    pub tree_cache_size: usize,
    /// Only download the content blocks that reads ask for.
    pub sparse: bool,
    /// Only download the metadata blocks that reads ask for.
    pub sparse_metadata: bool,
    /// Follow the owner's metadata as it grows instead of waiting for
    /// an explicit `update`.
    pub latest: bool,
    /// Hex-encoded 64-byte secret key of the metadata feed.
    pub secret_key: Option<String>,
}

impl Default for DriveOptions {
    fn default() -> Self {
        Self {
            metadata_cache_size: 1024,
            content_cache_size: 256,
            tree_cache_size: 4096,
            sparse: false,
            sparse_metadata: false,
            latest: false,
            secret_key: None,
        }
    }
}

impl std::fmt::Debug for DriveOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveOptions")
            .field("metadata_cache_size", &self.metadata_cache_size)
            .field("content_cache_size", &self.content_cache_size)
            .field("tree_cache_size", &self.tree_cache_size)
            .field("sparse", &self.sparse)
            .field("sparse_metadata", &self.sparse_metadata)
            .field("latest", &self.latest)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl DriveOptions {
    pub fn from_toml_str(s: &str) -> DriveResult<Self> {
        toml::from_str(s).map_err(|e| DriveError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> DriveResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
            .map_err(|e| DriveError::Config(format!("{}: {e}", path.display())))
    }

    pub fn to_toml_string(&self) -> DriveResult<String> {
        toml::to_string_pretty(self).map_err(|e| DriveError::Config(e.to_string()))
    }

    /// The configured secret key, if any.
    pub fn secret(&self) -> DriveResult<Option<SecretKey>> {
        let Some(encoded) = &self.secret_key else {
            return Ok(None);
        };
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| DriveError::InvalidKeypair(format!("secret key is not hex: {e}")))?;
        SecretKey::from_slice(&bytes)
            .map(Some)
            .map_err(|e| DriveError::InvalidKeypair(e.to_string()))
    }

    pub fn with_secret_key(mut self, secret: &SecretKey) -> Self {
        self.secret_key = Some(hex::encode(secret.to_bytes()));
        self
    }

    pub(crate) fn metadata_feed_options(&self) -> FeedOptions {
        FeedOptions {
            sparse: self.sparse_metadata,
            live: self.latest,
            cache_size: self.metadata_cache_size,
            tree_cache_size: self.tree_cache_size,
        }
    }

    pub(crate) fn content_feed_options(&self) -> FeedOptions {
        FeedOptions {
            sparse: self.sparse,
            live: true,
            cache_size: self.content_cache_size,
            tree_cache_size: self.tree_cache_size,
        }
    }
}
