use vault_crypto::{PublicKey, SecretKey};

/// Write capability of an opened feed.
///
/// `append` is only reachable through a `ReadWrite` handle.
#[derive(Clone, Debug)]
pub enum FeedHandle {
    ReadOnly(PublicKey),
    ReadWrite(SecretKey),
}

impl FeedHandle {
    pub fn public_key(&self) -> PublicKey {
        match self {
            Self::ReadOnly(key) => *key,
            Self::ReadWrite(secret) => secret.public_key(),
        }
    }

    pub fn secret(&self) -> Option<&SecretKey> {
        match self {
            Self::ReadOnly(_) => None,
            Self::ReadWrite(secret) => Some(secret),
        }
    }
}

/// Per-feed behaviour knobs.
#[derive(Clone, Debug)]
pub struct FeedOptions {
    /// Only fetch blocks that local reads ask for.
    pub sparse: bool,
    /// Adopt newer roots announced by peers as they arrive.
    pub live: bool,
    /// LRU entries in front of the block store; 0 disables.
    pub cache_size: usize,
    /// LRU entries in front of the tree node store; 0 disables.
    pub tree_cache_size: usize,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            sparse: false,
            live: true,
            cache_size: 64,
            tree_cache_size: 256,
        }
    }
}

/// Options for [`Feed::get`](crate::Feed::get).
#[derive(Clone, Copy, Debug)]
pub struct GetOptions {
    /// Download a missing block instead of failing with `BlockNotDownloaded`.
    pub wait: bool,
    /// Re-hash the block against its stored leaf node.
    pub verify: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            wait: true,
            verify: false,
        }
    }
}

impl GetOptions {
    /// Local-only read: never waits on the network.
    pub fn cached() -> Self {
        Self {
            wait: false,
            ..Self::default()
        }
    }
}
