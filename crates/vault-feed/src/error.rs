use vault_crypto::{PublicKey, SignatureError};
use vault_store::StoreError;

/// Errors from feed operations.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Append attempted on a feed opened without its secret key.
    #[error("feed is not writable")]
    NotWritable,

    /// Index at or beyond the trusted length.
    #[error("index {index} out of bounds for length {length}")]
    OutOfBounds { index: u64, length: u64 },

    /// The block exists in the feed but is not stored locally.
    #[error("Block not downloaded")]
    BlockNotDownloaded { index: u64 },

    /// A block, proof, or signed root did not verify.
    #[error("verification failed for {what}")]
    VerificationFailed { what: String },

    /// Every peer that could supply a pending download went away.
    #[error("peer disconnected")]
    PeerDisconnected,

    /// The feed was closed while the operation was pending.
    #[error("feed closed")]
    Closed,

    /// Storage holds a different feed than the key supplied.
    #[error("storage holds feed {stored}, not {supplied}")]
    KeyMismatch {
        stored: PublicKey,
        supplied: PublicKey,
    },

    /// A header record could not be decoded.
    #[error("corrupt {what}: {reason}")]
    Corrupt { what: String, reason: String },

    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl FeedError {
    pub(crate) fn verification(what: impl Into<String>) -> Self {
        Self::VerificationFailed { what: what.into() }
    }

    pub(crate) fn corrupt(what: impl Into<String>, reason: impl ToString) -> Self {
        Self::Corrupt {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result alias for feed operations.
pub type FeedResult<T> = Result<T, FeedError>;
