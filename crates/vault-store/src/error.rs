use std::path::PathBuf;

/// Errors from block store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested block was never written.
    #[error("block {0} not found")]
    NotFound(u64),

    /// A write tried to replace an existing block with different bytes.
    #[error("block {index} already holds different bytes")]
    Conflict { index: u64 },

    /// The backing location cannot be created or written.
    #[error("storage unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record does not fit the on-disk framing.
    #[error("block of {size} bytes exceeds the record limit of {max}")]
    TooLarge { size: usize, max: usize },

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
