use thiserror::Error;
use vault_feed::FeedError;
use vault_meta::MetaError;
use vault_replicate::ReplicateError;
use vault_store::StoreError;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("file exists: {0}")]
    AlreadyExists(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("drive is not writable")]
    NotWritable,

    #[error("drive is closed")]
    Closed,

    #[error("version {version} is past the latest version {latest}")]
    VersionOutOfRange { version: u64, latest: u64 },

    /// The supplied secret key is malformed or does not belong to the key.
    #[error("invalid keypair: {0}")]
    InvalidKeypair(String),

    #[error("storage holds drive {stored}, not {supplied}")]
    KeyMismatch { stored: String, supplied: String },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Feed(FeedError),

    #[error("metadata error: {0}")]
    Meta(MetaError),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("replication error: {0}")]
    Replicate(#[from] ReplicateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FeedError> for DriveError {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::NotWritable => Self::NotWritable,
            FeedError::Closed => Self::Closed,
            FeedError::KeyMismatch { stored, supplied } => Self::KeyMismatch {
                stored: stored.to_string(),
                supplied: supplied.to_string(),
            },
            FeedError::Storage(e) => e.into(),
            other => Self::Feed(other),
        }
    }
}

impl From<MetaError> for DriveError {
    fn from(err: MetaError) -> Self {
        match err {
            MetaError::NotFound(path) => Self::NotFound(path),
            MetaError::IsADirectory(path) => Self::IsADirectory(path),
            MetaError::NotADirectory(path) => Self::NotADirectory(path),
            other => Self::Meta(other),
        }
    }
}

impl From<StoreError> for DriveError {
    fn from(err: StoreError) -> Self {
        match err {
            e @ StoreError::Unavailable { .. } => Self::StorageUnavailable(e.to_string()),
            other => Self::Store(other),
        }
    }
}

pub type DriveResult<T> = Result<T, DriveError>;
