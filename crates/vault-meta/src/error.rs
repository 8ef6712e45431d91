/// Errors from metadata decoding and path resolution.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// No live entry for the path at the requested version.
    #[error("no such file or directory: {0}")]
    NotFound(String),

    /// The path resolves to a file where a directory was required.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// The path resolves to a directory where a file was required.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Entries below `version` have not all been indexed yet.
    #[error("index incomplete: version {version} requested, entries known up to {known}")]
    Incomplete { version: u64, known: u64 },

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Convenience alias for metadata results.
pub type MetaResult<T> = Result<T, MetaError>;
