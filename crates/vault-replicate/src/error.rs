use thiserror::Error;
use vault_feed::FeedError;
use vault_protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum ReplicateError {
    /// A block, proof, root, or link from the peer did not verify.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// The stream closed before the session was shut down locally.
    #[error("peer disconnected")]
    PeerDisconnected,

    /// The peer ended the session with an error message.
    #[error("remote error: {0}")]
    RemoteError(String),

    /// The session task is gone.
    #[error("session closed")]
    SessionClosed,

    /// A session multiplexes at most 256 feeds.
    #[error("too many channels")]
    ChannelLimit,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("feed error: {0}")]
    Feed(FeedError),
}

impl From<FeedError> for ReplicateError {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::VerificationFailed { what } => Self::VerificationFailed(what),
            FeedError::PeerDisconnected => Self::PeerDisconnected,
            other => Self::Feed(other),
        }
    }
}

pub type ReplicateResult<T> = Result<T, ReplicateError>;
