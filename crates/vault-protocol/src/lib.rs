//! Wire protocol for Vault replication.
//!
//! Defines the framing and message types two peers exchange over one
//! ordered byte stream. Each frame carries a channel id so several feeds
//! replicate over the same connection.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{read_frame, write_frame, FrameCodec};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    BlockRange, Data, ErrorMessage, Frame, Handshake, Have, Message, Request, Unavailable,
    MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
