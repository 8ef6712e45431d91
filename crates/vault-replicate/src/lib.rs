//! Feed replication between two peers.
//!
//! One [`replicate`] session runs over one ordered byte stream and carries
//! any number of feeds, each on its own [`Channel`]. Peers pair channels by
//! the discovery key in their handshakes, so a feed's public key never
//! crosses the wire. Every block received is verified against a signed
//! root before it reaches the feed.

pub mod channel;
pub mod error;
pub mod session;

pub use channel::{Channel, ChannelState, MAX_INFLIGHT};
pub use error::{ReplicateError, ReplicateResult};
pub use session::{replicate, SessionHandle, MAX_CHANNELS};
