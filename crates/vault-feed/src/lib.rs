//! Signed append-only feeds.
//!
//! A [`Feed`] is the unit of replication: a sequence of blocks stored in a
//! block store, summarized by a flat Merkle tree whose root the owner signs
//! after every append. Replicas hold any subset of the blocks; every block
//! they receive is checked against a trusted signed root before it is
//! stored, and stays trusted from then on.
//!
//! Write capability is the [`FeedHandle`]: only a `ReadWrite` handle can
//! append. Replication code talks to a feed exclusively through
//! [`Feed::proof`], [`Feed::put_verified`], [`Feed::adopt_root`] and
//! [`Feed::set_link`].

pub mod bitfield;
pub mod error;
pub mod feed;
pub mod options;

pub use bitfield::{Bitfield, Run};
pub use error::{FeedError, FeedResult};
pub use feed::Feed;
pub use options::{FeedHandle, FeedOptions, GetOptions};
