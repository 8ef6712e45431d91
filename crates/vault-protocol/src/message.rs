use serde::{Deserialize, Serialize};
use vault_crypto::{FeedLink, Proof, SignedRoot};
use vault_types::Hash;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Opens a channel: names the feed and states what this side trusts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub version: u32,
    pub discovery_key: Hash,
    pub root: Option<SignedRoot>,
    pub link: Option<FeedLink>,
    pub live: bool,
}

/// A run of block indices, `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

/// Blocks the sender has stored, plus its latest trusted root.
///
/// The first `Have` on a channel lists every stored block; later ones add
/// only blocks stored since, and receivers merge them. Ranges never reach
/// past the length of the sender's signed root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Have {
    pub ranges: Vec<BlockRange>,
    pub root: Option<SignedRoot>,
}

/// Ask for block `index`, proven against the root at `length`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub index: u64,
    pub length: u64,
}

/// A block with its inclusion proof against the root at `length`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    pub index: u64,
    pub length: u64,
    pub data: Vec<u8>,
    pub proof: Proof,
}

/// The sender cannot serve block `index`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unavailable {
    pub index: u64,
}

/// The sender is ending the session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
}

/// All message types in the Vault replication protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Handshake(Handshake),
    Have(Have),
    Request(Request),
    Data(Data),
    Unavailable(Unavailable),
    Error(ErrorMessage),
}

impl Message {
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::Handshake(_) => 1,
            Self::Have(_) => 2,
            Self::Request(_) => 3,
            Self::Data(_) => 4,
            Self::Unavailable(_) => 5,
            Self::Error(_) => 255,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "Handshake",
            Self::Have(_) => "Have",
            Self::Request(_) => "Request",
            Self::Data(_) => "Data",
            Self::Unavailable(_) => "Unavailable",
            Self::Error(_) => "Error",
        }
    }
}

/// A message addressed to one channel.
///
/// Channel ids are chosen by the sender; the receiver maps them to its own
/// channels through the discovery key in each channel's handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub channel: u8,
    pub message: Message,
}

impl Frame {
    pub fn new(channel: u8, message: Message) -> Self {
        Self { channel, message }
    }
}
