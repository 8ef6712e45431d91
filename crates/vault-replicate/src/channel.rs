//! Per-feed replication state machine.
//!
//! A [`Channel`] pairs one local feed with the same feed on the peer. It
//! never touches the stream: every handler returns the messages to send,
//! and the session writes them.
//!
//! ```text
//! Idle --open--> Handshaking --remote handshake--> Syncing --remote have--> Streaming
//!   \________________________ close / feed closed _________________________--> Closed
//! ```

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::{debug, warn};
use vault_feed::{Bitfield, Feed, FeedError, GetOptions, Run};
use vault_protocol::{
    BlockRange, Data, Handshake, Have, Message, ProtocolError, Request, Unavailable,
    PROTOCOL_VERSION,
};
use vault_types::Hash;

use crate::error::{ReplicateError, ReplicateResult};

/// Requests one channel keeps outstanding at most.
pub const MAX_INFLIGHT: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Handshaking,
    Syncing,
    Streaming,
    Closed,
}

pub struct Channel {
    id: u8,
    feed: Feed,
    state: ChannelState,
    remote_have: Bitfield,
    /// Requested index -> length the proof was asked against.
    inflight: BTreeMap<u64, u64>,
    /// Root length last announced to the peer.
    announced_length: u64,
    /// Stored-block log position covered by our last announcement.
    announced_position: usize,
    /// Longest verified root length the peer has shown us.
    remote_length: u64,
    peer_attached: bool,
}

impl Channel {
    pub fn new(id: u8, feed: Feed) -> Self {
        Self {
            id,
            feed,
            state: ChannelState::Idle,
            remote_have: Bitfield::new(),
            inflight: BTreeMap::new(),
            announced_length: 0,
            announced_position: 0,
            remote_length: 0,
            peer_attached: false,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    pub fn discovery_key(&self) -> Hash {
        self.feed.discovery_key()
    }

    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    /// Start the channel: the handshake to send.
    pub fn open(&mut self) -> Message {
        self.state = ChannelState::Handshaking;
        Message::Handshake(Handshake {
            version: PROTOCOL_VERSION,
            discovery_key: self.feed.discovery_key(),
            root: self.feed.root(),
            link: self.feed.link(),
            live: self.feed.live(),
        })
    }

    /// Both handshakes are known: trust the peer's root and announce ours.
    pub fn on_handshake(&mut self, remote: Handshake) -> ReplicateResult<Vec<Message>> {
        if remote.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: remote.version,
            }
            .into());
        }
        if let Some(root) = remote.root {
            self.feed.verify_root(&root)?;
            self.remote_length = self.remote_length.max(root.length);
            self.feed.adopt_root(root)?;
        }
        if let Some(link) = remote.link {
            self.feed.set_link(link)?;
        }
        if !self.peer_attached {
            self.feed.attach_peer();
            self.peer_attached = true;
        }
        debug!(
            channel = self.id,
            feed = self.feed.name(),
            length = self.feed.length(),
            remote_live = remote.live,
            "channel syncing"
        );
        self.state = ChannelState::Syncing;
        Ok(vec![self.have_message()])
    }

    /// Blocks the peer stored; starts streaming.
    ///
    /// Ranges are merged into what the peer announced before. A range that
    /// is reversed or reaches past the peer's signed length is a protocol
    /// error.
    pub fn on_have(&mut self, have: Have) -> ReplicateResult<Vec<Message>> {
        if let Some(root) = have.root {
            self.feed.verify_root(&root)?;
            self.remote_length = self.remote_length.max(root.length);
            self.feed.offer_root(root)?;
        }
        for range in &have.ranges {
            if range.start > range.end || range.end > self.remote_length {
                return Err(ProtocolError::InvalidMessage(format!(
                    "have range {}..{} outside remote length {}",
                    range.start, range.end, self.remote_length
                ))
                .into());
            }
        }
        for range in &have.ranges {
            self.remote_have.set_range(range.start, range.end);
        }
        if self.state == ChannelState::Syncing {
            self.state = ChannelState::Streaming;
        }
        Ok(self.schedule())
    }

    /// Serve a block, or say we cannot.
    pub async fn on_request(&mut self, request: Request) -> ReplicateResult<Message> {
        let Request { index, length } = request;
        let unavailable = Message::Unavailable(Unavailable { index });
        let Some(proof) = self.feed.proof(index, length)? else {
            debug!(channel = self.id, index, length, "cannot serve block");
            return Ok(unavailable);
        };
        match self.feed.get(index, GetOptions::cached()).await {
            Ok(data) => Ok(Message::Data(Data {
                index,
                length,
                data: data.to_vec(),
                proof,
            })),
            Err(FeedError::BlockNotDownloaded { .. } | FeedError::Closed) => Ok(unavailable),
            Err(e) => Err(e.into()),
        }
    }

    /// A block from the peer. Verification failure is fatal to the session.
    pub fn on_data(&mut self, data: Data) -> ReplicateResult<Vec<Message>> {
        self.inflight.remove(&data.index);
        match self
            .feed
            .put_verified(data.index, Bytes::from(data.data), &data.proof, data.length)
        {
            Ok(_) => Ok(self.schedule()),
            Err(FeedError::Closed) => {
                self.close();
                Ok(Vec::new())
            }
            Err(e) => {
                warn!(channel = self.id, feed = self.feed.name(), index = data.index, error = %e, "rejected block");
                Err(e.into())
            }
        }
    }

    /// The peer cannot serve `index`; stop asking it.
    pub fn on_unavailable(&mut self, unavailable: Unavailable) -> Vec<Message> {
        self.inflight.remove(&unavailable.index);
        self.remote_have.clear(unavailable.index);
        self.schedule()
    }

    /// The local feed changed: announce growth and issue new requests.
    pub fn on_feed_changed(&mut self) -> Vec<Message> {
        if self.feed.is_closed() {
            self.close();
            return Vec::new();
        }
        if !matches!(self.state, ChannelState::Syncing | ChannelState::Streaming) {
            return Vec::new();
        }
        let mut out = Vec::new();
        let (fresh, position) = self.feed.stored_since(self.announced_position);
        if !fresh.is_empty() || self.feed.length() != self.announced_length {
            out.push(self.announce(fresh, position));
        }
        out.extend(self.schedule());
        out
    }

    /// Requests to issue now, within the in-flight window.
    pub fn schedule(&mut self) -> Vec<Message> {
        if self.state != ChannelState::Streaming || self.feed.is_closed() {
            return Vec::new();
        }
        let budget = MAX_INFLIGHT.saturating_sub(self.inflight.len());
        if budget == 0 {
            return Vec::new();
        }

        let length = self.feed.length();
        let inflight = &self.inflight;
        let remote = &self.remote_have;
        let accept = |i: u64| i < length && remote.get(i) && !inflight.contains_key(&i);
        let picks: Vec<u64> = if self.feed.sparse() {
            self.feed
                .wanted_missing()
                .into_iter()
                .filter(|i| accept(*i))
                .take(budget)
                .collect()
        } else {
            self.feed.missing(budget, accept)
        };

        picks
            .into_iter()
            .map(|index| {
                self.inflight.insert(index, length);
                Message::Request(Request { index, length })
            })
            .collect()
    }

    /// Stop the channel and release its peer slot.
    pub fn close(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        self.state = ChannelState::Closed;
        self.inflight.clear();
        if self.peer_attached {
            self.feed.detach_peer();
            self.peer_attached = false;
        }
        debug!(channel = self.id, feed = self.feed.name(), "channel closed");
    }

    /// Everything stored so far.
    fn have_message(&mut self) -> Message {
        let position = self.feed.stored_position();
        let runs = self.feed.have_runs();
        self.announce(runs, position)
    }

    fn announce(&mut self, runs: Vec<Run>, position: usize) -> Message {
        let root = self.feed.root();
        self.announced_length = root.as_ref().map_or(0, |r| r.length);
        self.announced_position = position;
        Message::Have(Have {
            ranges: runs
                .into_iter()
                .map(|r| BlockRange {
                    start: r.start,
                    end: r.end,
                })
                .collect(),
            root,
        })
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("feed", &self.feed.name())
            .field("state", &self.state)
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_feed::{FeedHandle, FeedOptions};
    use vault_store::Storage;

    async fn owner(blocks: u8) -> Feed {
        let feed = Feed::open(&Storage::memory(), "metadata", None, FeedOptions::default())
            .await
            .unwrap();
        for i in 0..blocks {
            feed.append(vec![i; 4]).await.unwrap();
        }
        feed
    }

    async fn replica(of: &Feed, sparse: bool) -> Feed {
        let options = FeedOptions {
            sparse,
            ..FeedOptions::default()
        };
        Feed::open(
            &Storage::memory(),
            "metadata",
            Some(FeedHandle::ReadOnly(of.key())),
            options,
        )
        .await
        .unwrap()
    }

    fn handshake_of(message: Message) -> Handshake {
        match message {
            Message::Handshake(h) => h,
            other => panic!("expected handshake, got {}", other.type_name()),
        }
    }

    fn have_of(message: &Message) -> Have {
        match message {
            Message::Have(h) => h.clone(),
            other => panic!("expected have, got {}", other.type_name()),
        }
    }

    /// Run two channels against each other until neither has anything to say.
    async fn pump(a: &mut Channel, b: &mut Channel, mut to_b: Vec<Message>) {
        let mut to_a = Vec::new();
        while !to_a.is_empty() || !to_b.is_empty() {
            for m in std::mem::take(&mut to_b) {
                to_a.extend(deliver(b, m).await);
            }
            for m in std::mem::take(&mut to_a) {
                to_b.extend(deliver(a, m).await);
            }
        }
    }

    async fn deliver(ch: &mut Channel, message: Message) -> Vec<Message> {
        match message {
            Message::Have(h) => ch.on_have(h).unwrap(),
            Message::Request(r) => vec![ch.on_request(r).await.unwrap()],
            Message::Data(d) => ch.on_data(d).unwrap(),
            Message::Unavailable(u) => ch.on_unavailable(u),
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn states_advance_through_handshake_and_have() {
        let source = owner(3).await;
        let copy = replica(&source, false).await;
        let mut server = Channel::new(0, source.clone());
        let mut client = Channel::new(0, copy.clone());
        assert_eq!(client.state(), ChannelState::Idle);

        let server_hs = handshake_of(server.open());
        let client_hs = handshake_of(client.open());
        assert_eq!(client.state(), ChannelState::Handshaking);

        let from_server = server.on_handshake(client_hs).unwrap();
        let from_client = client.on_handshake(server_hs).unwrap();
        assert_eq!(client.state(), ChannelState::Syncing);
        assert_eq!(copy.length(), 3);
        assert_eq!(copy.peer_count(), 1);

        let requests = client.on_have(have_of(&from_server[0])).unwrap();
        assert_eq!(client.state(), ChannelState::Streaming);
        assert_eq!(requests.len(), 3);
        assert_eq!(client.inflight(), 3);

        server.on_have(have_of(&from_client[0])).unwrap();
        pump(&mut server, &mut client, requests).await;
        assert_eq!(copy.downloaded(), 3);
        assert_eq!(client.inflight(), 0);
    }

    #[tokio::test]
    async fn sparse_channel_requests_only_wanted_blocks() {
        let source = owner(6).await;
        let copy = replica(&source, true).await;
        let mut server = Channel::new(0, source.clone());
        let mut client = Channel::new(0, copy.clone());
        let server_hs = handshake_of(server.open());
        let client_hs = handshake_of(client.open());
        let from_server = server.on_handshake(client_hs).unwrap();
        client.on_handshake(server_hs).unwrap();

        assert!(client.on_have(have_of(&from_server[0])).unwrap().is_empty());

        let waiting = {
            let copy = copy.clone();
            tokio::spawn(async move { copy.download(4..5).await })
        };
        tokio::task::yield_now().await;
        let requests = client.on_feed_changed();
        let asked: Vec<u64> = requests
            .iter()
            .filter_map(|m| match m {
                Message::Request(r) => Some(r.index),
                _ => None,
            })
            .collect();
        assert_eq!(asked, vec![4]);

        pump(&mut server, &mut client, requests).await;
        waiting.await.unwrap().unwrap();
        assert_eq!(copy.downloaded(), 1);
    }

    fn invalid(err: ReplicateError) -> bool {
        matches!(err, ReplicateError::Protocol(ProtocolError::InvalidMessage(_)))
    }

    #[tokio::test]
    async fn have_outside_signed_length_is_rejected() {
        let mut empty = Channel::new(0, owner(0).await);
        let huge = Have {
            ranges: vec![BlockRange {
                start: u64::MAX - 1,
                end: u64::MAX,
            }],
            root: None,
        };
        assert!(invalid(empty.on_have(huge).unwrap_err()));

        let source = owner(3).await;
        let root = source.root();
        let mut channel = Channel::new(0, replica(&source, false).await);
        let reversed = Have {
            ranges: vec![BlockRange { start: 2, end: 1 }],
            root: root.clone(),
        };
        assert!(invalid(channel.on_have(reversed).unwrap_err()));
        let too_long = Have {
            ranges: vec![BlockRange { start: 0, end: 4 }],
            root: root.clone(),
        };
        assert!(invalid(channel.on_have(too_long).unwrap_err()));

        let stranger = owner(5).await;
        let forged = Have {
            ranges: vec![BlockRange { start: 0, end: 5 }],
            root: stranger.root(),
        };
        assert!(matches!(
            channel.on_have(forged).unwrap_err(),
            ReplicateError::VerificationFailed(_)
        ));

        let fine = Have {
            ranges: vec![BlockRange { start: 0, end: 3 }],
            root,
        };
        channel.on_have(fine).unwrap();
        assert_eq!(channel.remote_have.runs(), vec![Run { start: 0, end: 3 }]);
    }

    #[tokio::test]
    async fn later_haves_carry_only_new_blocks() {
        let source = owner(4).await;
        let copy = replica(&source, false).await;
        let mut server = Channel::new(0, source.clone());
        let mut client = Channel::new(0, copy.clone());
        let server_hs = handshake_of(server.open());
        let client_hs = handshake_of(client.open());
        let from_server = server.on_handshake(client_hs).unwrap();
        let from_client = client.on_handshake(server_hs).unwrap();
        server.on_have(have_of(&from_client[0])).unwrap();
        let mut requests = client.on_have(have_of(&from_server[0])).unwrap().into_iter();
        assert_eq!(requests.len(), 4);

        let first = deliver(&mut server, requests.next().unwrap()).await;
        requests.next();
        let third = deliver(&mut server, requests.next().unwrap()).await;
        for data in first.into_iter().chain(third) {
            deliver(&mut client, data).await;
        }
        let update = client.on_feed_changed();
        assert_eq!(update.len(), 1);
        assert_eq!(
            have_of(&update[0]).ranges,
            vec![BlockRange { start: 0, end: 1 }, BlockRange { start: 2, end: 3 }]
        );
        server.on_have(have_of(&update[0])).unwrap();

        let fourth = deliver(&mut server, requests.next().unwrap()).await;
        deliver(&mut client, fourth.into_iter().next().unwrap()).await;
        let update = client.on_feed_changed();
        assert_eq!(
            have_of(&update[0]).ranges,
            vec![BlockRange { start: 3, end: 4 }]
        );
        server.on_have(have_of(&update[0])).unwrap();
        assert_eq!(
            server.remote_have.runs(),
            vec![Run { start: 0, end: 1 }, Run { start: 2, end: 4 }]
        );
        assert!(client.on_feed_changed().is_empty());
    }

    #[tokio::test]
    async fn missing_block_is_unavailable() {
        let source = owner(2).await;
        let copy = replica(&source, true).await;
        copy.adopt_root(source.root().unwrap()).unwrap();
        let mut channel = Channel::new(0, copy);
        let reply = channel
            .on_request(Request { index: 1, length: 2 })
            .await
            .unwrap();
        assert_eq!(reply, Message::Unavailable(Unavailable { index: 1 }));
    }

    #[tokio::test]
    async fn bad_block_fails_verification() {
        let source = owner(2).await;
        let copy = replica(&source, false).await;
        copy.adopt_root(source.root().unwrap()).unwrap();
        let mut channel = Channel::new(0, copy.clone());

        let proof = source.proof(0, 2).unwrap().unwrap();
        let err = channel
            .on_data(Data {
                index: 0,
                length: 2,
                data: b"forged".to_vec(),
                proof,
            })
            .unwrap_err();
        assert!(matches!(err, ReplicateError::VerificationFailed(_)));
        assert!(!copy.has(0));
    }

    #[tokio::test]
    async fn closed_feed_releases_slots() {
        let source = owner(4).await;
        let copy = replica(&source, false).await;
        let mut server = Channel::new(0, source.clone());
        let mut client = Channel::new(0, copy.clone());
        let server_hs = handshake_of(server.open());
        let client_hs = handshake_of(client.open());
        let from_server = server.on_handshake(client_hs).unwrap();
        client.on_handshake(server_hs).unwrap();
        client.on_have(have_of(&from_server[0])).unwrap();
        assert_eq!(client.inflight(), 4);

        copy.close().await.unwrap();
        assert!(client.on_feed_changed().is_empty());
        assert_eq!(client.state(), ChannelState::Closed);
        assert_eq!(client.inflight(), 0);
        assert_eq!(copy.peer_count(), 0);
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let source = owner(0).await;
        let mut channel = Channel::new(0, source.clone());
        let mut hs = handshake_of(channel.open());
        hs.version = PROTOCOL_VERSION + 1;
        let err = channel.on_handshake(hs).unwrap_err();
        assert!(matches!(
            err,
            ReplicateError::Protocol(ProtocolError::VersionMismatch { .. })
        ));
    }
}
