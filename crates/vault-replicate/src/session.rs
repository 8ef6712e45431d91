//! A replication session over one ordered byte stream.
//!
//! The session owns the stream. A reader task decodes frames into a queue
//! so that writing never waits on the peer draining its side; the session
//! task routes frames to channels, writes their replies, and reacts to
//! local feed changes.

use std::collections::{BTreeSet, HashMap};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vault_feed::Feed;
use vault_protocol::{
    read_frame, write_frame, ErrorMessage, Frame, Handshake, Message, ProtocolError,
    ProtocolResult,
};
use vault_types::Hash;

use crate::channel::{Channel, ChannelState};
use crate::error::{ReplicateError, ReplicateResult};

/// Channels one session multiplexes; ids are a single byte.
pub const MAX_CHANNELS: usize = 256;

enum Command {
    Attach {
        feed: Feed,
        reply: oneshot::Sender<ReplicateResult<()>>,
    },
    Close,
}

/// Control handle for a running session. Clones share the session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// Replicate `feed` over this session.
    ///
    /// Attaching a feed that is already attached is a no-op.
    pub async fn attach(&self, feed: Feed) -> ReplicateResult<()> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Attach { feed, reply })
            .map_err(|_| ReplicateError::SessionClosed)?;
        result.await.map_err(|_| ReplicateError::SessionClosed)?
    }

    /// Ask the session to end. Its task then resolves to `Ok(())`.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Whether the session task has finished.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Start replicating over `stream`.
///
/// The returned task resolves when the session ends: `Ok(())` after
/// [`SessionHandle::close`], `PeerDisconnected` when the stream ends first,
/// `VerificationFailed` when the peer sent data that did not verify, and
/// `RemoteError` when the peer ended the session with an error.
pub fn replicate<S>(stream: S) -> (SessionHandle, JoinHandle<ReplicateResult<()>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (frames_tx, frames) = mpsc::unbounded_channel();
    let reader = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    if frames_tx.send(Ok(frame)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = frames_tx.send(Err(e));
                    break;
                }
            }
        }
    });

    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (changes_tx, changes) = mpsc::unbounded_channel();
    let session = Session {
        writer,
        frames,
        commands,
        commands_open: true,
        changes_tx,
        changes,
        channels: Vec::new(),
        by_discovery: HashMap::new(),
        remote_to_local: HashMap::new(),
        stashed: HashMap::new(),
        forwarders: Vec::new(),
        reader,
    };
    let task = tokio::spawn(session.run());
    (SessionHandle { commands: commands_tx }, task)
}

struct Session<S> {
    writer: WriteHalf<S>,
    frames: mpsc::UnboundedReceiver<ProtocolResult<Frame>>,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    changes_tx: mpsc::UnboundedSender<u8>,
    changes: mpsc::UnboundedReceiver<u8>,
    /// Indexed by local channel id.
    channels: Vec<Channel>,
    by_discovery: HashMap<Hash, u8>,
    remote_to_local: HashMap<u8, u8>,
    /// Peer handshakes for feeds not attached here yet.
    stashed: HashMap<Hash, (u8, Handshake)>,
    forwarders: Vec<JoinHandle<()>>,
    reader: JoinHandle<()>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn run(mut self) -> ReplicateResult<()> {
        info!("replication session started");
        let result = self.serve().await;
        match &result {
            Ok(()) => info!("replication session closed"),
            Err(e @ (ReplicateError::VerificationFailed(_) | ReplicateError::Protocol(_))) => {
                warn!(error = %e, "ending replication session");
                let notice = Message::Error(ErrorMessage {
                    message: e.to_string(),
                });
                let _ = self.send(0, notice).await;
            }
            Err(e) => warn!(error = %e, "replication session failed"),
        }
        self.shutdown().await;
        result
    }

    async fn serve(&mut self) -> ReplicateResult<()> {
        loop {
            tokio::select! {
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(Command::Attach { feed, reply }) => {
                        if self.channels.len() >= MAX_CHANNELS
                            && !self.by_discovery.contains_key(&feed.discovery_key())
                        {
                            let _ = reply.send(Err(ReplicateError::ChannelLimit));
                            continue;
                        }
                        let _ = reply.send(Ok(()));
                        self.attach(feed).await?;
                    }
                    Some(Command::Close) => return Ok(()),
                    None => self.commands_open = false,
                },
                frame = self.frames.recv() => match frame {
                    Some(Ok(frame)) => self.on_frame(frame).await?,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(ReplicateError::PeerDisconnected),
                },
                Some(id) = self.changes.recv() => {
                    let mut changed = BTreeSet::from([id]);
                    while let Ok(id) = self.changes.try_recv() {
                        changed.insert(id);
                    }
                    for id in changed {
                        let replies = self.channels[usize::from(id)].on_feed_changed();
                        self.send_all(id, replies).await?;
                    }
                }
            }
        }
    }

    async fn attach(&mut self, feed: Feed) -> ReplicateResult<()> {
        let discovery_key = feed.discovery_key();
        if self.by_discovery.contains_key(&discovery_key) {
            debug!(feed = feed.name(), "feed already attached");
            return Ok(());
        }
        let id = u8::try_from(self.channels.len()).map_err(|_| ReplicateError::ChannelLimit)?;

        let mut channel = Channel::new(id, feed.clone());
        let handshake = channel.open();
        self.channels.push(channel);
        self.by_discovery.insert(discovery_key, id);
        let forwarder = self.forward_changes(id, &feed);
        self.forwarders.push(forwarder);
        info!(channel = id, feed = feed.name(), key = %feed.key(), "attached feed");
        self.send(id, handshake).await?;

        if let Some((remote, handshake)) = self.stashed.remove(&discovery_key) {
            self.on_handshake(remote, handshake).await?;
        }
        Ok(())
    }

    /// Turn every change of `feed` into a wakeup for channel `id`.
    fn forward_changes(&self, id: u8, feed: &Feed) -> JoinHandle<()> {
        let mut changes = feed.subscribe();
        let wake = self.changes_tx.clone();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                if wake.send(id).is_err() {
                    break;
                }
            }
        })
    }

    async fn on_frame(&mut self, frame: Frame) -> ReplicateResult<()> {
        let Frame { channel: remote, message } = frame;
        debug!(channel = remote, kind = message.type_name(), "received message");
        match message {
            Message::Handshake(handshake) => return self.on_handshake(remote, handshake).await,
            Message::Error(e) => return Err(ReplicateError::RemoteError(e.message)),
            _ => {}
        }

        let Some(local) = self.route(remote) else {
            debug!(channel = remote, "dropping message for unknown channel");
            return Ok(());
        };
        let channel = &mut self.channels[usize::from(local)];
        let replies = match message {
            Message::Have(have) => channel.on_have(have)?,
            Message::Request(request) => vec![channel.on_request(request).await?],
            Message::Data(data) => channel.on_data(data)?,
            Message::Unavailable(unavailable) => channel.on_unavailable(unavailable),
            // handled above
            Message::Handshake(_) | Message::Error(_) => Vec::new(),
        };
        self.send_all(local, replies).await
    }

    async fn on_handshake(&mut self, remote: u8, handshake: Handshake) -> ReplicateResult<()> {
        let Some(&local) = self.by_discovery.get(&handshake.discovery_key) else {
            if self.stashed.len() >= MAX_CHANNELS
                && !self.stashed.contains_key(&handshake.discovery_key)
            {
                return Err(ProtocolError::InvalidMessage(format!(
                    "more than {MAX_CHANNELS} handshakes for unattached feeds"
                ))
                .into());
            }
            debug!(channel = remote, "stashing handshake for unattached feed");
            self.stashed
                .insert(handshake.discovery_key, (remote, handshake));
            return Ok(());
        };
        self.remote_to_local.insert(remote, local);
        let replies = self.channels[usize::from(local)].on_handshake(handshake)?;
        self.send_all(local, replies).await
    }

    /// Local channel for a peer channel id, if it is mapped and open.
    fn route(&self, remote: u8) -> Option<u8> {
        let local = *self.remote_to_local.get(&remote)?;
        (self.channels[usize::from(local)].state() != ChannelState::Closed).then_some(local)
    }

    async fn send_all(&mut self, channel: u8, messages: Vec<Message>) -> ReplicateResult<()> {
        for message in messages {
            self.send(channel, message).await?;
        }
        Ok(())
    }

    async fn send(&mut self, channel: u8, message: Message) -> ReplicateResult<()> {
        debug!(channel, kind = message.type_name(), "sending message");
        write_frame(&mut self.writer, &Frame::new(channel, message))
            .await
            .map_err(|e| match e {
                ProtocolError::Io(_) => ReplicateError::PeerDisconnected,
                other => other.into(),
            })
    }

    async fn shutdown(&mut self) {
        for channel in &mut self.channels {
            channel.close();
        }
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
        self.reader.abort();
        let _ = self.writer.shutdown().await;
    }
}
