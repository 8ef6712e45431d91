use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};
use vault_crypto::tree::{self, flat, Node, Proof};
use vault_crypto::{FeedLink, PublicKey, SecretKey, SignedRoot};
use vault_store::{BlockStore, CachedBlockStore, Storage, StoreError};
use vault_types::Hash;

use crate::bitfield::{Bitfield, Run};
use crate::error::{FeedError, FeedResult};
use crate::options::{FeedHandle, FeedOptions, GetOptions};

const KEY_HEADER: &str = "key";
const SECRET_HEADER: &str = "secret_key";
const ROOT_HEADER: &str = "root";
const LINK_HEADER: &str = "link";
const DATA_STORE: &str = "data";
const TREE_STORE: &str = "tree";

#[derive(Default)]
struct FeedState {
    /// Latest trusted root; its length is the feed length.
    root: Option<SignedRoot>,
    /// Verified root offered by a peer but not yet adopted.
    pending_root: Option<SignedRoot>,
    have: Bitfield,
    /// Indices stored since open, in the order they arrived.
    stored: Vec<u64>,
    link: Option<FeedLink>,
    /// Wanted index -> number of pending downloads asking for it.
    wants: BTreeMap<u64, usize>,
    peers: usize,
    disconnects: u64,
    update_waiters: usize,
    closed: bool,
}

impl FeedState {
    fn length(&self) -> u64 {
        self.root.as_ref().map_or(0, |r| r.length)
    }
}

struct FeedInner {
    name: String,
    key: PublicKey,
    discovery_key: Hash,
    secret: Option<SecretKey>,
    options: FeedOptions,
    storage: Storage,
    blocks: CachedBlockStore,
    tree: CachedBlockStore,
    state: RwLock<FeedState>,
    append_lock: Mutex<()>,
    changes: watch::Sender<u64>,
}

/// A signed, append-only sequence of blocks.
///
/// Cloning is cheap and every clone refers to the same feed. The only way
/// to obtain one is [`Feed::open`], which returns after keys, the signed
/// root, and the local have-set are loaded from storage.
#[derive(Clone)]
pub struct Feed {
    inner: Arc<FeedInner>,
}

impl Feed {
    /// Open the feed stored under `name`.
    ///
    /// With no handle, an existing feed is reopened (writable if its secret
    /// key was stored) or a fresh keypair is generated. A supplied handle
    /// must name the same key as any feed already in storage.
    pub async fn open(
        storage: &Storage,
        name: &str,
        handle: Option<FeedHandle>,
        options: FeedOptions,
    ) -> FeedResult<Self> {
        let stored_key = match storage.read_header(name, KEY_HEADER)? {
            Some(bytes) => Some(
                PublicKey::from_slice(&bytes).map_err(|e| FeedError::corrupt("feed key", e))?,
            ),
            None => None,
        };
        let stored_secret = match storage.read_header(name, SECRET_HEADER)? {
            Some(bytes) => Some(
                SecretKey::from_slice(&bytes).map_err(|e| FeedError::corrupt("secret key", e))?,
            ),
            None => None,
        };

        let upgrade = |key: PublicKey| match &stored_secret {
            Some(secret) if secret.public_key() == key => FeedHandle::ReadWrite(secret.clone()),
            _ => FeedHandle::ReadOnly(key),
        };
        let handle = match (handle, stored_key) {
            (Some(supplied), Some(stored)) if supplied.public_key() != stored => {
                return Err(FeedError::KeyMismatch {
                    stored,
                    supplied: supplied.public_key(),
                });
            }
            (Some(FeedHandle::ReadOnly(key)), _) => upgrade(key),
            (Some(supplied), _) => supplied,
            (None, Some(stored)) => upgrade(stored),
            (None, None) => FeedHandle::ReadWrite(SecretKey::generate()),
        };
        let key = handle.public_key();

        if stored_key.is_none() {
            storage.write_header(name, KEY_HEADER, key.as_bytes())?;
        }
        if let Some(secret) = handle.secret() {
            if stored_secret.is_none() {
                storage.write_header(name, SECRET_HEADER, &secret.to_bytes())?;
            }
        }

        let raw_blocks = storage.open_blocks(name, DATA_STORE)?;
        let have = Bitfield::from_indices(raw_blocks.indices()?);
        let blocks = CachedBlockStore::new(raw_blocks, options.cache_size);
        let tree = CachedBlockStore::new(
            storage.open_blocks(name, TREE_STORE)?,
            options.tree_cache_size,
        );

        let root: Option<SignedRoot> = read_record(storage, name, ROOT_HEADER)?;
        if let Some(root) = &root {
            root.verify(&key)
                .map_err(|e| FeedError::corrupt("stored root", e))?;
        }
        let link: Option<FeedLink> = read_record(storage, name, LINK_HEADER)?;
        if let Some(link) = &link {
            link.verify(&key)
                .map_err(|e| FeedError::corrupt("stored link", e))?;
        }

        let length = root.as_ref().map_or(0, |r| r.length);
        let (changes, _) = watch::channel(0u64);
        let feed = Self {
            inner: Arc::new(FeedInner {
                name: name.to_string(),
                key,
                discovery_key: key.discovery_key(),
                secret: handle.secret().cloned(),
                options,
                storage: storage.clone(),
                blocks,
                tree,
                state: RwLock::new(FeedState {
                    root,
                    have,
                    link,
                    ..FeedState::default()
                }),
                append_lock: Mutex::new(()),
                changes,
            }),
        };

        info!(
            feed = name,
            key = %key,
            length,
            writable = feed.writable(),
            "feed opened"
        );
        Ok(feed)
    }

    // --- identity ---------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn key(&self) -> PublicKey {
        self.inner.key
    }

    pub fn discovery_key(&self) -> Hash {
        self.inner.discovery_key
    }

    pub fn writable(&self) -> bool {
        self.inner.secret.is_some()
    }

    pub fn sparse(&self) -> bool {
        self.inner.options.sparse
    }

    pub fn live(&self) -> bool {
        self.inner.options.live
    }

    // --- state ------------------------------------------------------------

    /// Trusted number of blocks.
    pub fn length(&self) -> u64 {
        self.state().length()
    }

    /// Trusted number of block bytes.
    pub fn byte_length(&self) -> u64 {
        self.state().root.as_ref().map_or(0, |r| r.byte_length())
    }

    /// Number of blocks stored locally.
    pub fn downloaded(&self) -> u64 {
        self.state().have.count()
    }

    pub fn has(&self, index: u64) -> bool {
        self.state().have.get(index)
    }

    /// Locally stored blocks as maximal runs.
    pub fn have_runs(&self) -> Vec<Run> {
        self.state().have.runs()
    }

    /// Position after the last block stored since open.
    pub fn stored_position(&self) -> usize {
        self.state().stored.len()
    }

    /// Blocks stored after position `from`, as runs, and the position to
    /// resume from.
    pub fn stored_since(&self, from: usize) -> (Vec<Run>, usize) {
        let state = self.state();
        let fresh = state.stored.get(from..).unwrap_or_default();
        (Run::coalesce(fresh.iter().copied()), state.stored.len())
    }

    pub fn root(&self) -> Option<SignedRoot> {
        self.state().root.clone()
    }

    pub fn link(&self) -> Option<FeedLink> {
        self.state().link.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Whether anyone is waiting for the trusted length to grow.
    pub fn update_pending(&self) -> bool {
        self.state().update_waiters > 0
    }

    /// Wanted indices that are still missing, ascending.
    pub fn wanted_missing(&self) -> Vec<u64> {
        let state = self.state();
        state
            .wants
            .keys()
            .copied()
            .filter(|i| !state.have.get(*i))
            .collect()
    }

    /// Up to `limit` missing indices below the trusted length that pass
    /// `accept`, ascending.
    pub fn missing(&self, limit: usize, mut accept: impl FnMut(u64) -> bool) -> Vec<u64> {
        let state = self.state();
        state
            .have
            .missing(state.length())
            .filter(|i| accept(*i))
            .take(limit)
            .collect()
    }

    /// A receiver that observes every state change of this feed.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    // --- writing ----------------------------------------------------------

    /// Append one block; returns its index.
    pub async fn append(&self, data: impl Into<Bytes>) -> FeedResult<u64> {
        let secret = self.inner.secret.as_ref().ok_or(FeedError::NotWritable)?;
        let data = data.into();
        let _guard = self.inner.append_lock.lock().await;
        self.ensure_open()?;

        let index = self.length();
        let mut flat_index = 2 * index;
        let mut node = tree::leaf(&data);
        let mut nodes = vec![(flat_index, node)];
        while !flat::is_left(flat_index) {
            let sibling_index = flat::sibling(flat_index);
            let sibling = self
                .node(sibling_index)?
                .ok_or_else(|| FeedError::corrupt("tree", format!("missing node {sibling_index}")))?;
            node = tree::parent(&sibling, &node);
            flat_index = flat::parent(flat_index);
            nodes.push((flat_index, node));
        }

        self.inner.blocks.put(index, data)?;
        for (i, n) in &nodes {
            self.put_node(*i, *n)?;
        }

        let length = index + 1;
        let peaks = self.peaks(length)?.ok_or_else(|| {
            FeedError::corrupt("tree", format!("missing peaks for length {length}"))
        })?;
        let root = SignedRoot::sign(secret, length, peaks);
        self.write_record(ROOT_HEADER, &root)?;

        {
            let mut state = self.state_mut();
            state.root = Some(root);
            state.have.set(index);
            state.stored.push(index);
        }
        self.notify();
        debug!(feed = %self.inner.name, index, "appended block");
        Ok(index)
    }

    /// Record the owner-signed pointer to a paired feed.
    pub fn set_link(&self, link: FeedLink) -> FeedResult<()> {
        link.verify(&self.inner.key)
            .map_err(|e| FeedError::verification(format!("link for {}: {e}", self.inner.name)))?;
        if self.state().link.as_ref() == Some(&link) {
            return Ok(());
        }
        self.write_record(LINK_HEADER, &link)?;
        self.state_mut().link = Some(link);
        self.notify();
        Ok(())
    }

    /// Sign a link from this feed to `linked`. Owner only.
    pub fn sign_link(&self, linked: PublicKey) -> FeedResult<FeedLink> {
        let secret = self.inner.secret.as_ref().ok_or(FeedError::NotWritable)?;
        Ok(FeedLink::sign(secret, linked))
    }

    /// Derive the secret key of a paired feed from this feed's secret.
    pub fn derive_secret(&self, context: &str) -> FeedResult<SecretKey> {
        let secret = self.inner.secret.as_ref().ok_or(FeedError::NotWritable)?;
        Ok(secret.derive(context))
    }

    // --- reading ----------------------------------------------------------

    /// Read block `index`.
    pub async fn get(&self, index: u64, opts: GetOptions) -> FeedResult<Bytes> {
        self.ensure_open()?;
        let length = self.length();
        if index >= length {
            return Err(FeedError::OutOfBounds { index, length });
        }
        if !self.has(index) {
            if !opts.wait {
                return Err(FeedError::BlockNotDownloaded { index });
            }
            self.download(index..index + 1).await?;
        }

        let data = match self.inner.blocks.get(index) {
            Ok(data) => data,
            Err(StoreError::NotFound(_)) => return Err(FeedError::BlockNotDownloaded { index }),
            Err(e) => return Err(e.into()),
        };
        if opts.verify && self.node(2 * index)? != Some(tree::leaf(&data)) {
            return Err(FeedError::verification(format!(
                "{} block {index}",
                self.inner.name
            )));
        }
        Ok(data)
    }

    /// Wait until every block in `range` is stored locally.
    ///
    /// Fails with `Closed` if the feed closes first, and with
    /// `PeerDisconnected` once every peer attached during the wait is gone.
    pub async fn download(&self, range: Range<u64>) -> FeedResult<()> {
        let mut changes = self.subscribe();
        let (missing, start_disconnects) = {
            let state = self.state();
            if state.closed {
                return Err(FeedError::Closed);
            }
            let missing: Vec<u64> = range.clone().filter(|i| !state.have.get(*i)).collect();
            (missing, state.disconnects)
        };
        if missing.is_empty() {
            return Ok(());
        }

        debug!(feed = %self.inner.name, start = range.start, end = range.end, blocks = missing.len(), "download requested");
        let _wants = WantGuard::register(self, missing);
        self.notify();

        loop {
            {
                let state = self.state();
                if state.closed {
                    return Err(FeedError::Closed);
                }
                if state.have.all(range.start, range.end) {
                    return Ok(());
                }
                if state.disconnects > start_disconnects && state.peers == 0 {
                    return Err(FeedError::PeerDisconnected);
                }
            }
            changes.changed().await.map_err(|_| FeedError::Closed)?;
        }
    }

    /// Wait until the trusted length reaches at least `length`.
    pub async fn wait_for_length(&self, length: u64) -> FeedResult<u64> {
        let mut changes = self.subscribe();
        let start_disconnects = self.state().disconnects;
        loop {
            {
                let state = self.state();
                if state.closed {
                    return Err(FeedError::Closed);
                }
                if state.length() >= length {
                    return Ok(state.length());
                }
                if state.disconnects > start_disconnects && state.peers == 0 {
                    return Err(FeedError::PeerDisconnected);
                }
            }
            changes.changed().await.map_err(|_| FeedError::Closed)?;
        }
    }

    /// Wait for the next increase of the trusted length; returns the new length.
    ///
    /// While an update is pending, roots announced by peers are adopted even
    /// if the feed is not live.
    pub async fn update(&self) -> FeedResult<u64> {
        let start = self.length();
        let _waiter = UpdateGuard::register(self);
        let pending = self.state_mut().pending_root.take();
        if let Some(root) = pending {
            self.adopt(root)?;
        }
        self.wait_for_length(start + 1).await
    }

    // --- replication ------------------------------------------------------

    /// Adopt a peer's signed root unconditionally (handshake time).
    pub fn adopt_root(&self, root: SignedRoot) -> FeedResult<bool> {
        self.adopt(root)
    }

    /// Offer a peer's newer signed root.
    ///
    /// Adopted if the feed is live or an update is pending; otherwise kept
    /// aside for the next [`update`](Self::update).
    pub fn offer_root(&self, root: SignedRoot) -> FeedResult<bool> {
        if self.writable() {
            return Ok(false);
        }
        if self.inner.options.live || self.update_pending() {
            return self.adopt(root);
        }
        self.verify_root(&root)?;
        let mut state = self.state_mut();
        let longer = |r: &SignedRoot| root.length > r.length;
        if root.length > state.length() && state.pending_root.as_ref().map_or(true, longer) {
            state.pending_root = Some(root);
        }
        Ok(false)
    }

    /// Inclusion proof for block `index` against the root at `length`.
    ///
    /// `None` when the block or a needed tree node is not held locally.
    pub fn proof(&self, index: u64, length: u64) -> FeedResult<Option<Proof>> {
        if length > self.length() || !self.has(index) {
            return Ok(None);
        }
        let failure = RefCell::new(None);
        let proof = tree::build_proof(index, length, |i| match self.node(i) {
            Ok(node) => node,
            Err(e) => {
                failure.borrow_mut().get_or_insert(e);
                None
            }
        });
        match failure.into_inner() {
            Some(e) => Err(e),
            None => Ok(proof),
        }
    }

    /// Store a block received from a peer after verifying its proof.
    ///
    /// Returns `false` when the block was already present or `length` is
    /// not a length this feed can check against.
    pub fn put_verified(
        &self,
        index: u64,
        data: Bytes,
        proof: &Proof,
        length: u64,
    ) -> FeedResult<bool> {
        self.ensure_open()?;
        if self.has(index) {
            return Ok(false);
        }
        let Some(root) = self.root_at(length)? else {
            debug!(feed = %self.inner.name, index, length, "no trusted root for proof length");
            return Ok(false);
        };
        let learned = tree::verify_proof(index, &data, proof, length, &root).ok_or_else(|| {
            FeedError::verification(format!("{} block {index}", self.inner.name))
        })?;

        for (i, node) in learned {
            self.put_node(i, node)?;
        }
        self.inner.blocks.put(index, data)?;
        {
            let mut state = self.state_mut();
            if state.have.set(index) {
                state.stored.push(index);
            }
        }
        self.notify();
        debug!(feed = %self.inner.name, index, "stored verified block");
        Ok(true)
    }

    /// Count a connected peer.
    pub fn attach_peer(&self) {
        self.state_mut().peers += 1;
        self.notify();
    }

    /// Drop a connected peer; waiters fail once none remain.
    pub fn detach_peer(&self) {
        {
            let mut state = self.state_mut();
            state.peers = state.peers.saturating_sub(1);
            state.disconnects += 1;
        }
        self.notify();
    }

    pub fn peer_count(&self) -> usize {
        self.state().peers
    }

    /// Close the feed. Pending downloads and updates fail with `Closed`.
    pub async fn close(&self) -> FeedResult<()> {
        let _guard = self.inner.append_lock.lock().await;
        {
            let mut state = self.state_mut();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }
        self.notify();
        self.inner.blocks.flush()?;
        self.inner.tree.flush()?;
        info!(feed = %self.inner.name, length = self.length(), "feed closed");
        Ok(())
    }

    // --- internals --------------------------------------------------------

    fn state(&self) -> std::sync::RwLockReadGuard<'_, FeedState> {
        self.inner.state.read().expect("lock poisoned")
    }

    fn state_mut(&self) -> std::sync::RwLockWriteGuard<'_, FeedState> {
        self.inner.state.write().expect("lock poisoned")
    }

    fn notify(&self) {
        self.inner.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    fn ensure_open(&self) -> FeedResult<()> {
        if self.state().closed {
            return Err(FeedError::Closed);
        }
        Ok(())
    }

    fn node(&self, index: u64) -> FeedResult<Option<Node>> {
        match self.inner.tree.read(index)? {
            Some(bytes) => Node::from_bytes(&bytes)
                .map(Some)
                .ok_or_else(|| FeedError::corrupt("tree", format!("node {index}"))),
            None => Ok(None),
        }
    }

    fn put_node(&self, index: u64, node: Node) -> FeedResult<()> {
        match self
            .inner
            .tree
            .put(index, Bytes::copy_from_slice(&node.to_bytes()))
        {
            Ok(()) => Ok(()),
            Err(StoreError::Conflict { .. }) => Err(FeedError::verification(format!(
                "{} tree node {index}",
                self.inner.name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Peaks for `length` from stored nodes, if all are present.
    fn peaks(&self, length: u64) -> FeedResult<Option<Vec<Node>>> {
        let mut peaks = Vec::new();
        for index in flat::full_roots(length) {
            match self.node(index)? {
                Some(node) => peaks.push(node),
                None => return Ok(None),
            }
        }
        Ok(Some(peaks))
    }

    /// Trusted root hash for any length up to the current one.
    ///
    /// Stored nodes were all produced locally or verified, so older roots
    /// are recomputed from them.
    fn root_at(&self, length: u64) -> FeedResult<Option<Hash>> {
        {
            let state = self.state();
            if length > state.length() {
                return Ok(None);
            }
            if let Some(root) = state.root.as_ref().filter(|r| r.length == length) {
                return Ok(Some(root.root_hash()));
            }
        }
        Ok(self.peaks(length)?.map(|peaks| tree::root_hash(&peaks)))
    }

    /// Check that `root` was signed by this feed's owner.
    pub fn verify_root(&self, root: &SignedRoot) -> FeedResult<()> {
        root.verify(&self.inner.key).map_err(|e| {
            FeedError::verification(format!("signed root for {}: {e}", self.inner.name))
        })
    }

    fn adopt(&self, root: SignedRoot) -> FeedResult<bool> {
        if self.writable() {
            return Ok(false);
        }
        self.ensure_open()?;
        self.verify_root(&root)?;
        if root.length <= self.length() {
            return Ok(false);
        }

        for (index, peak) in root.peak_indices().into_iter().zip(root.peaks.iter()) {
            self.put_node(index, *peak)?;
        }
        self.write_record(ROOT_HEADER, &root)?;

        let length = root.length;
        {
            let mut state = self.state_mut();
            if state
                .pending_root
                .as_ref()
                .is_some_and(|p| p.length <= length)
            {
                state.pending_root = None;
            }
            state.root = Some(root);
        }
        self.notify();
        info!(feed = %self.inner.name, length, "adopted signed root");
        Ok(true)
    }

    fn write_record<T: Serialize>(&self, header: &str, value: &T) -> FeedResult<()> {
        let bytes = bincode::serialize(value).map_err(|e| FeedError::corrupt(header, e))?;
        self.inner
            .storage
            .write_header(&self.inner.name, header, &bytes)?;
        Ok(())
    }
}

fn read_record<T: DeserializeOwned>(
    storage: &Storage,
    feed: &str,
    header: &str,
) -> FeedResult<Option<T>> {
    match storage.read_header(feed, header)? {
        Some(bytes) => bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| FeedError::corrupt(header, e)),
        None => Ok(None),
    }
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("name", &self.inner.name)
            .field("key", &self.inner.key)
            .field("length", &self.length())
            .field("writable", &self.writable())
            .finish()
    }
}

/// Registers wanted indices for the lifetime of a download future.
struct WantGuard {
    feed: Feed,
    indices: Vec<u64>,
}

impl WantGuard {
    fn register(feed: &Feed, indices: Vec<u64>) -> Self {
        {
            let mut state = feed.state_mut();
            for i in &indices {
                *state.wants.entry(*i).or_insert(0) += 1;
            }
        }
        Self {
            feed: feed.clone(),
            indices,
        }
    }
}

impl Drop for WantGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.feed.inner.state.write() {
            for i in &self.indices {
                if let Some(count) = state.wants.get_mut(i) {
                    *count -= 1;
                    if *count == 0 {
                        state.wants.remove(i);
                    }
                }
            }
        }
    }
}

/// Marks an `update()` call as pending while it is alive.
struct UpdateGuard {
    feed: Feed,
}

impl UpdateGuard {
    fn register(feed: &Feed) -> Self {
        feed.state_mut().update_waiters += 1;
        Self { feed: feed.clone() }
    }
}

impl Drop for UpdateGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.feed.inner.state.write() {
            state.update_waiters = state.update_waiters.saturating_sub(1);
        }
    }
}
