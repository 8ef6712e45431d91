use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use vault_crypto::PublicKey;
use vault_feed::{Feed, FeedHandle, GetOptions};
use vault_meta::path::{ancestors, is_root};
use vault_meta::{normalize, Entry, MetaError, MetadataIndex, Resolved};
use vault_replicate::{ReplicateError, SessionHandle};
use vault_store::Storage;
use vault_types::Hash;

use crate::checkout::Checkout;
use crate::config::DriveOptions;
use crate::content::ContentLog;
use crate::error::{DriveError, DriveResult};

const METADATA_FEED: &str = "metadata";
const CONTENT_FEED: &str = "content";
const CONTENT_KEY_CONTEXT: &str = "vault 2024 content feed key v1";
const EVENT_CAPACITY: usize = 64;

/// Something that happened to a drive outside of any call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriveEvent {
    /// The content feed is open; file bytes can be read.
    ContentReady,
    /// A replication session lost its peer.
    PeerDisconnected,
    /// A replication session or background task failed.
    Error(String),
}

/// Options for reading a file.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadOptions {
    /// Fail with `Block not downloaded` instead of fetching missing content.
    pub cached: bool,
}

impl ReadOptions {
    pub fn cached() -> Self {
        Self { cached: true }
    }
}

/// What a path resolves to at some version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stat {
    pub path: String,
    pub mode: u32,
    /// File size in bytes; 0 for directories.
    pub size: u64,
    /// Content blocks holding the file.
    pub blocks: u64,
    /// First content block of the file.
    pub offset: u64,
    /// Byte offset of the file within the content feed.
    pub byte_offset: u64,
    /// Milliseconds since the Unix epoch.
    pub mtime: i64,
    /// Metadata block that produced this entry.
    pub entry: Option<u64>,
    directory: bool,
}

impl Stat {
    pub fn is_file(&self) -> bool {
        !self.directory
    }

    pub fn is_directory(&self) -> bool {
        self.directory
    }

    fn from_resolved(resolved: Resolved) -> Self {
        let range = resolved.entry.content().copied().unwrap_or_default();
        Self {
            mode: resolved.entry.mode(),
            directory: resolved.entry.is_directory(),
            size: range.byte_length,
            blocks: range.block_count,
            offset: range.start_block,
            byte_offset: range.byte_offset,
            mtime: resolved.entry.mtime,
            entry: resolved.index,
            path: resolved.entry.path,
        }
    }
}

struct DriveInner {
    storage: Storage,
    options: DriveOptions,
    metadata: Feed,
    content: watch::Sender<Option<ContentLog>>,
    index: Mutex<MetadataIndex>,
    /// Pairs each content append with its metadata entry.
    write_lock: tokio::sync::Mutex<()>,
    sessions: Mutex<Vec<SessionHandle>>,
    events: broadcast::Sender<DriveEvent>,
}

/// A versioned file tree stored in a metadata feed and a content feed.
///
/// Cloning is cheap; clones share the same feeds.
#[derive(Clone)]
pub struct Drive {
    inner: Arc<DriveInner>,
}

impl Drive {
    /// Open the drive in `storage`.
    ///
    /// With no key, the drive already in storage is reopened, or a new one
    /// is created. A replica (a key without its secret) opens its content
    /// feed once the owner's link arrives over replication; see
    /// [`content_ready`](Self::content_ready).
    pub async fn open(
        storage: Storage,
        key: Option<PublicKey>,
        options: DriveOptions,
    ) -> DriveResult<Self> {
        let handle = match (options.secret()?, key) {
            (Some(secret), Some(key)) if secret.public_key() != key => {
                return Err(DriveError::InvalidKeypair(format!(
                    "secret key belongs to {}, not {key}",
                    secret.public_key()
                )));
            }
            (Some(secret), _) => Some(FeedHandle::ReadWrite(secret)),
            (None, Some(key)) => Some(FeedHandle::ReadOnly(key)),
            (None, None) => None,
        };

        let metadata = Feed::open(
            &storage,
            METADATA_FEED,
            handle,
            options.metadata_feed_options(),
        )
        .await?;

        let content = if metadata.writable() {
            Some(open_owned_content(&storage, &metadata, &options).await?)
        } else if let Some(link) = metadata.link() {
            let feed = Feed::open(
                &storage,
                CONTENT_FEED,
                Some(FeedHandle::ReadOnly(link.key)),
                options.content_feed_options(),
            )
            .await?;
            Some(ContentLog::new(feed))
        } else {
            None
        };
        let waiting_for_link = content.is_none();

        let (content, _) = watch::channel(content);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let drive = Self {
            inner: Arc::new(DriveInner {
                storage,
                options,
                metadata,
                content,
                index: Mutex::new(MetadataIndex::new()),
                write_lock: tokio::sync::Mutex::new(()),
                sessions: Mutex::new(Vec::new()),
                events,
            }),
        };
        if waiting_for_link {
            watch_link(Arc::downgrade(&drive.inner));
        }

        info!(
            key = %drive.key(),
            writable = drive.writable(),
            version = drive.version(),
            storage = ?drive.inner.storage,
            "drive opened"
        );
        Ok(drive)
    }

    /// Open the drive stored in directory `path`.
    pub async fn open_dir(
        path: impl AsRef<Path>,
        key: Option<PublicKey>,
        options: DriveOptions,
    ) -> DriveResult<Self> {
        let storage = Storage::directory(path.as_ref())?;
        Self::open(storage, key, options).await
    }

    pub fn key(&self) -> PublicKey {
        self.inner.metadata.key()
    }

    pub fn discovery_key(&self) -> Hash {
        self.inner.metadata.discovery_key()
    }

    pub fn writable(&self) -> bool {
        self.inner.metadata.writable()
    }

    /// The drive version: the number of metadata entries.
    pub fn version(&self) -> u64 {
        self.inner.metadata.length()
    }

    pub fn metadata(&self) -> &Feed {
        &self.inner.metadata
    }

    /// The content log, once known.
    pub fn content(&self) -> Option<ContentLog> {
        self.inner.content.borrow().clone()
    }

    pub fn options(&self) -> &DriveOptions {
        &self.inner.options
    }

    /// Wait until the content feed is open.
    pub async fn content_ready(&self) -> DriveResult<ContentLog> {
        let mut content = self.inner.content.subscribe();
        let mut metadata = self.inner.metadata.subscribe();
        loop {
            let current = content.borrow_and_update().clone();
            if let Some(log) = current {
                return Ok(log);
            }
            if self.inner.metadata.is_closed() {
                return Err(DriveError::Closed);
            }
            tokio::select! {
                changed = content.changed() => changed.map_err(|_| DriveError::Closed)?,
                changed = metadata.changed() => changed.map_err(|_| DriveError::Closed)?,
            }
        }
    }

    /// Wait for the next version published by the owner; returns it.
    pub async fn update(&self) -> DriveResult<u64> {
        Ok(self.inner.metadata.update().await?)
    }

    pub fn events(&self) -> broadcast::Receiver<DriveEvent> {
        self.inner.events.subscribe()
    }

    /// A read-only view of the tree as of `version`.
    pub fn checkout(&self, version: u64) -> Checkout {
        Checkout::new(self.clone(), version)
    }

    // --- writing ----------------------------------------------------------

    /// Create or replace the file at `path`.
    pub async fn write_file(&self, path: &str, data: impl Into<Bytes>) -> DriveResult<u64> {
        let path = normalize(path);
        let _guard = self.inner.write_lock.lock().await;
        let content = self.owned_content()?;
        self.check_ancestors(&path).await?;
        if let Some(existing) = self.lookup(&path).await? {
            if existing.entry.is_directory() {
                return Err(DriveError::IsADirectory(path));
            }
        }
        let range = content.append(data.into()).await?;
        self.append_entry(Entry::file(&path, range)).await
    }

    /// Remove the file at `path`.
    pub async fn unlink(&self, path: &str) -> DriveResult<u64> {
        let path = normalize(path);
        let _guard = self.inner.write_lock.lock().await;
        self.owned_content()?;
        let existing = self.resolve_at(&path, self.version()).await?;
        if existing.entry.is_directory() {
            return Err(DriveError::IsADirectory(path));
        }
        self.append_entry(Entry::delete(&path)).await
    }

    /// Remove the directory at `path` along with everything below it.
    pub async fn rmdir(&self, path: &str) -> DriveResult<u64> {
        let path = normalize(path);
        let _guard = self.inner.write_lock.lock().await;
        self.owned_content()?;
        if is_root(&path) {
            return Err(DriveError::IsADirectory(path));
        }
        let existing = self.resolve_at(&path, self.version()).await?;
        if !existing.entry.is_directory() {
            return Err(DriveError::NotADirectory(path));
        }
        self.append_entry(Entry::delete(&path)).await
    }

    /// Create a directory at `path`.
    pub async fn mkdir(&self, path: &str) -> DriveResult<u64> {
        let path = normalize(path);
        let _guard = self.inner.write_lock.lock().await;
        self.owned_content()?;
        self.check_ancestors(&path).await?;
        if self.lookup(&path).await?.is_some() {
            return Err(DriveError::AlreadyExists(path));
        }
        self.append_entry(Entry::directory(&path)).await
    }

    // --- reading ----------------------------------------------------------

    pub async fn read_file(&self, path: &str) -> DriveResult<Bytes> {
        self.read_file_with(path, ReadOptions::default()).await
    }

    pub async fn read_file_with(&self, path: &str, opts: ReadOptions) -> DriveResult<Bytes> {
        self.read_file_at(path, self.version(), opts).await
    }

    pub async fn readdir(&self, path: &str) -> DriveResult<Vec<String>> {
        self.readdir_at(path, self.version()).await
    }

    pub async fn stat(&self, path: &str) -> DriveResult<Stat> {
        self.stat_at(path, self.version()).await
    }

    /// Succeeds if `path` exists.
    pub async fn access(&self, path: &str) -> DriveResult<()> {
        self.resolve_at(path, self.version()).await.map(|_| ())
    }

    /// Every metadata entry below `version`, with its index.
    pub async fn history(&self, version: u64) -> DriveResult<Vec<(u64, Entry)>> {
        self.ensure_indexed(version).await?;
        Ok(self
            .index()
            .entries()
            .take_while(|(i, _)| *i < version)
            .map(|(i, e)| (i, e.clone()))
            .collect())
    }

    pub(crate) async fn read_file_at(
        &self,
        path: &str,
        version: u64,
        opts: ReadOptions,
    ) -> DriveResult<Bytes> {
        let resolved = self.resolve_at(path, version).await?;
        let Some(range) = resolved.entry.content().copied() else {
            return Err(DriveError::IsADirectory(resolved.entry.path));
        };
        let content = match self.content() {
            Some(content) => content,
            None if opts.cached => {
                return Err(vault_feed::FeedError::BlockNotDownloaded {
                    index: range.start_block,
                }
                .into())
            }
            None => self.content_ready().await?,
        };
        content.read(&range, opts.cached).await
    }

    pub(crate) async fn readdir_at(&self, path: &str, version: u64) -> DriveResult<Vec<String>> {
        self.ensure_indexed(version).await?;
        Ok(self.index().readdir(path, version)?)
    }

    pub(crate) async fn stat_at(&self, path: &str, version: u64) -> DriveResult<Stat> {
        self.resolve_at(path, version).await.map(Stat::from_resolved)
    }

    pub(crate) async fn resolve_at(&self, path: &str, version: u64) -> DriveResult<Resolved> {
        self.ensure_indexed(version).await?;
        Ok(self.index().resolve(path, version)?)
    }

    /// Live files at `version`.
    pub(crate) async fn files_at(&self, version: u64) -> DriveResult<Vec<Resolved>> {
        self.ensure_indexed(version).await?;
        Ok(self.index().files(version)?)
    }

    /// Make sure every metadata entry below `version` is indexed,
    /// downloading missing ones.
    pub(crate) async fn ensure_indexed(&self, version: u64) -> DriveResult<()> {
        let latest = self.version();
        if version > latest {
            return Err(DriveError::VersionOutOfRange { version, latest });
        }
        let missing = self.index().missing(version);
        let (Some(&first), Some(&last)) = (missing.first(), missing.last()) else {
            return Ok(());
        };
        self.inner.metadata.download(first..last + 1).await?;
        for index in missing {
            let block = self.inner.metadata.get(index, GetOptions::cached()).await?;
            let entry = Entry::decode(&block)?;
            self.index().insert(index, entry);
        }
        debug!(version, "metadata indexed");
        Ok(())
    }

    async fn lookup(&self, path: &str) -> DriveResult<Option<Resolved>> {
        match self.resolve_at(path, self.version()).await {
            Ok(resolved) => Ok(Some(resolved)),
            Err(DriveError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `NotADirectory` when an ancestor of `path` is a live file.
    async fn check_ancestors(&self, path: &str) -> DriveResult<()> {
        let version = self.version();
        self.ensure_indexed(version).await?;
        let index = self.index();
        for ancestor in ancestors(path) {
            match index.resolve(ancestor, version) {
                Ok(found) if found.entry.is_file() => {
                    return Err(DriveError::NotADirectory(ancestor.to_string()))
                }
                Ok(_) | Err(MetaError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn owned_content(&self) -> DriveResult<ContentLog> {
        if !self.writable() {
            return Err(DriveError::NotWritable);
        }
        self.content().ok_or(DriveError::NotWritable)
    }

    async fn append_entry(&self, entry: Entry) -> DriveResult<u64> {
        let index = self.inner.metadata.append(entry.encode()?).await?;
        debug!(index, path = %entry.path, "appended metadata entry");
        self.index().insert(index, entry);
        Ok(index + 1)
    }

    fn index(&self) -> MutexGuard<'_, MetadataIndex> {
        self.inner.index.lock().expect("lock poisoned")
    }

    // --- replication ------------------------------------------------------

    /// Replicate this drive with a peer over `stream`.
    ///
    /// Failures of the session are published as [`DriveEvent`]s.
    pub async fn replicate<S>(&self, stream: S) -> DriveResult<SessionHandle>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.inner.metadata.is_closed() {
            return Err(DriveError::Closed);
        }
        let (session, task) = vault_replicate::replicate(stream);
        {
            let mut sessions = self.inner.sessions.lock().expect("lock poisoned");
            sessions.retain(|s| !s.is_closed());
            sessions.push(session.clone());
        }
        session.attach(self.inner.metadata.clone()).await?;
        if let Some(content) = self.content() {
            session.attach(content.feed().clone()).await?;
        }

        let events = self.inner.events.clone();
        let key = self.key();
        tokio::spawn(async move {
            match task.await {
                Ok(Ok(())) => debug!(drive = %key, "replication session closed"),
                Ok(Err(ReplicateError::PeerDisconnected)) => {
                    info!(drive = %key, "peer disconnected");
                    let _ = events.send(DriveEvent::PeerDisconnected);
                }
                Ok(Err(e)) => {
                    warn!(drive = %key, error = %e, "replication failed");
                    let _ = events.send(DriveEvent::Error(e.to_string()));
                }
                Err(e) => {
                    warn!(drive = %key, error = %e, "replication task aborted");
                    let _ = events.send(DriveEvent::Error(e.to_string()));
                }
            }
        });
        Ok(session)
    }

    /// End all sessions and close both feeds.
    pub async fn close(&self) -> DriveResult<()> {
        let sessions = std::mem::take(&mut *self.inner.sessions.lock().expect("lock poisoned"));
        for session in sessions {
            session.close();
        }
        self.inner.metadata.close().await?;
        if let Some(content) = self.content() {
            content.feed().close().await?;
        }
        info!(key = %self.key(), "drive closed");
        Ok(())
    }
}

impl std::fmt::Debug for Drive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drive")
            .field("key", &self.key())
            .field("writable", &self.writable())
            .field("version", &self.version())
            .finish()
    }
}

/// Open the owner's content feed and make sure the metadata feed links it.
async fn open_owned_content(
    storage: &Storage,
    metadata: &Feed,
    options: &DriveOptions,
) -> DriveResult<ContentLog> {
    let secret = metadata.derive_secret(CONTENT_KEY_CONTEXT)?;
    let content_key = secret.public_key();
    let feed = Feed::open(
        storage,
        CONTENT_FEED,
        Some(FeedHandle::ReadWrite(secret)),
        options.content_feed_options(),
    )
    .await?;
    if metadata.link().map(|l| l.key) != Some(content_key) {
        metadata.set_link(metadata.sign_link(content_key)?)?;
    }
    Ok(ContentLog::new(feed))
}

/// Open a replica's content feed as soon as the metadata feed learns the
/// owner's link, and attach it to every running session.
fn watch_link(drive: Weak<DriveInner>) {
    let Some(mut changes) = drive.upgrade().map(|inner| inner.metadata.subscribe()) else {
        return;
    };
    tokio::spawn(async move {
        loop {
            let Some(inner) = drive.upgrade() else {
                return;
            };
            if inner.metadata.is_closed() {
                return;
            }
            if let Some(link) = inner.metadata.link() {
                let opened = Feed::open(
                    &inner.storage,
                    CONTENT_FEED,
                    Some(FeedHandle::ReadOnly(link.key)),
                    inner.options.content_feed_options(),
                )
                .await;
                match opened {
                    Ok(feed) => install_content(&inner, ContentLog::new(feed)).await,
                    Err(e) => {
                        warn!(error = %e, "failed to open content feed");
                        let _ = inner.events.send(DriveEvent::Error(e.to_string()));
                    }
                }
                return;
            }
            drop(inner);
            if changes.changed().await.is_err() {
                return;
            }
        }
    });
}

async fn install_content(inner: &DriveInner, content: ContentLog) {
    if inner.metadata.is_closed() {
        let _ = content.feed().close().await;
        return;
    }
    inner.content.send_replace(Some(content.clone()));
    let sessions = inner.sessions.lock().expect("lock poisoned").clone();
    for session in sessions {
        if let Err(e) = session.attach(content.feed().clone()).await {
            debug!(error = %e, "session ended before content attached");
        }
    }
    info!(key = %content.feed().key(), "content feed ready");
    let _ = inner.events.send(DriveEvent::ContentReady);
}
