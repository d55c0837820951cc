//! The authenticated append-only log.
//!
//! A [`Feed`] is identified by a [`PublicKey`]. Whoever holds the matching [`SecretKey`] can
//! append entries; everyone else can read and verify them. Every entry is a leaf of a Merkle
//! tree (see [`flat_tree`]), and the writer signs the root of that tree after each append. A
//! [`SignedHead`] together with a [`Proof`] is enough to verify any single entry without
//! fetching the rest of the feed.
//!
//! Feeds are cheap to clone, all clones share the same state.

use std::{
    collections::BTreeMap,
    ops::Range,
    sync::{Arc, RwLock},
    time::Duration,
};

use bytes::Bytes;
use feedbee_base::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use self::{
    bitfield::Bitfield,
    store::{FeedMeta, FeedStore, Locator},
};
use crate::storage::{StorageError, StorageProvider};

mod bitfield;
pub mod flat_tree;
pub mod merkle;
mod store;
mod stream;

pub use self::{
    merkle::{Proof, SignedHead, VerifyError},
    stream::{ReadStream, ReadStreamOptions},
};

/// Errors returned by [`Feed`] operations.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum FeedError {
    /// Key material is malformed or does not belong to this feed.
    #[snafu(display("invalid key: {reason}"))]
    InvalidKey { reason: String },
    /// The feed has no secret key.
    #[snafu(display("feed is not writable"))]
    NotWritable {},
    /// The entry is neither local nor delivered by a peer in time.
    #[snafu(display("entry {index} is not available"))]
    NotAvailable { index: u64 },
    /// The entry is past the end of the feed.
    #[snafu(display("entry {index} is out of range for length {length}"))]
    OutOfRange { index: u64, length: u64 },
    /// Received data did not verify.
    #[snafu(display("integrity check failed"))]
    Integrity { source: VerifyError },
    /// The storage backend failed.
    #[snafu(transparent)]
    Storage { source: StorageError },
    /// The feed was closed.
    #[snafu(display("feed is closed"))]
    Closed {},
    /// The feed grew while a conditional append was prepared.
    #[snafu(display("expected length {expected}, found {actual}"))]
    LengthMismatch { expected: u64, actual: u64 },
}

/// Tunables of a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedOptions {
    /// How long [`Feed::get`] waits for a missing entry.
    #[serde(with = "humantime_serde")]
    pub get_timeout: Duration,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            get_timeout: Duration::from_secs(5),
        }
    }
}

/// An entry together with its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Sequence number.
    pub index: u64,
    /// Entry bytes.
    pub data: Bytes,
}

/// Builder for a [`Feed`].
///
/// Without any key material a new key pair is generated.
#[derive(Debug, Default)]
pub struct FeedBuilder {
    secret_key: Option<SecretKey>,
    public_key: Option<PublicKey>,
    public_key_bytes: Option<Vec<u8>>,
    options: FeedOptions,
}

impl FeedBuilder {
    /// Makes the feed writable.
    pub fn secret_key(mut self, secret_key: SecretKey) -> Self {
        self.secret_key = Some(secret_key);
        self
    }

    /// Opens the feed with this identity.
    pub fn public_key(mut self, public_key: PublicKey) -> Self {
        self.public_key = Some(public_key);
        self
    }

    /// Like [`Self::public_key`] but from raw bytes, validated on [`Self::open`].
    pub fn public_key_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.public_key_bytes = Some(bytes.into());
        self
    }

    /// Sets all options.
    pub fn options(mut self, options: FeedOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets [`FeedOptions::get_timeout`].
    pub fn get_timeout(mut self, timeout: Duration) -> Self {
        self.options.get_timeout = timeout;
        self
    }

    /// Loads or initialises the feed in `provider`.
    ///
    /// Fails with [`FeedError::InvalidKey`] on malformed or mismatched key material and with
    /// [`FeedError::Storage`] if the stored metadata is unreadable.
    pub async fn open<P: StorageProvider + ?Sized>(self, provider: &P) -> Result<Feed, FeedError> {
        let public_key = match (self.public_key, self.public_key_bytes) {
            (Some(key), _) => Some(key),
            (None, Some(bytes)) => Some(PublicKey::try_from(bytes.as_slice()).map_err(|err| {
                InvalidKeySnafu {
                    reason: err.to_string(),
                }
                .build()
            })?),
            (None, None) => None,
        };
        let mut secret_key = self.secret_key;
        let key = match (public_key, &secret_key) {
            (Some(key), Some(secret)) => {
                ensure!(
                    secret.public() == key,
                    InvalidKeySnafu {
                        reason: "secret key does not match public key"
                    }
                );
                key
            }
            (Some(key), None) => key,
            (None, Some(secret)) => secret.public(),
            (None, None) => {
                let secret = SecretKey::generate(&mut rand::rngs::OsRng);
                let key = secret.public();
                secret_key = Some(secret);
                key
            }
        };

        let store = FeedStore::open(provider, &key.to_hex()).await?;
        let (secret_key, head) = match store.read_meta().await? {
            Some(meta) => {
                ensure!(
                    meta.public_key == key,
                    InvalidKeySnafu {
                        reason: format!("storage holds feed {}", meta.public_key.fmt_short())
                    }
                );
                if let Some(head) = &meta.head {
                    head.verify(&key).map_err(|err| {
                        crate::storage::CorruptSnafu {
                            region: "meta",
                            reason: err.to_string(),
                        }
                        .build()
                    })?;
                }
                match (secret_key, meta.secret_key) {
                    (Some(secret), None) => {
                        let meta = FeedMeta::new(key, Some(secret.clone()), meta.head);
                        store.write_meta(&meta).await?;
                        (Some(secret), meta.head)
                    }
                    (Some(secret), Some(_)) => (Some(secret), meta.head),
                    (None, stored) => (stored, meta.head),
                }
            }
            None => {
                store
                    .write_meta(&FeedMeta::new(key, secret_key.clone(), None))
                    .await?;
                store.sync().await?;
                (secret_key, None)
            }
        };
        if let Some(secret) = &secret_key {
            ensure!(
                secret.public() == key,
                InvalidKeySnafu {
                    reason: "stored secret key does not match public key"
                }
            );
        }

        let length = head.map(|h| h.length).unwrap_or(0);
        let mut bitfield = Bitfield::default();
        for (index, locator) in store.read_locators(length).await?.into_iter().enumerate() {
            if locator.is_some() {
                bitfield.set(index as u64);
            }
        }
        let data_len = store.data_len().await?;
        debug!(
            feed = %key.fmt_short(),
            length,
            downloaded = bitfield.count(),
            writable = secret_key.is_some(),
            "opened feed"
        );

        Ok(Feed {
            inner: Arc::new(Inner {
                key,
                secret_key,
                options: self.options,
                store,
                state: RwLock::new(State {
                    head,
                    bitfield,
                    data_len,
                }),
                write_lock: Mutex::new(()),
                changes: watch::Sender::new(0),
                wants: watch::Sender::new(BTreeMap::new()),
                closed: CancellationToken::new(),
            }),
        })
    }
}

/// A single-writer, multi-reader authenticated append-only log.
#[derive(Debug, Clone)]
pub struct Feed {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    key: PublicKey,
    secret_key: Option<SecretKey>,
    options: FeedOptions,
    store: FeedStore,
    state: RwLock<State>,
    /// Serializes every write to the store.
    write_lock: Mutex<()>,
    /// Bumped whenever the head or the set of local entries changes.
    changes: watch::Sender<u64>,
    /// Entries local readers are waiting for, with the number of waiters.
    wants: watch::Sender<BTreeMap<u64, usize>>,
    closed: CancellationToken,
}

#[derive(Debug)]
struct State {
    head: Option<SignedHead>,
    bitfield: Bitfield,
    data_len: u64,
}

impl Feed {
    /// Starts building a feed.
    pub fn builder() -> FeedBuilder {
        FeedBuilder::default()
    }

    /// The identity of the feed.
    pub fn key(&self) -> PublicKey {
        self.inner.key
    }

    /// Whether this process holds the secret key.
    pub fn writable(&self) -> bool {
        self.inner.secret_key.is_some()
    }

    /// Number of entries according to the latest known head.
    pub fn len(&self) -> u64 {
        self.state().head.map(|h| h.length).unwrap_or(0)
    }

    /// Whether the feed has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The latest known signed head, `None` while the feed is empty.
    pub fn head(&self) -> Option<SignedHead> {
        self.state().head
    }

    /// Whether entry `index` is stored locally.
    pub fn has(&self, index: u64) -> bool {
        self.state().bitfield.get(index)
    }

    /// Number of entries stored locally.
    pub fn downloaded(&self) -> u64 {
        self.state().bitfield.count()
    }

    /// The options the feed was opened with.
    pub fn options(&self) -> &FeedOptions {
        &self.inner.options
    }

    /// Whether [`Self::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Closes the feed. Pending and future operations fail with [`FeedError::Closed`].
    pub fn close(&self) {
        if !self.inner.closed.is_cancelled() {
            debug!(feed = %self.inner.key.fmt_short(), "closing feed");
            self.inner.closed.cancel();
            self.notify();
        }
    }

    /// Appends one entry, returning the new length.
    pub async fn append(&self, data: impl Into<Bytes>) -> Result<u64, FeedError> {
        self.append_batch([data.into()]).await
    }

    /// Appends entries under a single new head, returning the new length.
    pub async fn append_batch(
        &self,
        entries: impl IntoIterator<Item = Bytes>,
    ) -> Result<u64, FeedError> {
        self.append_at(None, entries.into_iter().collect()).await
    }

    /// Appends `entries` only if the feed still has length `expected`.
    pub(crate) async fn append_at(
        &self,
        expected: Option<u64>,
        entries: Vec<Bytes>,
    ) -> Result<u64, FeedError> {
        let secret_key = self
            .inner
            .secret_key
            .as_ref()
            .ok_or_else(|| NotWritableSnafu.build())?;
        let _guard = self.inner.write_lock.lock().await;
        self.ensure_open()?;
        let (start, mut data_len) = {
            let state = self.state();
            (state.head.map(|h| h.length).unwrap_or(0), state.data_len)
        };
        if let Some(expected) = expected {
            ensure!(
                expected == start,
                LengthMismatchSnafu {
                    expected,
                    actual: start
                }
            );
        }
        if entries.is_empty() {
            return Ok(start);
        }

        let store = &self.inner.store;
        let mut length = start;
        for data in entries {
            let len = data.len() as u64;
            let leaf = merkle::leaf_hash(&data);
            store.write_data(data_len, data).await?;
            store
                .write_locator(
                    length,
                    Locator {
                        offset: data_len,
                        len,
                    },
                )
                .await?;
            let mut node = 2 * length;
            let mut hash = leaf;
            store.write_node(node, hash).await?;
            while !flat_tree::is_left(node) {
                let left = self.node(flat_tree::sibling(node)).await?;
                hash = merkle::parent_hash(&left, &hash);
                node = flat_tree::parent(node);
                store.write_node(node, hash).await?;
            }
            data_len += len;
            length += 1;
        }

        let mut peaks = Vec::new();
        for root in flat_tree::full_roots(length) {
            peaks.push((root, self.node(root).await?));
        }
        let head = SignedHead::sign(secret_key, length, merkle::root_hash(&peaks));
        store
            .write_meta(&FeedMeta::new(
                self.inner.key,
                Some(secret_key.clone()),
                Some(head),
            ))
            .await?;
        store.sync().await?;

        {
            let mut state = self.state_mut();
            state.head = Some(head);
            state.bitfield.set_range(start..length);
            state.data_len = data_len;
        }
        trace!(feed = %self.inner.key.fmt_short(), length, "appended");
        self.notify();
        Ok(length)
    }

    /// Returns entry `index`.
    ///
    /// If the entry is not stored locally, a want is registered for connected replication
    /// sessions and the call waits up to [`FeedOptions::get_timeout`] for a verified copy.
    pub async fn get(&self, index: u64) -> Result<Bytes, FeedError> {
        self.get_with_timeout(index, self.inner.options.get_timeout)
            .await
    }

    /// Like [`Self::get`] with an explicit wait bound.
    pub async fn get_with_timeout(
        &self,
        index: u64,
        timeout: Duration,
    ) -> Result<Bytes, FeedError> {
        self.ensure_open()?;
        let mut changes = self.inner.changes.subscribe();
        let length = self.len();
        ensure!(index < length, OutOfRangeSnafu { index, length });
        if self.has(index) {
            return self.read_local(index).await;
        }

        let _want = WantGuard::new(self, index);
        trace!(feed = %self.inner.key.fmt_short(), index, "waiting for remote entry");
        let wait = async {
            loop {
                if self.has(index) || self.is_closed() {
                    return;
                }
                if changes.changed().await.is_err() {
                    return;
                }
            }
        };
        if tokio::time::timeout(timeout, wait).await.is_err() {
            return NotAvailableSnafu { index }.fail();
        }
        self.ensure_open()?;
        self.read_local(index).await
    }

    /// Builds an inclusion proof of entry `index` against the current head.
    pub async fn proof(&self, index: u64) -> Result<Proof, FeedError> {
        let length = self.len();
        ensure!(index < length, OutOfRangeSnafu { index, length });
        self.proof_at(index, length).await
    }

    async fn proof_at(&self, index: u64, length: u64) -> Result<Proof, FeedError> {
        let peak = flat_tree::peak_for(index, length).ok_or_else(|| {
            OutOfRangeSnafu { index, length }.build()
        })?;
        let mut nodes = Vec::new();
        let mut node = 2 * index;
        while node != peak {
            nodes.push(self.proof_node(flat_tree::sibling(node), index).await?);
            node = flat_tree::parent(node);
        }
        let mut peaks = Vec::new();
        for root in flat_tree::full_roots(length) {
            peaks.push(self.proof_node(root, index).await?);
        }
        Ok(Proof {
            index,
            length,
            nodes,
            peaks,
        })
    }

    /// Checks that `data` is entry `index` of this feed according to the current head.
    pub fn verify(&self, index: u64, data: &[u8], proof: &Proof) -> bool {
        let Some(head) = self.head() else {
            return false;
        };
        proof.index == index && proof.verify(data, &head, &self.inner.key).is_ok()
    }

    /// Streams entries, see [`ReadStreamOptions`].
    pub fn read_stream(&self, options: ReadStreamOptions) -> ReadStream {
        ReadStream::new(self.clone(), options)
    }

    /// Adopts `head` if it is valid and newer than the current one.
    ///
    /// Returns whether the head was adopted. Writers never adopt foreign heads.
    pub(crate) async fn update_head(&self, head: SignedHead) -> Result<bool, FeedError> {
        head.verify(&self.inner.key).context(IntegritySnafu)?;
        if self.writable() || head.length <= self.len() {
            return Ok(false);
        }
        let _guard = self.inner.write_lock.lock().await;
        self.ensure_open()?;
        self.adopt_head(head).await
    }

    /// Verifies and stores an entry received from a peer.
    ///
    /// The proof is checked against `head`, stored tree nodes must agree with the nodes the
    /// proof establishes. A longer head is adopted unless this feed is the writer. Returns
    /// whether anything changed locally.
    pub(crate) async fn ingest(
        &self,
        index: u64,
        data: Bytes,
        proof: &Proof,
        head: SignedHead,
    ) -> Result<bool, FeedError> {
        if proof.index != index {
            return merkle::ShapeSnafu.fail().context(IntegritySnafu);
        }
        let established = proof
            .verify(&data, &head, &self.inner.key)
            .context(IntegritySnafu)?;

        let _guard = self.inner.write_lock.lock().await;
        self.ensure_open()?;
        let store = &self.inner.store;
        let mut missing = Vec::new();
        for (node, hash) in established {
            match store.read_node(node).await? {
                Some(existing) if existing != hash => {
                    warn!(feed = %self.inner.key.fmt_short(), node, "conflicting tree node");
                    return merkle::ForkSnafu { index: node }
                        .fail()
                        .context(IntegritySnafu);
                }
                Some(_) => {}
                None => missing.push((node, hash)),
            }
        }
        for (node, hash) in missing {
            store.write_node(node, hash).await?;
        }

        let (has, data_len) = {
            let state = self.state();
            (state.bitfield.get(index), state.data_len)
        };
        let mut new_data_len = data_len;
        if !has {
            let len = data.len() as u64;
            store.write_data(data_len, data).await?;
            store
                .write_locator(
                    index,
                    Locator {
                        offset: data_len,
                        len,
                    },
                )
                .await?;
            new_data_len += len;
        }
        let adopt = !self.writable() && head.length > self.len();
        if adopt {
            store
                .write_meta(&FeedMeta::new(
                    self.inner.key,
                    self.inner.secret_key.clone(),
                    Some(head),
                ))
                .await?;
        }
        if !has || adopt {
            store.sync().await?;
        }

        {
            let mut state = self.state_mut();
            state.bitfield.set(index);
            state.data_len = new_data_len;
            if adopt {
                state.head = Some(head);
            }
        }
        let changed = !has || adopt;
        if changed {
            trace!(feed = %self.inner.key.fmt_short(), index, adopt, "ingested entry");
            self.notify();
        }
        Ok(changed)
    }

    /// Serves entry `index` to a peer: the data, a proof and the head it verifies against.
    pub(crate) async fn serve(
        &self,
        index: u64,
    ) -> Result<Option<(Bytes, Proof, SignedHead)>, FeedError> {
        self.ensure_open()?;
        let Some(head) = self.head() else {
            return Ok(None);
        };
        if index >= head.length || !self.has(index) {
            return Ok(None);
        }
        let data = self.read_local(index).await?;
        match self.proof_at(index, head.length).await {
            Ok(proof) => Ok(Some((data, proof, head))),
            Err(FeedError::NotAvailable { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// The locally stored entries as ranges.
    pub(crate) fn ranges(&self) -> Vec<Range<u64>> {
        self.state().bitfield.ranges()
    }

    pub(crate) fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    pub(crate) fn subscribe_wants(&self) -> watch::Receiver<BTreeMap<u64, usize>> {
        self.inner.wants.subscribe()
    }

    pub(crate) fn closed(&self) -> &CancellationToken {
        &self.inner.closed
    }

    pub(crate) fn ensure_open(&self) -> Result<(), FeedError> {
        ensure!(!self.is_closed(), ClosedSnafu);
        Ok(())
    }

    async fn adopt_head(&self, head: SignedHead) -> Result<bool, FeedError> {
        if head.length <= self.len() {
            return Ok(false);
        }
        self.inner
            .store
            .write_meta(&FeedMeta::new(
                self.inner.key,
                self.inner.secret_key.clone(),
                Some(head),
            ))
            .await?;
        self.inner.store.sync().await?;
        self.state_mut().head = Some(head);
        debug!(feed = %self.inner.key.fmt_short(), length = head.length, "adopted remote head");
        self.notify();
        Ok(true)
    }

    async fn read_local(&self, index: u64) -> Result<Bytes, FeedError> {
        let locator = self
            .inner
            .store
            .read_locator(index)
            .await?
            .ok_or_else(|| NotAvailableSnafu { index }.build())?;
        Ok(self.inner.store.read_data(locator).await?)
    }

    async fn node(&self, index: u64) -> Result<feedbee_base::Hash, FeedError> {
        self.proof_node(index, flat_tree::first_leaf(index)).await
    }

    async fn proof_node(&self, node: u64, entry: u64) -> Result<feedbee_base::Hash, FeedError> {
        self.inner
            .store
            .read_node(node)
            .await?
            .ok_or_else(|| NotAvailableSnafu { index: entry }.build())
    }

    fn notify(&self) {
        self.inner.changes.send_modify(|revision| *revision += 1);
    }

    fn state(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.inner.state.read().expect("poisoned")
    }

    fn state_mut(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.inner.state.write().expect("poisoned")
    }
}

/// Registers interest in an entry for as long as it lives.
#[derive(Debug)]
struct WantGuard<'a> {
    feed: &'a Feed,
    index: u64,
}

impl<'a> WantGuard<'a> {
    fn new(feed: &'a Feed, index: u64) -> Self {
        feed.inner
            .wants
            .send_modify(|wants| *wants.entry(index).or_default() += 1);
        Self { feed, index }
    }
}

impl Drop for WantGuard<'_> {
    fn drop(&mut self) {
        self.feed.inner.wants.send_modify(|wants| {
            if let Some(count) = wants.get_mut(&self.index) {
                *count -= 1;
                if *count == 0 {
                    wants.remove(&self.index);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;
    use n0_snafu::{Result, ResultExt};
    use rand::SeedableRng;
    use tracing_test::traced_test;

    use super::*;
    use crate::storage::MemProvider;

    fn secret(seed: u64) -> SecretKey {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
        SecretKey::generate(&mut rng)
    }

    /// Copies entries from `from` to `to` the way a replication session does.
    async fn transfer(from: &Feed, to: &Feed, indices: impl IntoIterator<Item = u64>) -> Result {
        for index in indices {
            let (data, proof, head) = from.serve(index).await?.expect("served");
            to.ingest(index, data, &proof, head).await?;
        }
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_append_and_get() -> Result {
        let feed = Feed::builder().open(&MemProvider::new()).await?;
        assert!(feed.writable());
        assert!(feed.is_empty());
        assert!(feed.head().is_none());
        for i in 0..20u64 {
            let length = feed.append(format!("entry {i}")).await?;
            assert_eq!(length, i + 1);
        }
        for i in 0..20u64 {
            assert_eq!(feed.get(i).await?, Bytes::from(format!("entry {i}")));
        }
        assert!(matches!(
            feed.get(20).await,
            Err(FeedError::OutOfRange {
                index: 20,
                length: 20
            })
        ));
        assert_eq!(feed.downloaded(), 20);
        assert_eq!(feed.head().map(|h| h.length), Some(20));
        Ok(())
    }

    #[tokio::test]
    async fn test_append_batch_single_head() -> Result {
        let feed = Feed::builder().open(&MemProvider::new()).await?;
        let mut changes = feed.subscribe_changes();
        changes.borrow_and_update();
        let length = feed
            .append_batch(["a", "b", "c"].map(Bytes::from))
            .await?;
        assert_eq!(length, 3);
        assert!(changes.has_changed().e()?);
        assert_eq!(*changes.borrow_and_update(), 1);
        assert_eq!(feed.append_batch([]).await?, 3);
        assert!(matches!(
            feed.append_at(Some(2), vec![Bytes::from_static(b"d")]).await,
            Err(FeedError::LengthMismatch {
                expected: 2,
                actual: 3
            })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_proof_verify() -> Result {
        let feed = Feed::builder().open(&MemProvider::new()).await?;
        for i in 0..13u8 {
            feed.append(vec![i; 3]).await?;
        }
        for i in 0..13u64 {
            let proof = feed.proof(i).await?;
            let data = feed.get(i).await?;
            assert!(feed.verify(i, &data, &proof));
            assert!(!feed.verify((i + 1) % 13, &data, &proof));
            let mut corrupted = data.to_vec();
            corrupted[1] ^= 0x01;
            assert!(!feed.verify(i, &corrupted, &proof));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_reopen() -> Result {
        let provider = MemProvider::new();
        let key = secret(1);
        {
            let feed = Feed::builder()
                .secret_key(key.clone())
                .open(&provider)
                .await?;
            feed.append("one").await?;
            feed.append("two").await?;
            feed.close();
            assert!(matches!(feed.append("three").await, Err(FeedError::Closed {})));
        }

        // The stored secret key makes the reopened feed writable again.
        let feed = Feed::builder()
            .public_key(key.public())
            .open(&provider)
            .await?;
        assert!(feed.writable());
        assert_eq!(feed.len(), 2);
        assert_eq!(feed.get(1).await?, Bytes::from_static(b"two"));
        assert_eq!(feed.append("three").await?, 3);

        let other = secret(2);
        let res = Feed::builder()
            .public_key(key.public())
            .secret_key(other)
            .open(&provider)
            .await;
        assert!(matches!(res, Err(FeedError::InvalidKey { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_key_bytes() {
        let res = Feed::builder()
            .public_key_bytes(vec![1u8; 5])
            .open(&MemProvider::new())
            .await;
        assert!(matches!(res, Err(FeedError::InvalidKey { .. })));
    }

    #[tokio::test]
    async fn test_read_only_feed() -> Result {
        let provider = MemProvider::new();
        let writer = Feed::builder().secret_key(secret(3)).open(&provider).await?;
        writer.append("hello").await?;

        let reader = Feed::builder()
            .public_key(writer.key())
            .get_timeout(Duration::from_millis(50))
            .open(&MemProvider::new())
            .await?;
        assert!(!reader.writable());
        assert!(matches!(
            reader.append("nope").await,
            Err(FeedError::NotWritable {})
        ));
        assert!(matches!(
            reader.get(0).await,
            Err(FeedError::OutOfRange { .. })
        ));

        assert!(reader.update_head(writer.head().unwrap()).await?);
        assert_eq!(reader.len(), 1);
        assert!(matches!(
            reader.get(0).await,
            Err(FeedError::NotAvailable { index: 0 })
        ));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_ingest() -> Result {
        let writer = Feed::builder().open(&MemProvider::new()).await?;
        for i in 0..9u32 {
            writer.append(i.to_be_bytes().to_vec()).await?;
        }
        let reader = Feed::builder()
            .public_key(writer.key())
            .open(&MemProvider::new())
            .await?;

        transfer(&writer, &reader, [4, 0, 8]).await?;
        assert_eq!(reader.len(), 9);
        assert_eq!(reader.downloaded(), 3);
        assert_eq!(reader.ranges(), vec![0..1, 4..5, 8..9]);
        assert_eq!(reader.get(4).await?, Bytes::from(4u32.to_be_bytes().to_vec()));

        // The reader serves what it has to a third feed.
        let third = Feed::builder()
            .public_key(writer.key())
            .open(&MemProvider::new())
            .await?;
        transfer(&reader, &third, [8]).await?;
        assert!(third.has(8));
        assert!(reader.serve(3).await?.is_none());

        // Tampered data is rejected and nothing is stored.
        let (_, proof, head) = writer.serve(5).await?.expect("served");
        let res = third
            .ingest(5, Bytes::from_static(b"evil"), &proof, head)
            .await;
        assert!(matches!(res, Err(FeedError::Integrity { .. })));
        assert!(!third.has(5));
        Ok(())
    }

    #[tokio::test]
    async fn test_get_waits_for_remote() -> Result {
        let writer = Feed::builder().open(&MemProvider::new()).await?;
        writer.append("remote").await?;
        let reader = Feed::builder()
            .public_key(writer.key())
            .get_timeout(Duration::from_secs(10))
            .open(&MemProvider::new())
            .await?;
        reader.update_head(writer.head().unwrap()).await?;

        let mut wants = reader.subscribe_wants();
        let get = tokio::spawn({
            let reader = reader.clone();
            async move { reader.get(0).await }
        });
        wants.wait_for(|w| w.contains_key(&0)).await.e()?;
        transfer(&writer, &reader, [0]).await?;
        assert_eq!(get.await.e()??, Bytes::from_static(b"remote"));
        assert!(reader.subscribe_wants().borrow().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_read_streams() -> Result {
        let feed = Feed::builder().open(&MemProvider::new()).await?;
        for i in 0..5u8 {
            feed.append(vec![i]).await?;
        }
        let entries: Vec<_> = feed
            .read_stream(ReadStreamOptions {
                start: 1,
                end: Some(4),
                live: false,
            })
            .map(|e| e.map(|e| e.index))
            .collect()
            .await;
        assert_eq!(
            entries.into_iter().collect::<Result<Vec<_>, _>>().e()?,
            vec![1, 2, 3]
        );

        let mut live = feed.read_stream(ReadStreamOptions::live(4));
        assert_eq!(live.next().await.unwrap().e()?.index, 4);
        let appender = feed.clone();
        tokio::spawn(async move { appender.append("late").await });
        let entry = live.next().await.unwrap().e()?;
        assert_eq!(entry.index, 5);
        assert_eq!(entry.data, Bytes::from_static(b"late"));

        live.cancel();
        live.cancel();
        assert!(live.next().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_close_ends_live_stream() -> Result {
        let feed = Feed::builder().open(&MemProvider::new()).await?;
        let mut live = feed.read_stream(ReadStreamOptions::live(0));
        let closer = feed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });
        assert!(live.next().await.is_none());
        assert!(matches!(feed.get(0).await, Err(FeedError::Closed {})));
        Ok(())
    }
}
