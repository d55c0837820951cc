//! A sorted key-value index stored in a feed.
//!
//! Every mutation appends one block to the feed. A block carries the mutated key and value
//! plus every B-tree node the mutation rewrote; nodes that did not change are referenced by
//! pointer into older blocks. The index at version `v` is therefore fully described by the
//! first `v` entries of the feed, and every past version stays readable via
//! [`Bee::checkout`].
//!
//! Entry `0` is a [`Header`] identifying the feed as a bee.
//!
//! Deleting a key that does not exist is a no-op: nothing is appended and the current
//! version is returned.

use std::{
    collections::BTreeMap,
    num::NonZeroUsize,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{Stream, StreamExt, stream::BoxStream};
use lru::LruCache;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use snafu::{ResultExt, Snafu, ensure};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use self::{
    batch::Op,
    block::{Block, Pointer},
    tree::Reader,
};
use crate::feed::{Feed, FeedError};

mod batch;
mod block;
mod history;
mod range;
mod tree;

pub use self::{
    batch::Batch,
    block::Header,
    history::{Change, HistoryOptions},
    range::RangeOptions,
};

/// Errors returned by [`Bee`] operations.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum BeeError {
    /// The feed is read-only, or this bee is a checkout.
    #[snafu(display("bee is not writable"))]
    NotWritable {},
    /// The underlying feed failed.
    #[snafu(transparent)]
    Feed { source: FeedError },
    /// A feed entry is not a valid block.
    #[snafu(display("failed to decode block {seq}"))]
    Decode { seq: u64, source: postcard::Error },
    /// A block could not be encoded.
    #[snafu(display("failed to encode block"))]
    Encode { source: postcard::Error },
    /// A block decoded but does not describe a valid tree.
    #[snafu(display("block {seq} is corrupt: {reason}"))]
    Corrupt { seq: u64, reason: String },
    /// Entry `0` is not a bee header.
    #[snafu(display("feed is not a bee: {reason}"))]
    Header { reason: String },
    /// A checkout past the end of the feed.
    #[snafu(display("version {version} is beyond length {length}"))]
    InvalidVersion { version: u64, length: u64 },
    /// Conflicting stream options.
    #[snafu(display("invalid options: {reason}"))]
    InvalidOptions { reason: String },
    /// A value is not valid json for the requested type.
    #[snafu(display("json encoding failed"))]
    Json { source: serde_json::Error },
}

/// Tunables of a bee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeeOptions {
    /// Number of decoded blocks kept in memory.
    pub cache_size: usize,
}

impl Default for BeeOptions {
    fn default() -> Self {
        Self { cache_size: 1024 }
    }
}

/// A key and its value as stored at some version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// The block the key was last written in.
    pub seq: u64,
    /// The key, without the prefix of the sub it was read through.
    pub key: Bytes,
    /// The value.
    pub value: Bytes,
}

/// A sorted key-value index over a [`Feed`].
///
/// Clones, [`Bee::sub`]s and checkouts share one block cache.
#[derive(Debug, Clone)]
pub struct Bee {
    shared: Arc<Shared>,
    prefix: Bytes,
    checkout: Option<u64>,
}

#[derive(derive_more::Debug)]
pub(crate) struct Shared {
    feed: Feed,
    #[debug(skip)]
    cache: Mutex<LruCache<u64, Arc<Block>>>,
    /// Serializes mutations of this bee.
    #[debug(skip)]
    write_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    pub(crate) async fn block(&self, seq: u64) -> Result<Arc<Block>, BeeError> {
        let cached = self.cache.lock().expect("poisoned").get(&seq).cloned();
        if let Some(block) = cached {
            return Ok(block);
        }
        let bytes = self.feed.get(seq).await?;
        let block = Arc::new(Block::decode(seq, &bytes)?);
        self.cache
            .lock()
            .expect("poisoned")
            .put(seq, block.clone());
        Ok(block)
    }
}

impl Bee {
    /// Opens a bee over `feed`.
    ///
    /// A writable empty feed gets a [`Header`]. If entry `0` is local it must be one.
    pub async fn open(feed: Feed, options: BeeOptions) -> Result<Self, BeeError> {
        if feed.writable() && feed.is_empty() {
            match feed.append_at(Some(0), vec![Header::default().encode()?]).await {
                Ok(_) | Err(FeedError::LengthMismatch { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        if feed.has(0) {
            let header = Header::decode(&feed.get(0).await?)?;
            ensure!(
                header.protocol == block::PROTOCOL,
                HeaderSnafu {
                    reason: format!("unknown protocol {:?}", header.protocol)
                }
            );
        }
        let cache_size = NonZeroUsize::new(options.cache_size).unwrap_or(NonZeroUsize::MIN);
        debug!(feed = %feed.key().fmt_short(), version = feed.len(), "opened bee");
        Ok(Self {
            shared: Arc::new(Shared {
                feed,
                cache: Mutex::new(LruCache::new(cache_size)),
                write_lock: tokio::sync::Mutex::new(()),
            }),
            prefix: Bytes::new(),
            checkout: None,
        })
    }

    /// The feed holding the blocks.
    pub fn feed(&self) -> &Feed {
        &self.shared.feed
    }

    /// The header in entry `0`.
    pub async fn header(&self) -> Result<Header, BeeError> {
        Header::decode(&self.shared.feed.get(0).await?)
    }

    /// The version this bee reads at: the checked out version, or the feed length.
    pub fn version(&self) -> u64 {
        self.checkout.unwrap_or_else(|| self.shared.feed.len())
    }

    /// Whether mutations are possible.
    pub fn writable(&self) -> bool {
        self.checkout.is_none() && self.shared.feed.writable()
    }

    /// The key prefix of this sub, empty for the root bee.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Looks up `key` at [`Self::version`].
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Node>, BeeError> {
        let key = key.as_ref();
        let full = self.full_key(key);
        let reader = Reader::new(&self.shared);
        let root = reader.root(self.version()).await?;
        let Some(seq) = tree::lookup(reader, root, &full).await? else {
            return Ok(None);
        };
        let block = reader.block(seq).await?;
        Ok(Some(Node {
            seq,
            key: Bytes::copy_from_slice(key),
            value: block.value.clone().unwrap_or_default(),
        }))
    }

    /// Looks up `key` and decodes its value as json.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        key: impl AsRef<[u8]>,
    ) -> Result<Option<T>, BeeError> {
        match self.get(key).await? {
            Some(node) => Ok(Some(serde_json::from_slice(&node.value).context(JsonSnafu)?)),
            None => Ok(None),
        }
    }

    /// Sets `key` to `value`, returning the new version.
    pub async fn put(
        &self,
        key: impl AsRef<[u8]>,
        value: impl Into<Bytes>,
    ) -> Result<u64, BeeError> {
        self.commit(vec![Op::put(key, value)]).await
    }

    /// Sets `key` to the json encoding of `value`.
    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        key: impl AsRef<[u8]>,
        value: &T,
    ) -> Result<u64, BeeError> {
        let value = serde_json::to_vec(value).context(JsonSnafu)?;
        self.put(key, value).await
    }

    /// Removes `key`, returning the new version.
    ///
    /// If the key does not exist nothing is appended and the current version is returned.
    pub async fn del(&self, key: impl AsRef<[u8]>) -> Result<u64, BeeError> {
        self.commit(vec![Op::del(key)]).await
    }

    /// Starts a batch of mutations that is committed as one version transition.
    pub fn batch(&self) -> Result<Batch, BeeError> {
        ensure!(self.writable(), NotWritableSnafu);
        Ok(Batch::new(self.clone()))
    }

    /// A read-only view at `version`.
    pub fn checkout(&self, version: u64) -> Result<Bee, BeeError> {
        let length = self.shared.feed.len();
        ensure!(version <= length, InvalidVersionSnafu { version, length });
        Ok(Self {
            shared: self.shared.clone(),
            prefix: self.prefix.clone(),
            checkout: Some(version),
        })
    }

    /// A read-only view at the current version.
    pub fn snapshot(&self) -> Bee {
        Self {
            shared: self.shared.clone(),
            prefix: self.prefix.clone(),
            checkout: Some(self.version()),
        }
    }

    /// A view of the keys starting with `prefix` followed by a zero byte.
    ///
    /// Keys are passed in and returned without the prefix. Subs nest.
    pub fn sub(&self, prefix: impl AsRef<[u8]>) -> Bee {
        let prefix = prefix.as_ref();
        let mut full = BytesMut::with_capacity(self.prefix.len() + prefix.len() + 1);
        full.put_slice(&self.prefix);
        full.put_slice(prefix);
        full.put_u8(0);
        Self {
            shared: self.shared.clone(),
            prefix: full.freeze(),
            checkout: self.checkout,
        }
    }

    /// Streams the entries within the bounds of `options` in key order.
    pub fn range(&self, options: RangeOptions) -> Result<RangeStream, BeeError> {
        range::stream(self.clone(), options)
    }

    /// Streams the mutations within the bounds of `options` in commit order.
    pub fn history(&self, options: HistoryOptions) -> Result<HistoryStream, BeeError> {
        history::stream(self.clone(), options)
    }

    pub(crate) fn full_key(&self, key: &[u8]) -> Bytes {
        if self.prefix.is_empty() {
            return Bytes::copy_from_slice(key);
        }
        let mut full = BytesMut::with_capacity(self.prefix.len() + key.len());
        full.put_slice(&self.prefix);
        full.put_slice(key);
        full.freeze()
    }

    /// Strips the prefix, `None` if `key` is not in this sub.
    pub(crate) fn strip_prefix(&self, key: &Bytes) -> Option<Bytes> {
        key.starts_with(&self.prefix)
            .then(|| key.slice(self.prefix.len()..))
    }

    /// Applies `ops` in order and appends the resulting blocks in one go.
    pub(crate) async fn commit(&self, ops: Vec<Op>) -> Result<u64, BeeError> {
        ensure!(self.writable(), NotWritableSnafu);
        let shared = &*self.shared;
        let _guard = shared.write_lock.lock().await;
        let start = shared.feed.len();
        ensure!(
            start > 0,
            HeaderSnafu {
                reason: "missing header"
            }
        );

        let mut pending: BTreeMap<u64, Arc<Block>> = BTreeMap::new();
        let mut root: Option<Pointer> = Reader::new(shared).root(start).await?;
        for op in ops {
            let seq = start + pending.len() as u64;
            let reader = Reader::with_pending(shared, &pending);
            let block = match op {
                Op::Put { key, value } => {
                    let key = self.full_key(&key);
                    let index = tree::insert(reader, root, &key, seq).await?;
                    Block {
                        key,
                        value: Some(value),
                        index,
                    }
                }
                Op::Del { key } => {
                    let key = self.full_key(&key);
                    match tree::remove(reader, root, &key, seq).await? {
                        Some(index) => Block {
                            key,
                            value: None,
                            index,
                        },
                        None => {
                            trace!(seq, "delete of absent key skipped");
                            continue;
                        }
                    }
                }
            };
            root = block.root(seq);
            pending.insert(seq, Arc::new(block));
        }
        if pending.is_empty() {
            return Ok(start);
        }

        let entries = pending
            .values()
            .map(|block| block.encode())
            .collect::<Result<Vec<_>, _>>()?;
        let version = shared.feed.append_at(Some(start), entries).await?;
        let mut cache = shared.cache.lock().expect("poisoned");
        for (seq, block) in pending {
            cache.put(seq, block);
        }
        drop(cache);
        debug!(feed = %shared.feed.key().fmt_short(), version, "committed");
        Ok(version)
    }
}

/// A cancellable stream of bee items, see [`RangeStream`] and [`HistoryStream`].
pub struct BeeStream<T> {
    inner: BoxStream<'static, Result<T, BeeError>>,
    cancel: CancellationToken,
}

/// The stream returned by [`Bee::range`].
pub type RangeStream = BeeStream<Node>;

/// The stream returned by [`Bee::history`].
pub type HistoryStream = BeeStream<Change>;

impl<T> std::fmt::Debug for BeeStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeeStream")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<T> BeeStream<T> {
    pub(crate) fn new(
        inner: BoxStream<'static, Result<T, BeeError>>,
        cancel: CancellationToken,
    ) -> Self {
        Self { inner, cancel }
    }

    /// Stops the stream. Calling this more than once is fine.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether [`Self::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<T> Stream for BeeStream<T> {
    type Item = Result<T, BeeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.inner.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use futures_util::{StreamExt, TryStreamExt};
    use n0_snafu::Result;
    use proptest::prelude::*;
    use tracing_test::traced_test;

    use super::*;
    use crate::storage::MemProvider;

    async fn new_bee() -> Result<Bee> {
        let feed = Feed::builder().open(&MemProvider::new()).await?;
        Ok(Bee::open(feed, BeeOptions::default()).await?)
    }

    async fn keys(stream: RangeStream) -> Result<Vec<String>> {
        let nodes: Vec<Node> = stream.try_collect().await?;
        Ok(nodes
            .into_iter()
            .map(|n| String::from_utf8_lossy(&n.key).into_owned())
            .collect())
    }

    fn opts() -> RangeOptions {
        RangeOptions::default()
    }

    #[tokio::test]
    #[traced_test]
    async fn test_put_get_del() -> Result {
        let bee = new_bee().await?;
        assert_eq!(bee.version(), 1);
        assert_eq!(bee.header().await?, Header::default());
        assert!(bee.get("missing").await?.is_none());

        assert_eq!(bee.put("a", "1").await?, 2);
        assert_eq!(bee.put("a", "2").await?, 3);
        let node = bee.get("a").await?.unwrap();
        assert_eq!(node.value, Bytes::from_static(b"2"));
        assert_eq!(node.seq, 2);

        let changes: Vec<Change> = bee.history(HistoryOptions::default())?.try_collect().await?;
        let values: Vec<_> = changes.iter().map(|c| c.value.clone().unwrap()).collect();
        assert_eq!(values, vec![Bytes::from_static(b"1"), Bytes::from_static(b"2")]);

        assert_eq!(bee.del("a").await?, 4);
        assert!(bee.get("a").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_del_absent_is_noop() -> Result {
        let bee = new_bee().await?;
        bee.put("x", "1").await?;
        let version = bee.version();
        assert_eq!(bee.del("y").await?, version);
        assert_eq!(bee.feed().len(), version);
        Ok(())
    }

    #[tokio::test]
    async fn test_many_keys_and_ranges() -> Result {
        let bee = new_bee().await?;
        let mut batch = bee.batch()?;
        for i in (0..200u32).rev() {
            batch.put(format!("{i:03}"), i.to_string());
        }
        batch.flush().await?;
        for i in 0..200u32 {
            let node = bee.get(format!("{i:03}")).await?.unwrap();
            assert_eq!(node.value, Bytes::from(i.to_string()));
        }

        let all = keys(bee.range(opts())?).await?;
        let expected: Vec<_> = (0..200u32).map(|i| format!("{i:03}")).collect();
        assert_eq!(all, expected);

        let some = keys(bee.range(RangeOptions {
            gt: Some("010".into()),
            lte: Some("015".into()),
            ..opts()
        })?)
        .await?;
        assert_eq!(some, vec!["011", "012", "013", "014", "015"]);

        let reversed = keys(bee.range(RangeOptions {
            gte: Some("010".into()),
            lt: Some("015".into()),
            reverse: true,
            ..opts()
        })?)
        .await?;
        assert_eq!(reversed, vec!["014", "013", "012", "011", "010"]);

        let limited = keys(bee.range(RangeOptions {
            reverse: true,
            limit: Some(3),
            ..opts()
        })?)
        .await?;
        assert_eq!(limited, vec!["199", "198", "197"]);

        for i in (0..200u32).step_by(2) {
            bee.del(format!("{i:03}")).await?;
        }
        let odd = keys(bee.range(opts())?).await?;
        let expected: Vec<_> = (1..200u32).step_by(2).map(|i| format!("{i:03}")).collect();
        assert_eq!(odd, expected);
        assert!(matches!(
            bee.range(RangeOptions {
                gt: Some("a".into()),
                gte: Some("b".into()),
                ..opts()
            }),
            Err(BeeError::InvalidOptions { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_checkout_and_snapshot() -> Result {
        let bee = new_bee().await?;
        let v1 = bee.put("k", "old").await?;
        let snapshot = bee.snapshot();
        bee.put("k", "new").await?;
        bee.put("other", "x").await?;

        let old = bee.checkout(v1)?;
        assert_eq!(old.get("k").await?.unwrap().value, Bytes::from_static(b"old"));
        assert!(old.get("other").await?.is_none());
        assert_eq!(snapshot.get("k").await?.unwrap().value, Bytes::from_static(b"old"));
        assert!(!old.writable());
        assert!(matches!(old.put("k", "v").await, Err(BeeError::NotWritable {})));
        assert!(matches!(old.batch(), Err(BeeError::NotWritable {})));
        assert!(matches!(
            bee.checkout(100),
            Err(BeeError::InvalidVersion { .. })
        ));
        assert!(bee.checkout(1)?.get("k").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_subs() -> Result {
        let bee = new_bee().await?;
        let users = bee.sub("users");
        let posts = bee.sub("posts");
        users.put("alice", "1").await?;
        users.put("bob", "2").await?;
        posts.put("alice", "hello").await?;
        bee.put("zzz", "top").await?;

        assert_eq!(users.get("alice").await?.unwrap().value, Bytes::from_static(b"1"));
        assert_eq!(
            posts.get("alice").await?.unwrap().value,
            Bytes::from_static(b"hello")
        );
        assert!(bee.get("alice").await?.is_none());
        assert_eq!(keys(users.range(opts())?).await?, vec!["alice", "bob"]);
        assert_eq!(keys(posts.range(opts())?).await?, vec!["alice"]);

        let nested = users.sub("admins");
        nested.put("carol", "3").await?;
        assert_eq!(nested.prefix(), b"users\0admins\0");
        assert_eq!(keys(nested.range(opts())?).await?, vec!["carol"]);

        let history: Vec<Change> = posts.history(HistoryOptions::default())?.try_collect().await?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].key, Bytes::from_static(b"alice"));
        Ok(())
    }

    #[tokio::test]
    async fn test_history_order() -> Result {
        let bee = new_bee().await?;
        for i in 0..10u32 {
            bee.put("same", i.to_string()).await?;
        }
        let changes: Vec<Change> = bee.history(HistoryOptions::default())?.try_collect().await?;
        assert_eq!(changes.len(), 10);
        for (i, pair) in changes.windows(2).enumerate() {
            assert!(pair[0].version() < pair[1].version());
            assert_eq!(pair[0].value, Some(Bytes::from(i.to_string())));
        }

        let reversed: Vec<Change> = bee
            .history(HistoryOptions {
                gte: 5,
                reverse: true,
                ..Default::default()
            })?
            .try_collect()
            .await?;
        let seqs: Vec<_> = reversed.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![10, 9, 8, 7, 6, 5]);
        assert!(matches!(
            bee.history(HistoryOptions {
                live: true,
                reverse: true,
                ..Default::default()
            }),
            Err(BeeError::InvalidOptions { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_live_history() -> Result {
        let bee = new_bee().await?;
        bee.put("before", "x").await?;
        let mut live = bee.history(HistoryOptions::live(bee.version()))?;
        let writer = bee.clone();
        tokio::spawn(async move {
            writer.put("after", "1").await?;
            writer.del("before").await
        });
        let first = live.next().await.unwrap()?;
        assert_eq!(first.key, Bytes::from_static(b"after"));
        let second = live.next().await.unwrap()?;
        assert!(second.is_del());
        assert_eq!(second.version(), bee.version());
        live.cancel();
        assert!(live.next().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_json() -> Result {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Todo {
            title: String,
            done: bool,
        }
        let bee = new_bee().await?;
        let todo = Todo {
            title: "write tests".into(),
            done: false,
        };
        bee.put_json("todo", &todo).await?;
        assert_eq!(bee.get_json::<Todo>("todo").await?, Some(todo));
        bee.put("broken", "{").await?;
        assert!(matches!(
            bee.get_json::<Todo>("broken").await,
            Err(BeeError::Json { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_read_only_bee() -> Result {
        let writer = new_bee().await?;
        writer.put("k", "v").await?;
        let feed = Feed::builder()
            .public_key(writer.feed().key())
            .open(&MemProvider::new())
            .await?;
        let reader = Bee::open(feed, BeeOptions::default()).await?;
        assert!(!reader.writable());
        assert_eq!(reader.version(), 0);
        assert!(reader.get("k").await?.is_none());
        assert!(matches!(reader.put("k", "v").await, Err(BeeError::NotWritable {})));
        Ok(())
    }

    #[derive(Debug, Clone)]
    enum ModelOp {
        Put(u8, u8),
        Del(u8),
    }

    fn model_op() -> impl Strategy<Value = ModelOp> {
        prop_oneof![
            (0u8..40, any::<u8>()).prop_map(|(k, v)| ModelOp::Put(k, v)),
            (0u8..40).prop_map(ModelOp::Del),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn matches_btreemap(ops in proptest::collection::vec(model_op(), 1..150), batched in any::<bool>()) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let bee = new_bee().await.unwrap();
                let mut model = BTreeMap::new();
                let mut batch = bee.batch().unwrap();
                for op in &ops {
                    match op {
                        ModelOp::Put(k, v) => {
                            model.insert(vec![*k], vec![*v]);
                            if batched { batch.put([*k], vec![*v]); } else { bee.put([*k], vec![*v]).await.unwrap(); }
                        }
                        ModelOp::Del(k) => {
                            model.remove(&vec![*k]);
                            if batched { batch.del([*k]); } else { bee.del([*k]).await.unwrap(); }
                        }
                    }
                }
                batch.flush().await.unwrap();

                let nodes: Vec<Node> = bee.range(RangeOptions::default()).unwrap().try_collect().await.unwrap();
                let actual: Vec<(Vec<u8>, Vec<u8>)> = nodes.into_iter().map(|n| (n.key.to_vec(), n.value.to_vec())).collect();
                let expected: Vec<(Vec<u8>, Vec<u8>)> = model.clone().into_iter().collect();
                assert_eq!(actual, expected);
                for k in 0u8..40 {
                    let got = bee.get([k]).await.unwrap().map(|n| n.value.to_vec());
                    assert_eq!(got, model.get(&vec![k]).cloned());
                }
            });
        }
    }
}
