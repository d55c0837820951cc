//! The persisted layout of one feed.
//!
//! | region  | content                                                        |
//! |---------|----------------------------------------------------------------|
//! | `meta`  | u32 BE length prefix followed by a postcard encoded [`FeedMeta`] |
//! | `index` | one 24 byte record `(flags, offset, len)` per entry, all u64 BE  |
//! | `tree`  | one 32 byte hash per flat tree index                           |
//! | `data`  | entry bytes in arrival order                                   |
//!
//! Records and hashes that are all zero, or that lie beyond the end of their region, are
//! absent. This works because regions are zero-filled, see [`crate::storage`].

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use feedbee_base::{Hash, PublicKey, SecretKey};
use serde::{Deserialize, Serialize};

use super::merkle::SignedHead;
use crate::storage::{CorruptSnafu, Region, Storage, StorageError, StorageProvider};

const META_VERSION: u32 = 1;
const LOCATOR_SIZE: u64 = 24;
const NODE_SIZE: u64 = 32;
const FLAG_PRESENT: u64 = 1;

/// What the `meta` region holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FeedMeta {
    pub version: u32,
    pub public_key: PublicKey,
    pub secret_key: Option<SecretKey>,
    pub head: Option<SignedHead>,
}

impl FeedMeta {
    pub fn new(
        public_key: PublicKey,
        secret_key: Option<SecretKey>,
        head: Option<SignedHead>,
    ) -> Self {
        Self {
            version: META_VERSION,
            public_key,
            secret_key,
            head,
        }
    }
}

/// Where the bytes of an entry live in the `data` region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Locator {
    pub offset: u64,
    pub len: u64,
}

impl Locator {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(LOCATOR_SIZE as usize);
        buf.put_u64(FLAG_PRESENT);
        buf.put_u64(self.offset);
        buf.put_u64(self.len);
        buf.freeze()
    }

    fn decode(record: &[u8]) -> Option<Self> {
        let field = |i: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&record[i * 8..(i + 1) * 8]);
            u64::from_be_bytes(bytes)
        };
        if field(0) & FLAG_PRESENT == 0 {
            return None;
        }
        Some(Self {
            offset: field(1),
            len: field(2),
        })
    }
}

#[derive(Debug)]
pub(crate) struct FeedStore {
    meta: Arc<dyn Storage>,
    index: Arc<dyn Storage>,
    tree: Arc<dyn Storage>,
    data: Arc<dyn Storage>,
}

impl FeedStore {
    pub async fn open<P: StorageProvider + ?Sized>(
        provider: &P,
        namespace: &str,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            meta: provider.open(namespace, Region::Meta).await?,
            index: provider.open(namespace, Region::Index).await?,
            tree: provider.open(namespace, Region::Tree).await?,
            data: provider.open(namespace, Region::Data).await?,
        })
    }

    /// Reads the metadata, `None` if it was never written.
    pub async fn read_meta(&self) -> Result<Option<FeedMeta>, StorageError> {
        let size = self.meta.stat().await?;
        if size == 0 {
            return Ok(None);
        }
        if size < 4 {
            return corrupt(Region::Meta, "truncated length prefix");
        }
        let prefix = self.meta.read(0, 4).await?;
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as u64;
        if 4 + len > size {
            return corrupt(Region::Meta, "truncated metadata");
        }
        let bytes = self.meta.read(4, len).await?;
        let meta: FeedMeta = postcard::from_bytes(&bytes).map_err(|err| {
            CorruptSnafu {
                region: Region::Meta.to_string(),
                reason: err.to_string(),
            }
            .build()
        })?;
        if meta.version != META_VERSION {
            return corrupt(
                Region::Meta,
                &format!("unsupported version {}", meta.version),
            );
        }
        Ok(Some(meta))
    }

    pub async fn write_meta(&self, meta: &FeedMeta) -> Result<(), StorageError> {
        let encoded = postcard::to_stdvec(meta).map_err(|err| {
            CorruptSnafu {
                region: Region::Meta.to_string(),
                reason: err.to_string(),
            }
            .build()
        })?;
        let mut buf = BytesMut::with_capacity(4 + encoded.len());
        buf.put_u32(encoded.len() as u32);
        buf.put_slice(&encoded);
        let len = buf.len() as u64;
        self.meta.write(0, buf.freeze()).await?;
        self.meta.truncate(len).await
    }

    pub async fn read_locator(&self, index: u64) -> Result<Option<Locator>, StorageError> {
        let offset = index * LOCATOR_SIZE;
        if offset + LOCATOR_SIZE > self.index.stat().await? {
            return Ok(None);
        }
        let record = self.index.read(offset, LOCATOR_SIZE).await?;
        Ok(Locator::decode(&record))
    }

    /// Reads the records of entries `0..count` in one go.
    pub async fn read_locators(&self, count: u64) -> Result<Vec<Option<Locator>>, StorageError> {
        let size = self.index.stat().await?;
        let available = (size / LOCATOR_SIZE).min(count);
        let records = self.index.read(0, available * LOCATOR_SIZE).await?;
        Ok(records
            .chunks_exact(LOCATOR_SIZE as usize)
            .map(Locator::decode)
            .collect())
    }

    pub async fn write_locator(&self, index: u64, locator: Locator) -> Result<(), StorageError> {
        self.index
            .write(index * LOCATOR_SIZE, locator.encode())
            .await
    }

    pub async fn read_node(&self, index: u64) -> Result<Option<Hash>, StorageError> {
        let offset = index * NODE_SIZE;
        if offset + NODE_SIZE > self.tree.stat().await? {
            return Ok(None);
        }
        let bytes = self.tree.read(offset, NODE_SIZE).await?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes);
        let hash = Hash::from_bytes(hash);
        Ok((!hash.is_zero()).then_some(hash))
    }

    pub async fn write_node(&self, index: u64, hash: Hash) -> Result<(), StorageError> {
        self.tree
            .write(index * NODE_SIZE, Bytes::copy_from_slice(hash.as_bytes()))
            .await
    }

    pub async fn read_data(&self, locator: Locator) -> Result<Bytes, StorageError> {
        self.data.read(locator.offset, locator.len).await
    }

    pub async fn write_data(&self, offset: u64, data: Bytes) -> Result<(), StorageError> {
        self.data.write(offset, data).await
    }

    pub async fn data_len(&self) -> Result<u64, StorageError> {
        self.data.stat().await
    }

    pub async fn sync(&self) -> Result<(), StorageError> {
        self.data.sync().await?;
        self.index.sync().await?;
        self.tree.sync().await?;
        self.meta.sync().await
    }
}

fn corrupt<T>(region: Region, reason: &str) -> Result<T, StorageError> {
    CorruptSnafu {
        region: region.to_string(),
        reason: reason.to_string(),
    }
    .fail()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemProvider;

    #[tokio::test]
    async fn test_records_default_to_absent() {
        let provider = MemProvider::new();
        let store = FeedStore::open(&provider, "ns").await.unwrap();
        assert!(store.read_meta().await.unwrap().is_none());
        assert_eq!(store.read_locator(3).await.unwrap(), None);
        assert_eq!(store.read_node(7).await.unwrap(), None);

        let locator = Locator { offset: 5, len: 9 };
        store.write_locator(2, locator).await.unwrap();
        store.write_node(4, Hash::new(b"node")).await.unwrap();
        assert_eq!(store.read_locator(2).await.unwrap(), Some(locator));
        assert_eq!(store.read_locator(1).await.unwrap(), None);
        assert_eq!(store.read_node(4).await.unwrap(), Some(Hash::new(b"node")));
        assert_eq!(store.read_node(2).await.unwrap(), None);
        assert_eq!(
            store.read_locators(5).await.unwrap(),
            vec![None, None, Some(locator)]
        );
    }

    #[tokio::test]
    async fn test_meta_roundtrip_and_corruption() {
        let provider = MemProvider::new();
        let store = FeedStore::open(&provider, "ns").await.unwrap();
        let secret = SecretKey::generate(&mut rand::rngs::OsRng);
        let meta = FeedMeta::new(secret.public(), Some(secret.clone()), None);
        store.write_meta(&meta).await.unwrap();
        let read = store.read_meta().await.unwrap().unwrap();
        assert_eq!(read.public_key, secret.public());
        assert_eq!(
            read.secret_key.map(|s| s.to_bytes()),
            Some(secret.to_bytes())
        );

        let region = provider.open("ns", Region::Meta).await.unwrap();
        region.write(4, Bytes::from_static(&[0xff; 8])).await.unwrap();
        assert!(matches!(
            store.read_meta().await,
            Err(StorageError::Corrupt { .. })
        ));
    }
}
