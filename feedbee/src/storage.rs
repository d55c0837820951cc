//! Pluggable random access storage for feeds.
//!
//! A [`StorageProvider`] hands out one [`Storage`] per `(namespace, region)`. The namespace is
//! the hex encoded public key of a feed, so distinct feeds never share bytes. Each feed uses
//! the four regions listed in [`Region`].
//!
//! # Read policy
//!
//! Reading a range that ends beyond [`Storage::stat`] fails with
//! [`StorageError::OutOfRange`]. Reading a range inside the current size that was never
//! written returns zero bytes: regions are sparse and zero-filled. The feed relies on this to
//! encode "absent" as an all zero record.

use std::{fmt::Debug, sync::Arc};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use snafu::Snafu;

mod fs;
mod mem;

pub use self::{
    fs::{FsProvider, FsStorage},
    mem::{MemProvider, MemStorage},
};

/// Errors from a storage backend.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum StorageError {
    /// The requested range is not within the stored bytes.
    #[snafu(display("read of {len} bytes at offset {offset} is out of range (size {size})"))]
    OutOfRange { offset: u64, len: u64, size: u64 },
    /// The backend failed.
    #[snafu(display("io error in region {region}"))]
    Io {
        region: String,
        source: std::io::Error,
    },
    /// Stored bytes could not be interpreted.
    #[snafu(display("corrupt region {region}: {reason}"))]
    Corrupt { region: String, reason: String },
}

/// A random access byte region.
///
/// All methods take `&self`; implementations serialize access internally. Callers that need
/// ordering between writes (the feed) serialize their own write path.
pub trait Storage: Debug + Send + Sync + 'static {
    /// Reads exactly `len` bytes at `offset`.
    fn read(&self, offset: u64, len: u64) -> BoxFuture<'_, Result<Bytes, StorageError>>;

    /// Writes `data` at `offset`, growing the region if needed.
    ///
    /// If the region is shorter than `offset` the gap is filled with zeros.
    fn write(&self, offset: u64, data: Bytes) -> BoxFuture<'_, Result<(), StorageError>>;

    /// Sets the size of the region, discarding or zero-extending bytes.
    fn truncate(&self, len: u64) -> BoxFuture<'_, Result<(), StorageError>>;

    /// The current size of the region.
    fn stat(&self) -> BoxFuture<'_, Result<u64, StorageError>>;

    /// Flushes buffered writes to durable storage.
    fn sync(&self) -> BoxFuture<'_, Result<(), StorageError>>;
}

/// The regions a feed persists into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Region {
    /// Key material and the latest signed head.
    Meta,
    /// Fixed size records locating each entry in [`Region::Data`].
    Index,
    /// Merkle tree node hashes, addressed by flat tree index.
    Tree,
    /// Entry bytes in arrival order.
    Data,
}

impl Region {
    /// The file or key name of this region.
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Meta => "meta",
            Region::Index => "index",
            Region::Tree => "tree",
            Region::Data => "data",
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hands out storage regions, isolated per namespace.
pub trait StorageProvider: Debug + Send + Sync + 'static {
    /// Opens (or creates) the region `region` of `namespace`.
    ///
    /// Opening the same region twice must return storage backed by the same bytes.
    fn open(
        &self,
        namespace: &str,
        region: Region,
    ) -> BoxFuture<'_, Result<Arc<dyn Storage>, StorageError>>;
}

impl<P: StorageProvider + ?Sized> StorageProvider for Arc<P> {
    fn open(
        &self,
        namespace: &str,
        region: Region,
    ) -> BoxFuture<'_, Result<Arc<dyn Storage>, StorageError>> {
        (**self).open(namespace, region)
    }
}

/// Checks a read against the current size of a region.
pub(crate) fn check_range(offset: u64, len: u64, size: u64) -> Result<(), StorageError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => OutOfRangeSnafu { offset, len, size }.fail(),
    }
}
