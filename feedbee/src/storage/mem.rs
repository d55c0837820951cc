//! In memory storage, the default for tests and ephemeral feeds.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use bytes::{Bytes, BytesMut};
use futures_util::{FutureExt, future::BoxFuture};

use super::{Region, Storage, StorageError, StorageProvider, check_range};

/// A region held in a [`BytesMut`].
#[derive(Debug, Default, Clone)]
pub struct MemStorage {
    bytes: Arc<Mutex<BytesMut>>,
}

impl MemStorage {
    /// Creates an empty region.
    pub fn new() -> Self {
        Self::default()
    }

    fn read_sync(&self, offset: u64, len: u64) -> Result<Bytes, StorageError> {
        let bytes = self.bytes.lock().expect("poisoned");
        check_range(offset, len, bytes.len() as u64)?;
        let start = offset as usize;
        let end = start + len as usize;
        Ok(Bytes::copy_from_slice(&bytes[start..end]))
    }

    fn write_sync(&self, offset: u64, data: &[u8]) {
        let mut bytes = self.bytes.lock().expect("poisoned");
        let start = offset as usize;
        let end = start + data.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(data);
    }
}

impl Storage for MemStorage {
    fn read(&self, offset: u64, len: u64) -> BoxFuture<'_, Result<Bytes, StorageError>> {
        futures_util::future::ready(self.read_sync(offset, len)).boxed()
    }

    fn write(&self, offset: u64, data: Bytes) -> BoxFuture<'_, Result<(), StorageError>> {
        self.write_sync(offset, &data);
        futures_util::future::ok(()).boxed()
    }

    fn truncate(&self, len: u64) -> BoxFuture<'_, Result<(), StorageError>> {
        self.bytes
            .lock()
            .expect("poisoned")
            .resize(len as usize, 0);
        futures_util::future::ok(()).boxed()
    }

    fn stat(&self) -> BoxFuture<'_, Result<u64, StorageError>> {
        let len = self.bytes.lock().expect("poisoned").len() as u64;
        futures_util::future::ok(len).boxed()
    }

    fn sync(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        futures_util::future::ok(()).boxed()
    }
}

/// Hands out [`MemStorage`] regions, caching them per `(namespace, region)`.
///
/// Reopening a feed on the same provider sees everything written before, which makes this
/// provider suitable for "restart" tests.
#[derive(Debug, Default, Clone)]
pub struct MemProvider {
    regions: Arc<Mutex<HashMap<(String, Region), MemStorage>>>,
}

impl MemProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// The namespaces that have at least one open region.
    pub fn namespaces(&self) -> Vec<String> {
        let regions = self.regions.lock().expect("poisoned");
        let mut names: Vec<_> = regions.keys().map(|(ns, _)| ns.clone()).collect();
        names.sort();
        names.dedup();
        names
    }
}

impl StorageProvider for MemProvider {
    fn open(
        &self,
        namespace: &str,
        region: Region,
    ) -> BoxFuture<'_, Result<Arc<dyn Storage>, StorageError>> {
        let storage = self
            .regions
            .lock()
            .expect("poisoned")
            .entry((namespace.to_string(), region))
            .or_default()
            .clone();
        futures_util::future::ok(Arc::new(storage) as Arc<dyn Storage>).boxed()
    }
}
