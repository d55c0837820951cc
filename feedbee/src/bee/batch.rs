use bytes::Bytes;
use serde::Serialize;
use snafu::ResultExt;

use super::{Bee, BeeError, JsonSnafu};

#[derive(Debug, Clone)]
pub(crate) enum Op {
    Put { key: Bytes, value: Bytes },
    Del { key: Bytes },
}

impl Op {
    pub fn put(key: impl AsRef<[u8]>, value: impl Into<Bytes>) -> Self {
        Op::Put {
            key: Bytes::copy_from_slice(key.as_ref()),
            value: value.into(),
        }
    }

    pub fn del(key: impl AsRef<[u8]>) -> Self {
        Op::Del {
            key: Bytes::copy_from_slice(key.as_ref()),
        }
    }
}

/// Mutations collected for a single commit.
///
/// Nothing is written until [`Batch::flush`]. The flush appends one block per effective
/// operation in a single feed append, so either all of them become visible under the new
/// version or none do. Deletes of keys that do not exist at their point in the batch are
/// skipped.
#[derive(Debug)]
pub struct Batch {
    bee: Bee,
    ops: Vec<Op>,
}

impl Batch {
    pub(super) fn new(bee: Bee) -> Self {
        Self {
            bee,
            ops: Vec::new(),
        }
    }

    /// Queues setting `key` to `value`.
    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl Into<Bytes>) -> &mut Self {
        self.ops.push(Op::put(key, value));
        self
    }

    /// Queues setting `key` to the json encoding of `value`.
    pub fn put_json<T: Serialize + ?Sized>(
        &mut self,
        key: impl AsRef<[u8]>,
        value: &T,
    ) -> Result<&mut Self, BeeError> {
        let value = serde_json::to_vec(value).context(JsonSnafu)?;
        Ok(self.put(key, value))
    }

    /// Queues removing `key`.
    pub fn del(&mut self, key: impl AsRef<[u8]>) -> &mut Self {
        self.ops.push(Op::del(key));
        self
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Commits the batch, returning the new version.
    pub async fn flush(self) -> Result<u64, BeeError> {
        self.bee.commit(self.ops).await
    }
}
