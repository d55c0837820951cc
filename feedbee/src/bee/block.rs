//! What a bee stores in each feed entry.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::{BeeError, DecodeSnafu, EncodeSnafu};

pub(crate) const PROTOCOL: &str = "feedbee/bee";

/// Entry `0` of every bee feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Always `"feedbee/bee"`.
    pub protocol: String,
    /// Free form application data.
    pub metadata: Option<Bytes>,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            protocol: PROTOCOL.to_string(),
            metadata: None,
        }
    }
}

impl Header {
    pub(crate) fn encode(&self) -> Result<Bytes, BeeError> {
        Ok(postcard::to_stdvec(self).context(EncodeSnafu)?.into())
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, BeeError> {
        postcard::from_bytes(bytes).context(DecodeSnafu { seq: 0u64 })
    }
}

/// Addresses a tree node: node `offset` of the index in block `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Pointer {
    pub seq: u64,
    pub offset: u32,
}

/// One B-tree node. Key `i` is the key of block `keys[i]`.
///
/// Leaves have no children, inner nodes have `keys.len() + 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TreeNode {
    pub keys: Vec<u64>,
    pub children: Vec<Pointer>,
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// A mutation together with the tree nodes it rewrote.
///
/// `index[0]` is the root after the mutation, an empty index means the tree is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Block {
    pub key: Bytes,
    /// `None` for deletes.
    pub value: Option<Bytes>,
    pub index: Vec<TreeNode>,
}

impl Block {
    pub fn encode(&self) -> Result<Bytes, BeeError> {
        Ok(postcard::to_stdvec(self).context(EncodeSnafu)?.into())
    }

    pub fn decode(seq: u64, bytes: &[u8]) -> Result<Self, BeeError> {
        postcard::from_bytes(bytes).context(DecodeSnafu { seq })
    }

    /// The root this block leaves behind.
    pub fn root(&self, seq: u64) -> Option<Pointer> {
        (!self.index.is_empty()).then_some(Pointer { seq, offset: 0 })
    }
}
