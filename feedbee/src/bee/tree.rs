//! Copy-on-write B-tree over feed blocks.
//!
//! Nodes are immutable once written. A mutation loads the path from the root to the affected
//! leaf into [`MemNode`]s, edits them, and writes every touched node into the index of the new
//! block. Untouched subtrees keep pointing into older blocks.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use bytes::Bytes;

use super::{
    BeeError, CorruptSnafu, Shared,
    block::{Block, Pointer, TreeNode},
};

/// Maximum keys per node.
pub(crate) const MAX_KEYS: usize = 7;
/// Minimum keys per node, except for the root.
pub(crate) const MIN_KEYS: usize = 3;

/// Resolves blocks, preferring blocks of a batch that are not yet appended.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reader<'a> {
    shared: &'a Shared,
    pending: Option<&'a BTreeMap<u64, Arc<Block>>>,
}

impl<'a> Reader<'a> {
    pub fn new(shared: &'a Shared) -> Self {
        Self {
            shared,
            pending: None,
        }
    }

    pub fn with_pending(shared: &'a Shared, pending: &'a BTreeMap<u64, Arc<Block>>) -> Self {
        Self {
            shared,
            pending: Some(pending),
        }
    }

    pub async fn block(&self, seq: u64) -> Result<Arc<Block>, BeeError> {
        if let Some(block) = self.pending.and_then(|pending| pending.get(&seq)) {
            return Ok(block.clone());
        }
        self.shared.block(seq).await
    }

    pub async fn node(&self, ptr: Pointer) -> Result<TreeNode, BeeError> {
        let block = self.block(ptr.seq).await?;
        let node = block.index.get(ptr.offset as usize).cloned().ok_or_else(|| {
            CorruptSnafu {
                seq: ptr.seq,
                reason: format!("no tree node at offset {}", ptr.offset),
            }
            .build()
        })?;
        if !node.is_leaf() && node.children.len() != node.keys.len() + 1 {
            return CorruptSnafu {
                seq: ptr.seq,
                reason: "child count does not match key count",
            }
            .fail();
        }
        Ok(node)
    }

    pub async fn key(&self, seq: u64) -> Result<Bytes, BeeError> {
        Ok(self.block(seq).await?.key.clone())
    }

    /// The root at `version`.
    pub async fn root(&self, version: u64) -> Result<Option<Pointer>, BeeError> {
        if version <= 1 {
            return Ok(None);
        }
        let seq = version - 1;
        Ok(self.block(seq).await?.root(seq))
    }

    /// Binary search for `key` among the keys of a node.
    pub async fn search(&self, keys: &[u64], key: &[u8]) -> Result<Result<usize, usize>, BeeError> {
        let (mut lo, mut hi) = (0, keys.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.key(keys[mid]).await?.as_ref().cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }
}

/// Finds the seq of the block holding `key`.
pub(crate) async fn lookup(
    reader: Reader<'_>,
    root: Option<Pointer>,
    key: &[u8],
) -> Result<Option<u64>, BeeError> {
    let Some(mut ptr) = root else {
        return Ok(None);
    };
    loop {
        let node = reader.node(ptr).await?;
        match reader.search(&node.keys, key).await? {
            Ok(i) => return Ok(Some(node.keys[i])),
            Err(_) if node.is_leaf() => return Ok(None),
            Err(i) => ptr = node.children[i],
        }
    }
}

/// Inserts or replaces `key`, which lives in block `seq`. Returns the index of that block.
pub(crate) async fn insert(
    reader: Reader<'_>,
    root: Option<Pointer>,
    key: &[u8],
    seq: u64,
) -> Result<Vec<TreeNode>, BeeError> {
    let Some(root) = root else {
        let root = MemNode {
            keys: vec![seq],
            children: vec![],
        };
        return Ok(flatten(root, seq));
    };

    let mut path = Vec::new();
    let mut node = MemNode::load(reader, root).await?;
    loop {
        match reader.search(&node.keys, key).await? {
            Ok(i) => {
                node.keys[i] = seq;
                break;
            }
            Err(i) if node.is_leaf() => {
                node.keys.insert(i, seq);
                break;
            }
            Err(i) => {
                let child = node.take_child(reader, i).await?;
                path.push((node, i));
                node = child;
            }
        }
    }

    while node.keys.len() > MAX_KEYS {
        let (median, right) = node.split();
        node = match path.pop() {
            Some((mut parent, i)) => {
                parent.keys.insert(i, median);
                parent.children[i] = Child::Fresh(node);
                parent.children.insert(i + 1, Child::Fresh(right));
                parent
            }
            None => MemNode {
                keys: vec![median],
                children: vec![Child::Fresh(node), Child::Fresh(right)],
            },
        };
    }
    Ok(flatten(rebuild(path, node), seq))
}

/// Removes `key` in block `seq`. Returns the index of that block, or `None` if the key is
/// not in the tree.
pub(crate) async fn remove(
    reader: Reader<'_>,
    root: Option<Pointer>,
    key: &[u8],
    seq: u64,
) -> Result<Option<Vec<TreeNode>>, BeeError> {
    let Some(root) = root else {
        return Ok(None);
    };

    let mut path: Vec<(MemNode, usize)> = Vec::new();
    let mut node = MemNode::load(reader, root).await?;
    loop {
        match reader.search(&node.keys, key).await? {
            Ok(i) if node.is_leaf() => {
                node.keys.remove(i);
                break;
            }
            Ok(i) => {
                // Replace the key with its in-order predecessor and remove that from its leaf.
                let found = path.len();
                let mut current = node.take_child(reader, i).await?;
                path.push((node, i));
                while !current.is_leaf() {
                    let last = current.children.len() - 1;
                    let next = current.take_child(reader, last).await?;
                    path.push((current, last));
                    current = next;
                }
                let predecessor = current.keys.pop().ok_or_else(|| {
                    CorruptSnafu {
                        seq: root.seq,
                        reason: "empty leaf",
                    }
                    .build()
                })?;
                path[found].0.keys[i] = predecessor;
                node = current;
                break;
            }
            Err(_) if node.is_leaf() => return Ok(None),
            Err(i) => {
                let child = node.take_child(reader, i).await?;
                path.push((node, i));
                node = child;
            }
        }
    }

    while let Some((mut parent, i)) = path.pop() {
        if node.keys.len() >= MIN_KEYS {
            parent.children[i] = Child::Fresh(node);
        } else if i > 0 {
            let mut left = parent.take_child(reader, i - 1).await?;
            if left.keys.len() > MIN_KEYS {
                rotate_right(&mut left, &mut node, &mut parent.keys[i - 1]);
                parent.children[i - 1] = Child::Fresh(left);
                parent.children[i] = Child::Fresh(node);
            } else {
                let separator = parent.keys.remove(i - 1);
                left.merge(separator, node);
                parent.children.remove(i);
                parent.children[i - 1] = Child::Fresh(left);
            }
        } else {
            let mut right = parent.take_child(reader, i + 1).await?;
            if right.keys.len() > MIN_KEYS {
                rotate_left(&mut node, &mut right, &mut parent.keys[i]);
                parent.children[i] = Child::Fresh(node);
                parent.children[i + 1] = Child::Fresh(right);
            } else {
                let separator = parent.keys.remove(i);
                node.merge(separator, right);
                parent.children.remove(i + 1);
                parent.children[i] = Child::Fresh(node);
            }
        }
        node = parent;
    }

    if node.keys.is_empty() {
        if node.is_leaf() {
            return Ok(Some(Vec::new()));
        }
        node = node.take_child(reader, 0).await?;
    }
    Ok(Some(flatten(node, seq)))
}

/// Moves the last key of `left` up into the parent and the separator down into `right`.
fn rotate_right(left: &mut MemNode, right: &mut MemNode, separator: &mut u64) {
    if let Some(key) = left.keys.pop() {
        right.keys.insert(0, std::mem::replace(separator, key));
        if let Some(child) = left.children.pop() {
            right.children.insert(0, child);
        }
    }
}

/// Moves the first key of `right` up into the parent and the separator down into `left`.
fn rotate_left(left: &mut MemNode, right: &mut MemNode, separator: &mut u64) {
    if !right.keys.is_empty() {
        let key = right.keys.remove(0);
        left.keys.push(std::mem::replace(separator, key));
        if !right.children.is_empty() {
            left.children.push(right.children.remove(0));
        }
    }
}

#[derive(Debug)]
enum Child {
    Stored(Pointer),
    Fresh(MemNode),
}

/// A node being rewritten.
#[derive(Debug, Default)]
struct MemNode {
    keys: Vec<u64>,
    children: Vec<Child>,
}

impl MemNode {
    async fn load(reader: Reader<'_>, ptr: Pointer) -> Result<Self, BeeError> {
        let node = reader.node(ptr).await?;
        Ok(Self {
            keys: node.keys,
            children: node.children.into_iter().map(Child::Stored).collect(),
        })
    }

    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Takes child `i` out for editing. The caller puts it back as [`Child::Fresh`].
    async fn take_child(&mut self, reader: Reader<'_>, i: usize) -> Result<MemNode, BeeError> {
        match &mut self.children[i] {
            Child::Fresh(node) => Ok(std::mem::take(node)),
            Child::Stored(ptr) => {
                let ptr = *ptr;
                MemNode::load(reader, ptr).await
            }
        }
    }

    /// Splits an overfull node in two. `self` keeps the lower half.
    fn split(&mut self) -> (u64, MemNode) {
        let mid = self.keys.len() / 2;
        let right_keys = self.keys.split_off(mid + 1);
        let median = self.keys[mid];
        self.keys.truncate(mid);
        let right_children = if self.is_leaf() {
            Vec::new()
        } else {
            self.children.split_off(mid + 1)
        };
        (
            median,
            MemNode {
                keys: right_keys,
                children: right_children,
            },
        )
    }

    fn merge(&mut self, separator: u64, right: MemNode) {
        self.keys.push(separator);
        self.keys.extend(right.keys);
        self.children.extend(right.children);
    }
}

/// Puts the edited nodes of `path` back together, returning the new root.
fn rebuild(mut path: Vec<(MemNode, usize)>, mut node: MemNode) -> MemNode {
    while let Some((mut parent, i)) = path.pop() {
        parent.children[i] = Child::Fresh(node);
        node = parent;
    }
    node
}

/// Serializes the fresh nodes below `root` breadth first, `root` at offset zero.
fn flatten(root: MemNode, seq: u64) -> Vec<TreeNode> {
    let mut index = Vec::new();
    let mut queue = VecDeque::from([root]);
    let mut next = 1u32;
    while let Some(node) = queue.pop_front() {
        let children = node
            .children
            .into_iter()
            .map(|child| match child {
                Child::Stored(ptr) => ptr,
                Child::Fresh(node) => {
                    let ptr = Pointer { seq, offset: next };
                    next += 1;
                    queue.push_back(node);
                    ptr
                }
            })
            .collect();
        index.push(TreeNode {
            keys: node.keys,
            children,
        });
    }
    index
}
