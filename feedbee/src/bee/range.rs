//! Ordered scans.

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{
    Bee, BeeError, InvalidOptionsSnafu, Node, RangeStream,
    block::TreeNode,
    tree::Reader,
};

/// Bounds of a [`Bee::range`] scan. Keys are relative to the sub the scan runs on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeOptions {
    /// Keys greater than this.
    pub gt: Option<Bytes>,
    /// Keys greater than or equal to this.
    pub gte: Option<Bytes>,
    /// Keys less than this.
    pub lt: Option<Bytes>,
    /// Keys less than or equal to this.
    pub lte: Option<Bytes>,
    /// Yield in descending key order.
    pub reverse: bool,
    /// Stop after this many entries.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
enum Bound {
    Inclusive(Bytes),
    Exclusive(Bytes),
}

impl Bound {
    fn key(&self) -> &[u8] {
        match self {
            Bound::Inclusive(key) | Bound::Exclusive(key) => key,
        }
    }

    fn inclusive(&self) -> bool {
        matches!(self, Bound::Inclusive(_))
    }
}

pub(super) fn stream(bee: Bee, options: RangeOptions) -> Result<RangeStream, BeeError> {
    if options.gt.is_some() && options.gte.is_some() {
        return InvalidOptionsSnafu {
            reason: "gt and gte are exclusive",
        }
        .fail();
    }
    if options.lt.is_some() && options.lte.is_some() {
        return InvalidOptionsSnafu {
            reason: "lt and lte are exclusive",
        }
        .fail();
    }

    let lower = match (options.gt, options.gte) {
        (Some(gt), _) => Some(Bound::Exclusive(bee.full_key(&gt))),
        (None, Some(gte)) => Some(Bound::Inclusive(bee.full_key(&gte))),
        (None, None) if !bee.prefix.is_empty() => Some(Bound::Inclusive(bee.prefix.clone())),
        (None, None) => None,
    };
    let upper = match (options.lt, options.lte) {
        (Some(lt), _) => Some(Bound::Exclusive(bee.full_key(&lt))),
        (None, Some(lte)) => Some(Bound::Inclusive(bee.full_key(&lte))),
        (None, None) if !bee.prefix.is_empty() => Some(Bound::Exclusive(prefix_end(&bee.prefix))),
        (None, None) => None,
    };

    let cancel = CancellationToken::new();
    let cursor = Cursor {
        version: bee.version(),
        bee,
        lower,
        upper,
        reverse: options.reverse,
        remaining: options.limit,
        stack: Vec::new(),
        started: false,
        done: false,
        cancel: cancel.clone(),
    };
    let inner = futures_util::stream::unfold(cursor, Cursor::step).boxed();
    Ok(RangeStream::new(inner, cancel))
}

/// The smallest key greater than every key starting with `prefix`.
///
/// Sub prefixes end in a zero byte, so bumping the last byte suffices.
fn prefix_end(prefix: &[u8]) -> Bytes {
    let mut end = BytesMut::from(prefix);
    if let Some(last) = end.last_mut() {
        *last += 1;
    }
    end.freeze()
}

/// A node being walked. Even slots are children, odd slots are keys.
#[derive(Debug)]
struct Frame {
    node: TreeNode,
    slot: i64,
}

impl Frame {
    fn last_slot(&self) -> i64 {
        2 * self.node.keys.len() as i64
    }
}

struct Cursor {
    bee: Bee,
    version: u64,
    lower: Option<Bound>,
    upper: Option<Bound>,
    reverse: bool,
    remaining: Option<usize>,
    stack: Vec<Frame>,
    started: bool,
    done: bool,
    cancel: CancellationToken,
}

impl Cursor {
    async fn step(mut self) -> Option<(Result<Node, BeeError>, Self)> {
        if self.done {
            return None;
        }
        let cancel = self.cancel.clone();
        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            res = self.advance() => res,
        };
        match res {
            Ok(Some(node)) => Some((Ok(node), self)),
            Ok(None) => None,
            Err(err) => {
                self.done = true;
                Some((Err(err), self))
            }
        }
    }

    async fn advance(&mut self) -> Result<Option<Node>, BeeError> {
        if self.remaining == Some(0) {
            return Ok(None);
        }
        let shared = self.bee.shared.clone();
        let reader = Reader::new(&shared);
        if !self.started {
            self.started = true;
            self.seek(reader).await?;
        }
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let slot = frame.slot;
            if slot < 0 || slot > frame.last_slot() {
                self.stack.pop();
                continue;
            }
            frame.slot += if self.reverse { -1 } else { 1 };
            let position = (slot / 2) as usize;
            if slot % 2 == 0 {
                if let Some(ptr) = frame.node.children.get(position).copied() {
                    let node = reader.node(ptr).await?;
                    let frame = Frame { node, slot: 0 };
                    let slot = if self.reverse { frame.last_slot() } else { 0 };
                    self.stack.push(Frame { slot, ..frame });
                }
                continue;
            }

            let seq = frame.node.keys[position];
            let block = reader.block(seq).await?;
            if self.past_end(&block.key) {
                self.done = true;
                return Ok(None);
            }
            let Some(key) = self.bee.strip_prefix(&block.key) else {
                continue;
            };
            if let Some(remaining) = self.remaining.as_mut() {
                *remaining -= 1;
            }
            return Ok(Some(Node {
                seq,
                key,
                value: block.value.clone().unwrap_or_default(),
            }));
        }
    }

    /// Positions the stack right before the first key within the starting bound.
    async fn seek(&mut self, reader: Reader<'_>) -> Result<(), BeeError> {
        let Some(mut ptr) = reader.root(self.version).await? else {
            return Ok(());
        };
        let start = if self.reverse {
            self.upper.clone()
        } else {
            self.lower.clone()
        };
        loop {
            let node = reader.node(ptr).await?;
            let Some(bound) = &start else {
                let slot = if self.reverse {
                    2 * node.keys.len() as i64
                } else {
                    0
                };
                self.stack.push(Frame { node, slot });
                return Ok(());
            };
            let found = reader.search(&node.keys, bound.key()).await?;
            let (slot, descend) = match (found, self.reverse) {
                (Ok(i), false) if bound.inclusive() => (2 * i as i64 + 1, None),
                (Ok(i), false) => (2 * i as i64 + 2, None),
                (Ok(i), true) if bound.inclusive() => (2 * i as i64 + 1, None),
                (Ok(i), true) => (2 * i as i64, None),
                (Err(i), false) => (2 * i as i64 + 1, node.children.get(i).copied()),
                (Err(i), true) => (2 * i as i64 - 1, node.children.get(i).copied()),
            };
            self.stack.push(Frame { node, slot });
            match descend {
                Some(child) => ptr = child,
                None => return Ok(()),
            }
        }
    }

    /// Whether `key` is beyond the bound on the side the scan moves towards.
    fn past_end(&self, key: &[u8]) -> bool {
        if self.reverse {
            match &self.lower {
                Some(Bound::Inclusive(lower)) => key < lower.as_ref(),
                Some(Bound::Exclusive(lower)) => key <= lower.as_ref(),
                None => false,
            }
        } else {
            match &self.upper {
                Some(Bound::Inclusive(upper)) => key > upper.as_ref(),
                Some(Bound::Exclusive(upper)) => key >= upper.as_ref(),
                None => false,
            }
        }
    }
}
