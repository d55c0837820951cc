//! The log of mutations.

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{Bee, BeeError, HistoryStream, InvalidOptionsSnafu};

/// Bounds of a [`Bee::history`] stream, in block sequence numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryOptions {
    /// First block to consider. Block `0` is the header and never yielded.
    ///
    /// Passing [`Bee::version`] yields only changes committed after the call.
    pub gte: u64,
    /// Stop before this block.
    pub lt: Option<u64>,
    /// Keep yielding changes as they are committed.
    pub live: bool,
    /// Newest first. Not valid for live streams.
    pub reverse: bool,
}

impl HistoryOptions {
    /// Future changes only, starting at `version`.
    pub fn live(version: u64) -> Self {
        Self {
            gte: version,
            live: true,
            ..Default::default()
        }
    }
}

/// One committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// The block holding the mutation.
    pub seq: u64,
    /// The key, without the prefix of the sub it was read through.
    pub key: Bytes,
    /// The new value, `None` for deletes.
    pub value: Option<Bytes>,
}

impl Change {
    /// The bee version right after this change.
    pub fn version(&self) -> u64 {
        self.seq + 1
    }

    /// Whether this change removed its key.
    pub fn is_del(&self) -> bool {
        self.value.is_none()
    }
}

pub(super) fn stream(bee: Bee, options: HistoryOptions) -> Result<HistoryStream, BeeError> {
    if options.live && options.reverse {
        return InvalidOptionsSnafu {
            reason: "live history can not be reversed",
        }
        .fail();
    }
    if options.live && bee.checkout.is_some() {
        return InvalidOptionsSnafu {
            reason: "live history on a checkout",
        }
        .fail();
    }

    let version = bee.version();
    let start = options.gte.max(1);
    let (next, end) = if options.reverse {
        let end = options.lt.map_or(version, |lt| lt.min(version));
        (end, start)
    } else if options.live {
        (start, options.lt.unwrap_or(u64::MAX))
    } else {
        (start, options.lt.map_or(version, |lt| lt.min(version)))
    };

    let cancel = CancellationToken::new();
    let cursor = Cursor {
        changes: bee.shared.feed.subscribe_changes(),
        bee,
        next,
        end,
        live: options.live,
        reverse: options.reverse,
        done: false,
        cancel: cancel.clone(),
    };
    let inner = futures_util::stream::unfold(cursor, Cursor::step).boxed();
    Ok(HistoryStream::new(inner, cancel))
}

struct Cursor {
    bee: Bee,
    changes: watch::Receiver<u64>,
    /// Forward: the next seq to read. Reverse: one past it.
    next: u64,
    /// Forward: exclusive upper end. Reverse: inclusive lower end.
    end: u64,
    live: bool,
    reverse: bool,
    done: bool,
    cancel: CancellationToken,
}

impl Cursor {
    async fn step(mut self) -> Option<(Result<Change, BeeError>, Self)> {
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
            Ok(Some(change)) => Some((Ok(change), self)),
            Ok(None) => None,
            Err(err) => {
                self.done = true;
                Some((Err(err), self))
            }
        }
    }

    async fn advance(&mut self) -> Result<Option<Change>, BeeError> {
        loop {
            let seq = if self.reverse {
                if self.next <= self.end {
                    return Ok(None);
                }
                self.next -= 1;
                self.next
            } else {
                if self.next >= self.end {
                    return Ok(None);
                }
                if self.next >= self.bee.shared.feed.len() {
                    if !self.live || !self.wait().await {
                        return Ok(None);
                    }
                    continue;
                }
                self.next += 1;
                self.next - 1
            };

            let block = self.bee.shared.block(seq).await?;
            if let Some(key) = self.bee.strip_prefix(&block.key) {
                return Ok(Some(Change {
                    seq,
                    key,
                    value: block.value.clone(),
                }));
            }
        }
    }

    /// Waits for the feed to change. Returns false once it is closed.
    async fn wait(&mut self) -> bool {
        let feed = self.bee.shared.feed.clone();
        tokio::select! {
            _ = feed.closed().cancelled() => false,
            res = self.changes.changed() => res.is_ok(),
        }
    }
}
