//! Pull based streams of feed entries.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures_util::{Stream, StreamExt, stream::BoxStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{Entry, Feed, FeedError};

/// Options for [`Feed::read_stream`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadStreamOptions {
    /// First entry to yield.
    pub start: u64,
    /// Stop before this entry.
    pub end: Option<u64>,
    /// Keep yielding entries as they are appended or downloaded.
    ///
    /// A non-live stream ends at `end` or at the length of the feed when the stream was
    /// created, whichever is smaller.
    pub live: bool,
}

impl ReadStreamOptions {
    /// A live stream from `start`.
    pub fn live(start: u64) -> Self {
        Self {
            start,
            end: None,
            live: true,
        }
    }
}

/// A stream of [`Entry`] items.
///
/// The stream yields entries in order. Entries that are not local are awaited like
/// [`Feed::get`] does; if one can not be obtained the error is yielded and the stream ends.
/// A live stream ends only when cancelled, dropped, or when the feed is closed.
pub struct ReadStream {
    inner: BoxStream<'static, Result<Entry, FeedError>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadStream")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ReadStream {
    pub(super) fn new(feed: Feed, options: ReadStreamOptions) -> Self {
        let cancel = CancellationToken::new();
        let end = match (options.live, options.end) {
            (true, end) => end,
            (false, Some(end)) => Some(end.min(feed.len())),
            (false, None) => Some(feed.len()),
        };
        let cursor = Cursor {
            changes: feed.subscribe_changes(),
            feed,
            next: options.start,
            end,
            live: options.live,
            cancel: cancel.clone(),
            done: false,
        };
        let inner = futures_util::stream::unfold(cursor, Cursor::step).boxed();
        Self { inner, cancel }
    }

    /// Stops the stream. Pending and later polls return `None`. Calling this twice is fine.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether [`Self::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for ReadStream {
    type Item = Result<Entry, FeedError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.inner.poll_next_unpin(cx)
    }
}

struct Cursor {
    feed: Feed,
    changes: watch::Receiver<u64>,
    next: u64,
    end: Option<u64>,
    live: bool,
    cancel: CancellationToken,
    done: bool,
}

impl Cursor {
    async fn step(mut self) -> Option<(Result<Entry, FeedError>, Self)> {
        loop {
            if self.done || self.cancel.is_cancelled() || self.feed.is_closed() {
                return None;
            }
            if self.end.is_some_and(|end| self.next >= end) {
                return None;
            }
            if self.next < self.feed.len() {
                let index = self.next;
                let res = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return None,
                    res = self.feed.get(index) => res,
                };
                return match res {
                    Ok(data) => {
                        self.next += 1;
                        Some((Ok(Entry { index, data }), self))
                    }
                    Err(err) => {
                        self.done = true;
                        Some((Err(err), self))
                    }
                };
            }
            if !self.live {
                return None;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = self.feed.closed().cancelled() => return None,
                res = self.changes.changed() => {
                    if res.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}
