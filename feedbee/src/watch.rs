//! Callback based observation of bees and feeds.
//!
//! Every subscription runs in its own task and is owned by the handle returned when it was
//! created. Cancelling a handle is idempotent, and dropping it cancels as well, so a consumer
//! that goes away never leaves a task behind.

use bytes::Bytes;
use futures_util::StreamExt;
use n0_future::task::AbortOnDropHandle;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, warn};

use crate::{
    bee::{Bee, BeeError, HistoryOptions},
    feed::{Entry, Feed, ReadStreamOptions},
};

/// Which keys a [`Subscription`] reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Every key.
    All,
    /// Exactly this key.
    Key(Bytes),
    /// Keys starting with these bytes.
    Prefix(Bytes),
}

impl Filter {
    /// Whether `key` passes the filter.
    pub fn matches(&self, key: &[u8]) -> bool {
        match self {
            Filter::All => true,
            Filter::Key(k) => k.as_ref() == key,
            Filter::Prefix(prefix) => key.starts_with(prefix),
        }
    }
}

/// A running subscription.
///
/// [`Subscription::cancel`] does not wait for the task. A change the task already took from
/// the stream may still reach the callback, later ones do not.
#[derive(Debug)]
pub struct Subscription {
    cancel: CancellationToken,
    task: AbortOnDropHandle<()>,
}

impl Subscription {
    fn spawn<F>(cancel: CancellationToken, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            cancel,
            task: AbortOnDropHandle::new(n0_future::task::spawn(task)),
        }
    }

    /// Stops the subscription.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!("subscription cancelled");
        }
        self.cancel.cancel();
    }

    /// Whether the subscription still delivers changes.
    ///
    /// It stops when cancelled, when the observed feed is closed, or after a read error.
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Calls `callback` with the new value and the resulting version for every mutation of
/// `bee` matching `filter`, starting with the next one.
///
/// Deletes are reported with `None`.
pub fn subscribe<F>(bee: &Bee, filter: Filter, mut callback: F) -> Result<Subscription, BeeError>
where
    F: FnMut(Option<Bytes>, u64) + Send + 'static,
{
    let mut history = bee.history(HistoryOptions::live(bee.version()))?;
    let cancel = CancellationToken::new();
    let span = debug_span!("subscription", feed = %bee.feed().key().fmt_short());
    let token = cancel.clone();
    let task = async move {
        loop {
            let change = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                change = history.next() => change,
            };
            match change {
                Some(Ok(change)) => {
                    if filter.matches(&change.key) {
                        let version = change.version();
                        callback(change.value, version);
                    }
                }
                Some(Err(err)) => {
                    warn!("history stream failed: {err:#}");
                    break;
                }
                None => break,
            }
        }
        debug!("subscription ended");
    };
    Ok(Subscription::spawn(cancel, task.instrument(span)))
}

/// Calls `callback` with every entry of `feed` from `start` on, including entries appended
/// or downloaded later.
pub fn subscribe_feed<F>(feed: &Feed, start: u64, mut callback: F) -> Subscription
where
    F: FnMut(Entry) + Send + 'static,
{
    let mut stream = feed.read_stream(ReadStreamOptions::live(start));
    let cancel = CancellationToken::new();
    let span = debug_span!("feed_subscription", feed = %feed.key().fmt_short());
    let token = cancel.clone();
    let task = async move {
        loop {
            let entry = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                entry = stream.next() => entry,
            };
            match entry {
                Some(Ok(entry)) => callback(entry),
                Some(Err(err)) => {
                    warn!("read stream failed: {err:#}");
                    break;
                }
                None => break,
            }
        }
        debug!("subscription ended");
    };
    Subscription::spawn(cancel, task.instrument(span))
}

/// A typed, json encoded value stored under one key of a bee.
///
/// The current value is fetched in the background when the view is created and then kept up
/// to date, so [`Value::get`] never waits. Writes on a bee that is not writable are no-ops.
#[derive(Debug)]
pub struct Value<T> {
    bee: Bee,
    key: Bytes,
    current: watch::Receiver<Option<T>>,
    _task: AbortOnDropHandle<()>,
}

impl<T> Value<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Creates a view of `key`.
    ///
    /// If the key does not exist and the bee is writable, `initial` is written to it.
    pub fn new(bee: &Bee, key: impl Into<Bytes>, initial: Option<T>) -> Self {
        let key = key.into();
        let (tx, current) = watch::channel(None);
        let span = debug_span!("value", key = ?key);
        let task = track(bee.clone(), key.clone(), initial, tx).instrument(span);
        Self {
            bee: bee.clone(),
            key,
            current,
            _task: AbortOnDropHandle::new(n0_future::task::spawn(task)),
        }
    }

    /// The key of this view.
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// The latest known value, `None` before the first fetch finished or if the key is absent.
    pub fn get(&self) -> Option<T> {
        self.current.borrow().clone()
    }

    /// Waits for the value to change. Returns false once it will not change anymore.
    pub async fn changed(&mut self) -> bool {
        self.current.changed().await.is_ok()
    }

    /// A stream of the value, starting with the current one.
    pub fn stream(&self) -> WatchStream<Option<T>> {
        WatchStream::new(self.current.clone())
    }

    /// Writes `value`. Returns the new version, or `None` if the bee is not writable.
    pub async fn put(&self, value: &T) -> Result<Option<u64>, BeeError> {
        if !self.bee.writable() {
            return Ok(None);
        }
        self.bee.put_json(&self.key, value).await.map(Some)
    }

    /// Removes the key. Returns the new version, or `None` if the bee is not writable.
    pub async fn del(&self) -> Result<Option<u64>, BeeError> {
        if !self.bee.writable() {
            return Ok(None);
        }
        self.bee.del(&self.key).await.map(Some)
    }
}

async fn track<T>(bee: Bee, key: Bytes, initial: Option<T>, tx: watch::Sender<Option<T>>)
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    // Checkouts never change, they are fetched once.
    let history = bee.history(HistoryOptions::live(bee.version())).ok();
    let snapshot = bee.snapshot();
    match snapshot.get_json::<T>(&key).await {
        Ok(Some(value)) => {
            tx.send_replace(Some(value));
        }
        Ok(None) => {
            if let Some(initial) = initial.filter(|_| bee.writable()) {
                // The write shows up in the history stream below.
                if let Err(err) = bee.put_json(&key, &initial).await {
                    warn!("failed to write initial value: {err:#}");
                }
            }
        }
        Err(err) => warn!("failed to fetch value: {err:#}"),
    }

    let Some(mut history) = history else {
        return;
    };
    while let Some(change) = history.next().await {
        let change = match change {
            Ok(change) => change,
            Err(err) => {
                warn!("history stream failed: {err:#}");
                return;
            }
        };
        if change.key != key {
            continue;
        }
        let version = change.version();
        let value = match change.value {
            Some(bytes) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(version, "undecodable value: {err}");
                    continue;
                }
            },
            None => None,
        };
        if tx.send(value).is_err() {
            return;
        }
    }
}
