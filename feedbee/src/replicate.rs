//! Replication of a feed between two peers over any duplex byte stream.
//!
//! Both peers run the same protocol. The initiator sends a handshake naming the feed and its
//! head, the responder answers with its own. From then on each side announces which entries
//! it has, requests the entries it lacks and answers requests of the other side with the
//! entry, an inclusion proof and its signed head. Nothing is stored before it verified.
//!
//! A session that is not live ends once both sides declared they have nothing left to
//! request. A live session keeps announcing new entries until it is cancelled or the
//! connection breaks. Sessions do not encrypt, that is the job of the transport.
//!
//! [`replicate`] runs a session in the current task, [`ReplicationHandle::spawn`] in a
//! background task, and a [`Replicator`] manages the sessions of one feed across many
//! connections.

use std::sync::{Arc, Mutex};

use feedbee_base::PublicKey;
use n0_future::task::{AbortOnDropHandle, JoinSet};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::feed::{Feed, FeedError, VerifyError};

mod codec;
mod session;

/// Errors ending a replication session.
///
/// None of them affect the feed or other sessions. After [`ReplicationError::ConnectionLost`]
/// a new session picks up where this one stopped.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ReplicationError {
    /// The remote sent data that failed verification.
    #[snafu(display("remote sent data that does not verify"))]
    Integrity { source: VerifyError },
    /// The transport closed or failed.
    #[snafu(display("connection lost: {reason}"))]
    ConnectionLost { reason: String },
    /// The remote replicates a different feed.
    #[snafu(display("remote replicates feed {remote}, not {local}"))]
    FeedMismatch { local: PublicKey, remote: PublicKey },
    /// The remote violated the protocol.
    #[snafu(display("protocol violation: {reason}"))]
    Protocol { reason: String },
    /// The local feed failed.
    #[snafu(display("local feed error"))]
    Feed { source: FeedError },
    /// The session task panicked or was aborted.
    #[snafu(display("session task failed"))]
    Aborted {},
}

/// How a session behaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicateOptions {
    /// Whether this side opened the connection.
    #[serde(skip)]
    pub initiator: bool,
    /// Keep the session open and exchange new entries as they appear.
    ///
    /// A session is live if either side asks for it.
    pub live: bool,
    /// Only download entries that local readers wait for.
    pub sparse: bool,
    /// Maximum number of outstanding requests.
    pub max_inflight: usize,
}

impl Default for ReplicateOptions {
    fn default() -> Self {
        Self {
            initiator: false,
            live: false,
            sparse: false,
            max_inflight: 16,
        }
    }
}

impl ReplicateOptions {
    /// Sets [`Self::initiator`].
    pub fn initiator(mut self, initiator: bool) -> Self {
        self.initiator = initiator;
        self
    }

    /// Sets [`Self::live`].
    pub fn live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Sets [`Self::sparse`].
    pub fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }
}

/// What a finished session transferred.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Entries sent to the remote.
    pub uploaded: u64,
    /// Entries received from the remote and stored.
    pub downloaded: u64,
}

/// Replicates `feed` over `stream` until the session ends.
pub async fn replicate<S>(
    feed: Feed,
    stream: S,
    options: ReplicateOptions,
) -> Result<SessionStats, ReplicationError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    session::run(feed, stream, options, CancellationToken::new()).await
}

/// A session running in a background task.
///
/// Dropping the handle aborts the session.
#[derive(Debug)]
pub struct ReplicationHandle {
    cancel: CancellationToken,
    task: AbortOnDropHandle<Result<SessionStats, ReplicationError>>,
}

impl ReplicationHandle {
    /// Spawns a session replicating `feed` over `stream`.
    pub fn spawn<S>(feed: Feed, stream: S, options: ReplicateOptions) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = n0_future::task::spawn(session::run(feed, stream, options, cancel.clone()));
        Self {
            cancel,
            task: AbortOnDropHandle::new(task),
        }
    }

    /// Asks the session to stop. Calling this more than once is fine.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the session task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the session to end.
    pub async fn join(self) -> Result<SessionStats, ReplicationError> {
        match self.task.await {
            Ok(res) => res,
            Err(err) => {
                warn!("replication task failed: {err}");
                AbortedSnafu.fail()
            }
        }
    }
}

/// Runs one session per connection for a feed.
#[derive(Debug, Clone)]
pub struct Replicator {
    feed: Feed,
    options: ReplicateOptions,
    cancel: CancellationToken,
    sessions: Arc<Mutex<JoinSet<Result<SessionStats, ReplicationError>>>>,
}

impl Replicator {
    /// Creates a replicator. `options.initiator` is ignored, it is set per connection.
    pub fn new(feed: Feed, options: ReplicateOptions) -> Self {
        Self {
            feed,
            options,
            cancel: CancellationToken::new(),
            sessions: Default::default(),
        }
    }

    /// The replicated feed.
    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    /// Starts a session over a connection handed over by the discovery layer.
    ///
    /// The outcome of the session is logged.
    pub fn handle_connection<S>(&self, stream: S, initiator: bool)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let options = self.options.clone().initiator(initiator);
        let session = session::run(self.feed.clone(), stream, options, self.cancel.child_token());
        let mut sessions = self.sessions.lock().expect("poisoned");
        // Reap finished sessions so the set does not grow with every connection.
        while let Some(res) = sessions.try_join_next() {
            log_outcome(res);
        }
        sessions.spawn(session);
    }

    /// Number of sessions that were started and not yet reaped.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("poisoned").len()
    }

    /// Cancels all sessions and waits for them to end.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut sessions = std::mem::take(&mut *self.sessions.lock().expect("poisoned"));
        while let Some(res) = sessions.join_next().await {
            log_outcome(res);
        }
        debug!(feed = %self.feed.key().fmt_short(), "replicator shut down");
    }
}

fn log_outcome(
    res: Result<Result<SessionStats, ReplicationError>, n0_future::task::JoinError>,
) {
    match res {
        Ok(Ok(stats)) => debug!(?stats, "session finished"),
        Ok(Err(err)) => warn!("session failed: {err:#}"),
        Err(err) => warn!("session task failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use std::{ops::Range, time::Duration};

    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use n0_snafu::{Result, ResultExt};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio_util::codec::{FramedRead, FramedWrite};
    use tracing_test::traced_test;

    use super::{
        codec::{Handshake, Message, MessageCodec, PROTOCOL},
        *,
    };
    use crate::storage::MemProvider;

    async fn feeds() -> Result<(Feed, Feed)> {
        let writer = Feed::builder().open(&MemProvider::new()).await?;
        writer
            .append_batch(["a", "b", "c"].map(Bytes::from))
            .await?;
        let reader = Feed::builder()
            .public_key(writer.key())
            .open(&MemProvider::new())
            .await?;
        Ok((writer, reader))
    }

    type FakeRead = FramedRead<ReadHalf<DuplexStream>, MessageCodec>;
    type FakeWrite = FramedWrite<WriteHalf<DuplexStream>, MessageCodec>;

    /// Starts a session for `reader` and plays the remote side by hand, sending the handshake
    /// of `writer` followed by `ranges`.
    async fn fake_writer(
        writer: &Feed,
        reader: &Feed,
        ranges: Vec<Range<u64>>,
    ) -> Result<(ReplicationHandle, FakeRead, FakeWrite)> {
        let (a, b) = tokio::io::duplex(4096);
        let session = ReplicationHandle::spawn(reader.clone(), b, ReplicateOptions::default());
        let (read, write) = tokio::io::split(a);
        let rx = FramedRead::new(read, MessageCodec);
        let mut tx = FramedWrite::new(write, MessageCodec);
        tx.send(Message::Handshake(Handshake {
            protocol: PROTOCOL.to_string(),
            key: writer.key(),
            live: false,
            head: writer.head(),
        }))
        .await
        .e()?;
        tx.send(Message::Have { ranges }).await.e()?;
        Ok((session, rx, tx))
    }

    #[tokio::test]
    #[traced_test]
    async fn test_tampered_data_ends_session() -> Result {
        let (writer, reader) = feeds().await?;
        let (session, mut rx, mut tx) = fake_writer(&writer, &reader, writer.ranges()).await?;

        let index = loop {
            match rx.next().await.expect("open").e()? {
                Message::Request { index } => break index,
                _ => continue,
            }
        };
        let (_, proof, head) = writer.serve(index).await?.expect("stored");
        tx.send(Message::Data {
            index,
            value: Bytes::from_static(b"evil"),
            proof,
            head,
        })
        .await
        .e()?;

        let err = session.join().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Integrity { .. }), "{err:?}");
        assert_eq!(reader.downloaded(), 0);
        assert!(!reader.is_closed());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_have_beyond_head_is_a_protocol_error() -> Result {
        let (writer, reader) = feeds().await?;
        let (session, _rx, _tx) =
            fake_writer(&writer, &reader, vec![u64::MAX - 1..u64::MAX]).await?;
        let err = tokio::time::timeout(Duration::from_secs(10), session.join())
            .await
            .e()?
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Protocol { .. }), "{err:?}");
        assert!(!reader.is_closed());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_have_after_synced_is_requested() -> Result {
        let (writer, reader) = feeds().await?;
        let (session, mut rx, mut tx) = fake_writer(&writer, &reader, vec![0..1]).await?;

        // Announce the rest only after the session declared it is done with the first entry.
        let mut haves = 0;
        let mut announced = false;
        tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(msg) = rx.next().await {
                match msg.e()? {
                    Message::Have { .. } => haves += 1,
                    Message::Request { index } => {
                        let (value, proof, head) = writer.serve(index).await?.expect("stored");
                        tx.send(Message::Data {
                            index,
                            value,
                            proof,
                            head,
                        })
                        .await
                        .e()?;
                    }
                    Message::Synced { .. } => {
                        if !announced {
                            announced = true;
                            tx.send(Message::Have {
                                ranges: writer.ranges(),
                            })
                            .await
                            .e()?;
                        }
                        // The session may already have ended if it was waiting for nothing else.
                        let _ = tx.send(Message::Synced { haves }).await;
                    }
                    _ => {}
                }
            }
            Ok::<_, n0_snafu::Error>(())
        })
        .await
        .e()??;

        let stats = session.join().await?;
        assert_eq!(stats.downloaded, 3);
        assert!(reader.has(2));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_missing_handshake_is_a_protocol_error() -> Result {
        let (_, reader) = feeds().await?;
        let (a, b) = tokio::io::duplex(4096);
        let session = ReplicationHandle::spawn(reader, b, ReplicateOptions::default());
        let mut tx = FramedWrite::new(a, MessageCodec);
        tx.send(Message::Request { index: 0 }).await.e()?;

        let err = session.join().await.unwrap_err();
        assert!(matches!(err, ReplicationError::Protocol { .. }), "{err:?}");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_cancel_is_a_clean_end() -> Result {
        let (_, reader) = feeds().await?;
        let (_a, b) = tokio::io::duplex(4096);
        let session = ReplicationHandle::spawn(reader, b, ReplicateOptions::default());
        session.cancel();
        session.cancel();
        assert_eq!(session.join().await?, SessionStats::default());
        Ok(())
    }
}
