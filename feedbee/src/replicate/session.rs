use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use futures_util::{SinkExt, StreamExt};
use snafu::ensure;
use n0_future::task::AbortOnDropHandle;
use tokio::{
    io::{AsyncRead, AsyncWrite, WriteHalf},
    sync::{mpsc, watch},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{Instrument, debug, debug_span, trace};

use super::{
    ConnectionLostSnafu, FeedMismatchSnafu, ProtocolSnafu, ReplicateOptions, ReplicationError,
    SessionStats,
    codec::{CodecError, Handshake, Message, MessageCodec, PROTOCOL},
};
use crate::feed::{Feed, FeedError, SignedHead};

pub(super) async fn run<S>(
    feed: Feed,
    stream: S,
    options: ReplicateOptions,
    cancel: CancellationToken,
) -> Result<SessionStats, ReplicationError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let span = debug_span!(
        "replicate",
        feed = %feed.key().fmt_short(),
        initiator = options.initiator
    );
    async move {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, MessageCodec);
        let (out, rx) = mpsc::unbounded_channel();
        let writer = AbortOnDropHandle::new(n0_future::task::spawn(write_loop(
            FramedWrite::new(write_half, MessageCodec),
            rx,
        )));

        let local = Handshake {
            protocol: PROTOCOL.to_string(),
            key: feed.key(),
            live: options.live,
            head: feed.head(),
        };
        let remote = if options.initiator {
            let _ = out.send(Message::Handshake(local));
            recv_handshake(&mut reader, &cancel).await?
        } else {
            let remote = recv_handshake(&mut reader, &cancel).await?;
            let _ = out.send(Message::Handshake(local));
            remote
        };
        let Some(remote) = remote else {
            debug!("cancelled during handshake");
            return Ok(SessionStats::default());
        };
        if remote.protocol != PROTOCOL {
            return ProtocolSnafu {
                reason: format!("unsupported protocol {:?}", remote.protocol),
            }
            .fail();
        }
        if remote.key != feed.key() {
            // Flush our handshake so the remote can tell the cause as well.
            drop(out);
            let _ = writer.await;
            return FeedMismatchSnafu {
                local: feed.key(),
                remote: remote.key,
            }
            .fail();
        }

        let live = options.live || remote.live;
        debug!(live, remote_length = remote.head.map(|h| h.length), "handshake done");
        let mut session = Session {
            wants: feed.subscribe_wants(),
            feed,
            max_inflight: options.max_inflight.max(1),
            sparse: options.sparse,
            live,
            out,
            remote_have: RemoteHave::default(),
            got_have: false,
            inflight: BTreeSet::new(),
            unavailable: BTreeSet::new(),
            scan_from: 0,
            sent_length: 0,
            sent_ranges: Vec::new(),
            sent_have: false,
            haves_sent: 0,
            haves_received: 0,
            sent_synced: false,
            remote_synced: false,
            stats: SessionStats::default(),
        };
        if let Some(head) = remote.head {
            session.on_head(head).await?;
        }
        session.announce();
        session.drive(&mut reader, writer, &cancel).await
    }
    .instrument(span)
    .await
}

async fn recv_handshake<R>(
    reader: &mut FramedRead<R, MessageCodec>,
    cancel: &CancellationToken,
) -> Result<Option<Handshake>, ReplicationError>
where
    R: AsyncRead + Unpin,
{
    let msg = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(None),
        msg = reader.next() => msg,
    };
    match msg {
        Some(Ok(Message::Handshake(handshake))) => Ok(Some(handshake)),
        Some(Ok(other)) => ProtocolSnafu {
            reason: format!("expected handshake, got {}", name(&other)),
        }
        .fail(),
        Some(Err(err)) => Err(codec_error(err)),
        None => ConnectionLostSnafu {
            reason: "closed during handshake",
        }
        .fail(),
    }
}

async fn write_loop<S>(
    mut writer: FramedWrite<WriteHalf<S>, MessageCodec>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) -> Result<(), CodecError>
where
    S: AsyncWrite,
{
    while let Some(msg) = rx.recv().await {
        trace!("send {}", name(&msg));
        writer.send(msg).await?;
    }
    writer.close().await
}

struct Session {
    feed: Feed,
    wants: watch::Receiver<BTreeMap<u64, usize>>,
    max_inflight: usize,
    sparse: bool,
    live: bool,
    out: mpsc::UnboundedSender<Message>,
    /// What the remote announced.
    remote_have: RemoteHave,
    got_have: bool,
    inflight: BTreeSet<u64>,
    /// Entries the remote announced but could not serve, until its next announcement.
    unavailable: BTreeSet<u64>,
    /// Entries below this are known to be local.
    scan_from: u64,
    sent_length: u64,
    sent_ranges: Vec<Range<u64>>,
    sent_have: bool,
    /// Number of `Have` messages sent and received, acknowledged through `Synced`.
    haves_sent: u64,
    haves_received: u64,
    sent_synced: bool,
    remote_synced: bool,
    stats: SessionStats,
}

impl Session {
    async fn drive<R>(
        mut self,
        reader: &mut FramedRead<R, MessageCodec>,
        mut writer: AbortOnDropHandle<Result<(), CodecError>>,
        cancel: &CancellationToken,
    ) -> Result<SessionStats, ReplicationError>
    where
        R: AsyncRead + Unpin,
    {
        let feed = self.feed.clone();
        let mut changes = feed.subscribe_changes();
        loop {
            self.request_more();
            if !self.sent_synced && self.got_have && self.inflight.is_empty() {
                self.send(Message::Synced {
                    haves: self.haves_received,
                });
                self.sent_synced = true;
            }
            if !self.live && self.sent_synced && self.remote_synced {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(?self.stats, "session cancelled");
                    return Ok(self.stats);
                }
                _ = feed.closed().cancelled() => {
                    debug!("feed closed");
                    return Ok(self.stats);
                }
                res = &mut writer => {
                    let reason = match res {
                        Ok(Ok(())) => "writer stopped".to_string(),
                        Ok(Err(err)) => err.to_string(),
                        Err(err) => err.to_string(),
                    };
                    return ConnectionLostSnafu { reason }.fail();
                }
                msg = reader.next() => match msg {
                    Some(Ok(msg)) => self.on_message(msg).await?,
                    Some(Err(err)) => return Err(codec_error(err)),
                    None => {
                        return ConnectionLostSnafu {
                            reason: "remote closed the connection",
                        }
                        .fail();
                    }
                },
                _ = changes.changed() => self.announce(),
                _ = self.wants.changed() => {}
            }
        }

        debug!(?self.stats, "session synced");
        let Session { out, stats, .. } = self;
        drop(out);
        if let Ok(Err(err)) = writer.await {
            debug!("flushing failed: {err}");
        }
        Ok(stats)
    }

    async fn on_message(&mut self, msg: Message) -> Result<(), ReplicationError> {
        trace!("recv {}", name(&msg));
        match msg {
            Message::Handshake(_) => {
                return ProtocolSnafu {
                    reason: "duplicate handshake",
                }
                .fail();
            }
            Message::Head(head) => self.on_head(head).await?,
            Message::Have { ranges } => {
                self.remote_have = RemoteHave::new(ranges, self.feed.len())?;
                self.got_have = true;
                self.haves_received += 1;
                self.unavailable.clear();
                // The new announcement may need more requests, declare again once done.
                self.sent_synced = false;
            }
            Message::Request { index } => match self.feed.serve(index).await {
                Ok(Some((value, proof, head))) => {
                    self.send(Message::Data {
                        index,
                        value,
                        proof,
                        head,
                    });
                    self.stats.uploaded += 1;
                }
                Ok(None) => self.send(Message::NoData { index }),
                Err(source) => return Err(ReplicationError::Feed { source }),
            },
            Message::Data {
                index,
                value,
                proof,
                head,
            } => {
                self.inflight.remove(&index);
                let had = self.feed.has(index);
                match self.feed.ingest(index, value, &proof, head).await {
                    Ok(_) => {
                        if !had {
                            self.stats.downloaded += 1;
                        }
                    }
                    Err(FeedError::Integrity { source }) => {
                        return Err(ReplicationError::Integrity { source });
                    }
                    Err(source) => return Err(ReplicationError::Feed { source }),
                }
            }
            Message::NoData { index } => {
                self.inflight.remove(&index);
                self.unavailable.insert(index);
            }
            Message::Synced { haves } => self.remote_synced = haves == self.haves_sent,
        }
        Ok(())
    }

    async fn on_head(&mut self, head: SignedHead) -> Result<(), ReplicationError> {
        match self.feed.update_head(head).await {
            Ok(adopted) => {
                if adopted {
                    debug!(length = head.length, "adopted remote head");
                }
                Ok(())
            }
            Err(FeedError::Integrity { source }) => Err(ReplicationError::Integrity { source }),
            Err(source) => Err(ReplicationError::Feed { source }),
        }
    }

    /// Tells the remote about a new head and new local entries.
    fn announce(&mut self) {
        if self.sent_synced && !self.live {
            return;
        }
        if let Some(head) = self.feed.head() {
            if head.length > self.sent_length {
                self.sent_length = head.length;
                self.send(Message::Head(head));
            }
        }
        let ranges = self.feed.ranges();
        if ranges != self.sent_ranges || !self.sent_have {
            self.sent_have = true;
            self.sent_ranges = ranges.clone();
            self.haves_sent += 1;
            self.remote_synced = false;
            self.send(Message::Have { ranges });
        }
    }

    /// Fills the request window.
    fn request_more(&mut self) {
        if !self.got_have {
            return;
        }
        let length = self.feed.len();
        let mut budget = self.max_inflight.saturating_sub(self.inflight.len());
        let wanted: Vec<u64> = self.wants.borrow().keys().copied().collect();
        for index in wanted {
            if budget == 0 {
                return;
            }
            if self.should_request(index, length) {
                self.request(index);
                budget -= 1;
            }
        }
        if self.sparse {
            return;
        }
        while self.scan_from < length && self.feed.has(self.scan_from) {
            self.scan_from += 1;
        }
        for range in self.remote_have.ranges.clone() {
            let start = range.start.max(self.scan_from);
            for index in start..range.end.min(length) {
                if budget == 0 {
                    return;
                }
                if self.should_request(index, length) {
                    self.request(index);
                    budget -= 1;
                }
            }
        }
    }

    fn should_request(&self, index: u64, length: u64) -> bool {
        index < length
            && self.remote_have.contains(index)
            && !self.feed.has(index)
            && !self.inflight.contains(&index)
            && !self.unavailable.contains(&index)
    }

    fn request(&mut self, index: u64) {
        self.sent_synced = false;
        self.inflight.insert(index);
        self.send(Message::Request { index });
    }

    fn send(&self, msg: Message) {
        // A closed channel means the writer failed, which `drive` reports.
        let _ = self.out.send(msg);
    }
}

/// The entries announced by the remote, as sorted, disjoint ranges.
#[derive(Debug, Default)]
struct RemoteHave {
    ranges: Vec<Range<u64>>,
}

impl RemoteHave {
    /// Validates an announcement against the longest head known locally.
    ///
    /// The remote adopted no head longer than the one it sent before, which this side adopted
    /// in turn, so every announced entry lies below `length`.
    fn new(ranges: Vec<Range<u64>>, length: u64) -> Result<Self, ReplicationError> {
        let mut end = 0;
        for range in &ranges {
            ensure!(
                range.start >= end && range.start < range.end,
                ProtocolSnafu {
                    reason: format!("have range {range:?} is empty or out of order"),
                }
            );
            ensure!(
                range.end <= length,
                ProtocolSnafu {
                    reason: format!("have range {range:?} exceeds length {length}"),
                }
            );
            end = range.end;
        }
        Ok(Self { ranges })
    }

    fn contains(&self, index: u64) -> bool {
        let i = self.ranges.partition_point(|range| range.end <= index);
        self.ranges.get(i).is_some_and(|range| range.start <= index)
    }
}

fn codec_error(err: CodecError) -> ReplicationError {
    match err {
        CodecError::Io { source } => ReplicationError::ConnectionLost {
            reason: source.to_string(),
        },
        other => ReplicationError::Protocol {
            reason: other.to_string(),
        },
    }
}

fn name(msg: &Message) -> &'static str {
    match msg {
        Message::Handshake(_) => "handshake",
        Message::Head(_) => "head",
        Message::Have { .. } => "have",
        Message::Request { .. } => "request",
        Message::Data { .. } => "data",
        Message::NoData { .. } => "no-data",
        Message::Synced { .. } => "synced",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_have() {
        let have = RemoteHave::new(vec![0..2, 5..6, 8..10], 10).unwrap();
        assert!(have.contains(0) && have.contains(1) && have.contains(5) && have.contains(9));
        assert!(!have.contains(2) && !have.contains(7) && !have.contains(10));
        assert!(!RemoteHave::default().contains(0));

        for ranges in [
            vec![u64::MAX - 1..u64::MAX],
            vec![0..11],
            vec![3..3],
            vec![4..6, 2..3],
            vec![0..4, 3..5],
        ] {
            let err = RemoteHave::new(ranges.clone(), 10).unwrap_err();
            assert!(matches!(err, ReplicationError::Protocol { .. }), "{ranges:?}");
        }
    }
}
