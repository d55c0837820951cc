use std::time::Duration;

use bytes::Bytes;
use feedbee::{
    bee::{Bee, BeeOptions},
    feed::{Feed, ReadStreamOptions},
    replicate::{ReplicateOptions, ReplicationError, ReplicationHandle, Replicator, replicate},
    storage::MemProvider,
};
use futures_util::StreamExt;
use n0_snafu::{Result, ResultExt};
use tokio::io::duplex;
use tracing_test::traced_test;

const TIMEOUT: Duration = Duration::from_secs(10);

async fn writer_with(entries: usize) -> Result<Feed> {
    let feed = Feed::builder().open(&MemProvider::new()).await?;
    feed.append_batch((0..entries).map(|i| Bytes::from(format!("entry {i}"))))
        .await?;
    Ok(feed)
}

async fn reader_of(feed: &Feed) -> Result<Feed> {
    Ok(Feed::builder()
        .public_key(feed.key())
        .open(&MemProvider::new())
        .await?)
}

async fn assert_same(a: &Feed, b: &Feed) -> Result {
    assert_eq!(a.len(), b.len());
    assert_eq!(a.head(), b.head());
    for i in 0..a.len() {
        let data = b.get(i).await?;
        assert_eq!(a.get(i).await?, data);
        let proof = b.proof(i).await?;
        assert!(a.verify(i, &data, &proof));
    }
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn full_sync() -> Result {
    let writer = writer_with(50).await?;
    let reader = reader_of(&writer).await?;
    let (a, b) = duplex(4096);

    let (up, down) = tokio::time::timeout(TIMEOUT, async {
        tokio::join!(
            replicate(writer.clone(), a, ReplicateOptions::default().initiator(true)),
            replicate(reader.clone(), b, ReplicateOptions::default()),
        )
    })
    .await
    .e()?;
    let (up, down) = (up?, down?);

    assert_eq!(up.uploaded, 50);
    assert_eq!(down.downloaded, 50);
    assert_eq!(reader.downloaded(), 50);
    assert!(!reader.writable());
    assert_same(&writer, &reader).await
}

#[tokio::test]
#[traced_test]
async fn reconnect_converges() -> Result {
    let writer = writer_with(300).await?;
    let reader = reader_of(&writer).await?;

    // First session: dropped as soon as some entries arrived.
    {
        let (a, b) = duplex(1024);
        let options = ReplicateOptions {
            max_inflight: 1,
            ..Default::default()
        };
        let _up = ReplicationHandle::spawn(writer.clone(), a, options.clone().initiator(true));
        let _down = ReplicationHandle::spawn(reader.clone(), b, options);
        let mut stream = reader.read_stream(ReadStreamOptions::live(0));
        tokio::time::timeout(TIMEOUT, stream.next())
            .await
            .e()?
            .expect("entry")?;
    }
    let partial = reader.downloaded();
    assert!(partial >= 1);

    // Appends that happen while disconnected are picked up as well.
    writer.append("late").await?;

    let (a, b) = duplex(4096);
    let (up, down) = tokio::time::timeout(TIMEOUT, async {
        tokio::join!(
            replicate(writer.clone(), a, ReplicateOptions::default()),
            replicate(reader.clone(), b, ReplicateOptions::default().initiator(true)),
        )
    })
    .await
    .e()?;
    up?;
    let down = down?;
    assert_eq!(down.downloaded, 301 - partial);
    assert_same(&writer, &reader).await
}

#[tokio::test]
#[traced_test]
async fn interrupted_session_reports_connection_lost() -> Result {
    let writer = writer_with(10).await?;
    let reader = reader_of(&writer).await?;
    let (a, b) = duplex(4096);
    let down = ReplicationHandle::spawn(reader.clone(), b, ReplicateOptions::default());
    drop(a);
    let err = tokio::time::timeout(TIMEOUT, down.join()).await.e()?.unwrap_err();
    assert!(matches!(err, ReplicationError::ConnectionLost { .. }), "{err:?}");
    // The feed is unaffected.
    assert!(!reader.is_closed());
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn sparse_downloads_on_demand() -> Result {
    let writer = writer_with(100).await?;
    let reader = reader_of(&writer).await?;
    let (a, b) = duplex(4096);
    let up = ReplicationHandle::spawn(
        writer.clone(),
        a,
        ReplicateOptions::default().initiator(true).live(true),
    );
    let down = ReplicationHandle::spawn(
        reader.clone(),
        b,
        ReplicateOptions::default().sparse(true).live(true),
    );

    // Gets fail with OutOfRange until the head of the writer arrived.
    tokio::time::timeout(TIMEOUT, async {
        while reader.len() < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .e()?;
    assert_eq!(reader.get(42).await?, "entry 42");
    assert_eq!(reader.get(7).await?, "entry 7");
    assert!(reader.has(42) && reader.has(7));
    assert_eq!(reader.downloaded(), 2);
    assert_eq!(reader.len(), 100);

    up.cancel();
    down.cancel();
    assert_eq!(up.join().await?.uploaded, 2);
    down.join().await?;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn live_session_streams_new_entries() -> Result {
    let writer = Feed::builder().open(&MemProvider::new()).await?;
    let reader = reader_of(&writer).await?;
    let writer_bee = Bee::open(writer.clone(), BeeOptions::default()).await?;

    let (a, b) = duplex(4096);
    let up = ReplicationHandle::spawn(writer.clone(), a, ReplicateOptions::default().live(true));
    let down = ReplicationHandle::spawn(
        reader.clone(),
        b,
        ReplicateOptions::default().initiator(true),
    );

    let mut stream = reader.read_stream(ReadStreamOptions::live(0));
    let header = tokio::time::timeout(TIMEOUT, stream.next())
        .await
        .e()?
        .expect("header")?;
    assert_eq!(header.index, 0);

    writer_bee.put("greeting", "hello").await?;
    let entry = tokio::time::timeout(TIMEOUT, stream.next())
        .await
        .e()?
        .expect("block")?;
    assert_eq!(entry.index, 1);

    let reader_bee = Bee::open(reader.clone(), BeeOptions::default()).await?;
    assert_eq!(
        reader_bee.get("greeting").await?.map(|n| n.value),
        Some("hello".into())
    );
    assert!(!down.is_finished());

    // Closing the local feed ends the session without an error.
    reader.close();
    let stats = tokio::time::timeout(TIMEOUT, down.join()).await.e()??;
    assert_eq!(stats.downloaded, 2);
    up.cancel();
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn mismatched_feeds_are_rejected() -> Result {
    let one = writer_with(1).await?;
    let two = writer_with(1).await?;
    let (a, b) = duplex(4096);
    let (left, right) = tokio::join!(
        replicate(one, a, ReplicateOptions::default().initiator(true)),
        replicate(two, b, ReplicateOptions::default()),
    );
    assert!(matches!(left, Err(ReplicationError::FeedMismatch { .. })));
    assert!(matches!(right, Err(ReplicationError::FeedMismatch { .. })));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn replicator_fans_out() -> Result {
    let writer = writer_with(20).await?;
    let replicator = Replicator::new(writer.clone(), ReplicateOptions::default());

    let mut readers = Vec::new();
    let mut sessions = Vec::new();
    for _ in 0..3 {
        let reader = reader_of(&writer).await?;
        let (a, b) = duplex(4096);
        replicator.handle_connection(a, false);
        sessions.push(ReplicationHandle::spawn(
            reader.clone(),
            b,
            ReplicateOptions::default().initiator(true),
        ));
        readers.push(reader);
    }

    for session in sessions {
        let stats = tokio::time::timeout(TIMEOUT, session.join()).await.e()??;
        assert_eq!(stats.downloaded, 20);
    }
    for reader in &readers {
        assert_same(&writer, reader).await?;
    }
    replicator.shutdown().await;
    assert_eq!(replicator.session_count(), 0);
    Ok(())
}
