//! Authenticated append-only logs with a sorted index, a versioned filesystem and peer
//! replication.
//!
//! The building blocks, bottom up:
//!
//! - [`storage`]: pluggable random access regions, in memory or on disk.
//! - [`feed`]: a single-writer log whose entries are verifiable through Merkle proofs against
//!   a signed head.
//! - [`bee`]: a copy-on-write B-tree stored in a feed, with snapshots, range scans and a
//!   history of mutations.
//! - [`drive`]: files and directories on a bee.
//! - [`replicate`]: a symmetric protocol syncing one feed between two peers over any duplex
//!   byte stream.
//! - [`registry`] and [`watch`]: named instances and callback subscriptions for applications.
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use feedbee::{bee::Bee, feed::Feed, storage::MemProvider};
//!
//! let feed = Feed::builder().open(&MemProvider::new()).await?;
//! let bee = Bee::open(feed, Default::default()).await?;
//! bee.put("hello", "world").await?;
//! assert_eq!(bee.get("hello").await?.map(|node| node.value), Some("world".into()));
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(feedbee_docsrs, feature(doc_cfg))]

pub mod bee;
pub mod config;
pub mod drive;
pub mod feed;
pub mod registry;
pub mod replicate;
pub mod storage;
pub mod watch;

pub use feedbee_base::{Hash, PublicKey, SecretKey, Signature};

pub use self::{
    bee::{Bee, BeeError},
    config::Config,
    drive::{Drive, DriveError},
    feed::{Feed, FeedError},
    registry::{Registry, RegistryError},
    replicate::{ReplicateOptions, ReplicationError, Replicator, replicate},
};
