//! Define the commands and their arguments.

use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result, ensure};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use feedbee::{
    Bee, Config, Feed, PublicKey, Registry, Replicator,
    bee::{HistoryOptions, RangeOptions},
    feed::ReadStreamOptions,
    registry::Keys,
    replicate::{ReplicateOptions, replicate},
};
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

/// feedbee is a tool for authenticated append-only logs and the indexes built on them.
#[derive(Parser, Debug, Clone)]
#[clap(version, verbatim_doc_comment)]
pub(crate) struct Cli {
    #[clap(subcommand)]
    pub(crate) command: Commands,

    /// Path to the configuration file, see <https://github.com/feedbee/feedbee>.
    #[clap(long)]
    pub(crate) config: Option<PathBuf>,

    /// Directory holding the feeds. Overrides the configuration file.
    #[clap(long)]
    pub(crate) data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Commands {
    /// Create a new writable feed and print its key.
    Create {
        /// Initialise the feed as a bee.
        #[clap(long)]
        bee: bool,
    },
    /// Append entries to a writable feed.
    Append {
        /// The key of the feed.
        feed: PublicKey,
        /// One entry per argument, appended as a single batch.
        #[clap(required = true)]
        data: Vec<String>,
    },
    /// Print the entries of a feed, one per line.
    Cat {
        /// The key of the feed.
        feed: PublicKey,
        /// Index of the first entry.
        #[clap(long, default_value_t = 0)]
        start: u64,
        /// Keep printing entries as they arrive.
        #[clap(long)]
        live: bool,
    },
    /// Set a key in a bee.
    Put {
        /// The key of the bee's feed.
        bee: PublicKey,
        key: String,
        value: String,
    },
    /// Print the value of a key in a bee.
    Get {
        /// The key of the bee's feed.
        bee: PublicKey,
        key: String,
        /// Read at this version instead of the latest.
        #[clap(long)]
        version: Option<u64>,
    },
    /// Delete a key from a bee.
    Del {
        /// The key of the bee's feed.
        bee: PublicKey,
        key: String,
    },
    /// List the keys of a bee in order.
    Ls {
        /// The key of the bee's feed.
        bee: PublicKey,
        /// Lower bound, inclusive.
        #[clap(long)]
        gte: Option<String>,
        /// Upper bound, exclusive.
        #[clap(long)]
        lt: Option<String>,
        /// Largest key first.
        #[clap(long)]
        reverse: bool,
        /// Print at most this many entries.
        #[clap(long)]
        limit: Option<usize>,
    },
    /// Print the mutations of a bee as json lines.
    History {
        /// The key of the bee's feed.
        bee: PublicKey,
        /// First version to print.
        #[clap(long, default_value_t = 1)]
        gte: u64,
        /// Keep printing mutations as they are committed.
        #[clap(long)]
        live: bool,
    },
    /// Accept replication sessions for a feed.
    Listen {
        /// The key of the feed.
        feed: PublicKey,
        /// The address to bind to.
        #[clap(long, default_value = "127.0.0.1:7150")]
        addr: SocketAddr,
        /// Keep sessions open and forward new entries.
        #[clap(long)]
        live: bool,
    },
    /// Replicate a feed with a listening peer.
    Connect {
        /// The key of the feed.
        feed: PublicKey,
        /// The address of the peer.
        addr: SocketAddr,
        /// Keep the session open and forward new entries.
        #[clap(long)]
        live: bool,
        /// Only download entries that are read locally.
        #[clap(long)]
        sparse: bool,
    },
}

impl Cli {
    pub(crate) async fn run(self, mut config: Config) -> Result<()> {
        if let Some(dir) = self.data_dir {
            config.storage.data_dir = Some(dir);
        }
        let registry = Registry::from_config(&config)?;
        let replication = config.replication.clone();
        let res = self.command.run(&registry, replication).await;
        registry.close().await;
        res
    }
}

impl Commands {
    async fn run(self, registry: &Registry, replication: ReplicateOptions) -> Result<()> {
        match self {
            Commands::Create { bee } => {
                let feed = if bee {
                    registry.open_bee("new", Keys::Generate).await?.feed().clone()
                } else {
                    registry.open_feed("new", Keys::Generate).await?
                };
                println!("{}", feed.key());
            }
            Commands::Append { feed, data } => {
                let feed = open_feed(registry, feed).await?;
                ensure!(feed.writable(), "feed {} is not writable", feed.key().fmt_short());
                let len = feed
                    .append_batch(data.into_iter().map(Bytes::from))
                    .await?;
                println!("{len}");
            }
            Commands::Cat { feed, start, live } => {
                let feed = open_feed(registry, feed).await?;
                let options = ReadStreamOptions {
                    start,
                    end: None,
                    live,
                };
                let mut stream = feed.read_stream(options);
                while let Some(entry) = stream.next().await {
                    let entry = entry?;
                    println!("{}\t{}", entry.index, String::from_utf8_lossy(&entry.data));
                }
            }
            Commands::Put { bee, key, value } => {
                let bee = open_bee(registry, bee).await?;
                ensure!(bee.writable(), "bee {} is not writable", bee.feed().key().fmt_short());
                let version = bee.put(key, value).await?;
                println!("{version}");
            }
            Commands::Get { bee, key, version } => {
                let mut bee = open_bee(registry, bee).await?;
                if let Some(version) = version {
                    bee = bee.checkout(version)?;
                }
                let node = bee
                    .get(&key)
                    .await?
                    .with_context(|| format!("key {key} not found"))?;
                println!("{}", String::from_utf8_lossy(&node.value));
            }
            Commands::Del { bee, key } => {
                let bee = open_bee(registry, bee).await?;
                ensure!(bee.writable(), "bee {} is not writable", bee.feed().key().fmt_short());
                let version = bee.del(key).await?;
                println!("{version}");
            }
            Commands::Ls {
                bee,
                gte,
                lt,
                reverse,
                limit,
            } => {
                let bee = open_bee(registry, bee).await?;
                let options = RangeOptions {
                    gte: gte.map(Bytes::from),
                    lt: lt.map(Bytes::from),
                    reverse,
                    limit,
                    ..Default::default()
                };
                let mut stream = bee.range(options)?;
                while let Some(node) = stream.next().await {
                    let node = node?;
                    println!(
                        "{}\t{}",
                        String::from_utf8_lossy(&node.key),
                        String::from_utf8_lossy(&node.value)
                    );
                }
            }
            Commands::History { bee, gte, live } => {
                let bee = open_bee(registry, bee).await?;
                let options = HistoryOptions {
                    gte,
                    live,
                    ..Default::default()
                };
                let mut stream = bee.history(options)?;
                while let Some(change) = stream.next().await {
                    let change = change?;
                    let line = serde_json::json!({
                        "version": change.version(),
                        "type": if change.is_del() { "del" } else { "put" },
                        "key": String::from_utf8_lossy(&change.key),
                        "value": change.value.as_deref().map(String::from_utf8_lossy),
                    });
                    println!("{line}");
                }
            }
            Commands::Listen { feed, addr, live } => {
                let feed = open_feed(registry, feed).await?;
                listen(feed, addr, replication.live(live)).await?;
            }
            Commands::Connect {
                feed,
                addr,
                live,
                sparse,
            } => {
                let feed = open_feed(registry, feed).await?;
                let stream = TcpStream::connect(addr)
                    .await
                    .with_context(|| format!("failed to connect to {addr}"))?;
                info!(%addr, "connected");
                let options = replication.initiator(true).live(live).sparse(sparse);
                let stats = tokio::select! {
                    res = replicate(feed.clone(), stream, options) => res?,
                    _ = tokio::signal::ctrl_c() => {
                        feed.close();
                        return Ok(());
                    }
                };
                println!(
                    "uploaded {} downloaded {} length {}",
                    stats.uploaded,
                    stats.downloaded,
                    feed.len()
                );
            }
        }
        Ok(())
    }
}

async fn open_feed(registry: &Registry, key: PublicKey) -> Result<Feed> {
    let feed = registry
        .open_feed(&key.to_string(), Keys::Public(key))
        .await?;
    Ok(feed)
}

async fn open_bee(registry: &Registry, key: PublicKey) -> Result<Bee> {
    let bee = registry.open_bee(&key.to_string(), Keys::Public(key)).await?;
    Ok(bee)
}

async fn listen(feed: Feed, addr: SocketAddr, options: ReplicateOptions) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    println!("listening on {} for {}", listener.local_addr()?, feed.key());
    let replicator = Replicator::new(feed, options);
    loop {
        tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => break,
            res = listener.accept() => match res {
                Ok((stream, remote)) => {
                    info!(%remote, "accepted connection");
                    replicator.handle_connection(stream, false);
                }
                Err(err) => warn!(?err, "failed to accept connection"),
            },
        }
    }
    replicator.shutdown().await;
    Ok(())
}
