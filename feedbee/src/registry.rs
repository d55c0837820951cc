//! Named instances sharing one storage provider.
//!
//! A [`Registry`] is owned by the application and handed to whatever needs to look up feeds,
//! bees or drives by name. Opening a name that is already open returns the live instance, so
//! all users of a name share one set of watchers and caches.

use std::{collections::HashMap, sync::Arc};

use feedbee_base::{PublicKey, SecretKey};
use snafu::{ResultExt, Snafu};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    bee::{Bee, BeeError, BeeOptions},
    config::{Config, ConfigError},
    drive::Drive,
    feed::{Feed, FeedBuilder, FeedError, FeedOptions},
    storage::{FsProvider, StorageProvider},
};

/// Errors returned by [`Registry`] operations.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum RegistryError {
    /// Opening the feed failed.
    #[snafu(transparent)]
    Feed { source: FeedError },
    /// Opening the bee failed.
    #[snafu(transparent)]
    Bee { source: BeeError },
    /// The name is open as a different kind of instance.
    #[snafu(display("{name} is open as a {found}, not a {expected}"))]
    WrongKind {
        name: String,
        expected: Kind,
        found: Kind,
    },
    /// The name is open with a different key.
    #[snafu(display("{name} is open with key {open}, not {requested}"))]
    KeyMismatch {
        name: String,
        open: PublicKey,
        requested: PublicKey,
    },
    /// The configuration is unusable.
    #[snafu(display("invalid configuration"))]
    Config { source: ConfigError },
}

/// Key material to open a feed with.
#[derive(Debug, Clone, Default)]
pub enum Keys {
    /// Generate a new writable feed.
    #[default]
    Generate,
    /// A writable feed.
    Secret(SecretKey),
    /// A feed known by its public key. It is writable if the storage holds the secret key.
    Public(PublicKey),
}

impl Keys {
    fn builder(&self) -> FeedBuilder {
        match self {
            Keys::Generate => Feed::builder(),
            Keys::Secret(secret) => Feed::builder().secret_key(secret.clone()),
            Keys::Public(key) => Feed::builder().public_key(*key),
        }
    }

    fn public(&self) -> Option<PublicKey> {
        match self {
            Keys::Generate => None,
            Keys::Secret(secret) => Some(secret.public()),
            Keys::Public(key) => Some(*key),
        }
    }
}

/// The kind of an [`Instance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Kind {
    /// A [`Feed`].
    #[display("feed")]
    Feed,
    /// A [`Bee`].
    #[display("bee")]
    Bee,
    /// A [`Drive`].
    #[display("drive")]
    Drive,
}

/// A live instance held by a [`Registry`].
#[derive(Debug, Clone, derive_more::From)]
pub enum Instance {
    /// A bare feed.
    Feed(Feed),
    /// A sorted index.
    Bee(Bee),
    /// A filesystem.
    Drive(Drive),
}

impl Instance {
    /// The kind of this instance.
    pub fn kind(&self) -> Kind {
        match self {
            Instance::Feed(_) => Kind::Feed,
            Instance::Bee(_) => Kind::Bee,
            Instance::Drive(_) => Kind::Drive,
        }
    }

    /// The feed backing this instance.
    pub fn feed(&self) -> &Feed {
        match self {
            Instance::Feed(feed) => feed,
            Instance::Bee(bee) => bee.feed(),
            Instance::Drive(drive) => drive.feed(),
        }
    }
}

/// Named feeds, bees and drives over one storage provider.
#[derive(Debug, Clone)]
pub struct Registry {
    provider: Arc<dyn StorageProvider>,
    feed_options: FeedOptions,
    bee_options: BeeOptions,
    instances: Arc<Mutex<HashMap<String, Instance>>>,
}

impl Registry {
    /// Creates an empty registry over `provider`.
    pub fn new(provider: impl StorageProvider) -> Self {
        Self {
            provider: Arc::new(provider),
            feed_options: FeedOptions::default(),
            bee_options: BeeOptions::default(),
            instances: Default::default(),
        }
    }

    /// Creates a registry storing feeds on disk as configured.
    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        let dir = config.data_dir().context(ConfigSnafu)?;
        Ok(Self::new(FsProvider::new(dir))
            .with_feed_options(config.feed.clone())
            .with_bee_options(config.bee.clone()))
    }

    /// Sets the options for feeds opened from now on.
    pub fn with_feed_options(mut self, options: FeedOptions) -> Self {
        self.feed_options = options;
        self
    }

    /// Sets the options for bees opened from now on.
    pub fn with_bee_options(mut self, options: BeeOptions) -> Self {
        self.bee_options = options;
        self
    }

    /// The storage provider.
    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.provider
    }

    /// Opens the feed `name`, or returns it if it is already open.
    pub async fn open_feed(&self, name: &str, keys: Keys) -> Result<Feed, RegistryError> {
        match self.open(name, keys, Kind::Feed).await? {
            Instance::Feed(feed) => Ok(feed),
            other => Err(wrong_kind(name, Kind::Feed, &other)),
        }
    }

    /// Opens the bee `name`, or returns it if it is already open.
    pub async fn open_bee(&self, name: &str, keys: Keys) -> Result<Bee, RegistryError> {
        match self.open(name, keys, Kind::Bee).await? {
            Instance::Bee(bee) => Ok(bee),
            other => Err(wrong_kind(name, Kind::Bee, &other)),
        }
    }

    /// Opens the drive `name`, or returns it if it is already open.
    pub async fn open_drive(&self, name: &str, keys: Keys) -> Result<Drive, RegistryError> {
        match self.open(name, keys, Kind::Drive).await? {
            Instance::Drive(drive) => Ok(drive),
            other => Err(wrong_kind(name, Kind::Drive, &other)),
        }
    }

    async fn open(&self, name: &str, keys: Keys, kind: Kind) -> Result<Instance, RegistryError> {
        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get(name) {
            if let Some(requested) = keys.public() {
                let open = instance.feed().key();
                snafu::ensure!(
                    open == requested,
                    KeyMismatchSnafu {
                        name,
                        open,
                        requested
                    }
                );
            }
            return Ok(instance.clone());
        }

        let feed = keys
            .builder()
            .options(self.feed_options.clone())
            .open(&self.provider)
            .await?;
        let instance = match kind {
            Kind::Feed => Instance::Feed(feed),
            Kind::Bee => Instance::Bee(Bee::open(feed, self.bee_options.clone()).await?),
            Kind::Drive => {
                let bee = Bee::open(feed, self.bee_options.clone()).await?;
                Instance::Drive(Drive::new(bee))
            }
        };
        debug!(%name, %kind, feed = %instance.feed().key().fmt_short(), "opened");
        instances.insert(name.to_string(), instance.clone());
        Ok(instance)
    }

    /// The instance open under `name`.
    pub async fn get(&self, name: &str) -> Option<Instance> {
        self.instances.lock().await.get(name).cloned()
    }

    /// The names of all open instances.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.instances.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Removes `name` and closes its feed, ending its streams and replication sessions.
    pub async fn remove(&self, name: &str) -> Option<Instance> {
        let instance = self.instances.lock().await.remove(name)?;
        instance.feed().close();
        debug!(%name, "removed");
        Some(instance)
    }

    /// Closes and removes every instance.
    pub async fn close(&self) {
        let instances = std::mem::take(&mut *self.instances.lock().await);
        for instance in instances.values() {
            instance.feed().close();
        }
    }
}

fn wrong_kind(name: &str, expected: Kind, found: &Instance) -> RegistryError {
    WrongKindSnafu {
        name,
        expected,
        found: found.kind(),
    }
    .build()
}
