//! Configuration of an engine instance.

use std::{
    env,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{bee::BeeOptions, feed::FeedOptions, replicate::ReplicateOptions};

/// Environment variable overriding [`StorageConfig::data_dir`].
pub const DATA_DIR_ENV: &str = "FEEDBEE_DATA_DIR";

/// Errors loading a [`Config`].
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[snafu(display("failed to read {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file is not valid toml for a [`Config`].
    #[snafu(display("failed to parse {}", path.display()))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// No data directory was configured and the platform has none.
    #[snafu(display("operating environment provides no directory for application data"))]
    NoDataDir {},
}

/// Engine configuration.
///
/// Usually loaded from a toml file with [`Self::load`]. Every section and field is optional,
/// [`Default`] gives a config suitable for local use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where feeds are stored.
    pub storage: StorageConfig,
    /// Defaults for opened feeds.
    pub feed: FeedOptions,
    /// Defaults for opened bees.
    pub bee: BeeOptions,
    /// Defaults for replication sessions.
    pub replication: ReplicateOptions,
}

/// The storage section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one subdirectory per feed.
    ///
    /// Defaults to `feedbee` in the platform data directory.
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Loads the config from a toml file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path })?;
        Self::parse(&s).context(ParseSnafu { path })
    }

    /// Parses a toml document.
    pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
        toml::from_str(s)
    }

    /// The data directory.
    ///
    /// [`DATA_DIR_ENV`] takes precedence over the config, which takes precedence over the
    /// platform default.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = env::var_os(DATA_DIR_ENV) {
            return Ok(PathBuf::from(dir));
        }
        if let Some(dir) = &self.storage.data_dir {
            return Ok(dir.clone());
        }
        let dir = dirs_next::data_dir().context(NoDataDirSnafu)?;
        Ok(dir.join("feedbee"))
    }
}
