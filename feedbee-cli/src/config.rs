//! Configuration for the feedbee CLI.

use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use feedbee::Config;
use tracing::debug;

const ENV_CONFIG_DIR: &str = "FEEDBEE_CONFIG_DIR";

/// Name of the optional config file in the config directory.
pub(crate) const CONFIG_FILE_NAME: &str = "feedbee.config.toml";

/// Loads the config from `path`, or from the default location if it exists there.
pub(crate) async fn load(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let path = config_root()?.join(CONFIG_FILE_NAME);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Config::default());
            }
            path
        }
    };
    let config = Config::load(&path)
        .await
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    debug!(path = %path.display(), "loaded config");
    Ok(config)
}

/// The directory holding the config file.
///
/// [`ENV_CONFIG_DIR`] takes precedence over the platform config directory.
fn config_root() -> Result<PathBuf> {
    if let Some(val) = env::var_os(ENV_CONFIG_DIR) {
        return Ok(PathBuf::from(val));
    }
    let cfg = dirs_next::config_dir()
        .context("operating environment provides no directory for configuration")?;
    Ok(cfg.join("feedbee"))
}
