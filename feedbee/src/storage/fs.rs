//! File backed storage: one file per region in a directory per namespace.

use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use futures_util::{FutureExt, future::BoxFuture};
use snafu::ResultExt;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};
use tracing::trace;

use super::{IoSnafu, Region, Storage, StorageError, StorageProvider, check_range};

/// A region stored in a single file.
#[derive(Debug)]
pub struct FsStorage {
    path: PathBuf,
    file: Mutex<File>,
}

impl FsStorage {
    /// Opens or creates the file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .context(IoSnafu {
                region: path.display().to_string(),
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    fn region(&self) -> String {
        self.path.display().to_string()
    }
}

impl Storage for FsStorage {
    fn read(&self, offset: u64, len: u64) -> BoxFuture<'_, Result<Bytes, StorageError>> {
        async move {
            let mut file = self.file.lock().await;
            let size = file
                .metadata()
                .await
                .context(IoSnafu {
                    region: self.region(),
                })?
                .len();
            check_range(offset, len, size)?;
            let mut buf = vec![0u8; len as usize];
            file.seek(SeekFrom::Start(offset))
                .await
                .context(IoSnafu {
                    region: self.region(),
                })?;
            file.read_exact(&mut buf).await.context(IoSnafu {
                region: self.region(),
            })?;
            Ok(Bytes::from(buf))
        }
        .boxed()
    }

    fn write(&self, offset: u64, data: Bytes) -> BoxFuture<'_, Result<(), StorageError>> {
        async move {
            let mut file = self.file.lock().await;
            file.seek(SeekFrom::Start(offset))
                .await
                .context(IoSnafu {
                    region: self.region(),
                })?;
            file.write_all(&data).await.context(IoSnafu {
                region: self.region(),
            })?;
            trace!(path = %self.path.display(), offset, len = data.len(), "write");
            Ok(())
        }
        .boxed()
    }

    fn truncate(&self, len: u64) -> BoxFuture<'_, Result<(), StorageError>> {
        async move {
            let file = self.file.lock().await;
            file.set_len(len).await.context(IoSnafu {
                region: self.region(),
            })
        }
        .boxed()
    }

    fn stat(&self) -> BoxFuture<'_, Result<u64, StorageError>> {
        async move {
            let file = self.file.lock().await;
            let meta = file.metadata().await.context(IoSnafu {
                region: self.region(),
            })?;
            Ok(meta.len())
        }
        .boxed()
    }

    fn sync(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        async move {
            let mut file = self.file.lock().await;
            file.flush().await.context(IoSnafu {
                region: self.region(),
            })?;
            file.sync_data().await.context(IoSnafu {
                region: self.region(),
            })
        }
        .boxed()
    }
}

/// Stores each namespace in `<root>/<namespace>/<region>`.
#[derive(Debug, Clone)]
pub struct FsProvider {
    root: PathBuf,
}

impl FsProvider {
    /// Creates a provider rooted at `root`. Directories are created on demand.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl StorageProvider for FsProvider {
    fn open(
        &self,
        namespace: &str,
        region: Region,
    ) -> BoxFuture<'_, Result<Arc<dyn Storage>, StorageError>> {
        let dir = self.root.join(namespace);
        async move {
            tokio::fs::create_dir_all(&dir).await.context(IoSnafu {
                region: dir.display().to_string(),
            })?;
            let storage = FsStorage::open(dir.join(region.as_str())).await?;
            Ok(Arc::new(storage) as Arc<dyn Storage>)
        }
        .boxed()
    }
}
