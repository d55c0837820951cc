//! A versioned filesystem on top of a [`Bee`].
//!
//! Files live in two subs of one bee. `files` maps a normalized path to its [`Stat`], `blobs`
//! maps `blob hash || chunk index` to the content in chunks of [`CHUNK_SIZE`] bytes. Blobs are
//! content addressed, writing the same content twice stores it once, and they are never
//! removed: an older version of the drive can always read the files it lists.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use feedbee_base::Hash;
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};
use tracing::debug;

use crate::{
    bee::{Bee, BeeError, RangeOptions},
    feed::Feed,
};

/// Size of the chunks file content is split into.
pub const CHUNK_SIZE: usize = 64 * 1024;

const FILES: &str = "files";
const BLOBS: &str = "blobs";

/// Errors returned by [`Drive`] operations.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum DriveError {
    /// The index failed.
    #[snafu(transparent)]
    Bee { source: BeeError },
    /// The path can not be used.
    #[snafu(display("invalid path {path:?}: {reason}"))]
    InvalidPath { path: String, reason: &'static str },
    /// No file at this path.
    #[snafu(display("no such file: {path}"))]
    NotFound { path: String },
    /// The stored file does not match its metadata.
    #[snafu(display("corrupt file {path}: {reason}"))]
    Corrupt { path: String, reason: String },
    /// A stat record could not be decoded.
    #[snafu(display("malformed stat of {path}"))]
    Decode {
        path: String,
        source: postcard::Error,
    },
    /// A stat record could not be encoded.
    #[snafu(display("failed to encode stat"))]
    Encode { source: postcard::Error },
}

/// Metadata of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Content length in bytes.
    pub size: u64,
    /// BLAKE3 hash of the content.
    pub blob: Hash,
    /// Number of chunks the content is stored in.
    pub chunks: u32,
    /// Modification time in milliseconds since the unix epoch.
    pub mtime: u64,
}

/// A versioned filesystem.
///
/// Every mutation produces a new version, and [`Drive::checkout`] reads the drive as it was
/// at any earlier one.
#[derive(Debug, Clone)]
pub struct Drive {
    bee: Bee,
    files: Bee,
    blobs: Bee,
}

impl Drive {
    /// Wraps `bee`.
    pub fn new(bee: Bee) -> Self {
        Self {
            files: bee.sub(FILES),
            blobs: bee.sub(BLOBS),
            bee,
        }
    }

    /// The underlying index.
    pub fn bee(&self) -> &Bee {
        &self.bee
    }

    /// The feed holding the drive.
    pub fn feed(&self) -> &Feed {
        self.bee.feed()
    }

    /// The version this drive reads at.
    pub fn version(&self) -> u64 {
        self.bee.version()
    }

    /// Whether the drive can be written.
    pub fn writable(&self) -> bool {
        self.bee.writable()
    }

    /// A read-only view of the drive at `version`.
    pub fn checkout(&self, version: u64) -> Result<Drive, DriveError> {
        Ok(Self::new(self.bee.checkout(version)?))
    }

    /// Writes `data` to `path`, replacing any previous file, and returns the new version.
    ///
    /// Content and metadata are committed together.
    pub async fn write_file(
        &self,
        path: &str,
        data: impl Into<Bytes>,
    ) -> Result<u64, DriveError> {
        let path = normalize(path)?;
        let data: Bytes = data.into();
        let blob = Hash::new(&data);
        let chunks = data.len().div_ceil(CHUNK_SIZE);
        let stat = Stat {
            size: data.len() as u64,
            blob,
            chunks: u32::try_from(chunks).map_err(|_| {
                InvalidPathSnafu {
                    path: path.clone(),
                    reason: "file too large",
                }
                .build()
            })?,
            mtime: now_millis(),
        };

        let mut batch = self.bee.batch()?;
        let stored = chunks == 0 || self.blobs.get(chunk_key(&blob, 0)).await?.is_some();
        if !stored {
            for (i, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
                let key = self.blobs.full_key(&chunk_key(&blob, i as u32));
                batch.put(key, data.slice_ref(chunk));
            }
        }
        let value = postcard::to_stdvec(&stat).context(EncodeSnafu)?;
        batch.put(self.files.full_key(path.as_bytes()), value);
        let version = batch.flush().await?;
        debug!(%path, size = stat.size, blob = %blob.fmt_short(), dedup = stored, version, "wrote file");
        Ok(version)
    }

    /// Reads the content of the file at `path`.
    pub async fn read_file(&self, path: &str) -> Result<Bytes, DriveError> {
        let path = normalize(path)?;
        let Some(stat) = self.stat_normalized(&path).await? else {
            return NotFoundSnafu { path }.fail();
        };
        let mut content = BytesMut::with_capacity(stat.size as usize);
        for i in 0..stat.chunks {
            let Some(node) = self.blobs.get(chunk_key(&stat.blob, i)).await? else {
                return CorruptSnafu {
                    path,
                    reason: format!("missing chunk {i}"),
                }
                .fail();
            };
            content.extend_from_slice(&node.value);
        }
        let content = content.freeze();
        ensure!(
            content.len() as u64 == stat.size && Hash::new(&content) == stat.blob,
            CorruptSnafu {
                path,
                reason: "content does not match its hash",
            }
        );
        Ok(content)
    }

    /// The metadata of the file at `path`.
    pub async fn stat(&self, path: &str) -> Result<Option<Stat>, DriveError> {
        let path = normalize(path)?;
        self.stat_normalized(&path).await
    }

    /// Whether a file exists at `path`.
    pub async fn exists(&self, path: &str) -> Result<bool, DriveError> {
        Ok(self.stat(path).await?.is_some())
    }

    /// Removes the file at `path` and returns the new version.
    pub async fn unlink(&self, path: &str) -> Result<u64, DriveError> {
        let path = normalize(path)?;
        ensure!(
            self.files.get(path.as_bytes()).await?.is_some(),
            NotFoundSnafu { path }
        );
        let version = self.files.del(path.as_bytes()).await?;
        debug!(%path, version, "unlinked file");
        Ok(version)
    }

    /// The names of the files and directories directly inside `dir`, sorted.
    pub async fn readdir(&self, dir: &str) -> Result<Vec<String>, DriveError> {
        let dir = normalize_dir(dir)?;
        let mut options = RangeOptions::default();
        if dir != "/" {
            let mut upper = dir.clone().into_bytes();
            // Paths under `dir` all start with `dir/`, and `0` sorts right after `/`.
            if let Some(last) = upper.last_mut() {
                *last = b'0';
            }
            options.gte = Some(Bytes::from(dir.clone()));
            options.lt = Some(Bytes::from(upper));
        }

        let mut names: Vec<String> = Vec::new();
        let mut stream = self.files.range(options)?;
        while let Some(node) = stream.try_next().await? {
            let Ok(path) = std::str::from_utf8(&node.key) else {
                continue;
            };
            let Some(name) = path[dir.len()..].split('/').next() else {
                continue;
            };
            if names.last().map(String::as_str) != Some(name) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    async fn stat_normalized(&self, path: &str) -> Result<Option<Stat>, DriveError> {
        let Some(node) = self.files.get(path.as_bytes()).await? else {
            return Ok(None);
        };
        let stat = postcard::from_bytes(&node.value).context(DecodeSnafu { path })?;
        Ok(Some(stat))
    }
}

fn chunk_key(blob: &Hash, index: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(36);
    key.extend_from_slice(blob.as_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Turns `path` into `/a/b` form.
fn normalize(path: &str) -> Result<String, DriveError> {
    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        ensure!(
            segment != "." && segment != "..",
            InvalidPathSnafu {
                path,
                reason: "relative segments are not allowed",
            }
        );
        normalized.push('/');
        normalized.push_str(segment);
    }
    ensure!(
        !normalized.is_empty(),
        InvalidPathSnafu {
            path,
            reason: "empty path",
        }
    );
    Ok(normalized)
}

/// Like [`normalize`] with a trailing slash.
fn normalize_dir(dir: &str) -> Result<String, DriveError> {
    if dir.split('/').all(str::is_empty) {
        return Ok("/".to_string());
    }
    let mut dir = normalize(dir)?;
    dir.push('/');
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use n0_snafu::Result;
    use tracing_test::traced_test;

    use super::*;
    use crate::{bee::BeeOptions, storage::MemProvider};

    async fn drive() -> Result<Drive> {
        let feed = Feed::builder().open(&MemProvider::new()).await?;
        let bee = Bee::open(feed, BeeOptions::default()).await?;
        Ok(Drive::new(bee))
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("a/b").unwrap(), "/a/b");
        assert_eq!(normalize("//a///b/").unwrap(), "/a/b");
        assert!(normalize("/").is_err());
        assert!(normalize("/a/../b").is_err());
        assert_eq!(normalize_dir("/").unwrap(), "/");
        assert_eq!(normalize_dir("docs").unwrap(), "/docs/");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_write_read_multi_chunk() -> Result {
        let drive = drive().await?;
        let content: Vec<u8> = (0..CHUNK_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();
        drive.write_file("/big.bin", content.clone()).await?;

        let stat = drive.stat("big.bin").await?.expect("written");
        assert_eq!(stat.size, content.len() as u64);
        assert_eq!(stat.chunks, 3);
        assert_eq!(drive.read_file("/big.bin").await?, content);

        drive.write_file("/empty", Bytes::new()).await?;
        assert_eq!(drive.read_file("/empty").await?, Bytes::new());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_same_content_is_stored_once() -> Result {
        let drive = drive().await?;
        let v1 = drive.write_file("/a", "hello").await?;
        let v2 = drive.write_file("/b", "hello").await?;
        // Only the stat of `/b` was appended.
        assert_eq!(v2, v1 + 1);
        assert_eq!(drive.read_file("/b").await?, "hello");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unlink_and_checkout() -> Result {
        let drive = drive().await?;
        let written = drive.write_file("/notes.txt", "v1").await?;
        drive.unlink("/notes.txt").await?;
        assert!(!drive.exists("/notes.txt").await?);
        assert!(matches!(
            drive.read_file("/notes.txt").await,
            Err(DriveError::NotFound { .. })
        ));
        assert!(matches!(
            drive.unlink("/notes.txt").await,
            Err(DriveError::NotFound { .. })
        ));

        let old = drive.checkout(written)?;
        assert_eq!(old.read_file("/notes.txt").await?, "v1");
        assert!(!old.writable());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_readdir() -> Result {
        let drive = drive().await?;
        for path in ["/a.txt", "/docs/x.md", "/docs/y.md", "/docs/sub/z.md", "/docs2/w"] {
            drive.write_file(path, path.to_string()).await?;
        }
        assert_eq!(drive.readdir("/").await?, ["a.txt", "docs", "docs2"]);
        assert_eq!(drive.readdir("/docs").await?, ["sub", "x.md", "y.md"]);
        assert!(drive.readdir("/nothing").await?.is_empty());
        Ok(())
    }
}
