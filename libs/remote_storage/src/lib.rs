//! A set of generic storage abstractions for the page server to use when backing up and restoring its state from the external storage.
//! No other modules from this tree are supposed to be used directly by the external code.
//!
//! [`RemoteStorage`] trait a CRUD-like generic abstraction to use for adapting external storages with a few implementations:
//!   * [`local_fs`] allows to use local file system as an external storage
//!
//! Network object stores plug in behind the same trait and a new
//! [`GenericRemoteStorage`] variant.
mod config;
mod local_fs;

use std::{fmt::Debug, pin::Pin, time::Duration};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tokio::io;
use tracing::info;

pub use self::config::{RemoteStorageConfig, RemoteStorageKind};
pub use self::local_fs::LocalFs;

/// How many remote operations may be in flight at once across all timelines.
/// During regular work, pageserver produces one layer file per timeline checkpoint, with bursts of concurrency
/// during start and tenant attach, where a lot of layers may be downloaded at once.
pub const DEFAULT_REMOTE_STORAGE_MAX_CONCURRENT_SYNCS: usize = 50;

/// Path of an object in the remote storage, relative to the storage root.
///
/// The layout mirrors the pageserver's workdir: a local file
/// `<workdir>/tenants/<tenant>/timelines/<timeline>/<layer>` is stored at
/// `tenants/<tenant>/timelines/<timeline>/<layer>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemotePath(Utf8PathBuf);

impl std::fmt::Display for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl RemotePath {
    pub fn new(relative_path: &Utf8Path) -> anyhow::Result<Self> {
        anyhow::ensure!(
            relative_path.is_relative(),
            "Path {relative_path:?} is not relative"
        );
        anyhow::ensure!(
            !relative_path
                .components()
                .any(|c| matches!(c, camino::Utf8Component::ParentDir)),
            "Path {relative_path:?} escapes the storage root"
        );
        Ok(Self(relative_path.to_path_buf()))
    }

    pub fn from_string(relative_path: &str) -> anyhow::Result<Self> {
        Self::new(Utf8Path::new(relative_path))
    }

    /// Resolves the path against a local root directory.
    pub fn with_base(&self, base_path: &Utf8Path) -> Utf8PathBuf {
        base_path.join(&self.0)
    }

    pub fn object_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn join(&self, segment: impl AsRef<Utf8Path>) -> Self {
        Self(self.0.join(segment))
    }

    pub fn get_path(&self) -> &Utf8PathBuf {
        &self.0
    }

    pub fn strip_prefix(&self, p: &RemotePath) -> Result<&Utf8Path, std::path::StripPrefixError> {
        self.0.strip_prefix(&p.0)
    }
}

/// Storage (potentially remote) API to manage its state.
/// This storage tries to be unaware of any layered repository context,
/// providing basic CRUD operations for storage files.
#[async_trait::async_trait]
pub trait RemoteStorage: Send + Sync + 'static {
    /// Lists all files (recursively) under the given prefix, or the whole storage.
    async fn list_files(&self, prefix: Option<&RemotePath>) -> anyhow::Result<Vec<RemotePath>>;

    /// Lists the immediate "directories" under the given prefix.
    async fn list_prefixes(
        &self,
        prefix: Option<&RemotePath>,
    ) -> Result<Vec<RemotePath>, DownloadError>;

    /// Streams the local file contents into remote into the remote storage entry.
    async fn upload(
        &self,
        from: impl io::AsyncRead + Unpin + Send + Sync + 'static,
        // S3 PUT request requires the content length to be specified,
        // otherwise it starts to fail with the concurrent connection count increasing.
        from_size_bytes: usize,
        to: &RemotePath,
    ) -> anyhow::Result<()>;

    /// Streams the remote storage entry contents.
    async fn download(&self, from: &RemotePath) -> Result<Download, DownloadError>;

    /// Removes the entry. Removing an absent entry is not an error.
    async fn delete(&self, path: &RemotePath) -> anyhow::Result<()>;
}

pub struct Download {
    pub download_stream: Pin<Box<dyn io::AsyncRead + Unpin + Send + Sync>>,
}

impl Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download").finish()
    }
}

#[derive(Debug)]
pub enum DownloadError {
    /// Validation or other error happened due to user input.
    BadInput(anyhow::Error),
    /// The file was not found in the remote storage.
    NotFound,
    /// A timeout happened while executing the request.
    Timeout,
    /// The file was found in the remote storage, but the download failed.
    Other(anyhow::Error),
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadError::BadInput(e) => {
                write!(f, "Failed to download a remote file due to user input: {e}")
            }
            DownloadError::NotFound => write!(f, "No file found for the remote object id given"),
            DownloadError::Timeout => write!(f, "timeout"),
            DownloadError::Other(e) => write!(f, "Failed to download a remote file: {e:?}"),
        }
    }
}

impl std::error::Error for DownloadError {}

impl DownloadError {
    /// Returns true if the error should not be retried with backoff
    pub fn is_permanent(&self) -> bool {
        use DownloadError::*;
        match self {
            BadInput(_) => true,
            NotFound => true,
            Timeout => false,
            Other(_) => false,
        }
    }
}

/// Every storage, currently supported.
/// Serves as a simple way to pass around the [`RemoteStorage`] without dealing with generics.
#[derive(Clone)]
pub enum GenericRemoteStorage {
    LocalFs(LocalFs),
}

impl GenericRemoteStorage {
    pub fn from_config(storage_config: &RemoteStorageConfig) -> anyhow::Result<Self> {
        Ok(match &storage_config.storage {
            RemoteStorageKind::LocalFs { local_path } => {
                info!("Using fs root '{local_path}' as a remote storage");
                Self::LocalFs(LocalFs::new(local_path.clone(), storage_config.timeout)?)
            }
        })
    }

    pub async fn list_files(&self, prefix: Option<&RemotePath>) -> anyhow::Result<Vec<RemotePath>> {
        match self {
            Self::LocalFs(s) => s.list_files(prefix).await,
        }
    }

    pub async fn list_prefixes(
        &self,
        prefix: Option<&RemotePath>,
    ) -> Result<Vec<RemotePath>, DownloadError> {
        match self {
            Self::LocalFs(s) => s.list_prefixes(prefix).await,
        }
    }

    pub async fn upload(
        &self,
        from: impl io::AsyncRead + Unpin + Send + Sync + 'static,
        from_size_bytes: usize,
        to: &RemotePath,
    ) -> anyhow::Result<()> {
        match self {
            Self::LocalFs(s) => s.upload(from, from_size_bytes, to).await,
        }
    }

    pub async fn download(&self, from: &RemotePath) -> Result<Download, DownloadError> {
        match self {
            Self::LocalFs(s) => s.download(from).await,
        }
    }

    pub async fn delete(&self, path: &RemotePath) -> anyhow::Result<()> {
        match self {
            Self::LocalFs(s) => s.delete(path).await,
        }
    }

    /// Uploads an in-memory object, e.g. an index file.
    pub async fn upload_bytes(&self, bytes: Vec<u8>, to: &RemotePath) -> anyhow::Result<()> {
        let size = bytes.len();
        self.upload(std::io::Cursor::new(bytes), size, to)
            .await
            .with_context(|| format!("upload {size} bytes to {to}"))
    }

    /// Downloads a whole object into memory, e.g. an index file.
    pub async fn download_bytes(&self, from: &RemotePath) -> Result<Vec<u8>, DownloadError> {
        use tokio::io::AsyncReadExt;
        let mut download = self.download(from).await?;
        let mut buf = Vec::new();
        download
            .download_stream
            .read_to_end(&mut buf)
            .await
            .map_err(|e| DownloadError::Other(anyhow::anyhow!(e).context(format!("read {from}"))))?;
        Ok(buf)
    }
}

/// Applies the configured per-request timeout to a storage operation.
pub(crate) async fn with_timeout<T, E>(
    timeout: Duration,
    op: impl std::future::Future<Output = Result<T, E>>,
    on_timeout: impl FnOnce() -> E,
) -> Result<T, E> {
    match tokio::time::timeout(timeout, op).await {
        Ok(res) => res,
        Err(_elapsed) => Err(on_timeout()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_path_must_stay_inside_root() {
        RemotePath::from_string("tenants/a/timelines/b/index_part.json").unwrap();
        RemotePath::from_string("/etc/passwd").unwrap_err();
        RemotePath::from_string("tenants/../../outside").unwrap_err();
    }

    #[test]
    fn remote_path_helpers() {
        let p = RemotePath::from_string("tenants/a").unwrap();
        let file = p.join("timelines/b/layer");
        assert_eq!(file.object_name(), Some("layer"));
        assert_eq!(file.strip_prefix(&p).unwrap(), "timelines/b/layer");
        assert_eq!(
            file.with_base(Utf8Path::new("/remote")),
            Utf8PathBuf::from("/remote/tenants/a/timelines/b/layer")
        );
    }

    #[test]
    fn not_found_is_permanent() {
        assert!(DownloadError::NotFound.is_permanent());
        assert!(!DownloadError::Timeout.is_permanent());
        assert!(!DownloadError::Other(anyhow::anyhow!("io")).is_permanent());
    }
}
