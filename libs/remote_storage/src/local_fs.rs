//! Local filesystem acting as a remote storage.
//! Multiple pageservers can use the same "storage" of this kind by using different storage roots.
//!
//! This storage used in tests, but can also be used in cases when a certain persistent
//! volume is mounted to the local FS.

use std::{future::Future, pin::Pin, time::Duration};

use anyhow::{bail, ensure, Context};
use camino::{Utf8Path, Utf8PathBuf};
use tokio::{
    fs,
    io::{self, AsyncWriteExt},
};
use tracing::debug;

use crate::{with_timeout, Download, DownloadError, RemotePath};

use super::RemoteStorage;

/// Suffix of the files being written; they are renamed into place once complete.
const LOCAL_FS_TEMP_FILE_SUFFIX: &str = "___temp";

#[derive(Debug, Clone)]
pub struct LocalFs {
    storage_root: Utf8PathBuf,
    timeout: Duration,
}

impl LocalFs {
    /// Attempts to create local FS storage, along with its root directory.
    /// Storage root will be created (if does not exist) and transformed into an absolute path (if passed as relative).
    pub fn new(mut storage_root: Utf8PathBuf, timeout: Duration) -> anyhow::Result<Self> {
        if !storage_root.exists() {
            std::fs::create_dir_all(&storage_root).with_context(|| {
                format!("Failed to create all directories in the given root path {storage_root:?}")
            })?;
        }
        if !storage_root.is_absolute() {
            storage_root = storage_root.canonicalize_utf8().with_context(|| {
                format!("Failed to represent path {storage_root:?} as an absolute path")
            })?;
        }

        Ok(Self {
            storage_root,
            timeout,
        })
    }

    fn get_all_files<'a>(
        &'a self,
        directory_path: &'a Utf8Path,
        recursive: bool,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<Utf8PathBuf>>> + Send + 'a>> {
        Box::pin(async move {
            if !directory_path.exists() {
                return Ok(Vec::new());
            }
            if !directory_path.is_dir() {
                bail!("Path '{directory_path}' is not a directory")
            }

            let mut dir_contents = fs::read_dir(directory_path)
                .await
                .with_context(|| format!("read directory '{directory_path}'"))?;
            let mut paths = Vec::new();
            while let Some(dir_entry) = dir_contents.next_entry().await? {
                let file_type = dir_entry.file_type().await?;
                let entry_path = Utf8PathBuf::from_path_buf(dir_entry.path()).map_err(|p| {
                    anyhow::anyhow!("non-utf8 path '{}' in local storage", p.display())
                })?;
                if file_type.is_symlink() {
                    debug!("{entry_path:?} is a symlink, skipping")
                } else if file_type.is_dir() {
                    if recursive {
                        paths.extend(self.get_all_files(&entry_path, true).await?.into_iter())
                    } else {
                        paths.push(entry_path)
                    }
                } else if !entry_path.as_str().ends_with(LOCAL_FS_TEMP_FILE_SUFFIX) {
                    paths.push(entry_path);
                }
            }
            Ok(paths)
        })
    }

    fn to_remote_path(&self, local: &Utf8Path) -> anyhow::Result<RemotePath> {
        let relative = local
            .strip_prefix(&self.storage_root)
            .with_context(|| format!("'{local}' is not inside the storage root"))?;
        RemotePath::new(relative)
    }

    fn prefix_dir(&self, prefix: Option<&RemotePath>) -> Utf8PathBuf {
        match prefix {
            Some(prefix) => prefix.with_base(&self.storage_root),
            None => self.storage_root.clone(),
        }
    }
}

#[async_trait::async_trait]
impl RemoteStorage for LocalFs {
    async fn list_files(&self, prefix: Option<&RemotePath>) -> anyhow::Result<Vec<RemotePath>> {
        let dir = self.prefix_dir(prefix);
        let mut files = self
            .get_all_files(&dir, true)
            .await?
            .iter()
            .map(|local| self.to_remote_path(local))
            .collect::<anyhow::Result<Vec<_>>>()?;
        files.sort();
        Ok(files)
    }

    async fn list_prefixes(
        &self,
        prefix: Option<&RemotePath>,
    ) -> Result<Vec<RemotePath>, DownloadError> {
        let dir = self.prefix_dir(prefix);
        let entries = self
            .get_all_files(&dir, false)
            .await
            .map_err(DownloadError::Other)?;
        let mut prefixes = entries
            .iter()
            .filter(|path| path.is_dir())
            .map(|path| self.to_remote_path(path))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(DownloadError::Other)?;
        prefixes.sort();
        Ok(prefixes)
    }

    async fn upload(
        &self,
        mut from: impl io::AsyncRead + Unpin + Send + Sync + 'static,
        from_size_bytes: usize,
        to: &RemotePath,
    ) -> anyhow::Result<()> {
        let target_file_path = to.with_base(&self.storage_root);
        create_target_directory(&target_file_path).await?;
        // We need this dance with sort of durable rename (without fsyncs)
        // to prevent partial uploads. This was really hit when pageserver shutdown
        // cancelled the upload and partial file was left on the fs
        let temp_file_path =
            Utf8PathBuf::from(format!("{target_file_path}{LOCAL_FS_TEMP_FILE_SUFFIX}"));

        let write = async {
            let mut destination = io::BufWriter::new(
                fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&temp_file_path)
                    .await
                    .with_context(|| {
                        format!("Failed to open target fs destination at '{target_file_path}'")
                    })?,
            );

            let bytes_read = io::copy(&mut from, &mut destination)
                .await
                .with_context(|| {
                    format!("Failed to upload file (write temp) to the local storage at '{temp_file_path}'")
                })?;
            ensure!(
                bytes_read == from_size_bytes as u64,
                "Provided stream was shorter than expected: {bytes_read} vs {from_size_bytes} bytes"
            );

            destination.flush().await.with_context(|| {
                format!("Failed to upload (flush temp) file to the local storage at '{temp_file_path}'")
            })?;

            fs::rename(&temp_file_path, &target_file_path)
                .await
                .with_context(|| {
                    format!(
                        "Failed to upload (rename) file to the local storage at '{target_file_path}'"
                    )
                })?;
            Ok(())
        };

        let res = with_timeout(self.timeout, write, || {
            anyhow::anyhow!("upload of '{to}' timed out")
        })
        .await;
        if res.is_err() {
            let _ = fs::remove_file(&temp_file_path).await;
        }
        res
    }

    async fn download(&self, from: &RemotePath) -> Result<Download, DownloadError> {
        let target_path = from.with_base(&self.storage_root);
        let open = async {
            match fs::File::open(&target_path).await {
                Ok(file) => {
                    let metadata = file.metadata().await.map_err(|e| {
                        DownloadError::Other(anyhow::anyhow!(e).context("stat local file"))
                    })?;
                    if !metadata.is_file() {
                        return Err(DownloadError::BadInput(anyhow::anyhow!(
                            "'{target_path}' is not a file"
                        )));
                    }
                    Ok(Download {
                        download_stream: Box::pin(file),
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(DownloadError::NotFound),
                Err(e) => Err(DownloadError::Other(
                    anyhow::anyhow!(e).context(format!("open '{target_path}'")),
                )),
            }
        };
        with_timeout(self.timeout, open, || DownloadError::Timeout).await
    }

    async fn delete(&self, path: &RemotePath) -> anyhow::Result<()> {
        let file_path = path.with_base(&self.storage_root);
        match fs::remove_file(&file_path).await {
            Ok(()) => Ok(()),
            // The file doesn't exist. This shouldn't yield an error to mirror S3's behaviour.
            // See https://docs.aws.amazon.com/AmazonS3/latest/API/API_DeleteObject.html
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::anyhow!(e).context(format!("delete '{file_path}'"))),
        }
    }
}

async fn create_target_directory(target_file_path: &Utf8Path) -> anyhow::Result<()> {
    let target_dir = match target_file_path.parent() {
        Some(parent_dir) => parent_dir,
        None => bail!("File path '{target_file_path}' has no parent directory"),
    };
    if !target_dir.exists() {
        fs::create_dir_all(target_dir).await?;
    }
    Ok(())
}

#[cfg(test)]
mod fs_tests {
    use super::*;

    use camino_tempfile::Utf8TempDir;
    use tokio::io::AsyncReadExt;

    fn create_storage() -> anyhow::Result<(Utf8TempDir, LocalFs)> {
        let dir = camino_tempfile::tempdir()?;
        let storage = LocalFs::new(dir.path().join("remote"), Duration::from_secs(10))?;
        Ok((dir, storage))
    }

    async fn upload_str(storage: &LocalFs, path: &str, content: &str) -> anyhow::Result<RemotePath> {
        let remote = RemotePath::from_string(path)?;
        let bytes = content.as_bytes().to_vec();
        let size = bytes.len();
        storage.upload(std::io::Cursor::new(bytes), size, &remote).await?;
        Ok(remote)
    }

    async fn read_download(storage: &LocalFs, path: &RemotePath) -> Result<String, DownloadError> {
        let mut download = storage.download(path).await?;
        let mut contents = String::new();
        download
            .download_stream
            .read_to_string(&mut contents)
            .await
            .map_err(|e| DownloadError::Other(e.into()))?;
        Ok(contents)
    }

    #[tokio::test]
    async fn upload_then_download() -> anyhow::Result<()> {
        let (_dir, storage) = create_storage()?;
        let remote = upload_str(&storage, "tenants/t/timelines/tl/layer", "layer contents").await?;

        assert_eq!(read_download(&storage, &remote).await?, "layer contents");
        assert_eq!(storage.list_files(None).await?, vec![remote]);
        Ok(())
    }

    #[tokio::test]
    async fn upload_rejects_short_stream() -> anyhow::Result<()> {
        let (_dir, storage) = create_storage()?;
        let remote = RemotePath::from_string("short")?;
        let err = storage
            .upload(std::io::Cursor::new(b"abc".to_vec()), 10, &remote)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("shorter than expected"), "{err}");
        // no partial object is visible
        assert!(storage.list_files(None).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn download_missing_is_not_found() -> anyhow::Result<()> {
        let (_dir, storage) = create_storage()?;
        let err = storage
            .download(&RemotePath::from_string("nope")?)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::NotFound), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn list_files_and_prefixes() -> anyhow::Result<()> {
        let (_dir, storage) = create_storage()?;
        let a = upload_str(&storage, "tenants/t/timelines/a/index_part.json", "{}").await?;
        let b1 = upload_str(&storage, "tenants/t/timelines/b/layer1", "1").await?;
        let b2 = upload_str(&storage, "tenants/t/timelines/b/layer2", "2").await?;

        let timelines = RemotePath::from_string("tenants/t/timelines")?;
        assert_eq!(
            storage.list_prefixes(Some(&timelines)).await?,
            vec![timelines.join("a"), timelines.join("b")]
        );
        assert_eq!(
            storage.list_files(Some(&timelines.join("b"))).await?,
            vec![b1.clone(), b2.clone()]
        );
        assert_eq!(storage.list_files(None).await?, vec![a, b1, b2]);

        let absent = RemotePath::from_string("tenants/other")?;
        assert!(storage.list_files(Some(&absent)).await?.is_empty());
        assert!(storage.list_prefixes(Some(&absent)).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn delete_is_idempotent() -> anyhow::Result<()> {
        let (_dir, storage) = create_storage()?;
        let remote = upload_str(&storage, "some/file", "data").await?;

        storage.delete(&remote).await?;
        storage.delete(&remote).await?;
        assert!(matches!(
            storage.download(&remote).await,
            Err(DownloadError::NotFound)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn upload_overwrites() -> anyhow::Result<()> {
        let (_dir, storage) = create_storage()?;
        let remote = upload_str(&storage, "index_part.json", "v1").await?;
        upload_str(&storage, "index_part.json", "version 2").await?;
        assert_eq!(read_download(&storage, &remote).await?, "version 2");
        Ok(())
    }
}
