//! Helper functions to download files from remote storage with a RemoteStorage
//!
//! The functions in this module retry failed operations automatically, according
//! to the FAILED_DOWNLOAD_RETRIES constant.

use std::collections::HashSet;
use std::future::Future;

use anyhow::{anyhow, Context};
use failpoints::FailpointRegistry;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::PageServerConf;
use crate::tenant::storage_layer::LayerFileName;
use crate::TEMP_DOWNLOAD_EXTENSION;
use remote_storage::{DownloadError, GenericRemoteStorage};
use utils::backoff;
use utils::crashsafe::{fsync_async, path_with_suffix_extension};
use utils::id::{TenantId, TimelineId};

use super::index::{IndexPart, LayerFileMetadata};
use super::{
    remote_index_path, remote_layer_path, remote_timelines_path, FAILED_DOWNLOAD_RETRIES,
    FAILED_DOWNLOAD_WARN_THRESHOLD,
};

///
/// Downloads a layer file into the timeline directory and validates its size
/// against `layer_metadata`, the metadata from the remote index file.
///
/// The file only appears under its final name once it is complete and
/// durable; a crash leaves a `.temp_download` file behind, which is removed
/// on startup.
///
/// Returns the size of the downloaded file.
#[allow(clippy::too_many_arguments)]
pub(super) async fn download_layer_file<'a>(
    conf: &'static PageServerConf,
    failpoints: &'a FailpointRegistry,
    storage: &'a GenericRemoteStorage,
    tenant_id: TenantId,
    timeline_id: TimelineId,
    layer_file_name: &'a LayerFileName,
    layer_metadata: &'a LayerFileMetadata,
    cancel: &'a CancellationToken,
) -> Result<u64, DownloadError> {
    let local_path = conf.layer_path(&tenant_id, &timeline_id, layer_file_name);
    let remote_path = remote_layer_path(&tenant_id, &timeline_id, layer_file_name);

    // Perform a rename inspired by durable_rename from file_utils.c.
    // The sequence:
    //     write(tmp)
    //     fsync(tmp)
    //     rename(tmp, new)
    //     fsync(new)
    //     fsync(parent)
    // If pageserver crashes the temp file will be deleted on startup and re-downloaded.
    let temp_file_path = path_with_suffix_extension(&local_path, TEMP_DOWNLOAD_EXTENSION);

    let (mut destination_file, bytes_amount) = download_retry(
        || async {
            let mut destination_file = fs::File::create(&temp_file_path)
                .await
                .with_context(|| {
                    format!("create a destination file for layer '{temp_file_path}'")
                })
                .map_err(DownloadError::Other)?;
            let mut download = storage.download(&remote_path).await?;

            let bytes_amount = tokio::io::copy(&mut download.download_stream, &mut destination_file)
                .await
                .with_context(|| {
                    format!("Failed to download layer with remote storage path '{remote_path}' into file {temp_file_path:?}")
                })
                .map_err(DownloadError::Other)?;

            Ok((destination_file, bytes_amount))
        },
        &format!("download {remote_path}"),
        cancel,
    )
    .await?;

    // A file will not be closed immediately when it goes out of scope if there are any IO operations
    // that have not yet completed. Flush to make sure nothing is pending before the checks below.
    destination_file
        .flush()
        .await
        .with_context(|| format!("failed to flush source file at {temp_file_path}"))
        .map_err(DownloadError::Other)?;

    let expected = layer_metadata.file_size();
    if expected != bytes_amount {
        return Err(DownloadError::Other(anyhow!(
            "According to layer file metadata should have downloaded {expected} bytes but downloaded {bytes_amount} bytes into file {temp_file_path:?}",
        )));
    }

    // not using sync_data because it can lose file size update
    destination_file
        .sync_all()
        .await
        .with_context(|| format!("failed to fsync source file at {temp_file_path}"))
        .map_err(DownloadError::Other)?;
    drop(destination_file);

    failpoints
        .check("remote-storage-download-pre-rename")
        .await
        .map_err(|e| DownloadError::Other(anyhow!(e)))?;

    fs::rename(&temp_file_path, &local_path)
        .await
        .with_context(|| format!("Could not rename download layer file to {local_path}"))
        .map_err(DownloadError::Other)?;

    fsync_async(&local_path)
        .await
        .with_context(|| format!("Could not fsync layer file {local_path}"))
        .map_err(DownloadError::Other)?;
    let timeline_path = conf.timeline_path(&tenant_id, &timeline_id);
    fsync_async(&timeline_path)
        .await
        .with_context(|| format!("Could not fsync timeline directory {timeline_path}"))
        .map_err(DownloadError::Other)?;

    debug!("download complete: {local_path}");

    Ok(bytes_amount)
}

/// List timelines of given tenant in remote storage
pub(crate) async fn list_remote_timelines(
    storage: &GenericRemoteStorage,
    tenant_id: TenantId,
    cancel: &CancellationToken,
) -> anyhow::Result<HashSet<TimelineId>> {
    let remote_path = remote_timelines_path(&tenant_id);

    let timelines = download_retry(
        || storage.list_prefixes(Some(&remote_path)),
        &format!("list prefixes for {remote_path}"),
        cancel,
    )
    .await?;

    if timelines.is_empty() {
        anyhow::bail!("no timelines found on the remote storage")
    }

    let mut timeline_ids = HashSet::new();

    for timeline_remote_storage_key in timelines {
        let object_name = timeline_remote_storage_key.object_name().ok_or_else(|| {
            anyhow::anyhow!("failed to get timeline id for remote tenant {tenant_id}")
        })?;

        let timeline_id: TimelineId = object_name.parse().with_context(|| {
            format!("failed to parse object name into timeline id '{object_name}'")
        })?;

        // list_prefixes is assumed to return unique names. Ensure this here.
        anyhow::ensure!(
            timeline_ids.insert(timeline_id),
            "list_prefixes contains duplicate timeline id {timeline_id}"
        );
    }

    Ok(timeline_ids)
}

pub(super) async fn download_index_part(
    storage: &GenericRemoteStorage,
    tenant_id: &TenantId,
    timeline_id: &TimelineId,
    cancel: &CancellationToken,
) -> Result<IndexPart, DownloadError> {
    let remote_path = remote_index_path(tenant_id, timeline_id);

    let index_part_bytes = download_retry(
        || storage.download_bytes(&remote_path),
        &format!("download {remote_path}"),
        cancel,
    )
    .await?;

    IndexPart::from_json_bytes(&index_part_bytes)
        .with_context(|| format!("Failed to deserialize index part file {remote_path}"))
        .map_err(DownloadError::Other)
}

///
/// Helper function to handle retries for a download operation.
///
/// Remote operations can fail due to rate limits, spurious network
/// problems, or other external reasons. Retry FAILED_DOWNLOAD_RETRIES times,
/// with backoff.
///
/// (See similar logic for uploads in `perform_upload_task`)
async fn download_retry<T, O, F>(
    op: O,
    description: &str,
    cancel: &CancellationToken,
) -> Result<T, DownloadError>
where
    O: FnMut() -> F,
    F: Future<Output = Result<T, DownloadError>>,
{
    backoff::retry(
        op,
        DownloadError::is_permanent,
        FAILED_DOWNLOAD_WARN_THRESHOLD,
        FAILED_DOWNLOAD_RETRIES,
        description,
        cancel,
    )
    .await
    .unwrap_or_else(|| Err(DownloadError::Other(anyhow!("{description} cancelled"))))
}
