//! Helper functions to upload files to remote storage with a RemoteStorage

use anyhow::{bail, Context};
use camino::Utf8Path;
use failpoints::FailpointRegistry;
use remote_storage::{GenericRemoteStorage, RemotePath};
use tokio::fs;
use tracing::debug;
use utils::id::{TenantId, TimelineId};

use super::index::IndexPart;
use super::remote_index_path;

/// Serializes and uploads the given index part data to the remote storage.
pub(super) async fn upload_index_part(
    failpoints: &FailpointRegistry,
    storage: &GenericRemoteStorage,
    tenant_id: &TenantId,
    timeline_id: &TimelineId,
    index_part: &IndexPart,
) -> anyhow::Result<()> {
    failpoints.check("before-upload-index").await?;

    let index_part_bytes = index_part
        .to_json_bytes()
        .context("Failed to serialize index part file into bytes")?;

    let remote_path = remote_index_path(tenant_id, timeline_id);
    debug!("uploading index part with {} layers", index_part.layer_metadata.len());
    storage
        .upload_bytes(index_part_bytes, &remote_path)
        .await
        .with_context(|| format!("Failed to upload index part for '{tenant_id} / {timeline_id}'"))
}

/// Attempts to upload given layer file.
/// Any file that is already present remotely is overwritten.
///
/// On an error, the caller bumps the retries count and reschedules the entire task.
pub(super) async fn upload_timeline_layer<'a>(
    failpoints: &'a FailpointRegistry,
    storage: &'a GenericRemoteStorage,
    source_path: &'a Utf8Path,
    remote_path: &'a RemotePath,
    known_metadata_size: u64,
) -> anyhow::Result<()> {
    failpoints.check("before-upload-layer").await?;

    // A layer whose upload is pending is never removed locally, see
    // `schedule_layer_file_deletion`. A missing file is a bug, not a reason
    // to publish an index that points at nothing.
    let source_file = fs::File::open(&source_path)
        .await
        .with_context(|| format!("Failed to open a source file for layer {source_path:?}"))?;

    let fs_size = source_file
        .metadata()
        .await
        .with_context(|| format!("Failed to get the source file metadata for layer {source_path:?}"))?
        .len();

    if known_metadata_size != fs_size {
        bail!("File {source_path:?} has its current FS size {fs_size} different from initially determined {known_metadata_size}");
    }

    let fs_size = usize::try_from(fs_size)
        .with_context(|| format!("File {source_path:?} size {fs_size} could not be converted to usize"))?;

    storage
        .upload(tokio::io::BufReader::new(source_file), fs_size, remote_path)
        .await
        .with_context(|| format!("Failed to upload a layer from local path '{source_path}'"))
}
