//! Helper functions to delete files from remote storage with a RemoteStorage
use anyhow::Context;
use failpoints::FailpointRegistry;
use remote_storage::{GenericRemoteStorage, RemotePath};
use tracing::debug;

pub(super) async fn delete_layer<'a>(
    failpoints: &'a FailpointRegistry,
    storage: &'a GenericRemoteStorage,
    path_to_delete: &'a RemotePath,
) -> anyhow::Result<()> {
    failpoints.check("before-delete-layer").await?;

    debug!("Deleting layer from remote storage: {path_to_delete}");

    // Deleting an object that is already gone is not an error, so a retried
    // deletion that did succeed remotely the first time completes fine.
    storage
        .delete(path_to_delete)
        .await
        .with_context(|| format!("Failed to delete remote layer from storage at {path_to_delete}"))
}
