//!
//! The background routines that bring a tenant into memory.
//!
//! [`attach`] rebuilds a tenant from the remote storage: it downloads the index
//! of every remote timeline, then the layers missing on local disk. The
//! `attaching` marker file stays in the tenant directory until the local
//! metadata files are written, so an interrupted attach is resumed at startup.
//! Layers that were completely downloaded before the interruption are not
//! downloaded again: a layer file only appears under its final name once it is
//! complete.
//!
//! [`load_local`] starts a tenant from its local files and reconciles them with
//! the remote storage, scheduling the uploads and deletions that were lost when
//! the page server went down.
//!

use std::sync::Arc;

use anyhow::{bail, ensure, Context};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use pageserver_api::models::{TenantStateEvent, TimelineState};
use remote_storage::DownloadError;
use tracing::{debug, info, info_span, warn, Instrument};
use utils::crashsafe;
use utils::id::TimelineId;

use super::metadata::{load_metadata, save_metadata};
use super::remote_timeline_client::index::{IndexPart, LayerFileMetadata};
use super::remote_timeline_client::list_remote_timelines;
use super::storage_layer::LayerFileName;
use super::timeline::Timeline;
use super::Tenant;
use crate::{is_temp_download_file, is_temporary, METADATA_FILE_NAME};

/// A layer listed in a remote index that is not on local disk yet.
struct PendingDownload {
    timeline: Arc<Timeline>,
    layer_file_name: LayerFileName,
    layer_metadata: LayerFileMetadata,
}

/// Downloads the tenant's timelines from the remote storage and activates the tenant.
pub(super) async fn attach(tenant: Arc<Tenant>) -> anyhow::Result<()> {
    let conf = tenant.conf;
    let tenant_id = tenant.tenant_id;

    let mut remote_timeline_ids = list_remote_timelines(
        &tenant.resources.remote_storage,
        tenant_id,
        &tenant.cancel,
    )
    .await
    .context("list remote timelines")?
    .into_iter()
    .collect::<Vec<_>>();
    remote_timeline_ids.sort();
    info!("found {} timelines in the remote storage", remote_timeline_ids.len());

    let mut attached = Vec::with_capacity(remote_timeline_ids.len());
    let mut pending = Vec::new();
    for timeline_id in remote_timeline_ids {
        let remote_client = tenant.create_remote_client(timeline_id);
        let index_part = remote_client
            .download_index_file()
            .instrument(info_span!("download_index_file", %timeline_id))
            .await
            .with_context(|| format!("download index file of timeline {timeline_id}"))?;
        remote_client.init_upload_queue(&index_part)?;

        crashsafe::create_dir_all(conf.timeline_path(&tenant_id, &timeline_id))?;
        let timeline = Timeline::new(
            conf,
            tenant_id,
            timeline_id,
            &index_part.to_local_metadata(),
            remote_client,
            Arc::clone(&tenant.state),
            TimelineState::Loading,
        );

        let pending_before = pending.len();
        for (layer_file_name, layer) in &index_part.layer_metadata {
            let layer_metadata = LayerFileMetadata::from(layer);
            let local_path = conf.layer_path(&tenant_id, &timeline_id, layer_file_name);
            match local_path.metadata() {
                Ok(local) if local.len() == layer_metadata.file_size() => {
                    debug!("layer {local_path} is already downloaded");
                    continue;
                }
                Ok(local) => warn!(
                    "layer {local_path} has size {}, expected {}, downloading it again",
                    local.len(),
                    layer_metadata.file_size()
                ),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("stat local layer file {local_path}"))
                }
            }
            pending.push(PendingDownload {
                timeline: Arc::clone(&timeline),
                layer_file_name: layer_file_name.clone(),
                layer_metadata,
            });
        }

        timeline.set_layers_awaiting_download(pending.len() - pending_before);

        tenant
            .timelines
            .lock()
            .insert(timeline_id, Arc::clone(&timeline));
        attached.push((timeline, index_part));
    }

    let downloads_pending = pending.len();
    if downloads_pending == 0 {
        info!("every layer is present locally, nothing to download");
        finish_attach(&tenant, &attached)?;
        tenant.state.apply(TenantStateEvent::Loaded {
            downloads_pending: 0,
        })?;
        return Ok(());
    }

    info!("downloading {downloads_pending} layers");
    tenant
        .state
        .apply(TenantStateEvent::Loaded { downloads_pending })?;

    let concurrency = conf.download_concurrency.get();
    let mut queued = pending.into_iter();
    let mut downloads = FuturesUnordered::new();
    let mut layers_downloaded = 0;
    loop {
        while downloads.len() < concurrency {
            let Some(download) = queued.next() else {
                break;
            };
            downloads.push(async move {
                let result = download
                    .timeline
                    .remote_client()
                    .download_layer_file(&download.layer_file_name, &download.layer_metadata)
                    .instrument(info_span!(
                        "download_layer",
                        timeline_id = %download.timeline.timeline_id,
                        layer = %download.layer_file_name
                    ))
                    .await;
                (download.timeline, download.layer_file_name, result)
            });
        }

        let Some((timeline, layer_file_name, result)) = downloads.next().await else {
            break;
        };
        result.with_context(|| format!("download layer {layer_file_name}"))?;
        timeline.layer_downloaded();
        layers_downloaded += 1;
        tenant
            .state
            .apply(TenantStateEvent::DownloadProgress { layers_downloaded })?;
    }

    finish_attach(&tenant, &attached)?;
    tenant.state.apply(TenantStateEvent::DownloadsComplete)?;
    Ok(())
}

/// Every layer is on local disk: write the local indexes, drop the marker and
/// open the timelines.
fn finish_attach(tenant: &Tenant, attached: &[(Arc<Timeline>, IndexPart)]) -> anyhow::Result<()> {
    for (timeline, index_part) in attached {
        save_metadata(
            tenant.conf,
            &tenant.tenant_id,
            &timeline.timeline_id,
            &index_part.to_local_metadata(),
        )?;
    }

    crashsafe::durable_remove_file(&tenant.conf.tenant_attaching_mark_file_path(&tenant.tenant_id))
        .context("remove the attach marker file")?;

    for (timeline, _) in attached {
        timeline.activate();
    }
    Ok(())
}

/// Loads the tenant's timelines from local disk and reconciles them with the
/// remote storage.
pub(super) async fn load_local(tenant: Arc<Tenant>) -> anyhow::Result<()> {
    let timelines_path = tenant.conf.timelines_path(&tenant.tenant_id);

    let mut timeline_ids = Vec::new();
    let entries = timelines_path
        .read_dir_utf8()
        .with_context(|| format!("read timelines directory {timelines_path}"))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry of {timelines_path}"))?;
        let path = entry.path();

        if is_temporary(path) {
            info!("removing temporary timeline directory {path}");
            std::fs::remove_dir_all(path)
                .with_context(|| format!("remove temporary timeline directory {path}"))?;
            continue;
        }

        let Ok(timeline_id) = entry.file_name().parse::<TimelineId>() else {
            warn!("skipping unexpected entry in timelines directory: {path}");
            continue;
        };

        if !path.join(METADATA_FILE_NAME).exists() {
            // The creation of the timeline did not finish before the metadata file was written.
            info!("removing timeline directory without metadata: {path}");
            std::fs::remove_dir_all(path)
                .with_context(|| format!("remove unfinished timeline directory {path}"))?;
            continue;
        }
        timeline_ids.push(timeline_id);
    }
    timeline_ids.sort();

    for timeline_id in timeline_ids {
        load_timeline(&tenant, timeline_id)
            .instrument(info_span!("load_timeline", %timeline_id))
            .await
            .with_context(|| format!("load timeline {timeline_id}"))?;
    }

    tenant.state.apply(TenantStateEvent::Loaded {
        downloads_pending: 0,
    })?;
    Ok(())
}

async fn load_timeline(tenant: &Tenant, timeline_id: TimelineId) -> anyhow::Result<()> {
    let conf = tenant.conf;
    let tenant_id = tenant.tenant_id;
    let metadata = load_metadata(conf, &tenant_id, &timeline_id)?;

    let timeline_path = conf.timeline_path(&tenant_id, &timeline_id);
    for entry in timeline_path
        .read_dir_utf8()
        .with_context(|| format!("read timeline directory {timeline_path}"))?
    {
        let entry = entry.with_context(|| format!("read entry of {timeline_path}"))?;
        let path = entry.path();
        let file_name = entry.file_name();
        if file_name == METADATA_FILE_NAME {
            continue;
        }

        let leftover = is_temp_download_file(path) || is_temporary(path);
        let listed = LayerFileName::parse_str(file_name)
            .map(|name| metadata.layers().contains(&name))
            .unwrap_or(false);
        if leftover || !listed {
            info!("removing file not listed in the local metadata: {path}");
            std::fs::remove_file(path).with_context(|| format!("remove {path}"))?;
        }
    }

    for layer_file_name in metadata.layers() {
        let path = conf.layer_path(&tenant_id, &timeline_id, layer_file_name);
        let size = match path.metadata() {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                bail!("layer {layer_file_name} listed in the local metadata is missing")
            }
            Err(e) => return Err(e).with_context(|| format!("stat local layer file {path}")),
        };
        ensure!(
            size == layer_file_name.expected_file_size(),
            "layer {layer_file_name} has size {size}, expected {}",
            layer_file_name.expected_file_size()
        );
    }

    let remote_client = tenant.create_remote_client(timeline_id);
    match remote_client.download_index_file().await {
        Ok(index_part) => {
            remote_client.init_upload_queue(&index_part)?;

            let mut uploads_scheduled = 0;
            for layer_file_name in metadata.layers() {
                if !index_part.layer_metadata.contains_key(layer_file_name) {
                    remote_client.schedule_layer_file_upload(
                        layer_file_name,
                        &LayerFileMetadata::new(layer_file_name.expected_file_size()),
                    )?;
                    uploads_scheduled += 1;
                }
            }
            if uploads_scheduled > 0
                || index_part.disk_consistent_lsn != metadata.disk_consistent_lsn()
            {
                remote_client.schedule_index_upload(&metadata)?;
            }

            let remote_only = index_part
                .layer_metadata
                .keys()
                .filter(|name| !metadata.layers().contains(*name))
                .cloned()
                .collect::<Vec<_>>();
            if !remote_only.is_empty() {
                remote_client.schedule_layer_file_deletion(&remote_only)?;
            }
            info!(
                "reconciled with the remote index: {uploads_scheduled} uploads and {} deletions scheduled",
                remote_only.len()
            );
        }
        Err(DownloadError::NotFound) => {
            info!("no index file in the remote storage, uploading the whole timeline");
            remote_client.init_upload_queue_for_empty_remote(&metadata)?;
            for layer_file_name in metadata.layers() {
                remote_client.schedule_layer_file_upload(
                    layer_file_name,
                    &LayerFileMetadata::new(layer_file_name.expected_file_size()),
                )?;
            }
            remote_client.schedule_index_upload(&metadata)?;
        }
        Err(e) => return Err(e).context("download index file"),
    }

    let timeline = Timeline::new(
        conf,
        tenant_id,
        timeline_id,
        &metadata,
        remote_client,
        Arc::clone(&tenant.state),
        TimelineState::Active,
    );
    tenant.timelines.lock().insert(timeline_id, timeline);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use bytes::Bytes;
    use pageserver_api::models::TenantState;
    use tokio_util::sync::CancellationToken;
    use utils::wait::wait_until;

    use super::*;
    use crate::tenant::harness::{TenantHarness, TIMELINE_ID};
    use crate::tenant::{create_tenant_files, TenantStateError};

    const ACTIVATION_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates the harness tenant with two checkpointed layers, all uploaded, and
    /// shuts it down.
    async fn prepare_uploaded_tenant(harness: &TenantHarness) -> anyhow::Result<Vec<LayerFileName>> {
        let tenant = harness.create_tenant()?;
        let timeline = tenant.create_empty_timeline(TIMELINE_ID)?;
        for record in ["very secret secret|1", "very secret secret|2"] {
            timeline.ingest(vec![Bytes::from_static(record.as_bytes())])?;
            timeline.checkpoint().await?;
        }
        timeline.remote_client().wait_completion().await?;
        let layers = timeline.layers();
        tenant.shutdown(false).await;
        Ok(layers)
    }

    fn load_tenant(harness: &TenantHarness) -> anyhow::Result<Arc<Tenant>> {
        Tenant::spawn_load(
            harness.conf,
            harness.tenant_id,
            harness.resources.clone(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn interrupted_attach_skips_downloaded_layers() -> anyhow::Result<()> {
        let harness = TenantHarness::create("interrupted_attach_skips_downloaded_layers")?;
        let layers = prepare_uploaded_tenant(&harness).await?;
        assert_eq!(layers.len(), 2);

        // What an attach interrupted after the first download leaves behind: the
        // first layer complete, the second one partially written.
        std::fs::remove_dir_all(harness.conf.tenant_path(&harness.tenant_id))?;
        create_tenant_files(harness.conf, harness.tenant_id, true)?;
        std::fs::create_dir_all(harness.timeline_path(&TIMELINE_ID))?;
        std::fs::copy(
            harness
                .remote_timeline_dir(&TIMELINE_ID)
                .join(layers[0].file_name()),
            harness.layer_path(&TIMELINE_ID, &layers[0]),
        )?;
        std::fs::write(harness.layer_path(&TIMELINE_ID, &layers[1]), b"torn")?;

        // Hold the one remaining download before its rename, to look at the progress.
        harness
            .resources
            .failpoints
            .configure("remote-storage-download-pre-rename", "1*sleep(500)->off")?;

        let downloads_before = harness.resources.metrics.downloaded_layers();
        let tenant = load_tenant(&harness)?;
        let progress = wait_until(50, Duration::from_millis(20), || async {
            match tenant.current_state() {
                TenantState::Attaching { progress } => Ok(progress),
                other => anyhow::bail!("tenant is {other}"),
            }
        })
        .await?;
        assert_eq!(progress.layers_total, 1);
        let info = tenant.info(false);
        assert_eq!(
            info.timelines_awaiting_download,
            BTreeMap::from([(TIMELINE_ID, 1)])
        );
        let loading = tenant.get_timeline(TIMELINE_ID, false)?.info(false);
        assert!(loading.awaits_download);
        assert_eq!(loading.layers_awaiting_download, 1);

        tenant.wait_to_become_active(ACTIVATION_TIMEOUT).await?;
        assert!(tenant.info(false).timelines_awaiting_download.is_empty());

        assert_eq!(harness.resources.metrics.downloaded_layers() - downloads_before, 1);
        assert!(!harness
            .conf
            .tenant_attaching_mark_file_path(&harness.tenant_id)
            .exists());
        let timeline = tenant.get_timeline(TIMELINE_ID, true)?;
        assert_eq!(
            timeline.read_records().await?,
            vec![
                Bytes::from_static(b"very secret secret|1"),
                Bytes::from_static(b"very secret secret|2"),
            ]
        );
        let info = timeline.info(false);
        assert!(!info.awaits_download);
        assert_eq!(info.layers_awaiting_download, 0);
        Ok(())
    }

    #[tokio::test]
    async fn attach_without_remote_data_breaks_the_tenant() -> anyhow::Result<()> {
        let harness = TenantHarness::create("attach_without_remote_data_breaks_the_tenant")?;
        create_tenant_files(harness.conf, harness.tenant_id, true)?;

        let tenant = Tenant::spawn_attach(
            harness.conf,
            harness.tenant_id,
            harness.resources.clone(),
            CancellationToken::new(),
        )?;
        match tenant.wait_to_become_active(ACTIVATION_TIMEOUT).await {
            Err(TenantStateError::Broken(_, reason)) => {
                assert!(reason.contains("no timelines found"), "{reason}")
            }
            other => panic!("expected a broken tenant, got {other:?}"),
        }
        // The marker stays, a restart tries the attach again.
        assert!(harness
            .conf
            .tenant_attaching_mark_file_path(&harness.tenant_id)
            .exists());
        Ok(())
    }

    #[tokio::test]
    async fn load_removes_leftovers_and_reuploads_lost_files() -> anyhow::Result<()> {
        let harness = TenantHarness::create("load_removes_leftovers_and_reuploads_lost_files")?;
        let layers = prepare_uploaded_tenant(&harness).await?;

        let timeline_path = harness.timeline_path(&TIMELINE_ID);
        let leftovers = [
            timeline_path.join(format!("{}.{}", layers[0].file_name(), crate::TEMP_DOWNLOAD_EXTENSION)),
            timeline_path.join(format!("{}{}", METADATA_FILE_NAME, crate::TEMP_FILE_SUFFIX)),
            timeline_path.join("0000000000001000-0000000000002000"),
        ];
        for leftover in &leftovers {
            std::fs::write(leftover, b"leftover")?;
        }
        let unfinished_timeline = harness.conf.timelines_path(&harness.tenant_id).join(
            TimelineId::from_array([0xBB; 16]).to_string(),
        );
        std::fs::create_dir_all(&unfinished_timeline)?;

        // The remote storage lost everything.
        std::fs::remove_dir_all(harness.remote_timeline_dir(&TIMELINE_ID))?;

        let tenant = load_tenant(&harness)?;
        tenant.wait_to_become_active(ACTIVATION_TIMEOUT).await?;

        for leftover in &leftovers {
            assert!(!leftover.exists(), "{leftover} was not removed");
        }
        assert!(!unfinished_timeline.exists());
        assert_eq!(tenant.list_timelines().len(), 1);

        let timeline = tenant.get_timeline(TIMELINE_ID, true)?;
        timeline.remote_client().wait_completion().await?;
        let remote_dir = harness.remote_timeline_dir(&TIMELINE_ID);
        for layer in &layers {
            assert!(remote_dir.join(layer.file_name()).exists());
        }
        assert!(remote_dir.join(IndexPart::FILE_NAME).exists());
        assert_eq!(
            timeline.remote_client().remote_consistent_lsn(),
            Some(timeline.get_disk_consistent_lsn())
        );
        Ok(())
    }

    #[tokio::test]
    async fn load_with_missing_layer_breaks_the_tenant() -> anyhow::Result<()> {
        let harness = TenantHarness::create("load_with_missing_layer_breaks_the_tenant")?;
        let layers = prepare_uploaded_tenant(&harness).await?;
        std::fs::remove_file(harness.layer_path(&TIMELINE_ID, &layers[1]))?;

        let tenant = load_tenant(&harness)?;
        let err = tenant
            .wait_to_become_active(ACTIVATION_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, TenantStateError::Broken(..)), "{err}");
        assert!(tenant.current_state().is_broken());
        Ok(())
    }
}
