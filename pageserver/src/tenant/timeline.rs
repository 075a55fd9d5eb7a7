//!
//! A timeline keeps the records of one history of a tenant in immutable layer
//! files, plus an in-memory buffer of the records ingested since the last
//! checkpoint.
//!
//! Every change of the set of layer files is mirrored to the remote storage
//! through the timeline's [`RemoteTimelineClient`]: new layers are scheduled
//! for upload followed by an index upload, removed layers are scheduled for
//! deletion after an index upload that no longer lists them.
//!
//! Compaction merges the live layers into one that covers all of them. The
//! inputs become superseded: reads skip them, and GC removes them once they are
//! older than the GC horizon. Which layers are superseded is derived from the
//! layer ranges, so it is not persisted anywhere.
//!

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context};
use bytes::Bytes;
use itertools::Itertools;
use pageserver_api::models::{GcResult, TimelineInfo, TimelineState};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use utils::fs_ext;
use utils::id::{TenantId, TimelineId};
use utils::lsn::{AtomicLsn, Lsn};

use super::metadata::{save_metadata, TimelineMetadata};
use super::remote_timeline_client::index::LayerFileMetadata;
use super::remote_timeline_client::RemoteTimelineClient;
use super::storage_layer::{read_layer_file, record_lsn_len, write_layer_file, LayerFileName};
use super::TenantStateCell;
use crate::config::PageServerConf;

/// The layer files of a timeline and the records not yet written to any of them.
#[derive(Default)]
struct LayerMap {
    /// Every layer file on local disk with its size, including the superseded ones
    /// that GC has not removed yet.
    historic: BTreeMap<LayerFileName, u64>,

    /// Records ingested since the last checkpoint, in LSN order.
    open: Vec<Bytes>,
}

impl LayerMap {
    fn is_superseded(&self, name: &LayerFileName) -> bool {
        self.historic.keys().any(|other| other.covers(name))
    }

    /// The layers reads go through, in LSN order.
    fn live_layers(&self) -> Vec<LayerFileName> {
        self.historic
            .keys()
            .filter(|name| !self.is_superseded(name))
            .cloned()
            .collect()
    }

    /// The local index as it will be once `added` is in the map and `removed` is not.
    fn metadata_with(
        &self,
        disk_consistent_lsn: Lsn,
        added: Option<&LayerFileName>,
        removed: &[LayerFileName],
    ) -> TimelineMetadata {
        let mut layers = self
            .historic
            .keys()
            .filter(|name| !removed.contains(name))
            .cloned()
            .collect::<BTreeSet<_>>();
        layers.extend(added.cloned());
        TimelineMetadata::new(disk_consistent_lsn, layers)
    }
}

/// Runs blocking file IO on the blocking thread pool.
async fn spawn_blocking_io<T, F>(f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("blocking file IO task panicked")?
}

pub struct Timeline {
    conf: &'static PageServerConf,
    pub tenant_id: TenantId,
    pub timeline_id: TimelineId,

    state: watch::Sender<TimelineState>,
    tenant_state: Arc<TenantStateCell>,

    /// LSN of the end of the last ingested record.
    last_record_lsn: AtomicLsn,

    /// Everything before this LSN is in layer files on local disk.
    disk_consistent_lsn: AtomicLsn,

    layers: Mutex<LayerMap>,

    /// Layers listed in the remote index that an attach has not downloaded yet.
    layers_awaiting_download: AtomicUsize,

    /// Held by the operations that add or remove layer files (checkpoint,
    /// compaction and GC), and by reads, so that a layer being read is never
    /// removed underneath.
    layer_removal_cs: tokio::sync::Mutex<()>,

    remote_client: Arc<RemoteTimelineClient>,
}

impl Timeline {
    /// Builds the in-memory timeline from its local index. The layers it lists
    /// must be on local disk before the timeline is activated.
    pub fn new(
        conf: &'static PageServerConf,
        tenant_id: TenantId,
        timeline_id: TimelineId,
        metadata: &TimelineMetadata,
        remote_client: Arc<RemoteTimelineClient>,
        tenant_state: Arc<TenantStateCell>,
        state: TimelineState,
    ) -> Arc<Self> {
        let historic = metadata
            .layers()
            .iter()
            .map(|name| (name.clone(), name.expected_file_size()))
            .collect();
        let disk_consistent_lsn = metadata.disk_consistent_lsn();

        Arc::new(Timeline {
            conf,
            tenant_id,
            timeline_id,
            state: watch::channel(state).0,
            tenant_state,
            last_record_lsn: AtomicLsn::new(disk_consistent_lsn.0),
            disk_consistent_lsn: AtomicLsn::new(disk_consistent_lsn.0),
            layers: Mutex::new(LayerMap {
                historic,
                open: Vec::new(),
            }),
            layers_awaiting_download: AtomicUsize::new(0),
            layer_removal_cs: tokio::sync::Mutex::new(()),
            remote_client,
        })
    }

    pub fn current_state(&self) -> TimelineState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.current_state() == TimelineState::Active
    }

    pub fn activate(&self) {
        self.set_state(TimelineState::Active);
    }

    fn set_state(&self, new_state: TimelineState) {
        let old_state = self.state.send_replace(new_state);
        if old_state != new_state {
            debug!(
                "timeline {}/{} state change: {old_state:?} -> {new_state:?}",
                self.tenant_id, self.timeline_id
            );
        }
    }

    /// Stops the timeline: its pending remote operations are dropped.
    pub fn shutdown(&self) {
        self.set_state(TimelineState::Stopping);
        self.remote_client.stop();
    }

    pub fn layers_awaiting_download(&self) -> usize {
        self.layers_awaiting_download.load(Ordering::Relaxed)
    }

    pub(super) fn set_layers_awaiting_download(&self, layers: usize) {
        self.layers_awaiting_download.store(layers, Ordering::Relaxed);
    }

    pub(super) fn layer_downloaded(&self) {
        let _ = self.layers_awaiting_download.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |remaining| remaining.checked_sub(1),
        );
    }

    pub fn remote_client(&self) -> &Arc<RemoteTimelineClient> {
        &self.remote_client
    }

    pub fn get_last_record_lsn(&self) -> Lsn {
        self.last_record_lsn.load()
    }

    pub fn get_disk_consistent_lsn(&self) -> Lsn {
        self.disk_consistent_lsn.load()
    }

    /// All layer files on local disk, superseded ones included.
    pub fn layers(&self) -> Vec<LayerFileName> {
        self.layers.lock().historic.keys().cloned().collect()
    }

    fn ensure_writable(&self) -> anyhow::Result<()> {
        ensure!(
            self.is_active(),
            "timeline {}/{} is not active, state: {:?}",
            self.tenant_id,
            self.timeline_id,
            self.current_state()
        );
        Ok(())
    }

    /// Appends records; each one advances `last_record_lsn` by its encoded size.
    ///
    /// Returns the new `last_record_lsn`.
    pub fn ingest(&self, records: Vec<Bytes>) -> anyhow::Result<Lsn> {
        self.ensure_writable()?;

        let mut layers = self.layers.lock();
        let mut lsn = self.last_record_lsn.load();
        for record in records {
            lsn += record_lsn_len(&record);
            layers.open.push(record);
        }
        self.last_record_lsn.store(lsn);
        Ok(lsn)
    }

    /// Returns every record of the timeline, in LSN order.
    ///
    /// The tenant's data is only readable while the tenant is Active.
    pub async fn read_records(&self) -> anyhow::Result<Vec<Bytes>> {
        if !self.tenant_state.is_active() {
            bail!(
                "tenant {} is not active, state: {}",
                self.tenant_id,
                self.tenant_state.current()
            );
        }
        self.ensure_writable()?;

        let _layer_removal_guard = self.layer_removal_cs.lock().await;
        let (live_layers, open) = {
            let layers = self.layers.lock();
            (layers.live_layers(), layers.open.clone())
        };

        let mut records = Vec::new();
        for name in live_layers {
            let path = self.conf.layer_path(&self.tenant_id, &self.timeline_id, &name);
            records.extend(read_layer_file(&path).await?);
        }
        records.extend(open);
        Ok(records)
    }

    /// Writes the buffered records into a new layer file covering
    /// `[disk_consistent_lsn, last_record_lsn)`, and schedules its upload
    /// followed by an index upload.
    ///
    /// Returns the name of the new layer, or `None` if there was nothing to write.
    ///
    /// The in-memory state changes only once both the layer file and the local
    /// index listing it are durable. On failure the records stay buffered.
    #[instrument(skip_all, fields(tenant_id = %self.tenant_id, timeline_id = %self.timeline_id))]
    pub async fn checkpoint(&self) -> anyhow::Result<Option<LayerFileName>> {
        self.ensure_writable()?;
        let _layer_removal_guard = self.layer_removal_cs.lock().await;

        // Records ingested from here on are appended after the snapshot and stay buffered.
        let (new_layer, records, metadata) = {
            let layers = self.layers.lock();
            if layers.open.is_empty() {
                debug!("nothing to checkpoint");
                return Ok(None);
            }

            let disk_consistent_lsn = self.disk_consistent_lsn.load();
            let last_record_lsn = self.last_record_lsn.load();
            let new_layer = LayerFileName::new(disk_consistent_lsn..last_record_lsn);
            let metadata = layers.metadata_with(last_record_lsn, Some(&new_layer), &[]);
            (new_layer, layers.open.clone(), metadata)
        };

        let written = records.len();
        let layer_size = {
            let conf = self.conf;
            let (tenant_id, timeline_id) = (self.tenant_id, self.timeline_id);
            let new_layer = new_layer.clone();
            let metadata = metadata.clone();
            spawn_blocking_io(move || {
                let layer_path = conf.layer_path(&tenant_id, &timeline_id, &new_layer);
                let layer_size = write_layer_file(&layer_path, &records)?;
                let saved = if layer_size == new_layer.expected_file_size() {
                    save_metadata(conf, &tenant_id, &timeline_id, &metadata)
                } else {
                    Err(anyhow::anyhow!(
                        "layer {new_layer} was written with {layer_size} bytes"
                    ))
                };
                if let Err(e) = saved {
                    // Not listed in the local index, so loading would remove it anyway.
                    if let Err(remove_err) = std::fs::remove_file(&layer_path) {
                        warn!("failed to remove unlisted layer file {layer_path}: {remove_err}");
                    }
                    return Err(e);
                }
                Ok(layer_size)
            })
            .await?
        };

        {
            let mut layers = self.layers.lock();
            layers.open.drain(..written);
            layers.historic.insert(new_layer.clone(), layer_size);
            self.disk_consistent_lsn.store(new_layer.lsn_range.end);
        }
        info!("checkpointed layer {new_layer}");

        self.remote_client
            .schedule_layer_file_upload(&new_layer, &LayerFileMetadata::new(layer_size))?;
        self.remote_client.schedule_index_upload(&metadata)?;
        Ok(Some(new_layer))
    }

    /// Merges the live layers into a single layer covering all of them.
    ///
    /// The inputs stay on disk, superseded, until GC removes them.
    #[instrument(skip_all, fields(tenant_id = %self.tenant_id, timeline_id = %self.timeline_id))]
    pub async fn compact(&self) -> anyhow::Result<Option<LayerFileName>> {
        self.ensure_writable()?;
        let _layer_removal_guard = self.layer_removal_cs.lock().await;

        let inputs = self.layers.lock().live_layers();
        if inputs.len() < 2 {
            debug!("nothing to compact, {} live layers", inputs.len());
            return Ok(None);
        }
        if let Some((a, b)) = inputs
            .iter()
            .tuple_windows()
            .find(|(a, b)| a.lsn_range.end != b.lsn_range.start)
        {
            warn!("live layers {a} and {b} are not contiguous, skipping compaction");
            return Ok(None);
        }

        let mut records = Vec::new();
        for input in &inputs {
            let path = self.conf.layer_path(&self.tenant_id, &self.timeline_id, input);
            records.extend(read_layer_file(&path).await?);
        }

        let merged = LayerFileName::new(
            inputs[0].lsn_range.start..inputs[inputs.len() - 1].lsn_range.end,
        );
        let metadata = self.layers.lock().metadata_with(
            self.disk_consistent_lsn.load(),
            Some(&merged),
            &[],
        );
        let merged_size = {
            let conf = self.conf;
            let (tenant_id, timeline_id) = (self.tenant_id, self.timeline_id);
            let merged = merged.clone();
            let metadata = metadata.clone();
            spawn_blocking_io(move || {
                let merged_path = conf.layer_path(&tenant_id, &timeline_id, &merged);
                let merged_size = write_layer_file(&merged_path, &records)
                    .with_context(|| format!("write compacted layer {merged}"))?;
                save_metadata(conf, &tenant_id, &timeline_id, &metadata)?;
                Ok(merged_size)
            })
            .await?
        };
        self.layers
            .lock()
            .historic
            .insert(merged.clone(), merged_size);
        info!("compacted {} layers into {merged}", inputs.len());

        self.remote_client
            .schedule_layer_file_upload(&merged, &LayerFileMetadata::new(merged_size))?;
        self.remote_client.schedule_index_upload(&metadata)?;
        Ok(Some(merged))
    }

    /// Removes the superseded layers that end at or before `last_record_lsn - horizon`,
    /// locally and remotely.
    ///
    /// `layers_removed` in the result counts the deletions scheduled; the remote
    /// deletions complete in the background.
    #[instrument(skip_all, fields(tenant_id = %self.tenant_id, timeline_id = %self.timeline_id, horizon))]
    pub async fn gc(&self, horizon: u64) -> anyhow::Result<GcResult> {
        let started_at = Instant::now();
        self.ensure_writable()?;
        let _layer_removal_guard = self.layer_removal_cs.lock().await;

        let cutoff = self.last_record_lsn.load().saturating_sub(horizon);
        let (layers_total, layers_to_remove) = {
            let layers = self.layers.lock();
            let layers_total = layers.historic.len();
            let layers_to_remove = layers
                .historic
                .keys()
                .filter(|name| name.lsn_range.end <= cutoff && layers.is_superseded(name))
                .cloned()
                .collect::<Vec<_>>();
            if layers_to_remove.is_empty() {
                debug!("no layers to remove below {cutoff}");
                return Ok(GcResult {
                    layers_total: layers_total as u64,
                    layers_removed: 0,
                    elapsed: started_at.elapsed(),
                });
            }

            (layers_total, layers_to_remove)
        };

        // The local index stops listing the layers before their files go away.
        let metadata = self.layers.lock().metadata_with(
            self.disk_consistent_lsn.load(),
            None,
            &layers_to_remove,
        );
        {
            let conf = self.conf;
            let (tenant_id, timeline_id) = (self.tenant_id, self.timeline_id);
            spawn_blocking_io(move || save_metadata(conf, &tenant_id, &timeline_id, &metadata))
                .await?;
        }
        {
            let mut layers = self.layers.lock();
            for name in &layers_to_remove {
                layers.historic.remove(name);
            }
        }

        let layers_removed = self
            .remote_client
            .schedule_layer_file_deletion(&layers_to_remove)?;
        info!("scheduled removal of {layers_removed} layers below {cutoff}");

        Ok(GcResult {
            layers_total: layers_total as u64,
            layers_removed: layers_removed as u64,
            elapsed: started_at.elapsed(),
        })
    }

    /// Checkpoints and waits, at most `timeout`, for the upload queue to drain.
    pub async fn freeze_and_flush(&self, timeout: Duration) -> anyhow::Result<()> {
        self.checkpoint().await?;
        tokio::time::timeout(timeout, self.remote_client.wait_completion())
            .await
            .with_context(|| format!("uploads did not finish within {timeout:?}"))?
    }

    pub fn current_physical_size(&self) -> anyhow::Result<u64> {
        let timeline_path = self.conf.timeline_path(&self.tenant_id, &self.timeline_id);
        fs_ext::dir_size(&timeline_path, &[])
            .with_context(|| format!("compute the size of {timeline_path}"))
    }

    pub fn info(&self, include_physical_size: bool) -> TimelineInfo {
        let current_physical_size = if include_physical_size {
            match self.current_physical_size() {
                Ok(size) => Some(size),
                Err(e) => {
                    warn!("{e:#}");
                    None
                }
            }
        } else {
            None
        };
        let state = self.current_state();

        TimelineInfo {
            tenant_id: self.tenant_id,
            timeline_id: self.timeline_id,
            state,
            last_record_lsn: self.get_last_record_lsn(),
            disk_consistent_lsn: self.get_disk_consistent_lsn(),
            remote_consistent_lsn: self.remote_client.remote_consistent_lsn(),
            awaits_download: state == TimelineState::Loading,
            layers_awaiting_download: self.layers_awaiting_download(),
            upload_queue_depth: self.remote_client.queue_depth(),
            current_physical_size,
        }
    }
}
