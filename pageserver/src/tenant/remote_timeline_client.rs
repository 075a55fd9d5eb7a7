//! This module manages synchronizing local FS with remote storage.
//!
//! # Overview
//!
//! * [`RemoteTimelineClient`] provides functions related to upload/download of a particular timeline.
//!   It contains a queue of pending uploads and deletions, and executes them one after another.
//!
//! * Stand-alone function, [`list_remote_timelines`], to get list of timelines of a tenant.
//!
//! These functions use the low-level remote storage client, [`remote_storage::GenericRemoteStorage`].
//!
//! # APIs & How To Use Them
//!
//! There is a [`RemoteTimelineClient`] for each [`Timeline`](crate::tenant::timeline::Timeline).
//! The client does not become ready for use until we've initialized its upload queue:
//!
//! - For timelines that already have some state on the remote storage, we use
//!   [`RemoteTimelineClient::init_upload_queue`] .
//! - For newly created timelines, we use
//!   [`RemoteTimelineClient::init_upload_queue_for_empty_remote`].
//!
//! Whenever we've created/updated/deleted a file in a timeline directory, we schedule
//! the corresponding remote operation with the timeline's [`RemoteTimelineClient`]:
//!
//! - [`RemoteTimelineClient::schedule_layer_file_upload`]  when we've created a new layer file.
//! - [`RemoteTimelineClient::schedule_index_upload`] when we've updated the timeline metadata file.
//! - [`RemoteTimelineClient::schedule_layer_file_deletion`] when we've deleted one or more layer files.
//!
//! Internally, these functions create [`UploadOp`]s and put them in a queue.
//!
//! # Remote Storage Structure & [`IndexPart`] Index File
//!
//! The "directory structure" in the remote storage mirrors the local directory structure, with paths
//! like `tenants/<tenant_id>/timelines/<timeline_id>/<layer filename>`.
//! Instead of keeping the `metadata` file remotely, we keep an "index file" aka [`IndexPart`],
//! containing the list of **all** remote layer files of a timeline and its `disk_consistent_lsn`.
//! If a file is not referenced from [`IndexPart`], it's not part of the remote storage state.
//!
//! # Consistency
//!
//! The index file lists layer files, so it must not be uploaded until all the
//! layer files that are in its list have been successfully uploaded. A layer file
//! must not be deleted before an index that no longer lists it is uploaded, and
//! not before its own upload completed.
//!
//! The client executes the operations of one timeline strictly in the order they were
//! scheduled, one at a time: an operation is started only after the previous one
//! completed. A failing operation is retried in place with exponential back-off,
//! and nothing scheduled after it runs meanwhile. Together with the scheduling
//! order kept by the callers, this gives the guarantees above.
//!
//! The number of remote operations in flight across all timelines is limited by a
//! process-wide semaphore, sized by `remote_storage.max_concurrent_syncs`.
//!
//! NB: Pageserver assumes that it has exclusive write access to the tenant in remote
//! storage. If the same tenant is attached to two pageservers at the same time, they
//! will overwrite each other's index file updates.
//!
//! ## Implementation Note
//!
//! The *actual* remote state lags behind the *desired* remote state while
//! there are queued operations.
//! We keep track of the desired remote state in
//! [`UploadQueueInitialized::latest_files`] and [`UploadQueueInitialized::latest_metadata`].
//! It is initialized based on the [`IndexPart`] that was passed during init
//! and updated with every `schedule_*` function call.
//!
//! # Retries & Error Handling
//!
//! By default the client retries operations indefinitely. With
//! `remote_storage.max_sync_errors` set, an operation that failed more often than
//! that stops the queue and breaks the tenant; further scheduling calls fail with
//! [`NotInitialized::Stopped`].
//!
//! # Cancellation
//!
//! The operations run as tokio tasks. Cancelling the client's token (on shutdown or
//! detach) stops the queue at the next retry or permit wait, dropping queued operations.
//!
//! # Completion
//!
//! Once an index upload has completed, we update
//! [`UploadQueueInitialized::last_uploaded_consistent_lsn`], reported as the timeline's
//! `remote_consistent_lsn`.
//!
//! The [`RemoteTimelineClient::wait_completion`] method can be used to wait
//! for all pending operations to complete. It does not prevent more
//! operations from getting scheduled.
//!
//! # Crash Consistency
//!
//! We do not persist the upload queue state.
//! If we drop the client, or crash, all unfinished operations are lost.
//! On the next load, the timeline compares its local layers with the remote
//! [`IndexPart`] and schedules uploads for whatever is missing remotely.
//!
//! # Downloads (= Tenant Attach)
//!
//! In addition to the upload queue, [`RemoteTimelineClient`] has functions for
//! downloading files from the remote storage. Downloads are performed immediately,
//! independently of the uploads, see [`crate::tenant::attach`]. While a layer is being
//! downloaded, a [`DownloadLease`](crate::tenant::download_lease::DownloadLease) on it is
//! held, and a remote deletion of that layer waits for the lease to be released.

mod delete;
mod download;
pub mod index;
mod upload;

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::ops::DerefMut;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Context;
use failpoints::FailpointRegistry;
use metrics::UIntGauge;
use parking_lot::{Mutex, MutexGuard};
use remote_storage::{DownloadError, GenericRemoteStorage, RemotePath};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use utils::backoff::{exponential_backoff, DEFAULT_BASE_BACKOFF_SECONDS, DEFAULT_MAX_BACKOFF_SECONDS};
use utils::id::{TenantId, TenantTimelineId, TimelineId};
use utils::lsn::Lsn;

use self::index::{IndexPart, LayerFileMetadata};
use super::download_lease::{DownloadLeases, LeaseKey};
use super::metadata::TimelineMetadata;
use super::storage_layer::LayerFileName;
use super::upload_queue::{
    Delete, NotInitialized, UploadOp, UploadQueue, UploadQueueInitialized, UploadQueueStopped,
    UploadTask,
};
use super::{TenantSharedResources, TenantStateCell};
use crate::config::{PageServerConf, TENANTS_SEGMENT_NAME, TIMELINES_SEGMENT_NAME};
use crate::metrics::{PageserverMetrics, RemoteOpFileKind, RemoteOpKind};

// Occasional network issues and such can cause remote operations to fail, and
// that's expected. If a download fails, we log it at info-level, and retry.
// But after FAILED_DOWNLOAD_WARN_THRESHOLD retries, we start to log it at WARN
// level instead, as repeated failures can mean a more serious problem. If it
// fails more than FAILED_DOWNLOAD_RETRIES times, we give up
pub(crate) const FAILED_DOWNLOAD_WARN_THRESHOLD: u32 = 3;
pub(crate) const FAILED_DOWNLOAD_RETRIES: u32 = 10;

// Similarly log failed uploads and deletions at WARN level, after this many
// retries. Uploads and deletions are retried forever, unless
// `max_sync_errors` is configured.
pub(crate) const FAILED_UPLOAD_WARN_THRESHOLD: u32 = 3;

pub(crate) use download::list_remote_timelines;

/// A client for accessing a timeline's data in remote storage.
///
/// This takes care of managing the number of connections, and balancing them
/// across tenants. This also handles retries of failed uploads.
///
/// Upload and delete requests are executed in order, one at a time. This ensures
/// that if you perform a compaction operation that reshuffles data in layer
/// files, we don't have a transient state where the old files have already been
/// deleted, but new files have not yet been uploaded.
///
/// This also maintains a list of remote files, and automatically includes that
/// in the index part file, whenever timeline metadata is uploaded.
///
/// Downloads are not queued, they are performed immediately.
pub struct RemoteTimelineClient {
    conf: &'static PageServerConf,

    tenant_id: TenantId,
    timeline_id: TimelineId,

    upload_queue: Mutex<UploadQueue>,

    storage_impl: GenericRemoteStorage,
    remote_ops_limit: Arc<Semaphore>,
    download_leases: Arc<DownloadLeases>,
    failpoints: Arc<FailpointRegistry>,
    metrics: Arc<PageserverMetrics>,
    upload_queue_items: UIntGauge,
    max_sync_errors: Option<NonZeroU32>,

    tenant_state: Arc<TenantStateCell>,
    cancel: CancellationToken,

    /// Every operation that reached the remote storage, in completion order.
    #[cfg(test)]
    completed_ops: Mutex<Vec<CompletedOp>>,
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
enum CompletedOp {
    UploadLayer(LayerFileName),
    UploadIndex(Vec<LayerFileName>),
    Delete(LayerFileName),
}

impl RemoteTimelineClient {
    ///
    /// Create a remote storage client for given timeline
    ///
    /// Note: the caller must initialize the upload queue before any uploads can be scheduled,
    /// by calling init_upload_queue.
    ///
    pub fn new(
        conf: &'static PageServerConf,
        resources: &TenantSharedResources,
        tenant_state: Arc<TenantStateCell>,
        tenant_id: TenantId,
        timeline_id: TimelineId,
        cancel: CancellationToken,
    ) -> RemoteTimelineClient {
        RemoteTimelineClient {
            conf,
            tenant_id,
            timeline_id,
            upload_queue: Mutex::new(UploadQueue::Uninitialized),
            storage_impl: resources.remote_storage.clone(),
            remote_ops_limit: Arc::clone(&resources.remote_ops_limit),
            download_leases: Arc::clone(&resources.download_leases),
            failpoints: Arc::clone(&resources.failpoints),
            upload_queue_items: resources.metrics.upload_queue_items(&tenant_id, &timeline_id),
            metrics: Arc::clone(&resources.metrics),
            max_sync_errors: conf.remote_storage_config.max_sync_errors,
            tenant_state,
            cancel,
            #[cfg(test)]
            completed_ops: Mutex::new(Vec::new()),
        }
    }

    /// Initialize the upload queue for a remote storage that already received
    /// an index file upload, i.e., it's not empty.
    /// The given `index_part` must be the one on the remote.
    pub fn init_upload_queue(&self, index_part: &IndexPart) -> anyhow::Result<()> {
        let mut upload_queue = self.upload_queue.lock();
        upload_queue.initialize_with_current_remote_index_part(index_part)?;
        Ok(())
    }

    /// Initialize the upload queue for the case where the remote storage is empty,
    /// i.e., it doesn't have an `IndexPart`.
    pub fn init_upload_queue_for_empty_remote(
        &self,
        local_metadata: &TimelineMetadata,
    ) -> anyhow::Result<()> {
        let mut upload_queue = self.upload_queue.lock();
        upload_queue.initialize_empty_remote(local_metadata)?;
        Ok(())
    }

    /// `disk_consistent_lsn` of the last index file that reached the remote storage.
    pub fn remote_consistent_lsn(&self) -> Option<Lsn> {
        match &*self.upload_queue.lock() {
            UploadQueue::Uninitialized => None,
            UploadQueue::Initialized(q) => q.last_uploaded_consistent_lsn,
            UploadQueue::Stopped(q) => q.last_uploaded_consistent_lsn,
        }
    }

    /// Number of scheduled operations that have not completed yet.
    pub fn queue_depth(&self) -> usize {
        match &*self.upload_queue.lock() {
            UploadQueue::Initialized(q) => q.depth(),
            UploadQueue::Uninitialized | UploadQueue::Stopped(_) => 0,
        }
    }

    /// Whether an upload of the layer is queued or in progress.
    pub fn is_upload_pending(&self, layer_file_name: &LayerFileName) -> bool {
        match &*self.upload_queue.lock() {
            UploadQueue::Initialized(q) => q.pending_layer_uploads.contains(layer_file_name),
            UploadQueue::Uninitialized | UploadQueue::Stopped(_) => false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(&*self.upload_queue.lock(), UploadQueue::Stopped(_))
    }

    //
    // Download operations.
    //
    // These don't use the per-timeline queue. They do use the global semaphore in
    // remote_ops_limit, to limit the total number of concurrent operations, though.
    //

    /// Download index file
    pub async fn download_index_file(&self) -> Result<IndexPart, DownloadError> {
        self.metrics
            .measure_remote_op(
                RemoteOpFileKind::Index,
                RemoteOpKind::Download,
                download::download_index_part(
                    &self.storage_impl,
                    &self.tenant_id,
                    &self.timeline_id,
                    &self.cancel,
                ),
            )
            .await
    }

    /// Download a layer file into the timeline directory.
    ///
    /// 'layer_metadata' is the metadata from the remote index file.
    ///
    /// On success, returns the size of the downloaded file.
    pub async fn download_layer_file(
        &self,
        layer_file_name: &LayerFileName,
        layer_metadata: &LayerFileMetadata,
    ) -> Result<u64, DownloadError> {
        if self.tenant_state.is_broken() {
            return Err(DownloadError::Other(anyhow::anyhow!(
                "tenant {} is broken, not downloading {}",
                self.tenant_id,
                layer_file_name
            )));
        }
        let lease_key = LeaseKey {
            timeline: TenantTimelineId::new(self.tenant_id, self.timeline_id),
            layer: layer_file_name.clone(),
        };
        let _lease = tokio::select! {
            lease = self.download_leases.acquire(lease_key) => lease,
            _ = self.cancel.cancelled() => {
                return Err(DownloadError::Other(anyhow::anyhow!(
                    "cancelled while waiting for the deletion of {layer_file_name}"
                )))
            }
        };
        let _permit = self
            .acquire_remote_op_permit()
            .await
            .map_err(DownloadError::Other)?;

        let downloaded_size = self
            .metrics
            .measure_remote_op(
                RemoteOpFileKind::Layer,
                RemoteOpKind::Download,
                download::download_layer_file(
                    self.conf,
                    &self.failpoints,
                    &self.storage_impl,
                    self.tenant_id,
                    self.timeline_id,
                    layer_file_name,
                    layer_metadata,
                    &self.cancel,
                ),
            )
            .await?;
        self.metrics.layer_downloaded();
        Ok(downloaded_size)
    }

    //
    // Upload operations.
    //

    ///
    /// Launch an index-file upload operation in the background.
    ///
    /// The upload will be added to the queue immediately, but it
    /// won't be performed until all previously scheduled layer file
    /// upload operations have completed successfully.  This is to
    /// ensure that when the index file claims that layers X, Y and Z
    /// exist in remote storage, they really do.
    pub fn schedule_index_upload(
        self: &Arc<Self>,
        metadata: &TimelineMetadata,
    ) -> Result<(), NotInitialized> {
        let mut guard = self.lock_for_scheduling()?;
        let upload_queue = guard.initialized_mut()?;

        // As documented in the struct definition, it's ok for latest_metadata to be
        // ahead of what's _actually_ on the remote during index upload.
        upload_queue.latest_metadata = metadata.clone();

        let disk_consistent_lsn = upload_queue.latest_metadata.disk_consistent_lsn();
        let index_part = IndexPart::new(upload_queue.latest_files.iter(), disk_consistent_lsn);
        upload_queue
            .queued_operations
            .push_back(UploadOp::UploadMetadata(index_part, disk_consistent_lsn));

        info!(
            "scheduled metadata upload with {} files",
            upload_queue.latest_files.len()
        );

        // Launch the task immediately, if possible
        self.launch_queued_tasks(upload_queue);

        Ok(())
    }

    ///
    /// Launch an upload operation in the background.
    ///
    pub fn schedule_layer_file_upload(
        self: &Arc<Self>,
        layer_file_name: &LayerFileName,
        layer_metadata: &LayerFileMetadata,
    ) -> Result<(), NotInitialized> {
        let mut guard = self.lock_for_scheduling()?;
        let upload_queue = guard.initialized_mut()?;

        upload_queue
            .latest_files
            .insert(layer_file_name.clone(), *layer_metadata);
        upload_queue
            .pending_layer_uploads
            .insert(layer_file_name.clone());

        upload_queue
            .queued_operations
            .push_back(UploadOp::UploadLayer(layer_file_name.clone(), *layer_metadata));

        info!("scheduled layer file upload {}", layer_file_name.file_name());

        // Launch the task immediately, if possible
        self.launch_queued_tasks(upload_queue);
        Ok(())
    }

    ///
    /// Launch a delete operation in the background.
    ///
    /// First schedules an index upload that no longer lists the layers, then one deletion per
    /// layer, so the remote index never refers to a deleted layer. The deletions won't actually
    /// be performed until all preceding operations have completed successfully.
    ///
    /// The local files of the layers are removed too: right away if they are already uploaded,
    /// otherwise by the deletion operation, once the pending upload is done.
    ///
    /// Returns the number of deletions scheduled.
    pub fn schedule_layer_file_deletion(
        self: &Arc<Self>,
        names: &[LayerFileName],
    ) -> Result<usize, NotInitialized> {
        let mut guard = self.lock_for_scheduling()?;
        let upload_queue = guard.initialized_mut()?;

        // Deleting layers doesn't affect the values stored in TimelineMetadata,
        // so we don't need update it.
        let disk_consistent_lsn = upload_queue.latest_metadata.disk_consistent_lsn();

        // Update the remote index file, removing the to-be-deleted files from the index,
        // before deleting the actual files.
        for name in names {
            upload_queue.latest_files.remove(name);
        }
        let index_part = IndexPart::new(upload_queue.latest_files.iter(), disk_consistent_lsn);
        upload_queue
            .queued_operations
            .push_back(UploadOp::UploadMetadata(index_part, disk_consistent_lsn));

        // schedule the actual deletions
        for name in names {
            // The pending uploads only shrink under this same lock, so a layer either
            // gets removed here or by its Delete op, never by neither.
            let remove_local_file = upload_queue.pending_layer_uploads.contains(name);
            if !remove_local_file {
                self.remove_local_layer_file(name);
            }
            upload_queue.queued_operations.push_back(UploadOp::Delete(Delete {
                layer_file_name: name.clone(),
                remove_local_file,
            }));
            info!("scheduled layer file deletion {}", name.file_name());
        }

        // Launch the tasks immediately, if possible
        self.launch_queued_tasks(upload_queue);
        Ok(names.len())
    }

    ///
    /// Wait for all previously scheduled uploads/deletions to complete
    ///
    pub async fn wait_completion(self: &Arc<Self>) -> anyhow::Result<()> {
        let (sender, mut receiver) = tokio::sync::watch::channel(());
        let barrier_op = UploadOp::Barrier(sender);

        {
            let mut guard = self.lock_for_scheduling()?;
            let upload_queue = guard.initialized_mut()?;
            upload_queue.queued_operations.push_back(barrier_op);
            // Don't count this kind of operation!

            // Launch the task immediately, if possible
            self.launch_queued_tasks(upload_queue);
        }

        if receiver.changed().await.is_err() {
            anyhow::bail!("wait_completion aborted because upload queue was stopped");
        }
        Ok(())
    }

    /// Locks the queue for a `schedule_*` call. A broken tenant accepts no more
    /// remote operations: its queue is stopped on the first attempt.
    fn lock_for_scheduling(&self) -> Result<MutexGuard<'_, UploadQueue>, NotInitialized> {
        if self.tenant_state.is_broken() {
            self.stop();
            return Err(NotInitialized::Stopped);
        }
        Ok(self.upload_queue.lock())
    }

    ///
    /// Pick the next task from the queue, and start it unless another one is still running.
    ///
    /// The caller needs to already hold the `upload_queue` lock.
    fn launch_queued_tasks(self: &Arc<Self>, upload_queue: &mut UploadQueueInitialized) {
        if self.tenant_state.is_broken() {
            // The queue gets stopped by whoever observes the Broken state without the lock held.
            info!("tenant is broken, not launching queued remote operations");
            return;
        }
        while upload_queue.inprogress_task.is_none() {
            let next_op = match upload_queue.queued_operations.pop_front() {
                Some(op) => op,
                None => break,
            };

            if let UploadOp::Barrier(sender) = next_op {
                // Everything scheduled before the barrier has completed.
                sender.send_replace(());
                continue;
            }

            info!("starting op: {}", next_op);

            // Assign unique ID to this task
            upload_queue.task_counter += 1;
            let task_id = upload_queue.task_counter;

            let task = Arc::new(UploadTask {
                task_id,
                op: next_op,
                retries: AtomicU32::new(0),
            });
            upload_queue.inprogress_task = Some(Arc::clone(&task));

            // Spawn task to perform the task
            let self_rc = Arc::clone(self);
            tokio::spawn(
                async move {
                    self_rc.perform_upload_task(task).await;
                }
                .instrument(info_span!(parent: None, "remote_upload", tenant_id = %self.tenant_id, timeline_id = %self.timeline_id, upload_task_id = %task_id)),
            );
        }

        self.upload_queue_items.set(upload_queue.depth() as u64);
    }

    ///
    /// Perform an upload task.
    ///
    /// The task is the `inprogress_task`. This function will try to execute it,
    /// retrying until it succeeds or runs out of attempts. On successful
    /// completion, the task is cleared and the next queued operation is launched.
    ///
    /// The task can be shut down, however, and the tenant can become Broken.
    /// Both lead to stopping the whole queue.
    ///
    async fn perform_upload_task(self: &Arc<Self>, task: Arc<UploadTask>) {
        // Loop to retry until it completes.
        loop {
            // If we're requested to shut down, close up shop and exit.
            //
            // Note: We only check for the shutdown requests between retries and while
            // waiting for a permit. An upload already talking to the storage is not
            // interrupted, we let it finish or time out.
            if self.cancel.is_cancelled() {
                info!("upload task cancelled by shutdown request");
                self.stop();
                return;
            }
            if self.tenant_state.is_broken() {
                info!("tenant is broken, abandoning remote task {}", task.op);
                self.stop();
                return;
            }

            let upload_result = self.execute_op(&task.op).await;

            match upload_result {
                Ok(()) => {
                    break;
                }
                Err(_) if self.cancel.is_cancelled() || self.tenant_state.is_broken() => continue,
                Err(e) => {
                    let failures = task.retries.fetch_add(1, Ordering::SeqCst) + 1;

                    if let Some(max_sync_errors) = self.max_sync_errors {
                        if failures > max_sync_errors.get() {
                            error!(
                                "remote task {} failed {failures} times, giving up: {e:?}",
                                task.op
                            );
                            self.tenant_state.set_broken(format!(
                                "remote task {} failed {failures} times: {e:#}",
                                task.op
                            ));
                            self.stop();
                            return;
                        }
                    }

                    // uploads may fail due to rate limits or spurious network and external errors
                    // such issues are relatively regular, so don't use WARN or ERROR to avoid alerting
                    // people and tests until the retries are definitely causing delays.
                    if failures < FAILED_UPLOAD_WARN_THRESHOLD {
                        info!(
                            "failed to perform remote task {}, will retry (attempt {}): {:#}",
                            task.op, failures, e
                        );
                    } else {
                        warn!(
                            "failed to perform remote task {}, will retry (attempt {}): {:?}",
                            task.op, failures, e
                        );
                    }

                    // sleep until it's time to retry, or we're cancelled or broken
                    tokio::select! {
                        _ = exponential_backoff(
                            failures,
                            DEFAULT_BASE_BACKOFF_SECONDS,
                            DEFAULT_MAX_BACKOFF_SECONDS,
                            &self.cancel,
                        ) => {}
                        _ = self.tenant_state.broken() => {}
                    }
                }
            }
        }

        #[cfg(test)]
        self.completed_ops.lock().push(match &task.op {
            UploadOp::UploadLayer(name, _) => CompletedOp::UploadLayer(name.clone()),
            UploadOp::UploadMetadata(index_part, _) => {
                CompletedOp::UploadIndex(index_part.layer_metadata.keys().cloned().collect())
            }
            UploadOp::Delete(delete) => CompletedOp::Delete(delete.layer_file_name.clone()),
            UploadOp::Barrier(_) => unreachable!("barriers are never launched"),
        });

        let retries = task.retries.load(Ordering::SeqCst);
        if retries > 0 {
            info!(
                "remote task {} completed successfully after {} retries",
                task.op, retries
            );
        } else {
            info!("remote task {} completed successfully", task.op);
        }

        if self.tenant_state.is_broken() {
            info!("tenant became broken while remote task {} ran, not launching more", task.op);
            self.stop();
            return;
        }

        // The task has completed successfully. Clear it and launch the next one.
        let mut upload_queue_guard = self.upload_queue.lock();
        let upload_queue = match upload_queue_guard.deref_mut() {
            UploadQueue::Uninitialized => {
                error!("upload task completed on an uninitialized queue");
                return;
            }
            UploadQueue::Stopped(_) => {
                info!("another concurrent task already stopped the queue");
                return;
            } // nothing to do
            UploadQueue::Initialized(qi) => qi,
        };

        upload_queue.inprogress_task = None;

        match &task.op {
            UploadOp::UploadLayer(layer_file_name, _) => {
                upload_queue.pending_layer_uploads.remove(layer_file_name);
            }
            UploadOp::UploadMetadata(_, lsn) => {
                upload_queue.last_uploaded_consistent_lsn = Some(*lsn);
            }
            UploadOp::Delete(_) | UploadOp::Barrier(_) => {}
        };

        // Launch the queued task that was waiting for this one.
        self.launch_queued_tasks(upload_queue);
    }

    async fn execute_op(&self, op: &UploadOp) -> anyhow::Result<()> {
        match op {
            UploadOp::UploadLayer(layer_file_name, layer_metadata) => {
                let source_path =
                    self.conf
                        .layer_path(&self.tenant_id, &self.timeline_id, layer_file_name);
                let remote_path = remote_layer_path(&self.tenant_id, &self.timeline_id, layer_file_name);

                let _permit = self.acquire_remote_op_permit().await?;
                self.metrics
                    .measure_remote_op(
                        RemoteOpFileKind::Layer,
                        RemoteOpKind::Upload,
                        upload::upload_timeline_layer(
                            &self.failpoints,
                            &self.storage_impl,
                            &source_path,
                            &remote_path,
                            layer_metadata.file_size(),
                        ),
                    )
                    .await
            }
            UploadOp::UploadMetadata(index_part, _lsn) => {
                let _permit = self.acquire_remote_op_permit().await?;
                self.metrics
                    .measure_remote_op(
                        RemoteOpFileKind::Index,
                        RemoteOpKind::Upload,
                        upload::upload_index_part(
                            &self.failpoints,
                            &self.storage_impl,
                            &self.tenant_id,
                            &self.timeline_id,
                            index_part,
                        ),
                    )
                    .await
            }
            UploadOp::Delete(delete) => {
                let lease_key = LeaseKey {
                    timeline: TenantTimelineId::new(self.tenant_id, self.timeline_id),
                    layer: delete.layer_file_name.clone(),
                };
                // Held until the remote file is gone: downloads of the layer wait for it.
                let _deletion = tokio::select! {
                    guard = self.download_leases.begin_deletion(lease_key) => guard,
                    _ = self.cancel.cancelled() => anyhow::bail!("cancelled while waiting for downloads of {}", delete.layer_file_name),
                };

                let remote_path =
                    remote_layer_path(&self.tenant_id, &self.timeline_id, &delete.layer_file_name);
                let _permit = self.acquire_remote_op_permit().await?;
                self.metrics
                    .measure_remote_op(
                        RemoteOpFileKind::Layer,
                        RemoteOpKind::Delete,
                        delete::delete_layer(&self.failpoints, &self.storage_impl, &remote_path),
                    )
                    .await?;

                if delete.remove_local_file {
                    self.remove_local_layer_file(&delete.layer_file_name);
                }
                Ok(())
            }
            UploadOp::Barrier(_) => {
                // unreachable. Barrier operations are handled synchronously in
                // launch_queued_tasks
                warn!("unexpected Barrier operation in perform_upload_task");
                Ok(())
            }
        }
    }

    async fn acquire_remote_op_permit(&self) -> anyhow::Result<SemaphorePermit<'_>> {
        tokio::select! {
            permit = self.remote_ops_limit.acquire() => permit.context("remote operations limit semaphore is closed"),
            _ = self.cancel.cancelled() => Err(anyhow::anyhow!("cancelled while waiting for a remote operation permit")),
            _ = self.tenant_state.broken() => Err(anyhow::anyhow!("tenant {} is broken", self.tenant_id)),
        }
    }

    fn remove_local_layer_file(&self, layer_file_name: &LayerFileName) {
        let local_path = self
            .conf
            .layer_path(&self.tenant_id, &self.timeline_id, layer_file_name);
        match std::fs::remove_file(&local_path) {
            Ok(()) => info!("removed local layer file {}", layer_file_name.file_name()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            // The file is not listed in the local metadata anymore, the next load removes it.
            Err(e) => warn!("failed to remove local layer file {local_path}: {e}"),
        }
    }

    /// Moves the queue into the Stopped state, dropping every queued operation.
    pub fn stop(&self) {
        // Whichever *task* for this RemoteTimelineClient grabs the mutex first will transition the queue
        // into stopped state, thereby dropping all off the queued *ops* which haven't become *tasks* yet.
        let mut guard = self.upload_queue.lock();
        match &*guard {
            UploadQueue::Uninitialized => {
                // Nothing was ever scheduled. Keep refusing new operations.
                *guard = UploadQueue::Stopped(UploadQueueStopped {
                    last_uploaded_consistent_lsn: None,
                });
            }
            UploadQueue::Stopped(_) => {
                // nothing to do
                info!("another concurrent task already shut down the queue");
            }
            UploadQueue::Initialized(qi) => {
                info!("shutting down upload queue");

                // Replace the queue with the Stopped state, taking ownership of the old
                // Initialized queue.
                let last_uploaded_consistent_lsn = qi.last_uploaded_consistent_lsn;
                let upload_queue = std::mem::replace(
                    &mut *guard,
                    UploadQueue::Stopped(UploadQueueStopped {
                        last_uploaded_consistent_lsn,
                    }),
                );

                if let UploadQueue::Initialized(qi) = upload_queue {
                    // An in-progress task will finish on its own and observe that the
                    // queue is Stopped.
                    let dropped = qi.depth();
                    if dropped > 0 {
                        info!("dropped {dropped} unfinished remote operations");
                    }
                    // Dropping UploadOp::Barrier() here will make wait_completion() return with an Err()
                    // which is exactly what we want to happen.
                    drop(qi.queued_operations);
                }
            }
        }
        drop(guard);
        self.upload_queue_items.set(0);
    }

    /// Layers listed in the index the queue will upload next, for tests.
    #[cfg(test)]
    fn latest_files(&self) -> HashSet<LayerFileName> {
        match &*self.upload_queue.lock() {
            UploadQueue::Initialized(q) => q.latest_files.keys().cloned().collect(),
            _ => HashSet::new(),
        }
    }
}

pub fn remote_timelines_path(tenant_id: &TenantId) -> RemotePath {
    let path = format!("{TENANTS_SEGMENT_NAME}/{tenant_id}/{TIMELINES_SEGMENT_NAME}");
    RemotePath::from_string(&path).expect("Failed to construct path")
}

pub fn remote_timeline_path(tenant_id: &TenantId, timeline_id: &TimelineId) -> RemotePath {
    remote_timelines_path(tenant_id).join(timeline_id.to_string())
}

pub fn remote_layer_path(
    tenant_id: &TenantId,
    timeline_id: &TimelineId,
    layer_file_name: &LayerFileName,
) -> RemotePath {
    remote_timeline_path(tenant_id, timeline_id).join(layer_file_name.file_name())
}

pub fn remote_index_path(tenant_id: &TenantId, timeline_id: &TimelineId) -> RemotePath {
    remote_timeline_path(tenant_id, timeline_id).join(IndexPart::FILE_NAME)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use bytes::Bytes;
    use camino::Utf8Path;
    use pageserver_api::models::TenantState;
    use utils::wait::wait_until;

    use super::*;
    use crate::tenant::harness::{TenantHarness, TIMELINE_ID};
    use crate::tenant::storage_layer::write_layer_file;

    fn layer(start: u64, end: u64) -> LayerFileName {
        LayerFileName::new(Lsn(start)..Lsn(end))
    }

    /// Writes a layer file with one record filling the layer's LSN range.
    fn create_layer(harness: &TenantHarness, name: &LayerFileName) -> anyhow::Result<LayerFileMetadata> {
        let record = Bytes::from(vec![b'x'; (name.expected_file_size() - 8) as usize]);
        let size = write_layer_file(&harness.layer_path(&TIMELINE_ID, name), &[record])?;
        Ok(LayerFileMetadata::new(size))
    }

    fn dummy_metadata(disk_consistent_lsn: Lsn) -> TimelineMetadata {
        TimelineMetadata::new(disk_consistent_lsn, BTreeSet::new())
    }

    fn assert_remote_files(expected: &[&str], remote_path: &Utf8Path) {
        let mut expected: Vec<String> = expected.iter().map(|x| String::from(*x)).collect();
        expected.sort();

        let mut found: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(remote_path).unwrap().flatten() {
            let entry_name = entry.file_name();
            let fname = entry_name.to_str().unwrap();
            found.push(String::from(fname));
        }
        found.sort();

        assert_eq!(found, expected);
    }

    // Test scheduling
    #[tokio::test]
    async fn upload_scheduling() -> anyhow::Result<()> {
        let harness = TenantHarness::create("upload_scheduling")?;
        let client = harness.remote_client(TIMELINE_ID)?;
        let remote_timeline_dir = harness.remote_timeline_dir(&TIMELINE_ID);

        // Test outline:
        //
        // Schedule upload of a couple of layers. Check that only the first one is started.
        // Schedule upload of index. Check that it is queued
        // Wait for the queue to drain.
        //
        // Download back the index. Check that the list of files is correct
        //
        // Schedule upload. Schedule deletion. Check that the deletion is queued
        // Wait for the queue to drain. Check the remote files.

        client.init_upload_queue_for_empty_remote(&dummy_metadata(Lsn(0)))?;

        // Create a couple of dummy files, schedule upload for them
        let (foo, bar, baz) = (layer(0, 0x20), layer(0x20, 0x30), layer(0x30, 0x48));
        for name in [&foo, &bar] {
            let metadata = create_layer(&harness, name)?;
            client.schedule_layer_file_upload(name, &metadata)?;
        }

        // Operations run one at a time: the first upload is in flight, the second one waits.
        {
            let mut guard = client.upload_queue.lock();
            let upload_queue = guard.initialized_mut()?;
            assert!(upload_queue.inprogress_task.is_some());
            assert_eq!(upload_queue.queued_operations.len(), 1);
            assert_eq!(upload_queue.depth(), 2);
        }
        assert!(client.is_upload_pending(&bar));

        // Schedule upload of index. Check that it is queued
        client.schedule_index_upload(&dummy_metadata(Lsn(0x30)))?;
        assert_eq!(client.queue_depth(), 3);
        assert_eq!(client.remote_consistent_lsn(), None);

        // Wait for the uploads to finish
        client.wait_completion().await?;
        assert_eq!(client.queue_depth(), 0);
        assert!(!client.is_upload_pending(&bar));
        assert_eq!(client.remote_consistent_lsn(), Some(Lsn(0x30)));

        // Download back the index, and check that the list of files is correct
        let index_part = client.download_index_file().await?;
        assert_eq!(
            index_part.layer_metadata.keys().cloned().collect::<Vec<_>>(),
            vec![foo.clone(), bar.clone()]
        );
        assert_eq!(index_part.disk_consistent_lsn, Lsn(0x30));

        // Schedule upload and then a deletion. Check that the deletion is queued
        let metadata = create_layer(&harness, &baz)?;
        client.schedule_layer_file_upload(&baz, &metadata)?;
        assert_eq!(client.schedule_layer_file_deletion(&[foo.clone()])?, 1);
        {
            let mut guard = client.upload_queue.lock();
            let upload_queue = guard.initialized_mut()?;

            // Deletion schedules upload of the index file, and the file deletion itself
            assert_eq!(upload_queue.queued_operations.len(), 2);
            assert!(upload_queue.inprogress_task.is_some());
        }
        assert_eq!(client.latest_files(), HashSet::from([bar.clone(), baz.clone()]));
        // foo was uploaded already, so it is gone locally right away
        assert!(!harness.layer_path(&TIMELINE_ID, &foo).exists());

        // Finish them
        client.wait_completion().await?;

        assert_remote_files(
            &[&bar.file_name(), &baz.file_name(), IndexPart::FILE_NAME],
            &remote_timeline_dir,
        );

        let index_part = client.download_index_file().await?;
        assert_eq!(
            index_part.layer_metadata.keys().cloned().collect::<Vec<_>>(),
            vec![bar, baz]
        );
        Ok(())
    }

    #[tokio::test]
    async fn deletion_of_pending_upload_waits_for_the_upload() -> anyhow::Result<()> {
        let harness = TenantHarness::create("deletion_of_pending_upload_waits_for_the_upload")?;
        let client = harness.remote_client(TIMELINE_ID)?;
        client.init_upload_queue_for_empty_remote(&dummy_metadata(Lsn(0)))?;

        harness
            .resources
            .failpoints
            .configure("before-upload-layer", "2*return->off")?;

        let name = layer(0, 0x40);
        let metadata = create_layer(&harness, &name)?;
        client.schedule_layer_file_upload(&name, &metadata)?;
        client.schedule_layer_file_deletion(&[name.clone()])?;

        // The upload is still failing, so the local file must stay for its retries.
        assert!(harness.layer_path(&TIMELINE_ID, &name).exists());

        client.wait_completion().await?;

        let metrics = &harness.resources.metrics;
        assert_eq!(
            metrics.remote_operations_count(RemoteOpFileKind::Layer, RemoteOpKind::Upload, true),
            1
        );
        assert_eq!(
            metrics.remote_operations_count(RemoteOpFileKind::Layer, RemoteOpKind::Delete, true),
            1
        );
        assert_eq!(harness.resources.failpoints.hits("before-upload-layer"), 3);

        assert!(!harness.layer_path(&TIMELINE_ID, &name).exists());
        assert_remote_files(
            &[IndexPart::FILE_NAME],
            &harness.remote_timeline_dir(&TIMELINE_ID),
        );
        Ok(())
    }

    /// Checks the completion order: a layer is deleted only after its upload, and
    /// every index lists only layers that are uploaded and not deleted yet.
    fn assert_ordering(completed: &[CompletedOp]) {
        let mut remote = HashSet::new();
        let mut uploaded = HashSet::new();
        for (i, op) in completed.iter().enumerate() {
            match op {
                CompletedOp::UploadLayer(name) => {
                    remote.insert(name.clone());
                    uploaded.insert(name.clone());
                }
                CompletedOp::UploadIndex(layers) => {
                    for name in layers {
                        assert!(
                            remote.contains(name),
                            "index #{i} lists {name} which is not in the remote storage: {completed:?}"
                        );
                    }
                }
                CompletedOp::Delete(name) => {
                    assert!(
                        uploaded.contains(name),
                        "{name} deleted before its upload completed: {completed:?}"
                    );
                    remote.remove(name);
                }
            }
        }
    }

    #[rstest::rstest]
    #[case::no_failures("off", "off", "off")]
    #[case::layer_uploads_fail("3*return->off", "off", "off")]
    #[case::deletions_fail("off", "2*return->off", "off")]
    #[case::index_uploads_fail("off", "off", "3*return->off")]
    #[case::interleaved_failures("1*return->1*off->1*return->off", "1*return->off", "1*off->1*return->off")]
    #[case::everything_fails("2*return->off", "2*return->off", "2*return->off")]
    #[tokio::test]
    async fn deletions_never_overtake_uploads(
        #[case] upload_layer: &str,
        #[case] delete_layer: &str,
        #[case] upload_index: &str,
    ) -> anyhow::Result<()> {
        let harness = TenantHarness::create("deletions_never_overtake_uploads")?;
        let client = harness.remote_client(TIMELINE_ID)?;
        client.init_upload_queue_for_empty_remote(&dummy_metadata(Lsn(0)))?;

        let failpoints = &harness.resources.failpoints;
        failpoints.configure("before-upload-layer", upload_layer)?;
        failpoints.configure("before-delete-layer", delete_layer)?;
        failpoints.configure("before-upload-index", upload_index)?;

        let (a, b, c) = (layer(0, 0x20), layer(0x20, 0x40), layer(0x40, 0x60));
        for name in [&a, &b] {
            let metadata = create_layer(&harness, name)?;
            client.schedule_layer_file_upload(name, &metadata)?;
        }
        client.schedule_index_upload(&dummy_metadata(Lsn(0x40)))?;
        client.schedule_layer_file_deletion(&[a.clone()])?;
        let metadata = create_layer(&harness, &c)?;
        client.schedule_layer_file_upload(&c, &metadata)?;
        // Both deletions are scheduled while the upload of c is still pending.
        client.schedule_layer_file_deletion(&[b.clone(), c.clone()])?;
        client.schedule_index_upload(&dummy_metadata(Lsn(0x60)))?;

        client.wait_completion().await?;

        let completed = client.completed_ops.lock().clone();
        assert_ordering(&completed);
        for name in [&a, &b, &c] {
            assert!(completed.contains(&CompletedOp::UploadLayer(name.clone())));
            assert!(completed.contains(&CompletedOp::Delete(name.clone())));
            assert!(!harness.layer_path(&TIMELINE_ID, name).exists());
        }
        assert_eq!(
            completed.last(),
            Some(&CompletedOp::UploadIndex(Vec::new()))
        );
        assert_remote_files(
            &[IndexPart::FILE_NAME],
            &harness.remote_timeline_dir(&TIMELINE_ID),
        );
        assert_eq!(client.remote_consistent_lsn(), Some(Lsn(0x60)));
        Ok(())
    }

    #[tokio::test]
    async fn failing_operations_drain_once_the_fault_is_cleared() -> anyhow::Result<()> {
        let harness = TenantHarness::create("failing_operations_drain_once_the_fault_is_cleared")?;
        let client = harness.remote_client(TIMELINE_ID)?;
        client.init_upload_queue_for_empty_remote(&dummy_metadata(Lsn(0)))?;

        let failpoints = &harness.resources.failpoints;
        failpoints.configure("before-upload-layer", "return")?;
        failpoints.configure("before-upload-index", "return")?;

        let name = layer(0, 0x40);
        let metadata = create_layer(&harness, &name)?;
        client.schedule_layer_file_upload(&name, &metadata)?;
        client.schedule_index_upload(&dummy_metadata(Lsn(0x40)))?;

        wait_until(20, Duration::from_millis(100), || async {
            match failpoints.hits("before-upload-layer") {
                0 => anyhow::bail!("upload not attempted yet"),
                _ => Ok(()),
            }
        })
        .await?;
        assert_eq!(client.queue_depth(), 2);
        let gauge = harness
            .resources
            .metrics
            .upload_queue_items(&harness.tenant_id, &TIMELINE_ID);
        assert_eq!(gauge.get(), 2);

        failpoints.configure("before-upload-layer", "off")?;
        failpoints.configure("before-upload-index", "off")?;

        wait_until(10, Duration::from_secs(1), || async {
            match client.queue_depth() {
                0 => Ok(()),
                depth => anyhow::bail!("{depth} operations still pending"),
            }
        })
        .await?;
        assert_eq!(gauge.get(), 0);
        assert_eq!(client.remote_consistent_lsn(), Some(Lsn(0x40)));
        Ok(())
    }

    #[tokio::test]
    async fn broken_tenant_abandons_the_operation_in_progress() -> anyhow::Result<()> {
        let harness = TenantHarness::create("broken_tenant_abandons_the_operation_in_progress")?;
        let client = harness.remote_client(TIMELINE_ID)?;
        client.init_upload_queue_for_empty_remote(&dummy_metadata(Lsn(0)))?;

        let failpoints = &harness.resources.failpoints;
        failpoints.configure("before-upload-index", "return")?;
        client.schedule_index_upload(&dummy_metadata(Lsn(0x10)))?;
        wait_until(20, Duration::from_millis(100), || async {
            match failpoints.hits("before-upload-index") {
                0 => anyhow::bail!("index upload not attempted yet"),
                _ => Ok(()),
            }
        })
        .await?;

        // The retries would succeed from now on, but the tenant is broken first.
        harness.tenant_state.set_broken("disk on fire".to_string());
        failpoints.configure("before-upload-index", "off")?;

        wait_until(20, Duration::from_millis(100), || async {
            match client.is_stopped() {
                true => Ok(()),
                false => anyhow::bail!("upload queue is still running"),
            }
        })
        .await?;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!harness
            .remote_timeline_dir(&TIMELINE_ID)
            .join(IndexPart::FILE_NAME)
            .exists());
        assert_eq!(client.remote_consistent_lsn(), None);
        assert_eq!(
            client.schedule_index_upload(&dummy_metadata(Lsn(0x20))),
            Err(NotInitialized::Stopped)
        );
        client.wait_completion().await.unwrap_err();
        Ok(())
    }

    #[tokio::test]
    async fn persistent_failures_break_the_tenant() -> anyhow::Result<()> {
        let harness = TenantHarness::create_with_conf(
            "persistent_failures_break_the_tenant",
            |conf| conf.remote_storage_config.max_sync_errors = NonZeroU32::new(1),
        )?;
        let client = harness.remote_client(TIMELINE_ID)?;
        client.init_upload_queue_for_empty_remote(&dummy_metadata(Lsn(0)))?;
        harness
            .resources
            .failpoints
            .configure("before-upload-index", "return")?;

        client.schedule_index_upload(&dummy_metadata(Lsn(0)))?;

        let tenant_state = harness.tenant_state.clone();
        let reason = wait_until(20, Duration::from_millis(500), || async {
            match tenant_state.current() {
                TenantState::Broken { reason } => Ok(reason),
                other => anyhow::bail!("tenant is still {other}"),
            }
        })
        .await?;
        assert!(reason.contains("UploadMetadata"), "{reason}");

        assert!(client.is_stopped());
        assert_eq!(
            client.schedule_index_upload(&dummy_metadata(Lsn(0))),
            Err(NotInitialized::Stopped)
        );
        client.wait_completion().await.unwrap_err();
        Ok(())
    }
}
