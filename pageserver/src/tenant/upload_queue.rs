use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use tracing::info;
use utils::lsn::Lsn;

use super::metadata::TimelineMetadata;
use super::remote_timeline_client::index::{IndexPart, LayerFileMetadata};
use super::storage_layer::LayerFileName;

// clippy warns that Uninitialized is much smaller than Initialized, which wastes
// memory for Uninitialized variants. Doesn't matter in practice, there are not
// that many upload queues in a running pageserver, and most of them are initialized
// anyway.
#[allow(clippy::large_enum_variant)]
pub(crate) enum UploadQueue {
    Uninitialized,
    Initialized(UploadQueueInitialized),
    Stopped(UploadQueueStopped),
}

impl UploadQueue {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadQueue::Uninitialized => "Uninitialized",
            UploadQueue::Initialized(_) => "Initialized",
            UploadQueue::Stopped(_) => "Stopped",
        }
    }
}

/// This keeps track of queued and in-progress tasks.
pub(crate) struct UploadQueueInitialized {
    /// Counter to assign task IDs
    pub(crate) task_counter: u64,

    /// All layer files stored in the remote storage, taking into account all
    /// in-progress and queued operations
    pub(crate) latest_files: HashMap<LayerFileName, LayerFileMetadata>,

    /// Metadata stored in the remote storage, taking into account all
    /// in-progress and queued operations.
    pub(crate) latest_metadata: TimelineMetadata,

    /// `disk_consistent_lsn` from the last index file that was successfully
    /// uploaded. `None` if nothing was uploaded yet.
    /// Unlike `latest_files` or `latest_metadata`, this value is never ahead.
    pub(crate) last_uploaded_consistent_lsn: Option<Lsn>,

    /// Layers whose upload is queued or in progress. The local file of such a
    /// layer must stay until the upload is done.
    pub(crate) pending_layer_uploads: HashSet<LayerFileName>,

    /// The task that is currently in progress, if any. Operations of one
    /// timeline run strictly one after another. The in-progress task can be
    /// busy talking to the remote storage, waiting for a permit of the
    /// process-wide remote ops limit, or waiting for its next retry in
    /// `exponential_backoff`.
    pub(crate) inprogress_task: Option<Arc<UploadTask>>,

    /// Queued operations that have not been launched yet.
    pub(crate) queued_operations: VecDeque<UploadOp>,
}

impl UploadQueueInitialized {
    /// Number of operations that have not completed yet, barriers excluded.
    pub(crate) fn depth(&self) -> usize {
        let queued = self
            .queued_operations
            .iter()
            .filter(|op| !matches!(op, UploadOp::Barrier(_)))
            .count();
        queued + usize::from(self.inprogress_task.is_some())
    }
}

pub(crate) struct UploadQueueStopped {
    pub(crate) last_uploaded_consistent_lsn: Option<Lsn>,
}

impl UploadQueue {
    pub(crate) fn initialize_empty_remote(
        &mut self,
        metadata: &TimelineMetadata,
    ) -> anyhow::Result<&mut UploadQueueInitialized> {
        match self {
            UploadQueue::Uninitialized => (),
            UploadQueue::Initialized(_) | UploadQueue::Stopped(_) => {
                anyhow::bail!("already initialized, state {}", self.as_str())
            }
        }

        info!("initializing upload queue for empty remote");

        let state = UploadQueueInitialized {
            // The local metadata may list layers that are not uploaded yet:
            // `latest_files` only gets them once their uploads are scheduled.
            latest_files: HashMap::new(),
            latest_metadata: metadata.clone(),
            last_uploaded_consistent_lsn: None,
            // what follows are boring default initializations
            task_counter: 0,
            pending_layer_uploads: HashSet::new(),
            inprogress_task: None,
            queued_operations: VecDeque::new(),
        };

        *self = UploadQueue::Initialized(state);
        Ok(self.initialized_mut()?)
    }

    pub(crate) fn initialize_with_current_remote_index_part(
        &mut self,
        index_part: &IndexPart,
    ) -> anyhow::Result<&mut UploadQueueInitialized> {
        match self {
            UploadQueue::Uninitialized => (),
            UploadQueue::Initialized(_) | UploadQueue::Stopped(_) => {
                anyhow::bail!("already initialized, state {}", self.as_str())
            }
        }

        let files = index_part
            .layer_metadata
            .iter()
            .map(|(layer_name, layer_metadata)| {
                (layer_name.to_owned(), LayerFileMetadata::from(layer_metadata))
            })
            .collect();

        info!(
            "initializing upload queue with remote index_part.disk_consistent_lsn: {}",
            index_part.disk_consistent_lsn
        );

        let state = UploadQueueInitialized {
            latest_files: files,
            latest_metadata: index_part.to_local_metadata(),
            last_uploaded_consistent_lsn: Some(index_part.disk_consistent_lsn),
            // what follows are boring default initializations
            task_counter: 0,
            pending_layer_uploads: HashSet::new(),
            inprogress_task: None,
            queued_operations: VecDeque::new(),
        };

        *self = UploadQueue::Initialized(state);
        Ok(self.initialized_mut()?)
    }

    pub(crate) fn initialized_mut(&mut self) -> Result<&mut UploadQueueInitialized, NotInitialized> {
        match self {
            UploadQueue::Uninitialized => Err(NotInitialized::Uninitialized),
            UploadQueue::Stopped(_) => Err(NotInitialized::Stopped),
            UploadQueue::Initialized(x) => Ok(x),
        }
    }
}

/// Returned by the scheduling functions when the queue does not accept new operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NotInitialized {
    #[error("upload queue is not initialized")]
    Uninitialized,
    #[error("upload queue is stopped")]
    Stopped,
}

/// An in-progress upload or delete task.
#[derive(Debug)]
pub(crate) struct UploadTask {
    /// Unique ID of this task, increasing in the order the operations were queued.
    pub(crate) task_id: u64,
    /// Number of failed attempts so far.
    pub(crate) retries: AtomicU32,

    pub(crate) op: UploadOp,
}

#[derive(Debug)]
pub(crate) struct Delete {
    pub(crate) layer_file_name: LayerFileName,
    /// Remove the local file after the remote one is gone. Set when the layer's
    /// upload was still pending when the deletion was scheduled.
    pub(crate) remove_local_file: bool,
}

#[derive(Debug)]
pub(crate) enum UploadOp {
    /// Upload a layer file
    UploadLayer(LayerFileName, LayerFileMetadata),

    /// Upload the index file
    UploadMetadata(IndexPart, Lsn),

    /// Delete a layer file
    Delete(Delete),

    /// Barrier. When the barrier operation is reached, the sender is notified.
    Barrier(tokio::sync::watch::Sender<()>),
}

impl std::fmt::Display for UploadOp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            UploadOp::UploadLayer(layer_file, metadata) => {
                write!(
                    f,
                    "UploadLayer({}, size={})",
                    layer_file.file_name(),
                    metadata.file_size()
                )
            }
            UploadOp::UploadMetadata(_, lsn) => write!(f, "UploadMetadata(lsn: {})", lsn),
            UploadOp::Delete(delete) => {
                write!(f, "Delete({})", delete.layer_file_name.file_name())
            }
            UploadOp::Barrier(_) => write!(f, "Barrier"),
        }
    }
}
