use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use utils::{
    id::{NodeId, TenantId, TimelineId},
    lsn::Lsn,
};

/// The state of a tenant in this pageserver.
///
/// ```mermaid
/// stateDiagram-v2
///
///     [*] --> Loading: attach requested / local data found
///
///     Loading --> Attaching: index downloaded, layers pending
///     Loading --> Active: nothing to download
///     Attaching --> Attaching: layer downloaded
///     Attaching --> Active: all layers downloaded
///     Active --> Active: background jobs stopped
///
///     Loading --> Broken: fatal error
///     Attaching --> Broken: fatal error
///     Active --> Broken: fatal error
/// ```
///
/// Serialized in serde's externally tagged form, e.g. `"Loading"` or
/// `{"Active":{"background_jobs_running":true}}`.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumVariantNames,
    strum_macros::AsRefStr,
    strum_macros::IntoStaticStr,
)]
pub enum TenantState {
    /// The tenant is registered, its local files or remote index are being read.
    Loading,
    /// Layers referenced by the remote index are being downloaded.
    Attaching { progress: AttachProgress },
    /// The tenant is open for business: its data is readable and its uploads flow.
    Active { background_jobs_running: bool },
    /// The tenant can no longer be used for any operations.
    ///
    /// Not persisted: a restart re-runs the load or attach path.
    Broken { reason: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachProgress {
    pub layers_total: usize,
    pub layers_downloaded: usize,
}

/// Inputs of the tenant state machine, see [`TenantState::transition`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TenantStateEvent {
    AttachRequested,
    /// The tenant was found on local disk during startup.
    LoadRequested,
    /// Remote indices (or local metadata) are read; that many layers still need downloading.
    Loaded { downloads_pending: usize },
    DownloadProgress { layers_downloaded: usize },
    DownloadsComplete,
    BackgroundJobsStopped,
    Fatal { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("tenant already exists, current state: {0}")]
    AlreadyExists(TenantState),
    #[error("illegal tenant state transition from {from} on {event:?}")]
    IllegalTransition {
        from: &'static str,
        event: TenantStateEvent,
    },
}

impl TenantState {
    /// The complete transition table of the tenant lifecycle.
    ///
    /// `current` is `None` for a tenant the pageserver does not know about yet.
    pub fn transition(
        current: Option<&TenantState>,
        event: TenantStateEvent,
    ) -> Result<TenantState, TransitionError> {
        use TenantStateEvent as E;

        let illegal = |event| TransitionError::IllegalTransition {
            from: current.map(|s| s.into()).unwrap_or("absent"),
            event,
        };

        match (current, event) {
            (None, E::AttachRequested | E::LoadRequested) => Ok(TenantState::Loading),
            (Some(state), E::AttachRequested) => {
                Err(TransitionError::AlreadyExists(state.clone()))
            }
            (Some(TenantState::Loading), E::Loaded { downloads_pending }) => {
                if downloads_pending == 0 {
                    Ok(TenantState::Active {
                        background_jobs_running: true,
                    })
                } else {
                    Ok(TenantState::Attaching {
                        progress: AttachProgress {
                            layers_total: downloads_pending,
                            layers_downloaded: 0,
                        },
                    })
                }
            }
            (
                Some(TenantState::Attaching { progress }),
                E::DownloadProgress { layers_downloaded },
            ) if layers_downloaded <= progress.layers_total => Ok(TenantState::Attaching {
                progress: AttachProgress {
                    layers_total: progress.layers_total,
                    layers_downloaded,
                },
            }),
            (Some(TenantState::Attaching { .. }), E::DownloadsComplete) => {
                Ok(TenantState::Active {
                    background_jobs_running: true,
                })
            }
            (Some(TenantState::Active { .. }), E::BackgroundJobsStopped) => {
                Ok(TenantState::Active {
                    background_jobs_running: false,
                })
            }
            (Some(_), E::Fatal { reason }) => Ok(TenantState::Broken { reason }),
            (_, event) => Err(illegal(event)),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, TenantState::Active { .. })
    }

    pub fn is_broken(&self) -> bool {
        matches!(self, TenantState::Broken { .. })
    }

    pub fn has_in_progress_downloads(&self) -> bool {
        matches!(self, TenantState::Loading | TenantState::Attaching { .. })
    }
}

/// A state of a timeline in pageserver's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimelineState {
    /// The timeline is recognized by the pageserver but its layers are still being downloaded.
    Loading,
    /// The timeline is fully operational.
    Active,
    /// The timeline was detached or the pageserver is shutting down.
    Stopping,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StatusResponse {
    pub id: NodeId,
}

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct TenantCreateRequest {
    #[serde(default)]
    pub new_tenant_id: Option<TenantId>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(transparent)]
pub struct TenantCreateResponse(pub TenantId);

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct TimelineCreateRequest {
    /// Generated when not given.
    #[serde(default)]
    pub new_timeline_id: Option<TimelineId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TenantInfo {
    pub id: TenantId,
    pub state: TenantState,
    pub has_in_progress_downloads: bool,
    /// Sum of the size of all local files of the tenant.
    /// Only included in `tenant_status` endpoint.
    pub current_physical_size: Option<u64>,
    /// Layers each timeline still waits for, for the timelines of an attach in progress.
    #[serde(default)]
    pub timelines_awaiting_download: BTreeMap<TimelineId, usize>,
}

/// This represents the output of the "timeline_detail" and "timeline_list" API calls.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TimelineInfo {
    pub tenant_id: TenantId,
    pub timeline_id: TimelineId,
    pub state: TimelineState,

    pub last_record_lsn: Lsn,
    pub disk_consistent_lsn: Lsn,
    /// The LSN that we have successfully uploaded to remote storage.
    /// None until the first index upload completes.
    pub remote_consistent_lsn: Option<Lsn>,

    pub awaits_download: bool,
    /// Layers of the timeline that are not downloaded yet.
    pub layers_awaiting_download: usize,
    pub upload_queue_depth: usize,
    pub current_physical_size: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IngestRequest {
    pub records: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IngestResponse {
    pub last_record_lsn: Lsn,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RecordsResponse {
    pub records: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct TimelineGcRequest {
    pub gc_horizon: Option<u64>,
}

/// Result of performing GC
#[serde_as]
#[derive(Default, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GcResult {
    pub layers_total: u64,
    /// Layers whose deletion was enqueued, locally removed and scheduled for remote deletion.
    pub layers_removed: u64,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub elapsed: Duration,
}

impl std::ops::AddAssign for GcResult {
    fn add_assign(&mut self, other: Self) {
        self.layers_total += other.layers_total;
        self.layers_removed += other.layers_removed;
        self.elapsed += other.elapsed;
    }
}
