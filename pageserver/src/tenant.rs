//!
//! Tenant is the unit of attachment of this page server: a set of timelines
//! whose layer files live under `tenants/<tenant_id>` locally and under the
//! same prefix in the remote storage.
//!
//! A tenant enters memory in one of three ways:
//!
//! - [`Tenant::create_empty`]: a brand new tenant, Active right away.
//! - [`Tenant::spawn_load`]: found on local disk at startup. If the attach marker
//!   file is present, the interrupted attach is resumed, otherwise the local
//!   metadata is reconciled with the remote index in the background.
//! - [`Tenant::spawn_attach`]: the tenant's data is downloaded from the remote
//!   storage in the background, see [`attach`].
//!
//! The lifecycle is driven through the transition table of [`TenantState`];
//! [`TenantStateCell`] holds the current state and broadcasts every change.
//!

use std::collections::{hash_map, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8PathBuf;
use failpoints::FailpointRegistry;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use pageserver_api::models::{TenantInfo, TenantState, TenantStateEvent, TransitionError};
use parking_lot::Mutex;
use remote_storage::GenericRemoteStorage;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use utils::crashsafe::{self, path_with_suffix_extension};
use utils::fs_ext;
use utils::id::{TenantId, TimelineId};
use utils::lsn::Lsn;

use self::download_lease::DownloadLeases;
use self::metadata::{save_metadata, TimelineMetadata};
use self::remote_timeline_client::RemoteTimelineClient;
use self::timeline::Timeline;
use crate::config::PageServerConf;
use crate::metrics::PageserverMetrics;
use crate::TEMP_FILE_SUFFIX;

pub mod attach;
pub mod download_lease;
pub mod metadata;
pub mod mgr;
pub mod remote_timeline_client;
pub mod storage_layer;
pub mod timeline;
pub mod upload_queue;

/// How long a flushing shutdown waits for the upload queue of one timeline.
const SHUTDOWN_UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// The current [`TenantState`] of one tenant.
///
/// Every change goes through [`TenantState::transition`], updates the
/// `pageserver_tenant_states_count` gauge and is broadcast to subscribers.
pub struct TenantStateCell {
    tenant_id: TenantId,
    state: watch::Sender<TenantState>,
    /// Cancelled once the tenant becomes Broken. Broken is terminal, so it is never reset.
    broken: CancellationToken,
    metrics: Arc<PageserverMetrics>,
}

impl TenantStateCell {
    pub fn new(
        tenant_id: TenantId,
        event: TenantStateEvent,
        metrics: Arc<PageserverMetrics>,
    ) -> Result<Self, TransitionError> {
        let initial = TenantState::transition(None, event)?;
        metrics.tenant_state_changed(None, Some(&initial));
        let broken = CancellationToken::new();
        if initial.is_broken() {
            broken.cancel();
        }
        let (state, _) = watch::channel(initial);
        Ok(Self {
            tenant_id,
            state,
            broken,
            metrics,
        })
    }

    pub fn current(&self) -> TenantState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TenantState> {
        self.state.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.state.borrow().is_active()
    }

    pub fn is_broken(&self) -> bool {
        self.state.borrow().is_broken()
    }

    /// Completes when the tenant becomes Broken.
    pub async fn broken(&self) {
        self.broken.cancelled().await
    }

    /// Applies `event` to the current state, atomically with respect to other transitions.
    pub fn apply(&self, event: TenantStateEvent) -> Result<TenantState, TransitionError> {
        let mut outcome = None;
        self.state.send_if_modified(|current| {
            match TenantState::transition(Some(current), event) {
                Ok(new_state) => {
                    info!(
                        tenant_id = %self.tenant_id,
                        "tenant state change: {} -> {}",
                        <&'static str>::from(&*current),
                        <&'static str>::from(&new_state)
                    );
                    self.metrics
                        .tenant_state_changed(Some(current), Some(&new_state));
                    if new_state.is_broken() {
                        self.broken.cancel();
                    }
                    *current = new_state.clone();
                    outcome = Some(Ok(new_state));
                    true
                }
                Err(e) => {
                    outcome = Some(Err(e));
                    false
                }
            }
        });
        outcome.expect("send_if_modified calls the closure exactly once")
    }

    /// Moves the tenant into Broken, unless it is broken already.
    pub fn set_broken(&self, reason: String) {
        if let TenantState::Broken { reason: existing } = &*self.state.borrow() {
            warn!(tenant_id = %self.tenant_id, "tenant is already broken ({existing}), ignoring new reason: {reason}");
            return;
        }
        error!(tenant_id = %self.tenant_id, "marking tenant as broken: {reason}");
        if let Err(e) = self.apply(TenantStateEvent::Fatal { reason }) {
            warn!(tenant_id = %self.tenant_id, "failed to mark tenant as broken: {e}");
        }
    }
}

impl Drop for TenantStateCell {
    fn drop(&mut self) {
        self.metrics
            .tenant_state_changed(Some(&self.state.borrow()), None);
    }
}

/// Process-wide resources every tenant uses to talk to the remote storage.
#[derive(Clone)]
pub struct TenantSharedResources {
    pub remote_storage: GenericRemoteStorage,
    /// Bounds the number of remote operations in flight across all timelines.
    pub remote_ops_limit: Arc<Semaphore>,
    pub download_leases: Arc<DownloadLeases>,
    pub failpoints: Arc<FailpointRegistry>,
    pub metrics: Arc<PageserverMetrics>,
}

impl TenantSharedResources {
    pub fn new(
        conf: &'static PageServerConf,
        failpoints: Arc<FailpointRegistry>,
        metrics: Arc<PageserverMetrics>,
    ) -> anyhow::Result<Self> {
        let remote_storage = GenericRemoteStorage::from_config(&conf.remote_storage_config)
            .context("Failed to set up remote storage")?;
        Ok(Self {
            remote_storage,
            remote_ops_limit: Arc::new(Semaphore::new(
                conf.remote_storage_config.max_concurrent_syncs.get(),
            )),
            download_leases: Arc::new(DownloadLeases::new()),
            failpoints,
            metrics,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TenantStateError {
    #[error("tenant {0} is not active, state: {1}")]
    NotActive(TenantId, TenantState),
    #[error("tenant {0} is broken: {1}")]
    Broken(TenantId, String),
    #[error("tenant {tenant_id} did not become active within {wait_time:?}, state: {latest_state}")]
    WaitForActiveTimeout {
        tenant_id: TenantId,
        latest_state: TenantState,
        wait_time: Duration,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum GetTimelineError {
    #[error("timeline {tenant_id}/{timeline_id} was not found")]
    NotFound {
        tenant_id: TenantId,
        timeline_id: TimelineId,
    },
    #[error("timeline {tenant_id}/{timeline_id} is not active, state: {state:?}")]
    NotActive {
        tenant_id: TenantId,
        timeline_id: TimelineId,
        state: pageserver_api::models::TimelineState,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CreateTimelineError {
    #[error("timeline {0} already exists")]
    AlreadyExists(TimelineId),
    #[error(transparent)]
    NotActive(#[from] TenantStateError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

///
/// Tenant consists of multiple timelines. Keep them in a hash table.
///
pub struct Tenant {
    conf: &'static PageServerConf,
    tenant_id: TenantId,

    state: Arc<TenantStateCell>,

    timelines: Mutex<HashMap<TimelineId, Arc<Timeline>>>,

    resources: TenantSharedResources,

    /// Cancelled on shutdown and detach; every timeline gets a child token.
    cancel: CancellationToken,
}

impl Tenant {
    fn new(
        conf: &'static PageServerConf,
        tenant_id: TenantId,
        resources: TenantSharedResources,
        event: TenantStateEvent,
        cancel: CancellationToken,
    ) -> Result<Arc<Tenant>, TransitionError> {
        let state = TenantStateCell::new(tenant_id, event, Arc::clone(&resources.metrics))?;
        let tenant = Arc::new(Tenant {
            conf,
            tenant_id,
            state: Arc::new(state),
            timelines: Mutex::new(HashMap::new()),
            resources,
            cancel,
        });
        tenant.spawn_stop_on_broken();
        Ok(tenant)
    }

    /// Stops the upload queue of every timeline once the tenant becomes Broken, so
    /// that operations already queued do not run either.
    fn spawn_stop_on_broken(self: &Arc<Self>) {
        let tenant = Arc::downgrade(self);
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = state.broken() => {}
                    _ = cancel.cancelled() => return,
                }
                if let Some(tenant) = tenant.upgrade() {
                    tenant.stop_remote_clients();
                }
            }
            .instrument(info_span!(parent: None, "stop_on_broken", tenant_id = %self.tenant_id)),
        );
    }

    fn stop_remote_clients(&self) {
        let timelines = self.list_timelines();
        info!("tenant is broken, stopping the upload queues of {} timelines", timelines.len());
        for timeline in timelines {
            timeline.remote_client().stop();
        }
    }

    /// Creates the directories of a new tenant, which is Active right away.
    pub fn create_empty(
        conf: &'static PageServerConf,
        tenant_id: TenantId,
        resources: TenantSharedResources,
        cancel: CancellationToken,
    ) -> anyhow::Result<Arc<Tenant>> {
        create_tenant_files(conf, tenant_id, false)?;
        let tenant = Tenant::new(
            conf,
            tenant_id,
            resources,
            TenantStateEvent::LoadRequested,
            cancel,
        )?;
        tenant.state.apply(TenantStateEvent::Loaded {
            downloads_pending: 0,
        })?;
        info!("created tenant {tenant_id}");
        Ok(tenant)
    }

    ///
    /// Attach a tenant that's available in cloud storage.
    ///
    /// This returns quickly, after just creating the in-memory object
    /// Tenant struct and launching a background task to download
    /// the remote index files.  On return, the tenant is most likely still in
    /// Loading state, and it will become Active once the background task
    /// finishes. You can use wait_to_become_active() to wait for the download
    /// to complete.
    ///
    /// The caller creates the tenant directory with the attach marker file beforehand.
    pub fn spawn_attach(
        conf: &'static PageServerConf,
        tenant_id: TenantId,
        resources: TenantSharedResources,
        cancel: CancellationToken,
    ) -> anyhow::Result<Arc<Tenant>> {
        let tenant = Tenant::new(
            conf,
            tenant_id,
            resources,
            TenantStateEvent::AttachRequested,
            cancel,
        )?;
        tenant.spawn_init_task(
            info_span!(parent: None, "attach", tenant_id = %tenant_id),
            attach::attach,
        );
        Ok(tenant)
    }

    ///
    /// Load a tenant that's available on local disk
    ///
    /// This is used at pageserver startup, to rebuild the in-memory
    /// structures from on-disk state. A tenant with the attach marker file
    /// resumes its attach, skipping the layers that are already downloaded.
    ///
    pub fn spawn_load(
        conf: &'static PageServerConf,
        tenant_id: TenantId,
        resources: TenantSharedResources,
        cancel: CancellationToken,
    ) -> anyhow::Result<Arc<Tenant>> {
        let tenant = Tenant::new(
            conf,
            tenant_id,
            resources,
            TenantStateEvent::LoadRequested,
            cancel,
        )?;
        if conf.tenant_attaching_mark_file_path(&tenant_id).exists() {
            info!("tenant {tenant_id} has attaching mark file, resuming its attach operation");
            tenant.spawn_init_task(
                info_span!(parent: None, "attach", tenant_id = %tenant_id),
                attach::attach,
            );
        } else {
            info!("tenant {tenant_id} is assumed to be loadable, starting load operation");
            tenant.spawn_init_task(
                info_span!(parent: None, "load", tenant_id = %tenant_id),
                attach::load_local,
            );
        }
        Ok(tenant)
    }

    /// Runs the load or attach routine in the background. A failure breaks the tenant.
    fn spawn_init_task<F, Fut>(self: &Arc<Self>, span: Span, init: F)
    where
        F: FnOnce(Arc<Tenant>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let tenant = Arc::clone(self);
        tokio::spawn(
            async move {
                match init(Arc::clone(&tenant)).await {
                    Ok(()) => info!("tenant initialization finished"),
                    Err(e) if tenant.cancel.is_cancelled() => {
                        info!("tenant initialization interrupted by shutdown: {e:#}")
                    }
                    Err(e) => {
                        error!("tenant initialization failed: {e:?}");
                        tenant.set_broken(format!("{e:#}"));
                    }
                }
            }
            .instrument(span),
        );
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn current_state(&self) -> TenantState {
        self.state.current()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn subscribe_for_state_updates(&self) -> watch::Receiver<TenantState> {
        self.state.subscribe()
    }

    pub fn set_broken(&self, reason: String) {
        self.state.set_broken(reason)
    }

    /// Waits until the tenant is done loading or attaching.
    pub async fn wait_to_become_active(&self, timeout: Duration) -> Result<(), TenantStateError> {
        let mut receiver = self.state.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            receiver.wait_for(|state| !state.has_in_progress_downloads()),
        )
        .await;

        let state = match settled {
            Ok(Ok(state)) => state.clone(),
            // The sender lives in self, it cannot be dropped while we wait.
            Ok(Err(_)) => self.current_state(),
            Err(_) => {
                return Err(TenantStateError::WaitForActiveTimeout {
                    tenant_id: self.tenant_id,
                    latest_state: self.current_state(),
                    wait_time: timeout,
                })
            }
        };

        match state {
            TenantState::Active { .. } => Ok(()),
            TenantState::Broken { reason } => Err(TenantStateError::Broken(self.tenant_id, reason)),
            other => Err(TenantStateError::NotActive(self.tenant_id, other)),
        }
    }

    fn ensure_active(&self) -> Result<(), TenantStateError> {
        match self.current_state() {
            TenantState::Active { .. } => Ok(()),
            TenantState::Broken { reason } => Err(TenantStateError::Broken(self.tenant_id, reason)),
            other => Err(TenantStateError::NotActive(self.tenant_id, other)),
        }
    }

    /// Get Timeline handle for given timeline ID.
    /// This function is idempotent. It doesn't change internal state in any way.
    pub fn get_timeline(
        &self,
        timeline_id: TimelineId,
        active_only: bool,
    ) -> Result<Arc<Timeline>, GetTimelineError> {
        let timeline = self
            .timelines
            .lock()
            .get(&timeline_id)
            .cloned()
            .ok_or(GetTimelineError::NotFound {
                tenant_id: self.tenant_id,
                timeline_id,
            })?;

        if active_only && !timeline.is_active() {
            Err(GetTimelineError::NotActive {
                tenant_id: self.tenant_id,
                timeline_id,
                state: timeline.current_state(),
            })
        } else {
            Ok(timeline)
        }
    }

    /// Lists timelines the tenant contains.
    pub fn list_timelines(&self) -> Vec<Arc<Timeline>> {
        let mut timelines = self.timelines.lock().values().cloned().collect::<Vec<_>>();
        timelines.sort_by_key(|timeline| timeline.timeline_id);
        timelines
    }

    /// Creates a new timeline without any data. Its empty index is scheduled for
    /// upload, so the timeline exists in the remote storage from now on.
    pub fn create_empty_timeline(
        &self,
        new_timeline_id: TimelineId,
    ) -> Result<Arc<Timeline>, CreateTimelineError> {
        self.ensure_active()?;

        let mut timelines = self.timelines.lock();
        let vacant = match timelines.entry(new_timeline_id) {
            hash_map::Entry::Occupied(_) => {
                return Err(CreateTimelineError::AlreadyExists(new_timeline_id))
            }
            hash_map::Entry::Vacant(v) => v,
        };

        let timeline_path = self.conf.timeline_path(&self.tenant_id, &new_timeline_id);
        if timeline_path.exists() {
            return Err(CreateTimelineError::AlreadyExists(new_timeline_id));
        }
        // A crash before the metadata file is written leaves a directory that
        // loading removes as an unfinished creation.
        crashsafe::create_dir_all(&timeline_path)?;

        let metadata = TimelineMetadata::new(Lsn(0), Default::default());
        save_metadata(self.conf, &self.tenant_id, &new_timeline_id, &metadata)?;

        let remote_client = self.create_remote_client(new_timeline_id);
        remote_client.init_upload_queue_for_empty_remote(&metadata)?;
        remote_client
            .schedule_index_upload(&metadata)
            .context("schedule index upload for the new timeline")?;

        let timeline = Timeline::new(
            self.conf,
            self.tenant_id,
            new_timeline_id,
            &metadata,
            remote_client,
            Arc::clone(&self.state),
            pageserver_api::models::TimelineState::Active,
        );
        vacant.insert(Arc::clone(&timeline));
        info!("created timeline {}/{new_timeline_id}", self.tenant_id);
        Ok(timeline)
    }

    fn create_remote_client(&self, timeline_id: TimelineId) -> Arc<RemoteTimelineClient> {
        Arc::new(RemoteTimelineClient::new(
            self.conf,
            &self.resources,
            Arc::clone(&self.state),
            self.tenant_id,
            timeline_id,
            self.cancel.child_token(),
        ))
    }

    /// Sum of the sizes of every local file of the tenant.
    pub fn current_physical_size(&self) -> anyhow::Result<u64> {
        let tenant_path = self.conf.tenant_path(&self.tenant_id);
        fs_ext::dir_size(&tenant_path, &[])
            .with_context(|| format!("compute the size of {tenant_path}"))
    }

    pub fn info(&self, include_physical_size: bool) -> TenantInfo {
        let state = self.current_state();
        let current_physical_size = if include_physical_size {
            match self.current_physical_size() {
                Ok(size) => Some(size),
                Err(e) => {
                    warn!("failed to compute physical size of tenant {}: {e:#}", self.tenant_id);
                    None
                }
            }
        } else {
            None
        };
        let timelines_awaiting_download = self
            .list_timelines()
            .iter()
            .filter_map(|timeline| match timeline.layers_awaiting_download() {
                0 => None,
                remaining => Some((timeline.timeline_id, remaining)),
            })
            .collect();
        TenantInfo {
            id: self.tenant_id,
            has_in_progress_downloads: state.has_in_progress_downloads(),
            state,
            current_physical_size,
            timelines_awaiting_download,
        }
    }

    /// Stops the background activity of the tenant.
    ///
    /// With `freeze_and_flush`, an Active tenant first checkpoints every timeline and
    /// gives its upload queue a bounded time to drain. Whatever is left in the queues
    /// afterwards is dropped; it gets rescheduled when the tenant is loaded again.
    pub async fn shutdown(&self, freeze_and_flush: bool) {
        let timelines = self.list_timelines();

        if freeze_and_flush && self.is_active() {
            let mut flushes = timelines
                .iter()
                .filter(|timeline| timeline.is_active())
                .map(|timeline| async move {
                    let timeline_id = timeline.timeline_id;
                    if let Err(e) = timeline.freeze_and_flush(SHUTDOWN_UPLOAD_TIMEOUT).await {
                        warn!("failed to flush timeline {timeline_id} on shutdown: {e:#}");
                    }
                })
                .collect::<FuturesUnordered<_>>();
            while flushes.next().await.is_some() {}
        }

        if self.is_active() {
            if let Err(e) = self.state.apply(TenantStateEvent::BackgroundJobsStopped) {
                debug!("tenant state not updated on shutdown: {e}");
            }
        }

        self.cancel.cancel();
        for timeline in timelines {
            timeline.shutdown();
            self.resources
                .metrics
                .remove_upload_queue_items(&self.tenant_id, &timeline.timeline_id);
        }
    }
}

/// Creates the directory of a new tenant, with the attach marker inside if `attaching`.
///
/// The tree is prepared under a temporary name and renamed into place, so the
/// tenant directory either does not exist or is complete. Temporary leftovers are
/// removed on startup.
pub(crate) fn create_tenant_files(
    conf: &'static PageServerConf,
    tenant_id: TenantId,
    attaching: bool,
) -> anyhow::Result<Utf8PathBuf> {
    let target_tenant_directory = conf.tenant_path(&tenant_id);
    anyhow::ensure!(
        !target_tenant_directory.exists(),
        "cannot create new tenant repo: '{tenant_id}' directory already exists",
    );

    let temporary_tenant_dir = path_with_suffix_extension(&target_tenant_directory, TEMP_FILE_SUFFIX);
    debug!("Creating temporary directory structure in {temporary_tenant_dir}");
    if temporary_tenant_dir.exists() {
        std::fs::remove_dir_all(&temporary_tenant_dir).with_context(|| {
            format!("remove stale temporary tenant directory {temporary_tenant_dir}")
        })?;
    }

    crashsafe::create_dir_all(conf.tenants_path())?;
    crashsafe::create_dir(&temporary_tenant_dir)?;
    crashsafe::create_dir(
        temporary_tenant_dir.join(crate::config::TIMELINES_SEGMENT_NAME),
    )?;

    if attaching {
        let marker = temporary_tenant_dir.join(crate::TENANT_ATTACHING_MARKER_FILENAME);
        std::fs::File::create(&marker)
            .with_context(|| format!("create attach marker file {marker}"))?;
        crashsafe::fsync_file_and_parent(&marker)?;
    }

    std::fs::rename(&temporary_tenant_dir, &target_tenant_directory).with_context(|| {
        format!("move tenant {tenant_id} temporary directory {temporary_tenant_dir} into the permanent one {target_tenant_directory}")
    })?;
    crashsafe::fsync(&conf.tenants_path())?;

    Ok(target_tenant_directory)
}

#[cfg(test)]
pub mod harness {
    use camino_tempfile::Utf8TempDir;
    use once_cell::sync::OnceCell;
    use utils::logging::{self, LogFormat, Output};

    use super::remote_timeline_client::remote_timeline_path;
    use super::storage_layer::LayerFileName;
    use super::*;

    pub const TIMELINE_ID: TimelineId = TimelineId::from_array([
        0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
        0x88,
    ]);
    pub const NEW_TIMELINE_ID: TimelineId = TimelineId::from_array([
        0xAA, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
        0x88,
    ]);

    static LOG_HANDLE: OnceCell<()> = OnceCell::new();

    pub(crate) fn setup_logging() {
        LOG_HANDLE.get_or_init(|| {
            logging::init(LogFormat::Test, Output::Stdout).expect("Failed to init test logging");
        });
    }

    /// A scratch workdir with a local-filesystem remote storage, and the shared
    /// resources of a single test tenant.
    pub struct TenantHarness {
        pub conf: &'static PageServerConf,
        pub tenant_id: TenantId,
        pub resources: TenantSharedResources,
        /// An Active tenant state, for clients created outside of a [`Tenant`].
        pub tenant_state: Arc<TenantStateCell>,
        pub remote_fs_dir: Utf8PathBuf,
        _workdir: Utf8TempDir,
    }

    impl TenantHarness {
        pub fn create(test_name: &'static str) -> anyhow::Result<Self> {
            Self::create_with_conf(test_name, |_| {})
        }

        pub fn create_with_conf(
            test_name: &'static str,
            customize: impl FnOnce(&mut PageServerConf),
        ) -> anyhow::Result<Self> {
            setup_logging();

            let workdir = camino_tempfile::Builder::new()
                .prefix(test_name)
                .tempdir()?;
            let repo_dir = workdir.path().join("repo");
            let remote_fs_dir = workdir.path().join("localfs");
            std::fs::create_dir_all(&repo_dir)?;
            std::fs::create_dir_all(&remote_fs_dir)?;

            let mut conf = PageServerConf::dummy_conf(repo_dir, remote_fs_dir.clone());
            customize(&mut conf);
            // Make a static copy of the config. This can never be free'd, but that's
            // OK in a test.
            let conf: &'static PageServerConf = Box::leak(Box::new(conf));
            std::fs::create_dir_all(conf.tenants_path())?;

            let resources = TenantSharedResources::new(
                conf,
                Arc::new(FailpointRegistry::new()),
                Arc::new(PageserverMetrics::new()?),
            )?;

            let tenant_id = TenantId::generate();
            let tenant_state = Arc::new(TenantStateCell::new(
                tenant_id,
                TenantStateEvent::LoadRequested,
                Arc::clone(&resources.metrics),
            )?);
            tenant_state.apply(TenantStateEvent::Loaded {
                downloads_pending: 0,
            })?;

            Ok(Self {
                conf,
                tenant_id,
                resources,
                tenant_state,
                remote_fs_dir,
                _workdir: workdir,
            })
        }

        /// A standalone client for the harness tenant; its timeline directory is created.
        pub fn remote_client(
            &self,
            timeline_id: TimelineId,
        ) -> anyhow::Result<Arc<RemoteTimelineClient>> {
            std::fs::create_dir_all(self.conf.timeline_path(&self.tenant_id, &timeline_id))?;
            Ok(Arc::new(RemoteTimelineClient::new(
                self.conf,
                &self.resources,
                Arc::clone(&self.tenant_state),
                self.tenant_id,
                timeline_id,
                CancellationToken::new(),
            )))
        }

        /// Creates the harness tenant as a new, empty, Active tenant.
        pub fn create_tenant(&self) -> anyhow::Result<Arc<Tenant>> {
            Tenant::create_empty(
                self.conf,
                self.tenant_id,
                self.resources.clone(),
                CancellationToken::new(),
            )
        }

        pub fn remote_timeline_dir(&self, timeline_id: &TimelineId) -> Utf8PathBuf {
            remote_timeline_path(&self.tenant_id, timeline_id).with_base(&self.remote_fs_dir)
        }

        pub fn timeline_path(&self, timeline_id: &TimelineId) -> Utf8PathBuf {
            self.conf.timeline_path(&self.tenant_id, timeline_id)
        }

        pub fn layer_path(&self, timeline_id: &TimelineId, name: &LayerFileName) -> Utf8PathBuf {
            self.conf.layer_path(&self.tenant_id, timeline_id, name)
        }
    }
}

#[cfg(test)]
mod tests {
    use pageserver_api::models::AttachProgress;
    use utils::wait::wait_until;

    use super::harness::{TenantHarness, NEW_TIMELINE_ID, TIMELINE_ID};
    use super::*;

    #[test]
    fn state_cell_tracks_tenant_gauges() -> anyhow::Result<()> {
        let metrics = Arc::new(PageserverMetrics::new()?);
        let tenant_id = TenantId::generate();
        let cell = TenantStateCell::new(
            tenant_id,
            TenantStateEvent::AttachRequested,
            Arc::clone(&metrics),
        )?;
        assert_eq!(metrics.tenants_in_state(&TenantState::Loading), 1);

        let mut updates = cell.subscribe();
        let attaching = cell.apply(TenantStateEvent::Loaded {
            downloads_pending: 2,
        })?;
        assert!(updates.has_changed()?);
        assert_eq!(*updates.borrow_and_update(), attaching);
        assert_eq!(metrics.tenants_in_state(&TenantState::Loading), 0);
        assert_eq!(metrics.tenants_in_state(&attaching), 1);

        // A rejected event leaves the state, and the subscribers, alone.
        let err = cell.apply(TenantStateEvent::BackgroundJobsStopped).unwrap_err();
        assert!(matches!(err, TransitionError::IllegalTransition { .. }));
        assert!(!updates.has_changed()?);

        cell.set_broken("disk on fire".to_string());
        cell.set_broken("second reason".to_string());
        assert_eq!(
            cell.current(),
            TenantState::Broken {
                reason: "disk on fire".to_string()
            }
        );

        let broken = cell.current();
        drop(cell);
        assert_eq!(metrics.tenants_in_state(&broken), 0);
        assert_eq!(
            metrics.tenants_in_state(&TenantState::Attaching {
                progress: AttachProgress::default()
            }),
            0
        );
        Ok(())
    }

    #[tokio::test]
    async fn create_tenant_and_timelines() -> anyhow::Result<()> {
        let harness = TenantHarness::create("create_tenant_and_timelines")?;
        let tenant = harness.create_tenant()?;
        assert!(tenant.is_active());
        tenant
            .wait_to_become_active(Duration::from_secs(1))
            .await?;

        let timeline = tenant.create_empty_timeline(TIMELINE_ID)?;
        assert!(matches!(
            tenant.create_empty_timeline(TIMELINE_ID),
            Err(CreateTimelineError::AlreadyExists(id)) if id == TIMELINE_ID
        ));
        tenant.create_empty_timeline(NEW_TIMELINE_ID)?;

        let ids = tenant
            .list_timelines()
            .iter()
            .map(|timeline| timeline.timeline_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![TIMELINE_ID, NEW_TIMELINE_ID]);
        assert!(matches!(
            tenant.get_timeline(TimelineId::generate(), false),
            Err(GetTimelineError::NotFound { .. })
        ));

        // The empty index reaches the remote storage.
        timeline.remote_client().wait_completion().await?;
        assert!(harness
            .remote_timeline_dir(&TIMELINE_ID)
            .join(remote_timeline_client::index::IndexPart::FILE_NAME)
            .exists());
        assert!(tenant.current_physical_size()? > 0);
        Ok(())
    }

    #[tokio::test]
    async fn broken_tenant_rejects_new_timelines() -> anyhow::Result<()> {
        let harness = TenantHarness::create("broken_tenant_rejects_new_timelines")?;
        let tenant = harness.create_tenant()?;
        tenant.set_broken("test".to_string());

        assert!(matches!(
            tenant.create_empty_timeline(TIMELINE_ID),
            Err(CreateTimelineError::NotActive(TenantStateError::Broken(_, _)))
        ));
        assert!(matches!(
            tenant.wait_to_become_active(Duration::from_millis(10)).await,
            Err(TenantStateError::Broken(_, reason)) if reason == "test"
        ));
        Ok(())
    }

    #[tokio::test]
    async fn broken_tenant_stops_every_upload_queue() -> anyhow::Result<()> {
        let harness = TenantHarness::create("broken_tenant_stops_every_upload_queue")?;
        let tenant = harness.create_tenant()?;
        let first = tenant.create_empty_timeline(TIMELINE_ID)?;
        let second = tenant.create_empty_timeline(NEW_TIMELINE_ID)?;
        first.remote_client().wait_completion().await?;
        second.remote_client().wait_completion().await?;

        tenant.set_broken("test".to_string());

        wait_until(20, Duration::from_millis(100), || async {
            let stopped = [&first, &second]
                .iter()
                .filter(|timeline| timeline.remote_client().is_stopped())
                .count();
            match stopped {
                2 => Ok(()),
                n => anyhow::bail!("{n} of 2 upload queues stopped"),
            }
        })
        .await?;
        Ok(())
    }

    #[tokio::test]
    async fn tenant_directory_is_created_atomically() -> anyhow::Result<()> {
        let harness = TenantHarness::create("tenant_directory_is_created_atomically")?;
        let tenant_id = TenantId::generate();

        let path = create_tenant_files(harness.conf, tenant_id, true)?;
        assert!(harness.conf.timelines_path(&tenant_id).is_dir());
        assert!(harness.conf.tenant_attaching_mark_file_path(&tenant_id).exists());
        assert!(!path_with_suffix_extension(&path, TEMP_FILE_SUFFIX).exists());

        create_tenant_files(harness.conf, tenant_id, false).unwrap_err();
        Ok(())
    }
}
