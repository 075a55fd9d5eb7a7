//! This module acts as a switchboard to access different tenants managed by this
//! page server.

use std::collections::{hash_map, HashMap};
use std::sync::Arc;

use anyhow::Context;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use pageserver_api::models::{TenantState, TransitionError};
use tokio::fs;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use utils::id::TenantId;

use super::{create_tenant_files, Tenant, TenantSharedResources};
use crate::config::PageServerConf;

enum TenantsMap {
    Open(HashMap<TenantId, Arc<Tenant>>),
    /// The page server is shutting down, no tenants are accepted anymore.
    ShuttingDown,
}

#[derive(Debug, thiserror::Error)]
pub enum GetTenantError {
    #[error("tenant {0} not found")]
    NotFound(TenantId),
    #[error("tenant {0} is not active, state: {1}")]
    NotActive(TenantId, TenantState),
}

#[derive(Debug, thiserror::Error)]
pub enum TenantMapInsertError {
    #[error(transparent)]
    Conflict(#[from] TransitionError),
    #[error("page server is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TenantDetachError {
    #[error("tenant {0} not found")]
    NotFound(TenantId),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The tenants of this page server, keyed by id.
///
/// Attaches and creations hold the write lock, so two of them never race for
/// the same tenant id.
pub struct TenantManager {
    conf: &'static PageServerConf,
    resources: TenantSharedResources,
    tenants: RwLock<TenantsMap>,
    /// Every tenant gets a child token.
    cancel: CancellationToken,
}

impl TenantManager {
    pub fn new(
        conf: &'static PageServerConf,
        resources: TenantSharedResources,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conf,
            resources,
            tenants: RwLock::new(TenantsMap::Open(HashMap::new())),
            cancel,
        }
    }

    pub fn resources(&self) -> &TenantSharedResources {
        &self.resources
    }

    /// Registers the tenants found on local disk and starts loading them in the background.
    ///
    /// A tenant directory with the attach marker resumes its attach.
    #[instrument(skip_all)]
    pub async fn init_from_disk(&self) -> anyhow::Result<usize> {
        let tenants_dir = self.conf.tenants_path();
        let entries = tenants_dir
            .read_dir_utf8()
            .with_context(|| format!("Failed to list tenants dir {tenants_dir}"))?;

        let mut tenants = self.tenants.write().await;
        let TenantsMap::Open(m) = &mut *tenants else {
            anyhow::bail!("page server is shutting down");
        };

        let mut number_of_tenants = 0;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    // One unreadable entry must not keep the other tenants from loading.
                    error!("Failed to list tenants dir entry in directory {tenants_dir}, reason: {e:?}");
                    continue;
                }
            };
            let tenant_dir_path = entry.path();

            if crate::is_temporary(tenant_dir_path) {
                info!("Found temporary tenant directory, removing: {tenant_dir_path}");
                if let Err(e) = fs::remove_dir_all(tenant_dir_path).await {
                    error!("Failed to remove temporary directory '{tenant_dir_path}': {e:?}");
                }
                continue;
            }

            let tenant_id = match entry.file_name().parse::<TenantId>() {
                Ok(tenant_id) => tenant_id,
                Err(_) => {
                    warn!("skipping unexpected entry in tenants directory: {tenant_dir_path}");
                    continue;
                }
            };

            match Tenant::spawn_load(
                self.conf,
                tenant_id,
                self.resources.clone(),
                self.cancel.child_token(),
            ) {
                Ok(tenant) => {
                    m.insert(tenant_id, tenant);
                    number_of_tenants += 1;
                }
                Err(e) => error!("Failed to load tenant {tenant_id}: {e:#}"),
            }
        }

        info!("Processed {number_of_tenants} local tenants at startup");
        Ok(number_of_tenants)
    }

    /// Creates a new tenant without any timelines.
    #[instrument(skip(self))]
    pub async fn create_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<Arc<Tenant>, TenantMapInsertError> {
        self.insert_new_tenant(tenant_id, || {
            Tenant::create_empty(
                self.conf,
                tenant_id,
                self.resources.clone(),
                self.cancel.child_token(),
            )
        })
        .await
    }

    /// Starts downloading a tenant from the remote storage.
    ///
    /// Returns once the tenant is registered; it becomes Active when the
    /// background attach completes. A tenant that is already known in any state
    /// is left untouched.
    #[instrument(skip(self))]
    pub async fn attach_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<Arc<Tenant>, TenantMapInsertError> {
        self.insert_new_tenant(tenant_id, || {
            create_tenant_files(self.conf, tenant_id, true)?;
            Tenant::spawn_attach(
                self.conf,
                tenant_id,
                self.resources.clone(),
                self.cancel.child_token(),
            )
        })
        .await
    }

    async fn insert_new_tenant<F>(
        &self,
        tenant_id: TenantId,
        create: F,
    ) -> Result<Arc<Tenant>, TenantMapInsertError>
    where
        F: FnOnce() -> anyhow::Result<Arc<Tenant>>,
    {
        // Hold the write lock for the whole creation, the local IO it does is small.
        let mut tenants = self.tenants.write().await;
        let TenantsMap::Open(m) = &mut *tenants else {
            return Err(TenantMapInsertError::ShuttingDown);
        };
        match m.entry(tenant_id) {
            hash_map::Entry::Occupied(o) => Err(TenantMapInsertError::Conflict(
                TransitionError::AlreadyExists(o.get().current_state()),
            )),
            hash_map::Entry::Vacant(v) => {
                let tenant = create()?;
                v.insert(Arc::clone(&tenant));
                Ok(tenant)
            }
        }
    }

    /// Stops the tenant and removes its local files. Its remote data is kept.
    #[instrument(skip(self))]
    pub async fn detach_tenant(&self, tenant_id: TenantId) -> Result<(), TenantDetachError> {
        let removed = match &mut *self.tenants.write().await {
            TenantsMap::Open(m) => m.remove(&tenant_id),
            TenantsMap::ShuttingDown => None,
        };
        let tenant = removed.ok_or(TenantDetachError::NotFound(tenant_id))?;

        tenant.shutdown(false).await;

        let local_tenant_directory = self.conf.tenant_path(&tenant_id);
        fs::remove_dir_all(&local_tenant_directory)
            .await
            .with_context(|| {
                format!("Failed to remove local tenant directory {local_tenant_directory}")
            })?;
        info!("detached tenant {tenant_id}");
        Ok(())
    }

    /// Gets the tenant from the in-memory data, erroring if it's absent or is not fitting to the query.
    /// `active_only = true` allows to query only tenants that are ready for operations, erroring on other kinds of tenants.
    pub async fn get_tenant(
        &self,
        tenant_id: TenantId,
        active_only: bool,
    ) -> Result<Arc<Tenant>, GetTenantError> {
        let tenants = self.tenants.read().await;
        let tenant = match &*tenants {
            TenantsMap::Open(m) => m.get(&tenant_id),
            TenantsMap::ShuttingDown => None,
        }
        .ok_or(GetTenantError::NotFound(tenant_id))?;

        if active_only && !tenant.is_active() {
            Err(GetTenantError::NotActive(tenant_id, tenant.current_state()))
        } else {
            Ok(Arc::clone(tenant))
        }
    }

    /// Every known tenant, sorted by id.
    pub async fn list_tenants(&self) -> Vec<Arc<Tenant>> {
        let mut tenants = match &*self.tenants.read().await {
            TenantsMap::Open(m) => m.values().cloned().collect::<Vec<_>>(),
            TenantsMap::ShuttingDown => Vec::new(),
        };
        tenants.sort_by_key(|tenant| tenant.tenant_id());
        tenants
    }

    ///
    /// Shut down all tenants. This runs as part of pageserver shutdown.
    ///
    /// Active tenants checkpoint their timelines and give the uploads a bounded
    /// time to finish.
    pub async fn shutdown(&self) {
        let tenants_to_shut_down = {
            let mut tenants = self.tenants.write().await;
            match std::mem::replace(&mut *tenants, TenantsMap::ShuttingDown) {
                TenantsMap::Open(m) => m.into_values().collect::<Vec<_>>(),
                TenantsMap::ShuttingDown => Vec::new(),
            }
        };
        info!("shutting down {} tenants", tenants_to_shut_down.len());

        let mut shutdown_futures = tenants_to_shut_down
            .iter()
            .map(|tenant| tenant.shutdown(true))
            .collect::<FuturesUnordered<_>>();
        while shutdown_futures.next().await.is_some() {}

        self.cancel.cancel();
    }
}
