//! Everything the page server shares between its components, built once at
//! startup and passed around as an `Arc`.
//!
//! There are no process-wide singletons: tests build as many contexts as they
//! need, each with its own metrics registry and fault points.

use std::sync::Arc;

use failpoints::FailpointRegistry;
use tokio_util::sync::CancellationToken;

use crate::config::PageServerConf;
use crate::metrics::PageserverMetrics;
use crate::tenant::mgr::TenantManager;
use crate::tenant::TenantSharedResources;

pub struct ServerContext {
    pub conf: &'static PageServerConf,
    pub failpoints: Arc<FailpointRegistry>,
    pub metrics: Arc<PageserverMetrics>,
    pub tenant_manager: TenantManager,
    /// Cancelled once every tenant is shut down.
    pub cancel: CancellationToken,
}

impl ServerContext {
    pub fn new(
        conf: &'static PageServerConf,
        failpoints: FailpointRegistry,
    ) -> anyhow::Result<Arc<Self>> {
        let failpoints = Arc::new(failpoints);
        let metrics = Arc::new(PageserverMetrics::new()?);
        let resources =
            TenantSharedResources::new(conf, Arc::clone(&failpoints), Arc::clone(&metrics))?;
        let cancel = CancellationToken::new();

        Ok(Arc::new(Self {
            conf,
            failpoints,
            metrics,
            tenant_manager: TenantManager::new(conf, resources, cancel.child_token()),
            cancel,
        }))
    }

    /// Shuts every tenant down, flushing the active ones first.
    pub async fn shutdown(&self) {
        self.tenant_manager.shutdown().await;
        self.cancel.cancel();
    }
}
