//! Prometheus metrics of the page server.
//!
//! All series live in a [`Registry`] owned by [`PageserverMetrics`], which the
//! server context hands out as an `Arc`. The `/metrics` endpoint renders that
//! registry.

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Context;
use metrics::{
    exponential_buckets, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_uint_gauge_vec, HistogramVec, IntCounter, IntCounterVec, Registry, UIntGauge,
    UIntGaugeVec,
};
use pageserver_api::models::TenantState;
use strum::VariantNames;
use utils::id::{TenantId, TimelineId};

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum RemoteOpKind {
    Upload,
    Download,
    Delete,
}
impl RemoteOpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum RemoteOpFileKind {
    Layer,
    Index,
}
impl RemoteOpFileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Layer => "layer",
            Self::Index => "index",
        }
    }
}

pub struct PageserverMetrics {
    registry: Registry,
    remote_upload_queue_items: UIntGaugeVec,
    remote_operations: IntCounterVec,
    remote_operation_time: HistogramVec,
    remote_download_layers: IntCounter,
    tenant_states: UIntGaugeVec,
}

impl PageserverMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let remote_upload_queue_items = register_uint_gauge_vec(
            &registry,
            "pageserver_remote_upload_queue_items",
            "Number of queued and in-progress remote operations of a timeline",
            &["tenant_id", "timeline_id"],
        )
        .context("failed to define pageserver_remote_upload_queue_items")?;

        let remote_operations = register_int_counter_vec(
            &registry,
            "pageserver_remote_operations_total",
            "Number of remote storage operation attempts, by outcome",
            &["file_kind", "op_kind", "status"],
        )
        .context("failed to define pageserver_remote_operations_total")?;

        let remote_operation_time = register_histogram_vec(
            &registry,
            "pageserver_remote_operation_seconds",
            "Time spent on remote storage operations. \
            Grouped by file kind, operation kind and status. \
            Does not account for time spent waiting in the upload queue.",
            &["file_kind", "op_kind", "status"],
            exponential_buckets(0.001, 4.0, 10)?,
        )
        .context("failed to define pageserver_remote_operation_seconds")?;

        let remote_download_layers = register_int_counter(
            &registry,
            "pageserver_remote_download_layers_total",
            "Number of layer files materialized from the remote storage",
        )
        .context("failed to define pageserver_remote_download_layers_total")?;

        let tenant_states = register_uint_gauge_vec(
            &registry,
            "pageserver_tenant_states_count",
            "Count of tenants per state",
            &["state"],
        )
        .context("failed to define pageserver_tenant_states_count")?;
        // Export every state, including the ones no tenant is in yet.
        for state in TenantState::VARIANTS {
            tenant_states.with_label_values(&[*state]).set(0);
        }

        Ok(Self {
            registry,
            remote_upload_queue_items,
            remote_operations,
            remote_operation_time,
            remote_download_layers,
            tenant_states,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn upload_queue_items(&self, tenant_id: &TenantId, timeline_id: &TimelineId) -> UIntGauge {
        self.remote_upload_queue_items
            .with_label_values(&[&tenant_id.to_string(), &timeline_id.to_string()])
    }

    pub fn remove_upload_queue_items(&self, tenant_id: &TenantId, timeline_id: &TimelineId) {
        let _ = self
            .remote_upload_queue_items
            .remove_label_values(&[&tenant_id.to_string(), &timeline_id.to_string()]);
    }

    pub fn observe_remote_op(
        &self,
        file_kind: RemoteOpFileKind,
        op_kind: RemoteOpKind,
        success: bool,
        elapsed: Duration,
    ) {
        let status = if success { "success" } else { "failure" };
        let labels = [file_kind.as_str(), op_kind.as_str(), status];
        self.remote_operations.with_label_values(&labels).inc();
        self.remote_operation_time
            .with_label_values(&labels)
            .observe(elapsed.as_secs_f64());
    }

    /// Runs a remote operation, recording its outcome and duration.
    pub async fn measure_remote_op<F, O, E>(
        &self,
        file_kind: RemoteOpFileKind,
        op_kind: RemoteOpKind,
        op: F,
    ) -> Result<O, E>
    where
        F: Future<Output = Result<O, E>>,
    {
        let start = Instant::now();
        let res = op.await;
        self.observe_remote_op(file_kind, op_kind, res.is_ok(), start.elapsed());
        res
    }

    pub fn remote_operations_count(
        &self,
        file_kind: RemoteOpFileKind,
        op_kind: RemoteOpKind,
        success: bool,
    ) -> u64 {
        let status = if success { "success" } else { "failure" };
        self.remote_operations
            .with_label_values(&[file_kind.as_str(), op_kind.as_str(), status])
            .get()
    }

    pub fn layer_downloaded(&self) {
        self.remote_download_layers.inc();
    }

    pub fn downloaded_layers(&self) -> u64 {
        self.remote_download_layers.get()
    }

    /// Moves a tenant between the per-state gauges. `None` stands for a tenant
    /// that is not (or no longer) registered.
    pub fn tenant_state_changed(&self, old: Option<&TenantState>, new: Option<&TenantState>) {
        if let Some(old) = old {
            self.tenant_states
                .with_label_values(&[<&'static str>::from(old)])
                .dec();
        }
        if let Some(new) = new {
            self.tenant_states
                .with_label_values(&[<&'static str>::from(new)])
                .inc();
        }
    }

    pub fn tenants_in_state(&self, state: &TenantState) -> u64 {
        self.tenant_states
            .with_label_values(&[<&'static str>::from(state)])
            .get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_queue_gauge_is_per_timeline() -> anyhow::Result<()> {
        let metrics = PageserverMetrics::new()?;
        let tenant_id = TenantId::generate();
        let (timeline_a, timeline_b) = (TimelineId::generate(), TimelineId::generate());

        metrics.upload_queue_items(&tenant_id, &timeline_a).set(3);
        metrics.upload_queue_items(&tenant_id, &timeline_b).set(1);
        assert_eq!(metrics.upload_queue_items(&tenant_id, &timeline_a).get(), 3);

        let text = metrics::encode_text(metrics.registry())?;
        assert!(text.contains(&format!(
            "pageserver_remote_upload_queue_items{{tenant_id=\"{tenant_id}\",timeline_id=\"{timeline_a}\"}} 3"
        )));

        metrics.remove_upload_queue_items(&tenant_id, &timeline_a);
        let text = metrics::encode_text(metrics.registry())?;
        assert!(!text.contains(&timeline_a.to_string()));
        assert!(text.contains(&timeline_b.to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn remote_ops_are_counted_by_outcome() -> anyhow::Result<()> {
        let metrics = PageserverMetrics::new()?;

        let ok: Result<(), &str> = metrics
            .measure_remote_op(RemoteOpFileKind::Layer, RemoteOpKind::Upload, async { Ok(()) })
            .await;
        ok.unwrap();
        let failed: Result<(), &str> = metrics
            .measure_remote_op(RemoteOpFileKind::Layer, RemoteOpKind::Upload, async {
                Err("injected")
            })
            .await;
        failed.unwrap_err();

        assert_eq!(
            metrics.remote_operations_count(RemoteOpFileKind::Layer, RemoteOpKind::Upload, true),
            1
        );
        assert_eq!(
            metrics.remote_operations_count(RemoteOpFileKind::Layer, RemoteOpKind::Upload, false),
            1
        );
        Ok(())
    }

    #[test]
    fn tenant_state_gauges() -> anyhow::Result<()> {
        let metrics = PageserverMetrics::new()?;
        let active = TenantState::Active {
            background_jobs_running: true,
        };

        metrics.tenant_state_changed(None, Some(&TenantState::Loading));
        metrics.tenant_state_changed(Some(&TenantState::Loading), Some(&active));
        assert_eq!(metrics.tenants_in_state(&TenantState::Loading), 0);
        assert_eq!(metrics.tenants_in_state(&active), 1);

        metrics.tenant_state_changed(Some(&active), None);
        assert_eq!(metrics.tenants_in_state(&active), 0);

        let text = metrics::encode_text(metrics.registry())?;
        assert!(text.contains("pageserver_tenant_states_count{state=\"Broken\"} 0"));
        Ok(())
    }
}
