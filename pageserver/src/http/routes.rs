//!
//! Management HTTP API
//!
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use failpoints::FailpointConfig;
use hyper::{Body, Request, Response, StatusCode};
use pageserver_api::models::{
    IngestRequest, IngestResponse, RecordsResponse, StatusResponse, TenantCreateRequest,
    TenantCreateResponse, TimelineCreateRequest, TimelineGcRequest,
};
use tracing::{info, info_span, Instrument};
use utils::http::endpoint::{self, prometheus_metrics_response, request_span};
use utils::http::error::ApiError;
use utils::http::json::{json_request, json_request_or_empty_body, json_response};
use utils::http::request::{parse_query_param, parse_request_param};
use utils::http::{RequestExt, RouterBuilder};
use utils::id::{TenantId, TimelineId};

use crate::context::ServerContext;
use crate::tenant::mgr::{GetTenantError, TenantDetachError, TenantMapInsertError};
use crate::tenant::timeline::Timeline;
use crate::tenant::{CreateTimelineError, GetTimelineError, Tenant};

impl From<GetTenantError> for ApiError {
    fn from(e: GetTenantError) -> ApiError {
        match e {
            GetTenantError::NotFound(_) => ApiError::NotFound(e.into()),
            GetTenantError::NotActive(..) => ApiError::ResourceUnavailable(e.to_string().into()),
        }
    }
}

impl From<GetTimelineError> for ApiError {
    fn from(e: GetTimelineError) -> ApiError {
        match e {
            GetTimelineError::NotFound { .. } => ApiError::NotFound(e.into()),
            GetTimelineError::NotActive { .. } => {
                ApiError::ResourceUnavailable(e.to_string().into())
            }
        }
    }
}

impl From<TenantMapInsertError> for ApiError {
    fn from(e: TenantMapInsertError) -> ApiError {
        match e {
            TenantMapInsertError::Conflict(e) => ApiError::Conflict(e.to_string()),
            TenantMapInsertError::ShuttingDown => ApiError::ShuttingDown,
            TenantMapInsertError::Other(e) => ApiError::InternalServerError(e),
        }
    }
}

impl From<TenantDetachError> for ApiError {
    fn from(e: TenantDetachError) -> ApiError {
        match e {
            TenantDetachError::NotFound(_) => ApiError::NotFound(e.into()),
            TenantDetachError::Other(e) => ApiError::InternalServerError(e),
        }
    }
}

impl From<CreateTimelineError> for ApiError {
    fn from(e: CreateTimelineError) -> ApiError {
        match e {
            CreateTimelineError::AlreadyExists(_) => ApiError::Conflict(e.to_string()),
            CreateTimelineError::NotActive(e) => ApiError::ResourceUnavailable(e.to_string().into()),
            CreateTimelineError::Other(e) => ApiError::InternalServerError(e),
        }
    }
}

fn get_state(request: &Request<Body>) -> &ServerContext {
    request
        .data::<Arc<ServerContext>>()
        .expect("unknown state type")
        .as_ref()
}

async fn active_tenant(request: &Request<Body>) -> Result<Arc<Tenant>, ApiError> {
    let tenant_id: TenantId = parse_request_param(request, "tenant_id")?;
    Ok(get_state(request)
        .tenant_manager
        .get_tenant(tenant_id, true)
        .await?)
}

async fn active_timeline(request: &Request<Body>) -> Result<Arc<Timeline>, ApiError> {
    let timeline_id: TimelineId = parse_request_param(request, "timeline_id")?;
    let tenant = active_tenant(request).await?;
    Ok(tenant.get_timeline(timeline_id, true)?)
}

// healthcheck handler
async fn status_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let conf = get_state(&request).conf;
    json_response(StatusCode::OK, StatusResponse { id: conf.id })
}

async fn prometheus_metrics_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    prometheus_metrics_response(get_state(&request).metrics.registry())
}

async fn tenant_list_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let include_physical_size: bool =
        parse_query_param(&request, "include-physical-size")?.unwrap_or(false);
    let tenants = get_state(&request).tenant_manager.list_tenants().await;
    let response_data = tenants
        .iter()
        .map(|tenant| tenant.info(include_physical_size))
        .collect::<Vec<_>>();
    json_response(StatusCode::OK, response_data)
}

async fn tenant_create_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let request_data: TenantCreateRequest =
        json_request_or_empty_body(&mut request).await?.unwrap_or_default();
    let tenant_id = request_data
        .new_tenant_id
        .unwrap_or_else(TenantId::generate);

    let tenant = get_state(&request)
        .tenant_manager
        .create_tenant(tenant_id)
        .instrument(info_span!("tenant_create", %tenant_id))
        .await?;
    json_response(
        StatusCode::CREATED,
        TenantCreateResponse(tenant.tenant_id()),
    )
}

async fn tenant_status_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let tenant_id: TenantId = parse_request_param(&request, "tenant_id")?;
    let tenant = get_state(&request)
        .tenant_manager
        .get_tenant(tenant_id, false)
        .await?;
    json_response(StatusCode::OK, tenant.info(true))
}

async fn tenant_attach_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let tenant_id: TenantId = parse_request_param(&request, "tenant_id")?;
    info!("Handling tenant attach {tenant_id}");

    get_state(&request)
        .tenant_manager
        .attach_tenant(tenant_id)
        .instrument(info_span!("tenant_attach", %tenant_id))
        .await?;
    json_response(StatusCode::ACCEPTED, ())
}

async fn tenant_detach_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let tenant_id: TenantId = parse_request_param(&request, "tenant_id")?;
    get_state(&request)
        .tenant_manager
        .detach_tenant(tenant_id)
        .instrument(info_span!("tenant_detach", %tenant_id))
        .await?;
    json_response(StatusCode::OK, ())
}

async fn timeline_create_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let request_data: TimelineCreateRequest =
        json_request_or_empty_body(&mut request).await?.unwrap_or_default();
    let tenant = active_tenant(&request).await?;
    let new_timeline_id = request_data
        .new_timeline_id
        .unwrap_or_else(TimelineId::generate);

    let timeline = info_span!("timeline_create", tenant_id = %tenant.tenant_id(), timeline_id = %new_timeline_id)
        .in_scope(|| tenant.create_empty_timeline(new_timeline_id))?;
    json_response(StatusCode::CREATED, timeline.info(false))
}

async fn timeline_list_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let tenant_id: TenantId = parse_request_param(&request, "tenant_id")?;
    let include_physical_size: bool =
        parse_query_param(&request, "include-physical-size")?.unwrap_or(false);
    let tenant = get_state(&request)
        .tenant_manager
        .get_tenant(tenant_id, false)
        .await?;
    let response_data = tenant
        .list_timelines()
        .iter()
        .map(|timeline| timeline.info(include_physical_size))
        .collect::<Vec<_>>();
    json_response(StatusCode::OK, response_data)
}

async fn timeline_detail_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let tenant_id: TenantId = parse_request_param(&request, "tenant_id")?;
    let timeline_id: TimelineId = parse_request_param(&request, "timeline_id")?;
    let timeline = get_state(&request)
        .tenant_manager
        .get_tenant(tenant_id, false)
        .await?
        .get_timeline(timeline_id, false)?;
    json_response(StatusCode::OK, timeline.info(true))
}

async fn timeline_ingest_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let request_data: IngestRequest = json_request(&mut request).await?;
    let timeline = active_timeline(&request).await?;
    let last_record_lsn = timeline
        .ingest(request_data.records.into_iter().map(Bytes::from).collect())
        .map_err(ApiError::InternalServerError)?;
    json_response(StatusCode::OK, IngestResponse { last_record_lsn })
}

async fn timeline_records_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let timeline = active_timeline(&request).await?;
    let records = timeline
        .read_records()
        .await
        .map_err(ApiError::InternalServerError)?
        .iter()
        .map(|record| String::from_utf8_lossy(record).into_owned())
        .collect();
    json_response(StatusCode::OK, RecordsResponse { records })
}

async fn timeline_checkpoint_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let timeline = active_timeline(&request).await?;
    timeline
        .checkpoint()
        .await
        .context("checkpoint")
        .map_err(ApiError::InternalServerError)?;
    json_response(StatusCode::OK, ())
}

async fn timeline_compact_handler(request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let timeline = active_timeline(&request).await?;
    timeline
        .compact()
        .await
        .context("compaction")
        .map_err(ApiError::InternalServerError)?;
    json_response(StatusCode::OK, ())
}

async fn timeline_gc_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let gc_req: TimelineGcRequest =
        json_request_or_empty_body(&mut request).await?.unwrap_or_default();
    let timeline = active_timeline(&request).await?;
    let gc_horizon = gc_req
        .gc_horizon
        .unwrap_or(get_state(&request).conf.gc_horizon);

    let gc_result = timeline
        .gc(gc_horizon)
        .await
        .context("gc")
        .map_err(ApiError::InternalServerError)?;
    json_response(StatusCode::OK, gc_result)
}

async fn failpoints_handler(mut request: Request<Body>) -> Result<Response<Body>, ApiError> {
    let failpoints: Vec<FailpointConfig> = json_request(&mut request).await?;
    let registry = &get_state(&request).failpoints;
    for fp in failpoints {
        info!("cfg failpoint: {} {}", fp.name, fp.actions);
        registry
            .configure(&fp.name, &fp.actions)
            .with_context(|| format!("configure failpoint {}", fp.name))
            .map_err(ApiError::BadRequest)?;
    }
    json_response(StatusCode::OK, ())
}

async fn handler_404(_: Request<Body>) -> Result<Response<Body>, ApiError> {
    json_response(
        StatusCode::NOT_FOUND,
        utils::http::error::HttpErrorBody::from_msg("page not found".to_owned()),
    )
}

pub fn make_router(state: Arc<ServerContext>) -> RouterBuilder<hyper::Body, ApiError> {
    endpoint::make_router()
        .data(state)
        .get("/metrics", |r| request_span(r, prometheus_metrics_handler))
        .get("/v1/status", |r| request_span(r, status_handler))
        .put("/v1/failpoints", |r| request_span(r, failpoints_handler))
        .get("/v1/tenant", |r| request_span(r, tenant_list_handler))
        .post("/v1/tenant", |r| request_span(r, tenant_create_handler))
        .get("/v1/tenant/:tenant_id", |r| {
            request_span(r, tenant_status_handler)
        })
        .post("/v1/tenant/:tenant_id/attach", |r| {
            request_span(r, tenant_attach_handler)
        })
        .post("/v1/tenant/:tenant_id/detach", |r| {
            request_span(r, tenant_detach_handler)
        })
        .get("/v1/tenant/:tenant_id/timeline", |r| {
            request_span(r, timeline_list_handler)
        })
        .post("/v1/tenant/:tenant_id/timeline", |r| {
            request_span(r, timeline_create_handler)
        })
        .get("/v1/tenant/:tenant_id/timeline/:timeline_id", |r| {
            request_span(r, timeline_detail_handler)
        })
        .put("/v1/tenant/:tenant_id/timeline/:timeline_id/ingest", |r| {
            request_span(r, timeline_ingest_handler)
        })
        .get("/v1/tenant/:tenant_id/timeline/:timeline_id/records", |r| {
            request_span(r, timeline_records_handler)
        })
        .put("/v1/tenant/:tenant_id/timeline/:timeline_id/checkpoint", |r| {
            request_span(r, timeline_checkpoint_handler)
        })
        .put("/v1/tenant/:tenant_id/timeline/:timeline_id/compact", |r| {
            request_span(r, timeline_compact_handler)
        })
        .put("/v1/tenant/:tenant_id/timeline/:timeline_id/do_gc", |r| {
            request_span(r, timeline_gc_handler)
        })
        .any(handler_404)
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, SocketAddr};
    use std::str::FromStr;
    use std::time::Duration;

    use camino_tempfile::Utf8TempDir;
    use failpoints::FailpointRegistry;
    use futures::future::poll_fn;
    use hyper::service::Service;
    use hyper::Method;
    use pageserver_api::models::{TenantInfo, TenantState, TimelineInfo};
    use routerify::{RequestService, RequestServiceBuilder};
    use serde::de::DeserializeOwned;

    use super::*;
    use crate::config::PageServerConf;
    use crate::tenant::harness::setup_logging;

    struct TestServer {
        service: RequestService<Body, ApiError>,
        state: Arc<ServerContext>,
        _workdir: Utf8TempDir,
    }

    impl TestServer {
        async fn start() -> anyhow::Result<Self> {
            setup_logging();
            let workdir = camino_tempfile::tempdir()?;
            let conf = PageServerConf::dummy_conf(
                workdir.path().join("repo"),
                workdir.path().join("localfs"),
            );
            let conf: &'static PageServerConf = Box::leak(Box::new(conf));
            std::fs::create_dir_all(conf.tenants_path())?;

            let state = ServerContext::new(conf, FailpointRegistry::new())?;
            let router = make_router(Arc::clone(&state))
                .build()
                .map_err(|e| anyhow::anyhow!(e))?;
            let builder = RequestServiceBuilder::new(router).map_err(|e| anyhow::anyhow!(e))?;
            let mut service =
                builder.build(SocketAddr::new(IpAddr::from_str("127.0.0.1")?, 80));
            poll_fn(|ctx| service.poll_ready(ctx))
                .await
                .map_err(|e| anyhow::anyhow!(e))?;

            Ok(Self {
                service,
                state,
                _workdir: workdir,
            })
        }

        async fn request(
            &mut self,
            method: Method,
            uri: &str,
            body: Option<serde_json::Value>,
        ) -> anyhow::Result<(StatusCode, Bytes)> {
            let body = match body {
                Some(json) => Body::from(serde_json::to_vec(&json)?),
                None => Body::empty(),
            };
            let request = Request::builder().method(method).uri(uri).body(body)?;
            let response = self
                .service
                .call(request)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            let status = response.status();
            let body = hyper::body::to_bytes(response.into_body()).await?;
            Ok((status, body))
        }

        async fn request_json<T: DeserializeOwned>(
            &mut self,
            method: Method,
            uri: &str,
            body: Option<serde_json::Value>,
            expected_status: StatusCode,
        ) -> anyhow::Result<T> {
            let (status, body) = self.request(method, uri, body).await?;
            anyhow::ensure!(
                status == expected_status,
                "{uri} returned {status}: {}",
                String::from_utf8_lossy(&body)
            );
            Ok(serde_json::from_slice(&body)?)
        }
    }

    #[tokio::test]
    async fn tenant_and_timeline_lifecycle() -> anyhow::Result<()> {
        let mut server = TestServer::start().await?;

        let status: StatusResponse = server
            .request_json(Method::GET, "/v1/status", None, StatusCode::OK)
            .await?;
        assert_eq!(status.id, server.state.conf.id);

        let TenantCreateResponse(tenant_id) = server
            .request_json(
                Method::POST,
                "/v1/tenant",
                Some(serde_json::json!({})),
                StatusCode::CREATED,
            )
            .await?;
        let tenant: TenantInfo = server
            .request_json(
                Method::GET,
                &format!("/v1/tenant/{tenant_id}"),
                None,
                StatusCode::OK,
            )
            .await?;
        assert_eq!(
            tenant.state,
            TenantState::Active {
                background_jobs_running: true
            }
        );
        assert!(!tenant.has_in_progress_downloads);
        assert!(tenant.current_physical_size.is_some());

        let timeline: TimelineInfo = server
            .request_json(
                Method::POST,
                &format!("/v1/tenant/{tenant_id}/timeline"),
                None,
                StatusCode::CREATED,
            )
            .await?;
        let timeline_uri = format!("/v1/tenant/{tenant_id}/timeline/{}", timeline.timeline_id);

        let ingested: IngestResponse = server
            .request_json(
                Method::PUT,
                &format!("{timeline_uri}/ingest"),
                Some(serde_json::json!({ "records": ["very secret secret|1"] })),
                StatusCode::OK,
            )
            .await?;
        let (status, _) = server
            .request(Method::PUT, &format!("{timeline_uri}/checkpoint"), None)
            .await?;
        assert_eq!(status, StatusCode::OK);

        let records: RecordsResponse = server
            .request_json(
                Method::GET,
                &format!("{timeline_uri}/records"),
                None,
                StatusCode::OK,
            )
            .await?;
        assert_eq!(records.records, vec!["very secret secret|1".to_string()]);

        let detail: TimelineInfo = server
            .request_json(Method::GET, &timeline_uri, None, StatusCode::OK)
            .await?;
        assert_eq!(detail.last_record_lsn, ingested.last_record_lsn);
        assert_eq!(detail.disk_consistent_lsn, ingested.last_record_lsn);
        assert!(!detail.awaits_download);

        let gc_result: pageserver_api::models::GcResult = server
            .request_json(
                Method::PUT,
                &format!("{timeline_uri}/do_gc"),
                Some(serde_json::json!({ "gc_horizon": 0 })),
                StatusCode::OK,
            )
            .await?;
        assert_eq!((gc_result.layers_total, gc_result.layers_removed), (1, 0));

        let timelines: Vec<TimelineInfo> = server
            .request_json(
                Method::GET,
                &format!("/v1/tenant/{tenant_id}/timeline?include-physical-size=true"),
                None,
                StatusCode::OK,
            )
            .await?;
        assert_eq!(timelines.len(), 1);
        assert!(timelines[0].current_physical_size.is_some());

        let (status, body) = server.request(Method::GET, "/metrics", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8_lossy(&body).contains("pageserver_tenant_states_count"));

        let (status, _) = server
            .request(Method::POST, &format!("/v1/tenant/{tenant_id}/detach"), None)
            .await?;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = server
            .request(Method::GET, &format!("/v1/tenant/{tenant_id}"), None)
            .await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn attach_of_known_tenant_conflicts() -> anyhow::Result<()> {
        let mut server = TestServer::start().await?;
        let TenantCreateResponse(tenant_id) = server
            .request_json(Method::POST, "/v1/tenant", None, StatusCode::CREATED)
            .await?;

        let (status, body) = server
            .request(Method::POST, &format!("/v1/tenant/{tenant_id}/attach"), None)
            .await?;
        assert_eq!(status, StatusCode::CONFLICT);
        let body: utils::http::error::HttpErrorBody = serde_json::from_slice(&body)?;
        assert!(
            body.msg
                .contains("tenant already exists, current state: Active"),
            "{}",
            body.msg
        );

        let (status, _) = server
            .request(
                Method::POST,
                "/v1/tenant",
                Some(serde_json::json!({ "new_tenant_id": tenant_id })),
            )
            .await?;
        assert_eq!(status, StatusCode::CONFLICT);
        Ok(())
    }

    #[tokio::test]
    async fn attach_of_missing_tenant_shows_broken_state() -> anyhow::Result<()> {
        let mut server = TestServer::start().await?;
        let tenant_id = TenantId::generate();

        let (status, _) = server
            .request(Method::POST, &format!("/v1/tenant/{tenant_id}/attach"), None)
            .await?;
        assert_eq!(status, StatusCode::ACCEPTED);

        let tenant = server
            .state
            .tenant_manager
            .get_tenant(tenant_id, false)
            .await?;
        tenant
            .wait_to_become_active(Duration::from_secs(10))
            .await
            .unwrap_err();

        let info: TenantInfo = server
            .request_json(
                Method::GET,
                &format!("/v1/tenant/{tenant_id}"),
                None,
                StatusCode::OK,
            )
            .await?;
        assert!(info.state.is_broken(), "{:?}", info.state);

        // A broken tenant cannot be read from.
        let (status, _) = server
            .request(
                Method::GET,
                &format!("/v1/tenant/{tenant_id}/timeline/{}/records", TimelineId::generate()),
                None,
            )
            .await?;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        Ok(())
    }

    #[tokio::test]
    async fn failpoints_are_configured() -> anyhow::Result<()> {
        let mut server = TestServer::start().await?;

        let (status, _) = server
            .request(
                Method::PUT,
                "/v1/failpoints",
                Some(serde_json::json!([
                    { "name": "before-upload-layer", "actions": "2*return->off" },
                ])),
            )
            .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            server.state.failpoints.list(),
            vec![FailpointConfig {
                name: "before-upload-layer".to_string(),
                actions: "2*return->off".to_string(),
            }]
        );

        let (status, _) = server
            .request(
                Method::PUT,
                "/v1/failpoints",
                Some(serde_json::json!([{ "name": "before-upload-index", "actions": "bogus" }])),
            )
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        Ok(())
    }
}
