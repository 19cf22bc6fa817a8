//! HTTP transport over a [`GatewayApi`].
//!
//! Per-cluster failures are part of a 200 body. Only a rejected request
//! (validation, malformed JSON) gets a non-2xx status.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use flotilla_api::{
    ClustersResponse, DeploymentsResponse, FanOutOptions, GatewayApi, GatewayError, ListRequest, MutationResponse,
    ReplicaSetsResponse, RollbackRequest, RolloutRestartRequest, ScaleRequest, ServicesResponse,
};
use metrics::counter;
use serde::Deserialize;
use tracing::{info, warn};

type Api = Arc<dyn GatewayApi>;

/// Query string of the list routes: `?clusters=a,b&namespace=ns`.
#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    clusters: String,
    namespace: Option<String>,
}

impl From<ListQuery> for ListRequest {
    fn from(q: ListQuery) -> Self { ListRequest::from_csv(&q.clusters, q.namespace) }
}

/// Whole-request failure rendered as `{kind, message}`.
#[derive(Debug)]
struct Rejected(StatusCode, GatewayError);

impl From<GatewayError> for Rejected {
    fn from(e: GatewayError) -> Self {
        let status = match e {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, e)
    }
}

impl From<JsonRejection> for Rejected {
    fn from(e: JsonRejection) -> Self { Self(StatusCode::BAD_REQUEST, GatewayError::Validation(e.body_text())) }
}

impl From<QueryRejection> for Rejected {
    fn from(e: QueryRejection) -> Self { Self(StatusCode::BAD_REQUEST, GatewayError::Validation(e.body_text())) }
}

impl IntoResponse for Rejected {
    fn into_response(self) -> Response {
        counter!("http_rejected_total", 1, "status" => self.0.as_u16().to_string());
        warn!(status = %self.0, error = %self.1, "http: request rejected");
        (self.0, Json(self.1)).into_response()
    }
}

type Reply<T> = Result<Json<T>, Rejected>;

pub fn router(api: Api) -> Router {
    Router::new()
        .route("/clusters", get(clusters))
        .route("/resources/deployments", get(deployments))
        .route("/resources/replicasets", get(replica_sets))
        .route("/resources/services", get(services))
        .route("/resources/deployments/restart", post(restart))
        .route("/resources/deployments/scale", post(scale))
        .route("/resources/deployments/rollback", post(rollback))
        .with_state(api)
}

/// Bind `addr` and serve until Ctrl-C.
pub async fn serve(api: Api, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding {}", addr))?;
    info!(addr = %addr, "http: listening");
    axum::serve(listener, router(api))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received; shutting down http server");
            }
        })
        .await?;
    Ok(())
}

async fn clusters(State(api): State<Api>) -> Reply<ClustersResponse> { Ok(Json(api.clusters().await?)) }

async fn deployments(State(api): State<Api>, q: Result<Query<ListQuery>, QueryRejection>) -> Reply<DeploymentsResponse> {
    let Query(q) = q?;
    Ok(Json(api.deployments(q.into(), FanOutOptions::default()).await?))
}

async fn replica_sets(State(api): State<Api>, q: Result<Query<ListQuery>, QueryRejection>) -> Reply<ReplicaSetsResponse> {
    let Query(q) = q?;
    Ok(Json(api.replica_sets(q.into(), FanOutOptions::default()).await?))
}

async fn services(State(api): State<Api>, q: Result<Query<ListQuery>, QueryRejection>) -> Reply<ServicesResponse> {
    let Query(q) = q?;
    Ok(Json(api.services(q.into(), FanOutOptions::default()).await?))
}

async fn restart(State(api): State<Api>, body: Result<Json<RolloutRestartRequest>, JsonRejection>) -> Reply<MutationResponse> {
    let Json(req) = body?;
    Ok(Json(api.restart(req, FanOutOptions::default()).await?))
}

async fn scale(State(api): State<Api>, body: Result<Json<ScaleRequest>, JsonRejection>) -> Reply<MutationResponse> {
    let Json(req) = body?;
    Ok(Json(api.scale(req, FanOutOptions::default()).await?))
}

async fn rollback(State(api): State<Api>, body: Result<Json<RollbackRequest>, JsonRejection>) -> Reply<MutationResponse> {
    let Json(req) = body?;
    Ok(Json(api.rollback(req, FanOutOptions::default()).await?))
}
