//! Flotilla gateway API façade (in-process).
//!
//! This crate defines the request/response types and the [`GatewayApi`] trait
//! that frontends (CLI, HTTP) depend on. Requests are validated here; anything
//! that gets past validation is answered with one entry per requested cluster
//! plus a `meta` block, never with a whole-request failure.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use flotilla_core::{cluster_list, parse_cluster_list, ClusterId};
use flotilla_fanout::{ClusterMap, ClusterStatus, ErrorRecord, FanOut, FanOutConfig, Indexed, Statuses, Summary};
pub use flotilla_fanout::Status;
use flotilla_kubehub::ClusterRegistry;
use flotilla_ops::MultiClusterOps;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Service;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use flotilla_fanout::FanOutOptions;
pub use tokio_util::sync::CancellationToken;

/// API errors for the request as a whole. Per-cluster failures never show up
/// here; they live inside the response bodies.
#[derive(Debug, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum GatewayError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Counts describing how a fan-out went; attached to every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub partial: bool,
    pub all_failed: bool,
}

impl From<Summary> for ResponseMeta {
    fn from(s: Summary) -> Self {
        Self { requested: s.requested, succeeded: s.succeeded, failed: s.failed, partial: s.partial, all_failed: s.all_failed }
    }
}

impl From<ResponseMeta> for Summary {
    fn from(m: ResponseMeta) -> Self {
        Self { requested: m.requested, succeeded: m.succeeded, failed: m.failed, partial: m.partial, all_failed: m.all_failed }
    }
}

impl ResponseMeta {
    pub fn status(&self) -> Status { Summary::from(*self).status() }
}

/// List request. Blank `clusters` entries are dropped during validation; an
/// empty `namespace` means all namespaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {
    pub clusters: Vec<ClusterId>,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl ListRequest {
    /// Build from the `clusters=a,b` query form.
    pub fn from_csv(clusters: &str, namespace: Option<String>) -> Self {
        Self { clusters: parse_cluster_list(clusters), namespace }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutRestartRequest {
    pub deployment_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub clusters: Vec<ClusterId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleRequest {
    pub deployment_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub clusters: Vec<ClusterId>,
    pub replicas: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    pub deployment_name: String,
    pub replica_set_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub clusters: Vec<ClusterId>,
}

/// Map shape: `{items: {cluster: [..]}, errors: {cluster: ..}, meta}`.
#[derive(Debug, Clone, Serialize)]
pub struct MapResponse<T> {
    pub items: BTreeMap<ClusterId, Vec<T>>,
    pub errors: BTreeMap<ClusterId, ErrorRecord>,
    pub meta: ResponseMeta,
}

impl<T> From<ClusterMap<Vec<T>>> for MapResponse<T> {
    fn from(m: ClusterMap<Vec<T>>) -> Self { Self { items: m.items, errors: m.errors, meta: m.summary.into() } }
}

pub type DeploymentsResponse = MapResponse<Deployment>;
pub type ReplicaSetsResponse = MapResponse<ReplicaSet>;

/// One row per requested cluster, in request order.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRecord {
    pub cluster: ClusterId,
    pub services: Option<Vec<Service>>,
    pub error: Option<ErrorRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServicesResponse {
    pub results: Vec<ServiceRecord>,
    pub meta: ResponseMeta,
}

impl From<Indexed<Vec<Service>>> for ServicesResponse {
    fn from(idx: Indexed<Vec<Service>>) -> Self {
        let results = idx
            .records
            .into_iter()
            .map(|r| ServiceRecord { cluster: r.cluster, services: r.payload, error: r.error })
            .collect();
        Self { results, meta: idx.summary.into() }
    }
}

/// Result of a mutating fan-out: `error` is null where the cluster succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationResponse {
    pub results: Vec<ClusterStatus>,
    pub meta: ResponseMeta,
}

impl From<Statuses> for MutationResponse {
    fn from(s: Statuses) -> Self { Self { results: s.results, meta: s.summary.into() } }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClustersResponse {
    pub clusters: Vec<ClusterId>,
}

/// Multi-cluster gateway surface.
#[async_trait::async_trait]
pub trait GatewayApi: Send + Sync {
    /// Registered cluster ids, sorted.
    async fn clusters(&self) -> GatewayResult<ClustersResponse>;

    async fn deployments(&self, req: ListRequest, opts: FanOutOptions) -> GatewayResult<DeploymentsResponse>;

    async fn replica_sets(&self, req: ListRequest, opts: FanOutOptions) -> GatewayResult<ReplicaSetsResponse>;

    async fn services(&self, req: ListRequest, opts: FanOutOptions) -> GatewayResult<ServicesResponse>;

    /// Stamp a restart annotation on the deployment in every cluster.
    async fn restart(&self, req: RolloutRestartRequest, opts: FanOutOptions) -> GatewayResult<MutationResponse>;

    /// Set the replica count; clusters already at the target are left alone.
    async fn scale(&self, req: ScaleRequest, opts: FanOutOptions) -> GatewayResult<MutationResponse>;

    /// Replace the deployment's pod template with the named ReplicaSet's.
    async fn rollback(&self, req: RollbackRequest, opts: FanOutOptions) -> GatewayResult<MutationResponse>;
}

fn reject(op: &'static str, msg: impl Into<String>) -> GatewayError {
    let msg = msg.into();
    counter!("gateway_rejected_total", 1, "op" => op);
    warn!(op, error = %msg, "api: request rejected");
    GatewayError::Validation(msg)
}

fn cluster_ids(op: &'static str, raw: &[ClusterId]) -> GatewayResult<Vec<ClusterId>> {
    let ids = cluster_list(raw.iter().map(ClusterId::as_str));
    if ids.is_empty() {
        return Err(reject(op, "clusters must name at least one cluster"));
    }
    Ok(ids)
}

fn required<'a>(op: &'static str, field: &str, value: &'a str) -> GatewayResult<&'a str> {
    let v = value.trim();
    if v.is_empty() {
        return Err(reject(op, format!("{} is required", field)));
    }
    Ok(v)
}

fn list_namespace(ns: &Option<String>) -> Option<&str> { ns.as_deref().map(str::trim).filter(|s| !s.is_empty()) }

/// In-process implementation that drives the fan-out executor directly.
#[derive(Debug, Clone)]
pub struct InProcApi {
    ops: MultiClusterOps,
}

impl InProcApi {
    pub fn new(ops: MultiClusterOps) -> Self { Self { ops } }

    pub fn from_registry(registry: Arc<ClusterRegistry>, config: FanOutConfig) -> Self {
        Self::new(MultiClusterOps::new(FanOut::new(registry, config)))
    }

    pub fn ops(&self) -> &MultiClusterOps { &self.ops }
}

#[async_trait::async_trait]
impl GatewayApi for InProcApi {
    async fn clusters(&self) -> GatewayResult<ClustersResponse> {
        Ok(ClustersResponse { clusters: self.ops.fanout().registry().ids() })
    }

    async fn deployments(&self, req: ListRequest, opts: FanOutOptions) -> GatewayResult<DeploymentsResponse> {
        let t0 = Instant::now();
        let ids = cluster_ids("deployments", &req.clusters)?;
        let ns = list_namespace(&req.namespace);
        info!(clusters = ids.len(), ns = %ns.unwrap_or("(all)"), "api: deployments start");
        let res = self.ops.fan_out_list_deployments(&ids, ns, opts).await;
        let out = DeploymentsResponse::from(ClusterMap::assemble(res));
        info!(ok = out.meta.succeeded, failed = out.meta.failed, took_ms = %t0.elapsed().as_millis(), "api: deployments ok");
        Ok(out)
    }

    async fn replica_sets(&self, req: ListRequest, opts: FanOutOptions) -> GatewayResult<ReplicaSetsResponse> {
        let t0 = Instant::now();
        let ids = cluster_ids("replicasets", &req.clusters)?;
        let ns = list_namespace(&req.namespace);
        info!(clusters = ids.len(), ns = %ns.unwrap_or("(all)"), "api: replicasets start");
        let res = self.ops.fan_out_list_replica_sets(&ids, ns, opts).await;
        let out = ReplicaSetsResponse::from(ClusterMap::assemble(res));
        info!(ok = out.meta.succeeded, failed = out.meta.failed, took_ms = %t0.elapsed().as_millis(), "api: replicasets ok");
        Ok(out)
    }

    async fn services(&self, req: ListRequest, opts: FanOutOptions) -> GatewayResult<ServicesResponse> {
        let t0 = Instant::now();
        let ids = cluster_ids("services", &req.clusters)?;
        let ns = list_namespace(&req.namespace);
        info!(clusters = ids.len(), ns = %ns.unwrap_or("(all)"), "api: services start");
        let res = self.ops.fan_out_list_services(&ids, ns, opts).await;
        let out = ServicesResponse::from(Indexed::assemble(res));
        info!(ok = out.meta.succeeded, failed = out.meta.failed, took_ms = %t0.elapsed().as_millis(), "api: services ok");
        Ok(out)
    }

    async fn restart(&self, req: RolloutRestartRequest, opts: FanOutOptions) -> GatewayResult<MutationResponse> {
        let t0 = Instant::now();
        let ids = cluster_ids("restart", &req.clusters)?;
        let name = required("restart", "deploymentName", &req.deployment_name)?;
        let ns = required("restart", "namespace", &req.namespace)?;
        info!(deployment = %name, ns = %ns, clusters = ids.len(), "api: restart start");
        let res = self.ops.fan_out_restart(&ids, name, ns, opts).await;
        let out = MutationResponse::from(Statuses::assemble(res));
        info!(ok = out.meta.succeeded, failed = out.meta.failed, took_ms = %t0.elapsed().as_millis(), "api: restart ok");
        Ok(out)
    }

    async fn scale(&self, req: ScaleRequest, opts: FanOutOptions) -> GatewayResult<MutationResponse> {
        let t0 = Instant::now();
        let ids = cluster_ids("scale", &req.clusters)?;
        let name = required("scale", "deploymentName", &req.deployment_name)?;
        let ns = required("scale", "namespace", &req.namespace)?;
        if req.replicas < 0 {
            return Err(reject("scale", format!("replicas must be >= 0, got {}", req.replicas)));
        }
        info!(deployment = %name, ns = %ns, replicas = req.replicas, clusters = ids.len(), "api: scale start");
        let res = self.ops.fan_out_scale(&ids, name, ns, req.replicas, opts).await;
        let out = MutationResponse::from(Statuses::assemble(res));
        info!(ok = out.meta.succeeded, failed = out.meta.failed, took_ms = %t0.elapsed().as_millis(), "api: scale ok");
        Ok(out)
    }

    async fn rollback(&self, req: RollbackRequest, opts: FanOutOptions) -> GatewayResult<MutationResponse> {
        let t0 = Instant::now();
        let ids = cluster_ids("rollback", &req.clusters)?;
        let name = required("rollback", "deploymentName", &req.deployment_name)?;
        let rs = required("rollback", "replicaSetName", &req.replica_set_name)?;
        let ns = required("rollback", "namespace", &req.namespace)?;
        info!(deployment = %name, replica_set = %rs, ns = %ns, clusters = ids.len(), "api: rollback start");
        let res = self.ops.fan_out_rollback(&ids, name, rs, ns, opts).await;
        let out = MutationResponse::from(Statuses::assemble(res));
        info!(ok = out.meta.succeeded, failed = out.meta.failed, took_ms = %t0.elapsed().as_millis(), "api: rollback ok");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::ErrorKind;
    use flotilla_kubehub::fake::{deployment, replica_set, service, CallKind, FakeCluster};
    use flotilla_kubehub::{ClientError, ClusterClient};

    fn api(entries: &[(&str, Arc<FakeCluster>)]) -> InProcApi {
        let reg = ClusterRegistry::from_clients(
            entries.iter().map(|(id, c)| (ClusterId::from(*id), c.clone() as Arc<dyn ClusterClient>)),
        )
        .expect("registry");
        InProcApi::from_registry(Arc::new(reg), FanOutConfig::default())
    }

    fn clusters(v: &[&str]) -> Vec<ClusterId> { v.iter().map(|s| ClusterId::from(*s)).collect() }

    #[tokio::test]
    async fn deployments_report_unreachable_cluster_in_errors() {
        let a = Arc::new(FakeCluster::new().with_deployment(deployment("default", "web", 1, "nginx")));
        let b = Arc::new(FakeCluster::new().failing_all(ClientError::Transport("connection refused".into())));
        let api = api(&[("a", a), ("b", b)]);
        let out = api
            .deployments(ListRequest::from_csv("a,b", None), FanOutOptions::default())
            .await
            .expect("response");
        assert_eq!(out.items[&ClusterId::from("a")].len(), 1);
        assert_eq!(out.errors[&ClusterId::from("b")].kind, ErrorKind::Transport);
        assert_eq!(out.meta, ResponseMeta { requested: 2, succeeded: 1, failed: 1, partial: true, all_failed: false });
    }

    #[tokio::test]
    async fn empty_namespace_lists_everything() {
        let a = Arc::new(
            FakeCluster::new()
                .with_replica_set(replica_set("one", "web-1", "nginx"))
                .with_replica_set(replica_set("two", "api-1", "nginx")),
        );
        let api = api(&[("a", a)]);
        let all = api
            .replica_sets(ListRequest::from_csv("a", Some(" ".into())), FanOutOptions::default())
            .await
            .expect("all");
        assert_eq!(all.items[&ClusterId::from("a")].len(), 2);
        let one = api
            .replica_sets(ListRequest::from_csv("a", Some("one".into())), FanOutOptions::default())
            .await
            .expect("one");
        assert_eq!(one.items[&ClusterId::from("a")].len(), 1);
    }

    #[tokio::test]
    async fn services_keep_request_order_and_duplicates() {
        let a = Arc::new(FakeCluster::new().with_service(service("default", "web")));
        let b = Arc::new(FakeCluster::new().with_service(service("default", "db")));
        let api = api(&[("a", a), ("b", b)]);
        let out = api
            .services(ListRequest { clusters: clusters(&["b", "x", "b", "a"]), namespace: None }, FanOutOptions::default())
            .await
            .expect("services");
        let order: Vec<_> = out.results.iter().map(|r| r.cluster.as_str()).collect();
        assert_eq!(order, vec!["b", "x", "b", "a"]);
        assert!(out.results[0].services.is_some());
        assert_eq!(out.results[1].error.as_ref().map(|e| e.kind), Some(ErrorKind::UnknownCluster));
        assert!(out.results[1].services.is_none());
        assert_eq!(out.meta.failed, 1);
    }

    #[tokio::test]
    async fn scale_to_current_count_is_success_without_write() {
        let a = Arc::new(FakeCluster::new().with_deployment(deployment("ns", "web", 3, "nginx")));
        let api = api(&[("a", a.clone())]);
        let req = ScaleRequest { deployment_name: "web".into(), namespace: "ns".into(), clusters: clusters(&["a"]), replicas: 3 };
        let out = api.scale(req, FanOutOptions::default()).await.expect("scale");
        assert_eq!(out.results, vec![ClusterStatus { cluster: ClusterId::from("a"), error: None }]);
        assert_eq!(a.writes(), 0);
    }

    #[tokio::test]
    async fn restart_on_unknown_cluster_reports_it_and_calls_nothing() {
        let a = Arc::new(FakeCluster::new().with_deployment(deployment("ns", "web", 1, "nginx")));
        let api = api(&[("a", a.clone())]);
        let req = RolloutRestartRequest { deployment_name: "web".into(), namespace: "ns".into(), clusters: clusters(&["x"]) };
        let out = api.restart(req, FanOutOptions::default()).await.expect("restart");
        assert_eq!(out.results.len(), 1);
        assert_eq!(out.results[0].error.as_ref().map(|e| e.kind), Some(ErrorKind::UnknownCluster));
        assert!(out.meta.all_failed);
        assert!(a.calls().is_empty());
    }

    #[tokio::test]
    async fn rollback_partial_failure() {
        let a = Arc::new(
            FakeCluster::new()
                .with_deployment(deployment("ns", "web", 1, "nginx:2"))
                .with_replica_set(replica_set("ns", "web-1", "nginx:1")),
        );
        let b = Arc::new(FakeCluster::new().with_deployment(deployment("ns", "web", 1, "nginx:2")));
        let api = api(&[("a", a.clone()), ("b", b.clone())]);
        let req = RollbackRequest {
            deployment_name: "web".into(),
            replica_set_name: "web-1".into(),
            namespace: "ns".into(),
            clusters: clusters(&["a", "b"]),
        };
        let out = api.rollback(req, FanOutOptions::default()).await.expect("rollback");
        assert!(out.results[0].error.is_none());
        assert!(out.results[1].error.is_some());
        assert!(out.meta.partial);
        assert_eq!(a.count(CallKind::ReplaceDeployment), 1);
        assert_eq!(b.writes(), 0);
    }

    #[tokio::test]
    async fn blank_body_entries_are_dropped_and_duplicates_kept() {
        let a = Arc::new(FakeCluster::new().with_deployment(deployment("ns", "web", 1, "nginx")));
        let api = api(&[("a", a)]);
        let req = RolloutRestartRequest {
            deployment_name: "web".into(),
            namespace: "ns".into(),
            clusters: clusters(&[" a ", "", "a"]),
        };
        let out = api.restart(req, FanOutOptions::default()).await.expect("restart");
        let order: Vec<_> = out.results.iter().map(|r| (r.cluster.as_str(), r.error.is_none())).collect();
        assert_eq!(order, vec![("a", true), ("a", true)]);
        assert_eq!(out.meta.status(), Status::Complete);
    }

    #[test]
    fn list_query_form_uses_shared_cluster_rule() {
        let req = ListRequest::from_csv(" b,,a ,b", None);
        assert_eq!(req.clusters, clusters(&["b", "a", "b"]));
    }

    #[test]
    fn meta_status_follows_counts() {
        let partial = ResponseMeta { requested: 2, succeeded: 1, failed: 1, partial: true, all_failed: false };
        assert_eq!(partial.status(), Status::Partial);
        let failed = ResponseMeta { requested: 1, succeeded: 0, failed: 1, partial: false, all_failed: true };
        assert_eq!(failed.status(), Status::Failed);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_any_call() {
        let a = Arc::new(FakeCluster::new().with_deployment(deployment("ns", "web", 1, "nginx")));
        let api = api(&[("a", a.clone())]);

        let err = api.deployments(ListRequest::from_csv(" , ", None), FanOutOptions::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));

        let req = ScaleRequest { deployment_name: "web".into(), namespace: "ns".into(), clusters: clusters(&["a"]), replicas: -1 };
        assert!(matches!(api.scale(req, FanOutOptions::default()).await, Err(GatewayError::Validation(_))));

        let req = RolloutRestartRequest { deployment_name: " ".into(), namespace: "ns".into(), clusters: clusters(&["a"]) };
        assert!(matches!(api.restart(req, FanOutOptions::default()).await, Err(GatewayError::Validation(_))));

        let req = RollbackRequest {
            deployment_name: "web".into(),
            replica_set_name: String::new(),
            namespace: "ns".into(),
            clusters: clusters(&["a"]),
        };
        assert!(matches!(api.rollback(req, FanOutOptions::default()).await, Err(GatewayError::Validation(_))));

        assert!(a.calls().is_empty());
    }

    #[tokio::test]
    async fn cancelled_request_marks_every_slot() {
        let a = Arc::new(FakeCluster::new().with_deployment(deployment("ns", "web", 1, "nginx")));
        let api = api(&[("a", a.clone())]);
        let token = CancellationToken::new();
        token.cancel();
        let req = ScaleRequest { deployment_name: "web".into(), namespace: "ns".into(), clusters: clusters(&["a", "a"]), replicas: 2 };
        let out = api.scale(req, FanOutOptions::with_cancel(token)).await.expect("scale");
        assert_eq!(out.results.len(), 2);
        for r in &out.results {
            let e = r.error.as_ref().expect("cancelled");
            assert_eq!((e.kind, e.message.as_str()), (ErrorKind::Transport, flotilla_core::CANCELLED));
        }
        assert_eq!(a.writes(), 0);
    }

    #[tokio::test]
    async fn clusters_are_sorted() {
        let api = api(&[("west", Arc::new(FakeCluster::new())), ("east", Arc::new(FakeCluster::new()))]);
        let out = api.clusters().await.expect("clusters");
        assert_eq!(out.clusters, vec![ClusterId::from("east"), ClusterId::from("west")]);
    }

    #[test]
    fn request_bodies_use_camel_case() {
        let req: RollbackRequest = serde_json::from_str(
            r#"{"deploymentName":"web","replicaSetName":"web-1","namespace":"ns","clusters":["a","b"]}"#,
        )
        .expect("parse");
        assert_eq!(req.replica_set_name, "web-1");
        assert_eq!(req.clusters, clusters(&["a", "b"]));
    }

    #[test]
    fn gateway_error_serializes_with_kind() {
        let v = serde_json::to_value(GatewayError::Validation("clusters must name at least one cluster".into())).expect("json");
        assert_eq!(v["kind"], "validation");
    }
}
