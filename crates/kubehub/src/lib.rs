//! Flotilla kubehub: per-cluster API clients and the cluster registry.
//!
//! [`ClusterClient`] is the capability the fan-out core talks to. The kube-rs
//! backed implementation lives here; tests use the in-memory fakes from
//! [`fake`] (feature `testing`).

#![forbid(unsafe_code)]

use std::time::Instant;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::autoscaling::v1::Scale;
use k8s_openapi::api::core::v1::Service;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    Client,
};
use metrics::histogram;
use tracing::debug;

mod registry;
#[cfg(any(test, feature = "testing"))]
pub mod fake;

pub use registry::{load_registry, context_names, ClusterRegistry, RegistryError, RegistryOptions};

/// Failure of a single call against one cluster's API server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The API server answered with an error status.
    #[error("api error {code} ({reason}): {message}")]
    Api { code: u16, reason: String, message: String },
    /// Connection, TLS, auth exchange or any other failure before a status was read.
    #[error("transport: {0}")]
    Transport(String),
    /// Request or response body could not be (de)serialized.
    #[error("decode: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn api(code: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api { code, reason: reason.into(), message: message.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        let what = what.into();
        Self::api(404, "NotFound", format!("{} not found", what))
    }

    pub fn status(&self) -> Option<u16> {
        match self { ClientError::Api { code, .. } => Some(*code), _ => None }
    }

    pub fn is_conflict(&self) -> bool { self.status() == Some(409) }
}

impl From<kube::Error> for ClientError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => ClientError::Api { code: ae.code, reason: ae.reason, message: ae.message },
            kube::Error::SerdeError(e) => ClientError::Decode(e.to_string()),
            other => ClientError::Transport(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self { ClientError::Decode(e.to_string()) }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Per-cluster API capability. `namespace: None` on list calls means all namespaces.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_deployments(&self, namespace: Option<&str>) -> ClientResult<Vec<Deployment>>;
    async fn list_replica_sets(&self, namespace: Option<&str>) -> ClientResult<Vec<ReplicaSet>>;
    async fn list_services(&self, namespace: Option<&str>) -> ClientResult<Vec<Service>>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> ClientResult<Deployment>;
    async fn get_replica_set(&self, namespace: &str, name: &str) -> ClientResult<ReplicaSet>;

    /// Apply a JSON merge patch to a deployment.
    async fn patch_deployment(&self, namespace: &str, name: &str, merge_patch: &serde_json::Value) -> ClientResult<Deployment>;
    /// Replace a deployment (optimistic concurrency via `metadata.resourceVersion`).
    async fn replace_deployment(&self, namespace: &str, name: &str, deployment: &Deployment) -> ClientResult<Deployment>;

    async fn get_scale(&self, namespace: &str, name: &str) -> ClientResult<Scale>;
    async fn replace_scale(&self, namespace: &str, name: &str, scale: &Scale) -> ClientResult<Scale>;
}

/// [`ClusterClient`] over a kube-rs client bound to one kubeconfig context.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self { Self { client } }

    fn scoped<K>(&self, namespace: Option<&str>) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

fn observe(call: &'static str, t0: Instant) {
    let ms = t0.elapsed().as_secs_f64() * 1000.0;
    histogram!("kube_call_ms", ms, "call" => call);
    debug!(call, took_ms = ms, "kube call done");
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_deployments(&self, namespace: Option<&str>) -> ClientResult<Vec<Deployment>> {
        let t0 = Instant::now();
        let list = self.scoped::<Deployment>(namespace).list(&ListParams::default()).await;
        observe("list_deployments", t0);
        Ok(list?.items)
    }

    async fn list_replica_sets(&self, namespace: Option<&str>) -> ClientResult<Vec<ReplicaSet>> {
        let t0 = Instant::now();
        let list = self.scoped::<ReplicaSet>(namespace).list(&ListParams::default()).await;
        observe("list_replica_sets", t0);
        Ok(list?.items)
    }

    async fn list_services(&self, namespace: Option<&str>) -> ClientResult<Vec<Service>> {
        let t0 = Instant::now();
        let list = self.scoped::<Service>(namespace).list(&ListParams::default()).await;
        observe("list_services", t0);
        Ok(list?.items)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> ClientResult<Deployment> {
        let t0 = Instant::now();
        let res = self.scoped::<Deployment>(Some(namespace)).get(name).await;
        observe("get_deployment", t0);
        Ok(res?)
    }

    async fn get_replica_set(&self, namespace: &str, name: &str) -> ClientResult<ReplicaSet> {
        let t0 = Instant::now();
        let res = self.scoped::<ReplicaSet>(Some(namespace)).get(name).await;
        observe("get_replica_set", t0);
        Ok(res?)
    }

    async fn patch_deployment(&self, namespace: &str, name: &str, merge_patch: &serde_json::Value) -> ClientResult<Deployment> {
        let t0 = Instant::now();
        let pp = PatchParams::default();
        let res = self.scoped::<Deployment>(Some(namespace)).patch(name, &pp, &Patch::Merge(merge_patch)).await;
        observe("patch_deployment", t0);
        Ok(res?)
    }

    async fn replace_deployment(&self, namespace: &str, name: &str, deployment: &Deployment) -> ClientResult<Deployment> {
        let t0 = Instant::now();
        let res = self.scoped::<Deployment>(Some(namespace)).replace(name, &PostParams::default(), deployment).await;
        observe("replace_deployment", t0);
        Ok(res?)
    }

    async fn get_scale(&self, namespace: &str, name: &str) -> ClientResult<Scale> {
        let t0 = Instant::now();
        let res = self.scoped::<Deployment>(Some(namespace)).get_scale(name).await;
        observe("get_scale", t0);
        Ok(res?)
    }

    async fn replace_scale(&self, namespace: &str, name: &str, scale: &Scale) -> ClientResult<Scale> {
        let body = serde_json::to_vec(scale)?;
        let t0 = Instant::now();
        let res = self.scoped::<Deployment>(Some(namespace)).replace_scale(name, &PostParams::default(), body).await;
        observe("replace_scale", t0);
        Ok(res?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_detected_by_status() {
        assert!(ClientError::api(409, "Conflict", "object was modified").is_conflict());
        assert!(!ClientError::not_found("deployment ns/web").is_conflict());
        assert!(!ClientError::Transport("connection refused".into()).is_conflict());
    }

    #[test]
    fn not_found_carries_404() {
        let e = ClientError::not_found("replicaset ns/web-1");
        assert_eq!(e.status(), Some(404));
        assert_eq!(e.to_string(), "api error 404 (NotFound): replicaset ns/web-1 not found");
    }

    #[test]
    fn kube_api_error_keeps_status() {
        let ae = kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "forbidden".into(),
            reason: "Forbidden".into(),
            code: 403,
        };
        let e: ClientError = kube::Error::Api(ae).into();
        assert_eq!(e.status(), Some(403));
    }
}
