//! Flotilla Ops: imperative Kubernetes operations run once per cluster, and
//! their multi-cluster entry points.
//!
//! Each operation maps one [`ClusterClient`] plus parameters to a result. Reads
//! always happen before writes and any failed read returns before a write is
//! attempted, so a cluster never receives a write built from stale or partial
//! state. Nothing here retries.

#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use flotilla_core::{ClusterId, FanOutResult, OpError};
use flotilla_fanout::{FanOut, FanOutOptions};
use flotilla_kubehub::{ClientError, ClusterClient};
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Service;
use tracing::debug;

/// Pod template annotation bumped by a rollout restart (same key kubectl uses).
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Collapse a client failure into the per-cluster taxonomy: 409 is a
/// conflict, everything else is transport.
pub fn classify(e: ClientError) -> OpError {
    if e.is_conflict() { OpError::conflict(e.to_string()) } else { OpError::transport(e.to_string()) }
}

pub async fn list_deployments(client: &dyn ClusterClient, namespace: Option<&str>) -> Result<Vec<Deployment>, OpError> {
    client.list_deployments(namespace).await.map_err(classify)
}

pub async fn list_replica_sets(client: &dyn ClusterClient, namespace: Option<&str>) -> Result<Vec<ReplicaSet>, OpError> {
    client.list_replica_sets(namespace).await.map_err(classify)
}

pub async fn list_services(client: &dyn ClusterClient, namespace: Option<&str>) -> Result<Vec<Service>, OpError> {
    client.list_services(namespace).await.map_err(classify)
}

/// Merge patch stamping the pod template with `restarted_at`.
pub fn restart_patch(restarted_at: &str) -> serde_json::Value {
    serde_json::json!({
        "spec": {"template": {"metadata": {"annotations": {RESTARTED_AT_ANNOTATION: restarted_at}}}}
    })
}

/// Blind write: patch the restart annotation without reading first.
pub async fn rollout_restart(client: &dyn ClusterClient, namespace: &str, deployment: &str, patch: &serde_json::Value) -> Result<(), OpError> {
    client.patch_deployment(namespace, deployment, patch).await.map_err(classify)?;
    Ok(())
}

/// Read-modify-write of the scale subresource. Equal replica counts are a
/// no-op success without a write. The write carries the read
/// `resourceVersion`, so a concurrent change surfaces as `Conflict`.
pub async fn scale(client: &dyn ClusterClient, namespace: &str, deployment: &str, replicas: i32) -> Result<(), OpError> {
    let mut current = client.get_scale(namespace, deployment).await.map_err(classify)?;
    let have = current.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    if have == replicas {
        debug!(deployment, namespace, replicas, "scale already satisfied");
        return Ok(());
    }
    current.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
    client.replace_scale(namespace, deployment, &current).await.map_err(classify)?;
    debug!(deployment, namespace, from = have, to = replicas, "scaled");
    Ok(())
}

/// Replace the deployment's pod template with the one from `replica_set`.
///
/// Reads the ReplicaSet, then the Deployment, then writes the Deployment.
/// Only the pod template is copied; the selector and other spec fields are
/// left untouched.
pub async fn rollback(client: &dyn ClusterClient, namespace: &str, deployment: &str, replica_set: &str) -> Result<(), OpError> {
    let rs = client.get_replica_set(namespace, replica_set).await.map_err(classify)?;
    let template = rs
        .spec
        .and_then(|s| s.template)
        .ok_or_else(|| OpError::conflict(format!("replicaset {}/{} has no pod template", namespace, replica_set)))?;
    let mut target = client.get_deployment(namespace, deployment).await.map_err(classify)?;
    let spec = target
        .spec
        .as_mut()
        .ok_or_else(|| OpError::conflict(format!("deployment {}/{} has no spec", namespace, deployment)))?;
    spec.template = template;
    client.replace_deployment(namespace, deployment, &target).await.map_err(classify)?;
    Ok(())
}

/// Multi-cluster entry points: each runs one operation across `clusters`
/// through the fan-out executor.
#[derive(Debug, Clone)]
pub struct MultiClusterOps {
    fanout: FanOut,
}

impl MultiClusterOps {
    pub fn new(fanout: FanOut) -> Self { Self { fanout } }

    pub fn fanout(&self) -> &FanOut { &self.fanout }

    pub async fn fan_out_list_deployments(&self, clusters: &[ClusterId], namespace: Option<&str>, opts: FanOutOptions) -> FanOutResult<Vec<Deployment>> {
        self.fanout
            .run("list_deployments", clusters, opts, move |c: Arc<dyn ClusterClient>| async move {
                list_deployments(c.as_ref(), namespace).await
            })
            .await
    }

    pub async fn fan_out_list_replica_sets(&self, clusters: &[ClusterId], namespace: Option<&str>, opts: FanOutOptions) -> FanOutResult<Vec<ReplicaSet>> {
        self.fanout
            .run("list_replica_sets", clusters, opts, move |c: Arc<dyn ClusterClient>| async move {
                list_replica_sets(c.as_ref(), namespace).await
            })
            .await
    }

    pub async fn fan_out_list_services(&self, clusters: &[ClusterId], namespace: Option<&str>, opts: FanOutOptions) -> FanOutResult<Vec<Service>> {
        self.fanout
            .run("list_services", clusters, opts, move |c: Arc<dyn ClusterClient>| async move {
                list_services(c.as_ref(), namespace).await
            })
            .await
    }

    /// One timestamp is taken per request and stamped on every cluster.
    pub async fn fan_out_restart(&self, clusters: &[ClusterId], deployment: &str, namespace: &str, opts: FanOutOptions) -> FanOutResult<()> {
        let patch = restart_patch(&Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        let patch = &patch;
        self.fanout
            .run("rollout_restart", clusters, opts, move |c: Arc<dyn ClusterClient>| async move {
                rollout_restart(c.as_ref(), namespace, deployment, patch).await
            })
            .await
    }

    pub async fn fan_out_scale(&self, clusters: &[ClusterId], deployment: &str, namespace: &str, replicas: i32, opts: FanOutOptions) -> FanOutResult<()> {
        self.fanout
            .run("scale", clusters, opts, move |c: Arc<dyn ClusterClient>| async move {
                scale(c.as_ref(), namespace, deployment, replicas).await
            })
            .await
    }

    pub async fn fan_out_rollback(&self, clusters: &[ClusterId], deployment: &str, replica_set: &str, namespace: &str, opts: FanOutOptions) -> FanOutResult<()> {
        self.fanout
            .run("rollback", clusters, opts, move |c: Arc<dyn ClusterClient>| async move {
                rollback(c.as_ref(), namespace, deployment, replica_set).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::ErrorKind;
    use flotilla_kubehub::fake::{deployment, deployment_image, replica_set, CallKind, FakeCluster};

    #[tokio::test]
    async fn scale_twice_writes_once() {
        let fake = FakeCluster::new().with_deployment(deployment("ns", "web", 1, "nginx"));
        scale(&fake, "ns", "web", 3).await.expect("first");
        scale(&fake, "ns", "web", 3).await.expect("second");
        assert_eq!(fake.count(CallKind::ReplaceScale), 1);
        assert_eq!(fake.count(CallKind::GetScale), 2);
        let replicas = fake.deployment("ns", "web").and_then(|d| d.spec).and_then(|s| s.replicas);
        assert_eq!(replicas, Some(3));
    }

    #[tokio::test]
    async fn scale_read_failure_skips_write() {
        let fake = FakeCluster::new()
            .with_deployment(deployment("ns", "web", 1, "nginx"))
            .failing(CallKind::GetScale, ClientError::Transport("timeout".into()));
        let err = scale(&fake, "ns", "web", 5).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transport);
        assert_eq!(fake.writes(), 0);
    }

    #[tokio::test]
    async fn scale_write_conflict_is_reported_as_conflict() {
        let fake = FakeCluster::new()
            .with_deployment(deployment("ns", "web", 1, "nginx"))
            .failing(CallKind::ReplaceScale, ClientError::api(409, "Conflict", "the object has been modified"));
        let err = scale(&fake, "ns", "web", 2).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(fake.count(CallKind::ReplaceScale), 1);
    }

    #[tokio::test]
    async fn restart_patches_without_reading() {
        let fake = FakeCluster::new().with_deployment(deployment("ns", "web", 1, "nginx"));
        rollout_restart(&fake, "ns", "web", &restart_patch("2024-01-01T00:00:00Z")).await.expect("restart");
        assert_eq!(fake.calls(), vec![CallKind::PatchDeployment]);
        let ann = fake
            .deployment("ns", "web")
            .and_then(|d| d.spec)
            .and_then(|s| s.template.metadata)
            .and_then(|m| m.annotations)
            .unwrap_or_default();
        assert_eq!(ann.get(RESTARTED_AT_ANNOTATION).map(String::as_str), Some("2024-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn rollback_copies_pod_template() {
        let fake = FakeCluster::new()
            .with_deployment(deployment("ns", "web", 2, "nginx:2"))
            .with_replica_set(replica_set("ns", "web-1", "nginx:1"));
        rollback(&fake, "ns", "web", "web-1").await.expect("rollback");
        assert_eq!(fake.calls(), vec![CallKind::GetReplicaSet, CallKind::GetDeployment, CallKind::ReplaceDeployment]);
        let d = fake.deployment("ns", "web").expect("deployment");
        assert_eq!(deployment_image(&d).as_deref(), Some("nginx:1"));
        assert_eq!(d.spec.and_then(|s| s.replicas), Some(2));
    }

    #[tokio::test]
    async fn rollback_replica_set_read_failure_skips_everything_else() {
        let fake = FakeCluster::new().with_deployment(deployment("ns", "web", 2, "nginx:2"));
        let err = rollback(&fake, "ns", "web", "missing").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transport);
        assert_eq!(fake.calls(), vec![CallKind::GetReplicaSet]);
    }

    #[tokio::test]
    async fn rollback_deployment_read_failure_skips_write() {
        let fake = FakeCluster::new()
            .with_deployment(deployment("ns", "web", 2, "nginx:2"))
            .with_replica_set(replica_set("ns", "web-1", "nginx:1"))
            .failing(CallKind::GetDeployment, ClientError::Transport("reset by peer".into()));
        assert!(rollback(&fake, "ns", "web", "web-1").await.is_err());
        assert_eq!(fake.writes(), 0);
        let d = fake.deployment("ns", "web").expect("deployment");
        assert_eq!(deployment_image(&d).as_deref(), Some("nginx:2"));
    }

    #[tokio::test]
    async fn rollback_to_replica_set_without_template_is_conflict() {
        let mut rs = replica_set("ns", "web-1", "nginx:1");
        if let Some(spec) = rs.spec.as_mut() {
            spec.template = None;
        }
        let fake = FakeCluster::new().with_deployment(deployment("ns", "web", 2, "nginx:2")).with_replica_set(rs);
        let err = rollback(&fake, "ns", "web", "web-1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(fake.calls(), vec![CallKind::GetReplicaSet]);
    }

    #[tokio::test]
    async fn rollback_onto_deployment_without_spec_is_conflict() {
        let mut d = deployment("ns", "web", 2, "nginx:2");
        d.spec = None;
        let fake = FakeCluster::new().with_deployment(d).with_replica_set(replica_set("ns", "web-1", "nginx:1"));
        let err = rollback(&fake, "ns", "web", "web-1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(fake.calls(), vec![CallKind::GetReplicaSet, CallKind::GetDeployment]);
        assert_eq!(fake.writes(), 0);
    }

    #[test]
    fn classify_maps_conflict_and_transport() {
        assert_eq!(classify(ClientError::api(409, "Conflict", "stale")).kind, ErrorKind::Conflict);
        assert_eq!(classify(ClientError::api(503, "ServiceUnavailable", "down")).kind, ErrorKind::Transport);
        assert_eq!(classify(ClientError::Decode("bad json".into())).kind, ErrorKind::Transport);
    }
}
