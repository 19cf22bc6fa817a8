//! In-memory [`ClusterClient`] fakes that record every call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::autoscaling::v1::{Scale, ScaleSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::{ClientError, ClientResult, ClusterClient};

/// Which capability method was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    ListDeployments,
    ListReplicaSets,
    ListServices,
    GetDeployment,
    GetReplicaSet,
    PatchDeployment,
    ReplaceDeployment,
    GetScale,
    ReplaceScale,
}

impl CallKind {
    pub fn is_write(&self) -> bool {
        matches!(self, CallKind::PatchDeployment | CallKind::ReplaceDeployment | CallKind::ReplaceScale)
    }
}

/// Tracks how many calls are in flight across any number of fakes.
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn peak(&self) -> usize { self.peak.load(Ordering::SeqCst) }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) { self.current.fetch_sub(1, Ordering::SeqCst); }
}

#[derive(Default)]
struct State {
    deployments: Vec<Deployment>,
    replica_sets: Vec<ReplicaSet>,
    services: Vec<Service>,
}

/// Fake cluster backed by plain vectors. Failures can be injected per call
/// kind or for every call.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
    calls: Mutex<Vec<CallKind>>,
    failures: HashMap<CallKind, ClientError>,
    fail_all: Option<ClientError>,
    delay: Option<Duration>,
    panic_on: Option<CallKind>,
    gauge: Option<Arc<ConcurrencyGauge>>,
    own_gauge: Arc<ConcurrencyGauge>,
}

impl FakeCluster {
    pub fn new() -> Self { Self::default() }

    pub fn with_deployment(self, d: Deployment) -> Self {
        self.lock_state().deployments.push(d);
        self
    }

    pub fn with_replica_set(self, rs: ReplicaSet) -> Self {
        self.lock_state().replica_sets.push(rs);
        self
    }

    pub fn with_service(self, s: Service) -> Self {
        self.lock_state().services.push(s);
        self
    }

    /// Fail every call of `kind` with `err`.
    pub fn failing(mut self, kind: CallKind, err: ClientError) -> Self {
        self.failures.insert(kind, err);
        self
    }

    /// Fail every call with `err`.
    pub fn failing_all(mut self, err: ClientError) -> Self {
        self.fail_all = Some(err);
        self
    }

    /// Panic when `kind` is invoked.
    pub fn panicking(mut self, kind: CallKind) -> Self {
        self.panic_on = Some(kind);
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Report in-flight calls to a gauge shared with other fakes.
    pub fn with_gauge(mut self, gauge: Arc<ConcurrencyGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    pub fn shared(self) -> Arc<dyn ClusterClient> { Arc::new(self) }

    pub fn calls(&self) -> Vec<CallKind> { self.calls.lock().map(|c| c.clone()).unwrap_or_default() }

    pub fn count(&self, kind: CallKind) -> usize { self.calls().into_iter().filter(|c| *c == kind).count() }

    pub fn writes(&self) -> usize { self.calls().into_iter().filter(|c| c.is_write()).count() }

    /// Highest number of overlapping calls seen on this fake.
    pub fn peak_in_flight(&self) -> usize { self.own_gauge.peak() }

    /// Current state of a deployment, if present.
    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.lock_state().deployments.iter().find(|d| is(&d.metadata, namespace, name)).cloned()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn enter(&self, kind: CallKind) -> ClientResult<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(kind);
        }
        self.own_gauge.enter();
        if let Some(g) = &self.gauge { g.enter(); }
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        self.own_gauge.exit();
        if let Some(g) = &self.gauge { g.exit(); }
        if self.panic_on == Some(kind) {
            panic!("fake cluster panicked on {:?}", kind);
        }
        if let Some(e) = &self.fail_all {
            return Err(e.clone());
        }
        if let Some(e) = self.failures.get(&kind) {
            return Err(e.clone());
        }
        Ok(())
    }
}

fn is(meta: &ObjectMeta, namespace: &str, name: &str) -> bool {
    meta.name.as_deref() == Some(name) && meta.namespace.as_deref() == Some(namespace)
}

fn in_ns(meta: &ObjectMeta, namespace: Option<&str>) -> bool {
    namespace.map(|ns| meta.namespace.as_deref() == Some(ns)).unwrap_or(true)
}

/// RFC 7386 JSON merge patch.
fn merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(t), serde_json::Value::Object(p)) => {
            for (k, v) in p {
                if v.is_null() {
                    t.remove(k);
                } else {
                    merge(t.entry(k.clone()).or_insert(serde_json::Value::Null), v);
                }
            }
        }
        (t, p) => {
            if p.is_object() {
                *t = serde_json::Value::Object(Default::default());
                merge(t, p);
            } else {
                *t = p.clone();
            }
        }
    }
}

#[async_trait::async_trait]
impl ClusterClient for FakeCluster {
    async fn list_deployments(&self, namespace: Option<&str>) -> ClientResult<Vec<Deployment>> {
        self.enter(CallKind::ListDeployments).await?;
        Ok(self.lock_state().deployments.iter().filter(|d| in_ns(&d.metadata, namespace)).cloned().collect())
    }

    async fn list_replica_sets(&self, namespace: Option<&str>) -> ClientResult<Vec<ReplicaSet>> {
        self.enter(CallKind::ListReplicaSets).await?;
        Ok(self.lock_state().replica_sets.iter().filter(|r| in_ns(&r.metadata, namespace)).cloned().collect())
    }

    async fn list_services(&self, namespace: Option<&str>) -> ClientResult<Vec<Service>> {
        self.enter(CallKind::ListServices).await?;
        Ok(self.lock_state().services.iter().filter(|s| in_ns(&s.metadata, namespace)).cloned().collect())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> ClientResult<Deployment> {
        self.enter(CallKind::GetDeployment).await?;
        self.deployment(namespace, name)
            .ok_or_else(|| ClientError::not_found(format!("deployment {}/{}", namespace, name)))
    }

    async fn get_replica_set(&self, namespace: &str, name: &str) -> ClientResult<ReplicaSet> {
        self.enter(CallKind::GetReplicaSet).await?;
        self.lock_state()
            .replica_sets
            .iter()
            .find(|r| is(&r.metadata, namespace, name))
            .cloned()
            .ok_or_else(|| ClientError::not_found(format!("replicaset {}/{}", namespace, name)))
    }

    async fn patch_deployment(&self, namespace: &str, name: &str, merge_patch: &serde_json::Value) -> ClientResult<Deployment> {
        self.enter(CallKind::PatchDeployment).await?;
        let mut state = self.lock_state();
        let slot = state
            .deployments
            .iter_mut()
            .find(|d| is(&d.metadata, namespace, name))
            .ok_or_else(|| ClientError::not_found(format!("deployment {}/{}", namespace, name)))?;
        let mut raw = serde_json::to_value(&*slot)?;
        merge(&mut raw, merge_patch);
        *slot = serde_json::from_value(raw)?;
        Ok(slot.clone())
    }

    async fn replace_deployment(&self, namespace: &str, name: &str, deployment: &Deployment) -> ClientResult<Deployment> {
        self.enter(CallKind::ReplaceDeployment).await?;
        let mut state = self.lock_state();
        let slot = state
            .deployments
            .iter_mut()
            .find(|d| is(&d.metadata, namespace, name))
            .ok_or_else(|| ClientError::not_found(format!("deployment {}/{}", namespace, name)))?;
        *slot = deployment.clone();
        Ok(slot.clone())
    }

    async fn get_scale(&self, namespace: &str, name: &str) -> ClientResult<Scale> {
        self.enter(CallKind::GetScale).await?;
        let d = self
            .deployment(namespace, name)
            .ok_or_else(|| ClientError::not_found(format!("deployment {}/{}", namespace, name)))?;
        let replicas = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        Ok(Scale {
            metadata: ObjectMeta { name: Some(name.to_string()), namespace: Some(namespace.to_string()), ..Default::default() },
            spec: Some(ScaleSpec { replicas: Some(replicas) }),
            status: None,
        })
    }

    async fn replace_scale(&self, namespace: &str, name: &str, scale: &Scale) -> ClientResult<Scale> {
        self.enter(CallKind::ReplaceScale).await?;
        let mut state = self.lock_state();
        let slot = state
            .deployments
            .iter_mut()
            .find(|d| is(&d.metadata, namespace, name))
            .ok_or_else(|| ClientError::not_found(format!("deployment {}/{}", namespace, name)))?;
        let replicas = scale.spec.as_ref().and_then(|s| s.replicas);
        slot.spec.get_or_insert_with(Default::default).replicas = replicas;
        Ok(scale.clone())
    }
}

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta { name: Some(name.to_string()), namespace: Some(namespace.to_string()), ..Default::default() }
}

fn template(image: &str) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: None,
        spec: Some(PodSpec {
            containers: vec![Container { name: "app".into(), image: Some(image.to_string()), ..Default::default() }],
            ..Default::default()
        }),
    }
}

/// Deployment with one container running `image`.
pub fn deployment(namespace: &str, name: &str, replicas: i32, image: &str) -> Deployment {
    Deployment {
        metadata: meta(namespace, name),
        spec: Some(DeploymentSpec { replicas: Some(replicas), template: template(image), ..Default::default() }),
        status: None,
    }
}

/// ReplicaSet whose pod template runs `image`.
pub fn replica_set(namespace: &str, name: &str, image: &str) -> ReplicaSet {
    ReplicaSet {
        metadata: meta(namespace, name),
        spec: Some(ReplicaSetSpec { template: Some(template(image)), ..Default::default() }),
        status: None,
    }
}

pub fn service(namespace: &str, name: &str) -> Service {
    Service { metadata: meta(namespace, name), ..Default::default() }
}

/// Image of the first container in a deployment's pod template.
pub fn deployment_image(d: &Deployment) -> Option<String> {
    d.spec.as_ref()?.template.spec.as_ref()?.containers.first()?.image.clone()
}
