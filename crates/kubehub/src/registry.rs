//! Cluster registry: immutable mapping from cluster id to its client, built
//! once at startup from a multi-context kubeconfig.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use flotilla_core::{ClusterError, ClusterId};
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::info;

use crate::{ClusterClient, KubeClusterClient};

/// Startup failures. Any of these aborts initialisation; a serving registry
/// never degrades.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("reading kubeconfig: {message}")]
    Kubeconfig { path: Option<PathBuf>, message: String },
    #[error("kubeconfig declares no contexts")]
    NoContexts,
    #[error("context {0} is not declared in kubeconfig")]
    UnknownContext(String),
    #[error("cluster {0} declared more than once")]
    DuplicateCluster(String),
    #[error("building client for context {context}: {message}")]
    Client { context: String, message: String },
}

/// Where to read contexts from and which ones to keep.
#[derive(Debug, Clone, Default)]
pub struct RegistryOptions {
    /// Explicit kubeconfig path; `None` uses the standard lookup (`KUBECONFIG`, `~/.kube/config`).
    pub kubeconfig: Option<PathBuf>,
    /// Restrict to these contexts; empty keeps all of them.
    pub contexts: Vec<String>,
}

/// Read-only after construction; shared by reference across requests.
#[derive(Clone, Default)]
pub struct ClusterRegistry {
    clients: HashMap<ClusterId, Arc<dyn ClusterClient>>,
}

impl std::fmt::Debug for ClusterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRegistry").field("clusters", &self.ids()).finish()
    }
}

impl ClusterRegistry {
    /// Build from explicit clients. Duplicate ids are rejected.
    pub fn from_clients<I>(clients: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (ClusterId, Arc<dyn ClusterClient>)>,
    {
        let mut map = HashMap::new();
        for (id, client) in clients {
            if map.contains_key(&id) {
                return Err(RegistryError::DuplicateCluster(id.to_string()));
            }
            map.insert(id, client);
        }
        Ok(Self { clients: map })
    }

    /// Look up the client for `id`; unregistered ids fail with `UnknownCluster`.
    pub fn resolve(&self, id: &ClusterId) -> Result<Arc<dyn ClusterClient>, ClusterError> {
        self.clients.get(id).cloned().ok_or_else(|| ClusterError::unknown(id.clone()))
    }

    pub fn contains(&self, id: &ClusterId) -> bool { self.clients.contains_key(id) }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<ClusterId> {
        let mut ids: Vec<_> = self.clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize { self.clients.len() }
    pub fn is_empty(&self) -> bool { self.clients.is_empty() }
}

/// Context names to build clients for, in kubeconfig order, after applying
/// the optional `wanted` filter.
pub fn context_names(kubeconfig: &Kubeconfig, wanted: &[String]) -> Result<Vec<String>, RegistryError> {
    let mut names: Vec<String> = Vec::with_capacity(kubeconfig.contexts.len());
    for ctx in &kubeconfig.contexts {
        if names.contains(&ctx.name) {
            return Err(RegistryError::DuplicateCluster(ctx.name.clone()));
        }
        names.push(ctx.name.clone());
    }
    if names.is_empty() {
        return Err(RegistryError::NoContexts);
    }
    if wanted.is_empty() {
        return Ok(names);
    }
    if let Some(missing) = wanted.iter().find(|w| !names.contains(*w)) {
        return Err(RegistryError::UnknownContext(missing.clone()));
    }
    names.retain(|n| wanted.contains(n));
    Ok(names)
}

/// Build one kube client per selected context. Fails fast on the first
/// context that cannot produce a client.
pub async fn load_registry(opts: &RegistryOptions) -> Result<ClusterRegistry, RegistryError> {
    let kubeconfig = match &opts.kubeconfig {
        Some(path) => Kubeconfig::read_from(path)
            .map_err(|e| RegistryError::Kubeconfig { path: Some(path.clone()), message: format!("{}: {}", path.display(), e) })?,
        None => Kubeconfig::read().map_err(|e| RegistryError::Kubeconfig { path: None, message: e.to_string() })?,
    };
    let names = context_names(&kubeconfig, &opts.contexts)?;

    let mut clients: Vec<(ClusterId, Arc<dyn ClusterClient>)> = Vec::with_capacity(names.len());
    for name in names {
        let options = KubeConfigOptions { context: Some(name.clone()), ..Default::default() };
        let config = kube::Config::from_custom_kubeconfig(kubeconfig.clone(), &options)
            .await
            .map_err(|e| RegistryError::Client { context: name.clone(), message: e.to_string() })?;
        let url = config.cluster_url.to_string();
        let client = kube::Client::try_from(config)
            .map_err(|e| RegistryError::Client { context: name.clone(), message: e.to_string() })?;
        info!(context = %name, url = %url, "cluster client ready");
        let client: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client));
        clients.push((ClusterId::from(name), client));
    }
    let registry = ClusterRegistry::from_clients(clients)?;
    info!(clusters = registry.len(), "cluster registry built");
    Ok(registry)
}
