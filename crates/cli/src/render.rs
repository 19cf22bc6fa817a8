//! Human output: one line per cluster, `cluster • ok|error: msg`.

use flotilla_api::{MapResponse, MutationResponse, ResponseMeta, ServicesResponse};
use flotilla_core::ClusterId;
use flotilla_fanout::ErrorRecord;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::Metadata;

fn error_line(cluster: &ClusterId, e: &ErrorRecord) -> String { format!("{} • error: {}: {}", cluster, e.kind, e.message) }

fn object_ref(meta: &ObjectMeta) -> String {
    let name = meta.name.as_deref().unwrap_or("-");
    match meta.namespace.as_deref() {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    }
}

fn object_lines<T: Metadata<Ty = ObjectMeta>>(items: &[T]) -> impl Iterator<Item = String> + '_ {
    items.iter().map(|o| format!("    {}", object_ref(o.metadata())))
}

/// Map shape, sorted by cluster; successes list their objects indented.
pub fn map_lines<T: Metadata<Ty = ObjectMeta>>(resp: &MapResponse<T>, noun: &str) -> Vec<String> {
    let mut clusters: Vec<&ClusterId> = resp.items.keys().chain(resp.errors.keys()).collect();
    clusters.sort();
    let mut out = Vec::new();
    for c in clusters {
        if let Some(e) = resp.errors.get(c) {
            out.push(error_line(c, e));
        } else if let Some(items) = resp.items.get(c) {
            out.push(format!("{} • ok: {} {}", c, items.len(), noun));
            out.extend(object_lines(items));
        }
    }
    out
}

pub fn services_lines(resp: &ServicesResponse) -> Vec<String> {
    let mut out = Vec::new();
    for r in &resp.results {
        match (&r.error, &r.services) {
            (Some(e), _) => out.push(error_line(&r.cluster, e)),
            (None, Some(svcs)) => {
                out.push(format!("{} • ok: {} services", r.cluster, svcs.len()));
                out.extend(object_lines(svcs));
            }
            (None, None) => out.push(format!("{} • ok", r.cluster)),
        }
    }
    out
}

pub fn mutation_lines(resp: &MutationResponse) -> Vec<String> {
    resp.results
        .iter()
        .map(|r| match &r.error {
            Some(e) => error_line(&r.cluster, e),
            None => format!("{} • ok", r.cluster),
        })
        .collect()
}

pub fn meta_line(meta: &ResponseMeta) -> String {
    format!("{}/{} clusters succeeded", meta.succeeded, meta.requested)
}
