//! Response shapes assembled from a [`FanOutResult`].
//!
//! Every shape carries a [`Summary`] whose `succeeded + failed` equals the
//! number of requested slots, so callers can tell a partial failure from a
//! total one without re-counting.

use std::collections::BTreeMap;

use flotilla_core::{ClusterError, ClusterId, ErrorKind, FanOutResult};
use serde::{Deserialize, Serialize};

/// Wire form of a per-cluster failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ClusterError> for ErrorRecord {
    fn from(e: &ClusterError) -> Self { Self { kind: e.kind, message: e.message.clone() } }
}

impl From<ClusterError> for ErrorRecord {
    fn from(e: ClusterError) -> Self { Self { kind: e.kind, message: e.message } }
}

/// Aggregate condition across all requested clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Every cluster succeeded (also an empty request).
    Complete,
    /// Some clusters succeeded, some failed.
    Partial,
    /// Every requested cluster failed.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Summary {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub partial: bool,
    pub all_failed: bool,
}

impl Summary {
    pub fn of<T>(result: &FanOutResult<T>) -> Self {
        let requested = result.len();
        let succeeded = result.ok_count();
        let failed = requested - succeeded;
        Self {
            requested,
            succeeded,
            failed,
            partial: succeeded > 0 && failed > 0,
            all_failed: requested > 0 && succeeded == 0,
        }
    }

    pub fn status(&self) -> Status {
        if self.all_failed {
            Status::Failed
        } else if self.partial {
            Status::Partial
        } else {
            Status::Complete
        }
    }
}

/// Map shape: payloads keyed by cluster, failures keyed by cluster.
///
/// A cluster requested more than once lands in exactly one of the two maps:
/// any failed slot puts it in `errors` (first failure kept), otherwise the
/// first successful payload is kept.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterMap<T> {
    pub items: BTreeMap<ClusterId, T>,
    pub errors: BTreeMap<ClusterId, ErrorRecord>,
    pub summary: Summary,
}

impl<T> ClusterMap<T> {
    pub fn assemble(result: FanOutResult<T>) -> Self {
        let summary = Summary::of(&result);
        let mut items = BTreeMap::new();
        let mut errors = BTreeMap::new();
        for (cluster, outcome) in result {
            match outcome {
                Ok(v) => {
                    if !errors.contains_key(&cluster) {
                        items.entry(cluster).or_insert(v);
                    }
                }
                Err(e) => {
                    items.remove(&cluster);
                    errors.entry(cluster).or_insert_with(|| ErrorRecord::from(e));
                }
            }
        }
        Self { items, errors, summary }
    }
}

/// One row of the indexed shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterRecord<T> {
    pub cluster: ClusterId,
    pub payload: Option<T>,
    pub error: Option<ErrorRecord>,
}

/// Indexed shape: one record per requested slot, in request order.
#[derive(Debug, Clone, Serialize)]
pub struct Indexed<T> {
    pub records: Vec<ClusterRecord<T>>,
    pub summary: Summary,
}

impl<T> Indexed<T> {
    pub fn assemble(result: FanOutResult<T>) -> Self {
        let summary = Summary::of(&result);
        let records = result
            .into_iter()
            .map(|(cluster, outcome)| match outcome {
                Ok(v) => ClusterRecord { cluster, payload: Some(v), error: None },
                Err(e) => ClusterRecord { cluster, payload: None, error: Some(e.into()) },
            })
            .collect();
        Self { records, summary }
    }
}

/// Row of the per-cluster error list used by mutating operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub cluster: ClusterId,
    pub error: Option<ErrorRecord>,
}

/// Per-cluster error list: one row per slot, `error: None` on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statuses {
    pub results: Vec<ClusterStatus>,
    pub summary: Summary,
}

impl Statuses {
    pub fn assemble<T>(result: FanOutResult<T>) -> Self {
        let summary = Summary::of(&result);
        let results = result
            .into_iter()
            .map(|(cluster, outcome)| ClusterStatus { cluster, error: outcome.err().map(ErrorRecord::from) })
            .collect();
        Self { results, summary }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::OpError;

    fn slot(id: &str, ok: Option<u32>) -> (ClusterId, Result<u32, ClusterError>) {
        let cluster = ClusterId::from(id);
        match ok {
            Some(v) => (cluster, Ok(v)),
            None => (cluster.clone(), Err(OpError::transport(format!("{} down", id)).at(cluster))),
        }
    }

    #[test]
    fn summary_distinguishes_partial_and_total_failure() {
        let partial = FanOutResult::from_slots(vec![slot("a", Some(1)), slot("b", None)]);
        let s = Summary::of(&partial);
        assert_eq!((s.requested, s.succeeded, s.failed), (2, 1, 1));
        assert_eq!(s.status(), Status::Partial);

        let total = FanOutResult::from_slots(vec![slot("a", None), slot("b", None)]);
        assert_eq!(Summary::of(&total).status(), Status::Failed);

        let empty: FanOutResult<u32> = FanOutResult::from_slots(vec![]);
        assert_eq!(Summary::of(&empty).status(), Status::Complete);
    }

    #[test]
    fn map_shape_keeps_every_failure() {
        let r = FanOutResult::from_slots(vec![slot("a", Some(1)), slot("b", None), slot("c", None)]);
        let m = ClusterMap::assemble(r);
        assert_eq!(m.items.len(), 1);
        let failed: Vec<_> = m.errors.keys().map(|c| c.as_str()).collect();
        assert_eq!(failed, vec!["b", "c"]);
        assert_eq!(m.errors[&ClusterId::from("c")].message, "c down");
        assert_eq!(m.summary.succeeded + m.summary.failed, 3);
    }

    #[test]
    fn map_shape_duplicate_failure_wins_over_success() {
        let cluster = ClusterId::from("a");
        let r = FanOutResult::from_slots(vec![
            (cluster.clone(), Ok(1)),
            (cluster.clone(), Err(OpError::transport("flaky").at(cluster.clone()))),
            (cluster.clone(), Ok(3)),
        ]);
        let m = ClusterMap::assemble(r);
        assert!(m.items.is_empty());
        assert_eq!(m.errors.len(), 1);
        assert_eq!(m.summary.requested, 3);
    }

    #[test]
    fn indexed_shape_follows_request_order() {
        let r = FanOutResult::from_slots(vec![slot("b", None), slot("a", Some(7)), slot("b", Some(8))]);
        let idx = Indexed::assemble(r);
        let rows: Vec<_> = idx.records.iter().map(|r| (r.cluster.as_str(), r.payload, r.error.is_some())).collect();
        assert_eq!(rows, vec![("b", None, true), ("a", Some(7), false), ("b", Some(8), false)]);
    }

    #[test]
    fn statuses_serialize_null_error_on_success() {
        let r = FanOutResult::from_slots(vec![slot("a", Some(1)), slot("b", None)]);
        let v = serde_json::to_value(Statuses::assemble(r)).expect("json");
        assert_eq!(v["results"][0], serde_json::json!({"cluster": "a", "error": null}));
        assert_eq!(v["results"][1]["error"]["kind"], "transport");
        assert_eq!(v["summary"]["partial"], true);
    }
}
