//! Flotilla core types: cluster identity, per-cluster outcomes and errors.

#![forbid(unsafe_code)]

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Message recorded for slots that did not complete before cancellation/deadline.
pub const CANCELLED: &str = "cancelled";

/// Opaque cluster identifier (the kubeconfig context name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(String);

impl ClusterId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ClusterId {
    fn from(v: &str) -> Self { Self(v.to_string()) }
}

impl From<String> for ClusterId {
    fn from(v: String) -> Self { Self(v) }
}

impl AsRef<str> for ClusterId {
    fn as_ref(&self) -> &str { &self.0 }
}

impl Borrow<str> for ClusterId {
    fn borrow(&self) -> &str { &self.0 }
}

/// Normalise requested cluster ids: blanks are trimmed and empty entries
/// dropped. Order and duplicates are preserved.
pub fn cluster_list<'a>(parts: impl IntoIterator<Item = &'a str>) -> Vec<ClusterId> {
    parts.into_iter().map(str::trim).filter(|s| !s.is_empty()).map(ClusterId::from).collect()
}

/// [`cluster_list`] over a comma separated list (`a,b,,c`).
pub fn parse_cluster_list(raw: &str) -> Vec<ClusterId> { cluster_list(raw.split(',')) }

/// Classification of a per-cluster failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Requested identifier is not in the registry; the client was never called.
    UnknownCluster,
    /// Network, auth or API failure (also used for cancellation).
    Transport,
    /// Write rejected because of a concurrent state change.
    Conflict,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownCluster => "unknown_cluster",
            ErrorKind::Transport => "transport",
            ErrorKind::Conflict => "conflict",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Failure returned by an operation definition. It carries no cluster; the
/// executor attributes it to the slot it ran for.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct OpError {
    pub kind: ErrorKind,
    pub message: String,
}

impl OpError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn transport(message: impl Into<String>) -> Self { Self::new(ErrorKind::Transport, message) }

    pub fn conflict(message: impl Into<String>) -> Self { Self::new(ErrorKind::Conflict, message) }

    pub fn cancelled() -> Self { Self::transport(CANCELLED) }

    /// Attribute this failure to `cluster`.
    pub fn at(self, cluster: ClusterId) -> ClusterError {
        ClusterError { cluster, kind: self.kind, message: self.message }
    }
}

/// A failure attributed to exactly one cluster.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind} on cluster {cluster}: {message}")]
pub struct ClusterError {
    pub cluster: ClusterId,
    pub kind: ErrorKind,
    pub message: String,
}

impl ClusterError {
    pub fn unknown(cluster: ClusterId) -> Self {
        let message = format!("cluster {} is not registered", cluster);
        Self { cluster, kind: ErrorKind::UnknownCluster, message }
    }

    pub fn cancelled(cluster: ClusterId) -> Self { OpError::cancelled().at(cluster) }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Transport && self.message == CANCELLED
    }
}

/// Outcome of one operation against one cluster.
pub type Outcome<T> = Result<T, ClusterError>;

/// Ordered per-cluster outcomes of a fan-out.
///
/// Holds exactly one slot per requested identifier, in request order. The
/// executor builds it with [`FanOutResult::from_slots`]; the read and map
/// methods never add, drop or reorder slots.
#[derive(Debug, Clone)]
pub struct FanOutResult<T> {
    slots: Vec<(ClusterId, Outcome<T>)>,
}

impl<T> FanOutResult<T> {
    pub fn from_slots(slots: Vec<(ClusterId, Outcome<T>)>) -> Self { Self { slots } }

    pub fn len(&self) -> usize { self.slots.len() }
    pub fn is_empty(&self) -> bool { self.slots.is_empty() }

    pub fn iter(&self) -> std::slice::Iter<'_, (ClusterId, Outcome<T>)> { self.slots.iter() }

    pub fn clusters(&self) -> impl Iterator<Item = &ClusterId> + '_ {
        self.slots.iter().map(|(c, _)| c)
    }

    pub fn ok_count(&self) -> usize { self.slots.iter().filter(|(_, o)| o.is_ok()).count() }
    pub fn err_count(&self) -> usize { self.slots.len() - self.ok_count() }

    /// Transform successful payloads, keeping every slot in place.
    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> FanOutResult<U> {
        FanOutResult { slots: self.slots.into_iter().map(|(c, o)| (c, o.map(&mut f))).collect() }
    }

    pub fn into_slots(self) -> Vec<(ClusterId, Outcome<T>)> { self.slots }
}

impl<T> IntoIterator for FanOutResult<T> {
    type Item = (ClusterId, Outcome<T>);
    type IntoIter = std::vec::IntoIter<(ClusterId, Outcome<T>)>;

    fn into_iter(self) -> Self::IntoIter { self.slots.into_iter() }
}

impl<'a, T> IntoIterator for &'a FanOutResult<T> {
    type Item = &'a (ClusterId, Outcome<T>);
    type IntoIter = std::slice::Iter<'a, (ClusterId, Outcome<T>)>;

    fn into_iter(self) -> Self::IntoIter { self.slots.iter() }
}

pub mod prelude {
    pub use super::{ClusterError, ClusterId, ErrorKind, FanOutResult, OpError, Outcome};
}
