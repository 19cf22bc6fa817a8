//! Flotilla fan-out: run one operation against many clusters with bounded
//! concurrency, isolate per-cluster failures and hand back outcomes in
//! request order.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flotilla_core::{ClusterError, ClusterId, FanOutResult, OpError, Outcome};
use flotilla_kubehub::{ClusterClient, ClusterRegistry};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

pub mod aggregate;

pub use aggregate::{ClusterMap, ClusterRecord, ClusterStatus, ErrorRecord, Indexed, Statuses, Status, Summary};

/// Default number of clusters worked on at once.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Process-wide executor settings.
#[derive(Debug, Clone)]
pub struct FanOutConfig {
    /// Upper bound on concurrently running per-cluster operations; 1 runs sequentially.
    pub concurrency: usize,
    /// Default deadline for a whole fan-out.
    pub deadline: Option<Duration>,
}

impl Default for FanOutConfig {
    fn default() -> Self { Self { concurrency: DEFAULT_CONCURRENCY, deadline: None } }
}

/// Per-request overrides.
#[derive(Debug, Clone, Default)]
pub struct FanOutOptions {
    /// Cancelling this token stops the fan-out; finished slots are kept.
    pub cancel: Option<CancellationToken>,
    /// Overrides [`FanOutConfig::deadline`].
    pub deadline: Option<Duration>,
    /// Overrides [`FanOutConfig::concurrency`].
    pub concurrency: Option<usize>,
}

impl FanOutOptions {
    pub fn with_cancel(cancel: CancellationToken) -> Self { Self { cancel: Some(cancel), ..Default::default() } }
}

/// Fan-out executor over a read-only [`ClusterRegistry`].
#[derive(Debug, Clone)]
pub struct FanOut {
    registry: Arc<ClusterRegistry>,
    config: FanOutConfig,
}

impl FanOut {
    pub fn new(registry: Arc<ClusterRegistry>, config: FanOutConfig) -> Self { Self { registry, config } }

    pub fn registry(&self) -> &ClusterRegistry { &self.registry }

    pub fn config(&self) -> &FanOutConfig { &self.config }

    /// Run `op` once per entry of `clusters` and return one outcome per entry,
    /// in the same order.
    ///
    /// Unknown ids get `UnknownCluster` without invoking `op`. Failures and
    /// panics of one cluster are recorded in its slot only. On cancellation or
    /// deadline no further calls start and unfinished slots become
    /// `Transport("cancelled")`. Duplicate ids in one request never overlap on
    /// the same client.
    pub async fn run<T, F, Fut>(&self, op_name: &'static str, clusters: &[ClusterId], opts: FanOutOptions, op: F) -> FanOutResult<T>
    where
        F: Fn(Arc<dyn ClusterClient>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, OpError>> + Send,
        T: Send,
    {
        let request = uuid::Uuid::new_v4();
        let span = tracing::info_span!("fanout", op = op_name, request = %request);
        self.run_inner(op_name, clusters, opts, op).instrument(span).await
    }

    async fn run_inner<T, F, Fut>(&self, op_name: &'static str, clusters: &[ClusterId], opts: FanOutOptions, op: F) -> FanOutResult<T>
    where
        F: Fn(Arc<dyn ClusterClient>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, OpError>> + Send,
        T: Send,
    {
        let t0 = Instant::now();
        let concurrency = opts.concurrency.unwrap_or(self.config.concurrency).max(1);
        let deadline = opts.deadline.or(self.config.deadline);
        let cancel = opts.cancel.unwrap_or_default();
        counter!("fanout_requests_total", 1, "op" => op_name);
        info!(clusters = clusters.len(), concurrency, deadline_ms = ?deadline.map(|d| d.as_millis()), "fan-out start");

        let mut slots: Vec<Option<Outcome<T>>> = clusters.iter().map(|_| None).collect();
        let mut locks: HashMap<ClusterId, Arc<tokio::sync::Mutex<()>>> = HashMap::new();
        let mut work = Vec::with_capacity(clusters.len());
        for (idx, id) in clusters.iter().enumerate() {
            match self.registry.resolve(id) {
                Ok(client) => {
                    let lock = locks.entry(id.clone()).or_default().clone();
                    work.push((idx, id.clone(), client, lock));
                }
                Err(e) => {
                    warn!(cluster = %id, "unknown cluster requested");
                    slots[idx] = Some(Err(e));
                }
            }
        }

        let op = &op;
        let token = &cancel;
        let calls: Vec<BoxFuture<'_, (usize, Outcome<T>)>> = work
            .into_iter()
            .map(move |(idx, id, client, lock)| {
                async move {
                    let _exclusive = lock.lock().await;
                    if token.is_cancelled() {
                        return (idx, Err(ClusterError::cancelled(id)));
                    }
                    let c0 = Instant::now();
                    let outcome = match AssertUnwindSafe(op(client)).catch_unwind().await {
                        Ok(Ok(v)) => Ok(v),
                        Ok(Err(e)) => Err(e.at(id)),
                        Err(_) => Err(OpError::transport("operation panicked").at(id)),
                    };
                    histogram!("fanout_cluster_ms", c0.elapsed().as_secs_f64() * 1000.0, "op" => op_name);
                    (idx, outcome)
                }
                .boxed()
            })
            .collect();
        let pending = futures::stream::iter(calls).buffer_unordered(concurrency);
        futures::pin_mut!(pending);

        let expired = async move {
            match deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        futures::pin_mut!(expired);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(took_ms = %t0.elapsed().as_millis(), "fan-out cancelled");
                    break;
                }
                _ = &mut expired => {
                    warn!(took_ms = %t0.elapsed().as_millis(), "fan-out deadline reached");
                    break;
                }
                next = pending.next() => match next {
                    Some((idx, outcome)) => {
                        if let Err(e) = &outcome {
                            warn!(cluster = %e.cluster, kind = %e.kind, error = %e.message, "cluster operation failed");
                        }
                        slots[idx] = Some(outcome);
                    }
                    None => break,
                },
            }
        }

        let result = FanOutResult::from_slots(
            clusters
                .iter()
                .zip(slots)
                .map(|(id, slot)| (id.clone(), slot.unwrap_or_else(|| Err(ClusterError::cancelled(id.clone())))))
                .collect(),
        );
        let (ok, failed) = (result.ok_count(), result.err_count());
        let cancelled = result.iter().filter(|(_, o)| o.as_ref().err().is_some_and(ClusterError::is_cancelled)).count();
        counter!("fanout_cluster_outcomes_total", ok as u64, "op" => op_name, "result" => "ok");
        counter!("fanout_cluster_outcomes_total", failed as u64, "op" => op_name, "result" => "err");
        histogram!("fanout_total_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op_name);
        info!(ok, failed, cancelled, took_ms = %t0.elapsed().as_millis(), "fan-out done");
        result
    }
}
