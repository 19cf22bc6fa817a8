use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use flotilla_api::{
    CancellationToken, FanOutOptions, GatewayApi, InProcApi, ListRequest, ResponseMeta, RollbackRequest,
    RolloutRestartRequest, ScaleRequest, Status,
};
use flotilla_core::parse_cluster_list;
use flotilla_fanout::{FanOutConfig, DEFAULT_CONCURRENCY};
use flotilla_kubehub::{load_registry, RegistryOptions};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};

mod http;
mod render;

#[derive(Parser, Debug)]
#[command(name = "flotillactl", version, about = "Run Kubernetes operations across many clusters")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubeconfig file (default: KUBECONFIG or ~/.kube/config)
    #[arg(long = "kubeconfig", global = true, env = "FLOTILLA_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Contexts to register as clusters (default: every context in the kubeconfig)
    #[arg(long = "context", global = true, env = "FLOTILLA_CONTEXTS", value_delimiter = ',')]
    contexts: Vec<String>,

    /// Clusters worked on at once
    #[arg(long = "concurrency", global = true, env = "FLOTILLA_FANOUT_CONC", default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Deadline for a whole fan-out; unfinished clusters report "cancelled"
    #[arg(long = "timeout-secs", global = true, env = "FLOTILLA_FANOUT_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Kubernetes namespace (lists: all namespaces when omitted)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered clusters
    Clusters,
    /// List deployments in each cluster
    Deployments {
        /// Comma separated cluster ids, e.g. "prod-eu,prod-us"
        #[arg(long = "clusters")]
        clusters: String,
    },
    /// List replicasets in each cluster
    Replicasets {
        #[arg(long = "clusters")]
        clusters: String,
    },
    /// List services in each cluster
    Services {
        #[arg(long = "clusters")]
        clusters: String,
    },
    /// Rollout-restart a deployment in each cluster
    Restart {
        deployment: String,
        #[arg(long = "clusters")]
        clusters: String,
    },
    /// Scale a deployment in each cluster
    Scale {
        deployment: String,
        #[arg(long = "replicas")]
        replicas: i32,
        #[arg(long = "clusters")]
        clusters: String,
    },
    /// Roll a deployment back to a ReplicaSet's pod template
    Rollback {
        deployment: String,
        #[arg(long = "replica-set")]
        replica_set: String,
        #[arg(long = "clusters")]
        clusters: String,
    },
    /// Serve the HTTP gateway
    Serve {
        #[arg(long = "addr", env = "FLOTILLA_ADDR", default_value = "0.0.0.0:8080")]
        addr: SocketAddr,
    },
}

fn init_tracing() {
    let env = std::env::var("FLOTILLA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FLOTILLA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid FLOTILLA_METRICS_ADDR; expected host:port");
        }
    }
}

/// Drive `fut` to completion; Ctrl-C cancels `token` so the fan-out stops
/// starting new clusters and finished ones are still reported.
async fn with_ctrl_c<T>(token: CancellationToken, fut: impl Future<Output = T>) -> T {
    let watcher = tokio::spawn({
        let token = token.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received; cancelling fan-out");
                token.cancel();
            }
        }
    });
    let out = fut.await;
    watcher.abort();
    out
}

fn print_json<T: Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn print_lines(lines: Vec<String>, meta: &ResponseMeta) {
    for l in lines {
        println!("{}", l);
    }
    match meta.status() {
        Status::Failed => {
            warn!(requested = meta.requested, "all clusters failed");
            eprintln!("warning: all {} clusters failed", meta.requested);
        }
        Status::Partial => eprintln!("{}", render::meta_line(meta)),
        Status::Complete => {}
    }
}

async fn run(api: Arc<dyn GatewayApi>, command: Commands, namespace: Option<String>, output: Output) -> Result<()> {
    let token = CancellationToken::new();
    let opts = FanOutOptions::with_cancel(token.clone());
    let ns = namespace.clone().unwrap_or_default();
    match command {
        Commands::Clusters => {
            let resp = api.clusters().await?;
            match output {
                Output::Human => resp.clusters.iter().for_each(|c| println!("{}", c)),
                Output::Json => print_json(&resp)?,
            }
        }
        Commands::Deployments { clusters } => {
            info!(clusters = %clusters, ns = ?namespace, "deployments invoked");
            let resp = with_ctrl_c(token, api.deployments(ListRequest::from_csv(&clusters, namespace), opts)).await?;
            match output {
                Output::Human => print_lines(render::map_lines(&resp, "deployments"), &resp.meta),
                Output::Json => print_json(&resp)?,
            }
        }
        Commands::Replicasets { clusters } => {
            info!(clusters = %clusters, ns = ?namespace, "replicasets invoked");
            let resp = with_ctrl_c(token, api.replica_sets(ListRequest::from_csv(&clusters, namespace), opts)).await?;
            match output {
                Output::Human => print_lines(render::map_lines(&resp, "replicasets"), &resp.meta),
                Output::Json => print_json(&resp)?,
            }
        }
        Commands::Services { clusters } => {
            info!(clusters = %clusters, ns = ?namespace, "services invoked");
            let resp = with_ctrl_c(token, api.services(ListRequest::from_csv(&clusters, namespace), opts)).await?;
            match output {
                Output::Human => print_lines(render::services_lines(&resp), &resp.meta),
                Output::Json => print_json(&resp)?,
            }
        }
        Commands::Restart { deployment, clusters } => {
            info!(deployment = %deployment, clusters = %clusters, "restart invoked");
            let req = RolloutRestartRequest { deployment_name: deployment, namespace: ns, clusters: parse_cluster_list(&clusters) };
            let resp = with_ctrl_c(token, api.restart(req, opts)).await?;
            match output {
                Output::Human => print_lines(render::mutation_lines(&resp), &resp.meta),
                Output::Json => print_json(&resp)?,
            }
        }
        Commands::Scale { deployment, replicas, clusters } => {
            info!(deployment = %deployment, replicas, clusters = %clusters, "scale invoked");
            let req = ScaleRequest { deployment_name: deployment, namespace: ns, clusters: parse_cluster_list(&clusters), replicas };
            let resp = with_ctrl_c(token, api.scale(req, opts)).await?;
            match output {
                Output::Human => print_lines(render::mutation_lines(&resp), &resp.meta),
                Output::Json => print_json(&resp)?,
            }
        }
        Commands::Rollback { deployment, replica_set, clusters } => {
            info!(deployment = %deployment, replica_set = %replica_set, clusters = %clusters, "rollback invoked");
            let req = RollbackRequest {
                deployment_name: deployment,
                replica_set_name: replica_set,
                namespace: ns,
                clusters: parse_cluster_list(&clusters),
            };
            let resp = with_ctrl_c(token, api.rollback(req, opts)).await?;
            match output {
                Output::Human => print_lines(render::mutation_lines(&resp), &resp.meta),
                Output::Json => print_json(&resp)?,
            }
        }
        Commands::Serve { addr } => http::serve(api, addr).await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let registry = load_registry(&RegistryOptions { kubeconfig: cli.kubeconfig.clone(), contexts: cli.contexts.clone() })
        .await
        .context("building cluster registry")?;
    let config = FanOutConfig { concurrency: cli.concurrency.max(1), deadline: cli.timeout_secs.map(Duration::from_secs) };
    info!(clusters = registry.len(), concurrency = config.concurrency, deadline_secs = ?cli.timeout_secs, "gateway ready");
    let api: Arc<dyn GatewayApi> = Arc::new(InProcApi::from_registry(Arc::new(registry), config));

    run(api, cli.command, cli.namespace, cli.output).await
}
