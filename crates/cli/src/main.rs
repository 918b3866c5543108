//! Steer CLI: drive the controller against an in-memory simulated world.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use steer_controller::{Controller, EventStreams, Reconciler};
use steer_core::{DeployConfig, Keyed, ObjectKey, ObjectMeta, Pod, ReplicaController, OWNER_ANNOTATION};
use steer_store::{MemStore, ObjectView};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "steerctl", version, about = "Steer controller demo")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller over a seeded in-memory world with scripted churn
    Demo {
        /// Number of reconcile workers
        #[arg(long = "workers", default_value_t = 2)]
        workers: usize,
        /// Number of seeded deploy configs
        #[arg(long = "configs", default_value_t = 3)]
        configs: usize,
        /// Stop after this many seconds (default: run until Ctrl-C)
        #[arg(long = "duration-secs")]
        duration_secs: Option<u64>,
    },
}

fn init_tracing() {
    let env = std::env::var("STEER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STEER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid STEER_METRICS_ADDR; expected host:port");
        }
    }
}

/// Logs each invocation and pretends to converge the rollout.
struct LoggingReconciler;

#[async_trait::async_trait]
impl Reconciler for LoggingReconciler {
    async fn reconcile(&self, config: Arc<DeployConfig>) -> Result<()> {
        info!(key = %config.key(), rv = %config.meta.resource_version, replicas = config.replicas, "reconciling");
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(())
    }
}

fn owned_meta(ns: &str, name: &str, rv: &str, owner: &str) -> ObjectMeta {
    let mut annotations = BTreeMap::new();
    annotations.insert(OWNER_ANNOTATION.to_string(), owner.to_string());
    ObjectMeta { namespace: ns.into(), name: name.into(), resource_version: rv.into(), annotations }
}

async fn run_demo(workers: usize, configs_n: usize, duration_secs: Option<u64>) -> Result<()> {
    let configs: Arc<MemStore<DeployConfig>> = MemStore::new();
    let replicas: Arc<MemStore<ReplicaController>> = MemStore::new();
    let pods: Arc<MemStore<Pod>> = MemStore::new();

    let streams = EventStreams {
        configs: configs.subscribe(),
        replicas: replicas.subscribe(),
        pods: pods.subscribe(),
    };

    // Seed the world, then declare the initial snapshot complete.
    for i in 0..configs_n.max(1) {
        let name = format!("app-{i}");
        configs.apply(DeployConfig {
            meta: ObjectMeta { namespace: "demo".into(), name: name.clone(), resource_version: "1".into(), ..Default::default() },
            replicas: 2,
            latest_version: 1,
        });
        replicas.apply(ReplicaController { meta: owned_meta("demo", &format!("{name}-1"), "1", &name), replicas: 2 });
        pods.apply(Pod { meta: owned_meta("demo", &format!("{name}-1-x"), "1", &name), phase: "Running".into() });
    }
    configs.mark_synced();
    replicas.mark_synced();
    pods.mark_synced();
    info!(configs = configs.len(), replicas = replicas.len(), pods = pods.len(), "world seeded");

    let controller = Controller::new(
        Arc::clone(&configs) as Arc<dyn ObjectView<DeployConfig>>,
        Arc::clone(&replicas) as Arc<dyn ObjectView<ReplicaController>>,
        Arc::clone(&pods) as Arc<dyn ObjectView<Pod>>,
        Arc::new(LoggingReconciler),
    );
    let stop = CancellationToken::new();
    let run = tokio::spawn(Arc::clone(&controller).run(workers, streams, stop.clone()));

    // Scripted churn: bump a config, touch a pod, and eventually lose one
    // to a tombstone so every router path gets exercised.
    let churn = {
        let configs = Arc::clone(&configs);
        let pods = Arc::clone(&pods);
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(2));
            let mut round: u64 = 0;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tick.tick() => {}
                }
                round += 1;
                let name = format!("app-{}", round as usize % configs_n.max(1));
                if let Ok(Some(current)) = configs.get(&ObjectKey::new("demo", &name)) {
                    let mut next = (*current).clone();
                    next.meta.resource_version = (round + 1).to_string();
                    next.latest_version += 1;
                    configs.apply(next);
                }
                if round % 3 == 0 {
                    let pod_key = ObjectKey::new("demo", format!("{name}-1-x"));
                    pods.remove_as_tombstone(&pod_key, round % 6 != 0);
                    pods.apply(Pod { meta: owned_meta("demo", &format!("{name}-1-x"), &(round + 1).to_string(), &name), phase: "Running".into() });
                }
            }
        })
    };

    match duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => info!(secs, "demo duration elapsed"),
                _ = signal::ctrl_c() => info!("interrupt received"),
            }
        }
        None => {
            let _ = signal::ctrl_c().await;
            info!("interrupt received");
        }
    }
    stop.cancel();
    let _ = churn.await;
    run.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    match cli.command {
        Commands::Demo { workers, configs, duration_secs } => run_demo(workers, configs, duration_secs).await,
    }
}
