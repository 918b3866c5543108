//! Steer deploy config controller.
//!
//! Level-triggered reconcile loop fed by edge-triggered view events: the
//! router turns notifications into deploy config keys, the work queue
//! coalesces and rate-limits them, and a pool of workers resolves each key
//! back to the current cached object before invoking the reconciler.

#![forbid(unsafe_code)]

mod owner;
mod router;

pub use owner::OwnerIndex;
pub use router::Router;

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use steer_core::{DeployConfig, ObjectKey, Pod, ReplicaController, ViewEvent};
use steer_queue::WorkQueue;
use steer_store::{wait_for_sync, ObjectView};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// External collaborator that drives observed state toward declared state.
/// Failures are routed into the queue's backoff, never classified here.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, config: Arc<DeployConfig>) -> anyhow::Result<()>;
}

/// Event receivers for the three views, handed to [`Controller::run`].
pub struct EventStreams {
    pub configs: UnboundedReceiver<ViewEvent<DeployConfig>>,
    pub replicas: UnboundedReceiver<ViewEvent<ReplicaController>>,
    pub pods: UnboundedReceiver<ViewEvent<Pod>>,
}

/// Owns the queue and the injected views; shared state lives nowhere else.
pub struct Controller {
    configs: Arc<dyn ObjectView<DeployConfig>>,
    replicas: Arc<dyn ObjectView<ReplicaController>>,
    pods: Arc<dyn ObjectView<Pod>>,
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn Reconciler>,
}

impl Controller {
    pub fn new(
        configs: Arc<dyn ObjectView<DeployConfig>>,
        replicas: Arc<dyn ObjectView<ReplicaController>>,
        pods: Arc<dyn ObjectView<Pod>>,
        reconciler: Arc<dyn Reconciler>,
    ) -> Arc<Self> {
        Arc::new(Self { configs, replicas, pods, queue: WorkQueue::new(), reconciler })
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Run until `stop` fires. Blocks on the sync gate before starting any
    /// worker; returning without having processed anything is a clean abort.
    pub async fn run(self: Arc<Self>, workers: usize, streams: EventStreams, stop: CancellationToken) {
        info!("starting deploy config controller");

        let configs = Arc::clone(&self.configs);
        let replicas = Arc::clone(&self.replicas);
        let pods = Arc::clone(&self.pods);
        let configs_synced = move || configs.has_synced();
        let replicas_synced = move || replicas.has_synced();
        let pods_synced = move || pods.has_synced();
        if !wait_for_sync(&[&configs_synced, &replicas_synced, &pods_synced], &stop).await {
            self.queue.shut_down();
            return;
        }
        info!(workers = workers.max(1), "caches synced; starting workers");

        let router = Arc::new(Router::new(Arc::clone(&self.queue), OwnerIndex::new(Arc::clone(&self.configs))));
        let mut tasks = Vec::new();
        tasks.push(spawn_pump(Arc::clone(&router), streams.configs, stop.clone(), |r, ev| r.primary_event(ev)));
        tasks.push(spawn_pump(Arc::clone(&router), streams.replicas, stop.clone(), |r, ev| r.replica_event(ev)));
        tasks.push(spawn_pump(Arc::clone(&router), streams.pods, stop.clone(), |r, ev| r.pod_event(ev)));

        for id in 0..workers.max(1) {
            let controller = Arc::clone(&self);
            tasks.push(tokio::spawn(async move { controller.worker(id).await }));
        }

        stop.cancelled().await;
        info!("shutting down deploy config controller");
        self.queue.shut_down();
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(error = %e, "controller task panicked");
                }
            }
        }
    }

    async fn worker(self: Arc<Self>, id: usize) {
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!(worker = id, "worker exiting");
    }

    async fn process(&self, key: &str) {
        let parsed = match ObjectKey::parse(key) {
            Ok(k) => k,
            Err(e) => {
                // Keys are produced by the router; a bad one is reported
                // and dropped rather than retried forever.
                warn!(key = %key, error = %e, "dropping malformed key");
                return;
            }
        };
        let config = match self.configs.get(&parsed) {
            Ok(Some(c)) => c,
            Ok(None) => {
                debug!(key = %key, "deploy config has been deleted; nothing to do");
                return;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "cache lookup failed; retrying with backoff");
                self.queue.add_rate_limited(key);
                return;
            }
        };
        let started = Instant::now();
        match self.reconciler.reconcile(config).await {
            Ok(()) => {
                histogram!("steer_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
                self.queue.forget(key);
            }
            Err(e) => {
                counter!("steer_reconcile_failures_total", 1);
                warn!(key = %key, error = %e, retries = self.queue.retries(key), "reconcile failed; retrying with backoff");
                self.queue.add_rate_limited(key);
            }
        }
    }
}

fn spawn_pump<T: Send + Sync + 'static>(
    router: Arc<Router>,
    mut rx: UnboundedReceiver<ViewEvent<T>>,
    stop: CancellationToken,
    handle: impl Fn(&Router, ViewEvent<T>) + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                ev = rx.recv() => match ev {
                    Some(ev) => handle(&router, ev),
                    None => break,
                },
            }
        }
    })
}
