//! Background polling of node, storage, workload and daemon state
//!
//! Each source is polled by its own task on its own interval. Pollers never
//! touch shared state; they send a [`SourceUpdate`] to a single merger task,
//! which is the only writer of the published snapshot.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::snapshot::{workload_health, DaemonStatus, MonitorSnapshot, SourceUpdate};
use crate::client::ClusterClient;
use crate::config::MonitorConfig;
use crate::controller::maintenance::{resolve_target_node, WorkloadCategory};

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Continuously refreshed view of one node and the storage cluster.
///
/// Acquire with [`start`](Self::start) and release with
/// [`stop`](Self::stop). Dropping a running monitor cancels its tasks
/// without waiting for them.
pub struct ClusterMonitor {
    client: Arc<dyn ClusterClient>,
    config: MonitorConfig,
    namespace: String,
    node: String,
    current: Arc<ArcSwap<MonitorSnapshot>>,
    running: Mutex<Option<Running>>,
}

impl ClusterMonitor {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        namespace: &str,
        node: &str,
        config: MonitorConfig,
    ) -> Self {
        Self {
            client,
            config,
            namespace: namespace.to_string(),
            node: node.to_string(),
            current: Arc::new(ArcSwap::from_pointee(MonitorSnapshot::default())),
            running: Mutex::new(None),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Latest snapshot; never waits on a poll
    pub fn snapshot(&self) -> Arc<MonitorSnapshot> {
        self.current.load_full()
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Spawn the pollers and the merger. Does nothing if already running.
    pub fn start(&self) {
        let mut running = self.lock_running();
        if running.is_some() {
            debug!("Cluster monitor for {} already running", self.node);
            return;
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.config.update_buffer.max(1));
        let mut tasks = vec![spawn_merger(self.current.clone(), rx, cancel.clone())];

        let client = self.client.clone();
        let node = self.node.clone();
        tasks.push(spawn_poller(
            self.config.node_interval(),
            cancel.clone(),
            tx.clone(),
            move || poll_node(client.clone(), node.clone()),
        ));

        let client = self.client.clone();
        tasks.push(spawn_poller(
            self.config.storage_interval(),
            cancel.clone(),
            tx.clone(),
            move || poll_storage(client.clone()),
        ));

        let client = self.client.clone();
        let namespace = self.namespace.clone();
        let node = self.node.clone();
        tasks.push(spawn_poller(
            self.config.workload_interval(),
            cancel.clone(),
            tx.clone(),
            move || poll_workloads(client.clone(), namespace.clone(), node.clone()),
        ));

        let client = self.client.clone();
        tasks.push(spawn_poller(
            self.config.daemon_interval(),
            cancel.clone(),
            tx,
            move || poll_daemons(client.clone()),
        ));

        info!("Started cluster monitor for node {}", self.node);
        *running = Some(Running { cancel, tasks });
    }

    /// Cancel every task and wait for it to exit. Safe to call repeatedly or
    /// on a monitor that was never started.
    pub async fn stop(&self) {
        let running = self.lock_running().take();
        let Some(running) = running else {
            return;
        };

        running.cancel.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!("Monitor task ended abnormally: {}", e);
            }
        }
        info!("Stopped cluster monitor for node {}", self.node);
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for ClusterMonitor {
    fn drop(&mut self) {
        if let Some(running) = self.lock_running().take() {
            running.cancel.cancel();
        }
    }
}

fn spawn_merger(
    current: Arc<ArcSwap<MonitorSnapshot>>,
    mut rx: mpsc::Receiver<SourceUpdate>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => break,
                update = rx.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };

            let previous = current.load_full();
            let next = previous.with_update(update, Utc::now());
            if next.summary.status != previous.summary.status {
                info!(
                    "Cluster health changed from {} to {}",
                    previous.summary.status, next.summary.status
                );
            }
            current.store(Arc::new(next));
        }
        debug!("Monitor merger stopped");
    })
}

fn spawn_poller<F, Fut>(
    interval: Duration,
    cancel: CancellationToken,
    tx: mpsc::Sender<SourceUpdate>,
    poll: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = SourceUpdate> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let update = tokio::select! {
                _ = cancel.cancelled() => break,
                update = poll() => update,
            };
            if let Some(message) = failure(&update) {
                debug!("Poll of {} failed: {}", update.source(), message);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = tx.send(update) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn failure(update: &SourceUpdate) -> Option<&str> {
    match update {
        SourceUpdate::Node(Err(e))
        | SourceUpdate::Storage(Err(e))
        | SourceUpdate::Workloads(Err(e))
        | SourceUpdate::Daemons(Err(e)) => Some(e.as_str()),
        _ => None,
    }
}

async fn poll_node(client: Arc<dyn ClusterClient>, node: String) -> SourceUpdate {
    SourceUpdate::Node(match client.get_node(&node).await {
        Ok(Some(info)) => Ok(info),
        Ok(None) => Err(format!("node {node} not found")),
        Err(e) => Err(e.to_string()),
    })
}

async fn poll_storage(client: Arc<dyn ClusterClient>) -> SourceUpdate {
    SourceUpdate::Storage(client.storage_health().await.map_err(|e| e.to_string()))
}

async fn poll_workloads(
    client: Arc<dyn ClusterClient>,
    namespace: String,
    node: String,
) -> SourceUpdate {
    let deployments = match client.list_deployments(&namespace).await {
        Ok(deployments) => deployments,
        Err(e) => return SourceUpdate::Workloads(Err(e.to_string())),
    };

    let pinned = deployments
        .iter()
        .filter(|d| resolve_target_node(d).as_deref() == Some(node.as_str()))
        .map(|d| {
            let name = d.metadata.name.as_deref().unwrap_or_default();
            let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            let ready = d.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
            (WorkloadCategory::classify(name), desired, ready)
        });
    SourceUpdate::Workloads(Ok(workload_health(pinned)))
}

async fn poll_daemons(client: Arc<dyn ClusterClient>) -> SourceUpdate {
    let (osds, quorum) = tokio::join!(client.osd_status(), client.quorum_status());
    SourceUpdate::Daemons(match (osds, quorum) {
        (Ok(osds), Ok(quorum)) => Ok(DaemonStatus { osds, quorum }),
        (Err(e), _) | (_, Err(e)) => Err(e.to_string()),
    })
}
