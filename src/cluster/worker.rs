//! Worker node
//!
//! Attaches to the cluster through whichever known master is currently
//! reachable and in quorum, mirroring that master's view of the
//! cluster and failing over round-robin when it goes silent.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::attachment::AttachmentState;
use super::random_node_id;
use crate::error::Result;
use crate::net::{HttpMethod, RestClient, RestServer, Route, RouteResponse};
use crate::runtime::StopSignal;
use crate::CLUSTER_LOOP_INTERVAL_SECS;

/// Construction parameters for a worker node
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Hostname the node binds and advertises
    pub hostname: String,
    /// Port the node binds and advertises
    pub port: u16,
    /// Node id; a fresh random hex digest when absent
    pub node_id: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".into(),
            port: 8886,
            node_id: None,
        }
    }
}

pub(crate) struct WorkerShared {
    pub attachment: Mutex<AttachmentState>,
    pub client: RestClient,
}

/// A node that binds to one master at a time for later work execution
pub struct WorkerNode {
    node_id: String,
    node_url: String,
    bind_addr: String,
    shared: Arc<WorkerShared>,
    stop: StopSignal,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerNode {
    /// Create a worker node; nothing runs until start()
    pub fn new(config: WorkerConfig) -> Self {
        let node_id = config.node_id.unwrap_or_else(random_node_id);
        let node_url = format!("http://{}:{}", config.hostname, config.port);
        let bind_addr = format!("{}:{}", config.hostname, config.port);

        let shared = Arc::new(WorkerShared {
            attachment: Mutex::new(AttachmentState::new(node_id.clone(), node_url.clone())),
            client: RestClient::new(),
        });

        Self {
            node_id,
            node_url,
            bind_addr,
            shared,
            stop: StopSignal::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Id of this worker
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Advertised url of this worker
    pub fn node_url(&self) -> &str {
        &self.node_url
    }

    /// Set the master fail-over timeout
    pub fn set_master_node_timeout(&self, secs: i64) -> bool {
        self.shared.attachment.lock().set_master_timeout(secs)
    }

    /// Ids of every master this worker knows about
    pub fn known_masters(&self) -> Vec<String> {
        self.shared.attachment.lock().known_masters()
    }

    /// Id of the master the worker currently targets
    pub fn connected_master(&self) -> Option<String> {
        self.shared.attachment.lock().connected_master()
    }

    /// Whether the worker is attached through a quorum-bearing master
    pub fn is_in_cluster(&self) -> bool {
        self.shared.attachment.lock().is_in_cluster()
    }

    /// Bind the REST surface and start the attachment loop
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut server = RestServer::new();
        server.add_routes(self.routes());
        let (addr, server_task) = server.serve(&self.bind_addr, &self.stop).await?;

        let mut tasks = self.tasks.lock();
        tasks.push(server_task);
        tasks.push(tokio::spawn(run_attachment_loop(
            self.shared.clone(),
            self.stop.clone(),
        )));

        info!("Worker {} serving at {}", self.node_id, addr);
        Ok(addr)
    }

    /// Stop the loop and the listener, then wait for them to finish
    pub async fn shutdown(&self) {
        self.stop.stop();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Worker {} shut down", self.node_id);
    }

    fn routes(&self) -> Vec<Route> {
        let status = {
            let shared = self.shared.clone();
            Route::new(
                HttpMethod::Get,
                "/internal/worker/status",
                move |_, _, _| RouteResponse {
                    code: 200,
                    body: shared.attachment.lock().status_body(),
                },
            )
        };

        let join = {
            let shared = self.shared.clone();
            Route::new(
                HttpMethod::Post,
                "/internal/worker/join",
                move |_, body, _| handle_worker_join(&shared, body),
            )
        };

        vec![status, join]
    }
}

fn handle_worker_join(
    shared: &WorkerShared,
    body: &std::collections::HashMap<String, String>,
) -> RouteResponse {
    let node_id = body.get("NodeId").cloned().unwrap_or_default();
    let node_url = body.get("NodeUrl").cloned().unwrap_or_default();

    if node_id.is_empty() && !node_url.is_empty() {
        return RouteResponse::new(400).with("MissingArgument", "NodeId");
    }
    if node_url.is_empty() {
        return RouteResponse::new(400).with("MissingArgument", "NodeUrl");
    }

    let outcome = shared.attachment.lock().join(&node_id, &node_url);
    match outcome {
        Ok(()) => RouteResponse::new(201)
            .with("AddedNode", "True")
            .with("NodeId", node_id)
            .with("NodeUrl", node_url)
            .with("Message", "The node will be added to the cluster"),
        Err(crate::error::MeshError::NodeIdCollision { .. }) => RouteResponse::new(400)
            .with("AddedNode", "False")
            .with("NodeId", node_id)
            .with("NodeUrl", node_url)
            .with("Message", "A node with the same ID already exists"),
        Err(_) => RouteResponse::new(400)
            .with("AddedNode", "False")
            .with("NodeId", node_id)
            .with("NodeUrl", node_url)
            .with("Message", "A node with the same URL already exists"),
    }
}

/// Attachment loop: probe the selected master, mirror its view, and
/// rotate when it stays silent
async fn run_attachment_loop(shared: Arc<WorkerShared>, stop: StopSignal) {
    let mut stop = stop.listener();
    loop {
        attachment_tick(&shared).await;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(CLUSTER_LOOP_INTERVAL_SECS as u64)) => {}
            _ = stop.stopped() => break,
        }
    }
    debug!("Attachment loop stopped");
}

pub(crate) async fn attachment_tick(shared: &Arc<WorkerShared>) {
    // Snapshot under the lock, probe unlocked, commit the outcome.
    let (node_id, target) = {
        let attachment = shared.attachment.lock();
        (attachment.node_id().to_string(), attachment.current_target())
    };

    let Some(target) = target else {
        shared.attachment.lock().set_in_cluster(false);
        return;
    };

    let response = shared
        .client
        .get(&format!(
            "{}/internal/master/status/{}",
            target.url, node_id
        ))
        .await;
    let in_cluster = response.code < 300
        && response.body.get("QuorumMet").map(String::as_str) == Some("True");

    let mut attachment = shared.attachment.lock();
    attachment.record_probe(in_cluster, CLUSTER_LOOP_INTERVAL_SECS);
    if in_cluster {
        attachment.integrate_cluster_view(&response.body);
    }
    attachment.maybe_advance();
    attachment.set_in_cluster(in_cluster);
}
