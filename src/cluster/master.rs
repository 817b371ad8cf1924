//! Master node
//!
//! Hosts the membership state behind its REST surface and drives the
//! two periodic loops: peer status polling with self-healing join
//! fan-out, and attached-worker aging.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::membership::MembershipState;
use super::random_node_id;
use crate::error::Result;
use crate::metrics;
use crate::net::{HttpMethod, RestClient, RestServer, Route, RouteResponse};
use crate::runtime::StopSignal;
use crate::CLUSTER_LOOP_INTERVAL_SECS;

/// Construction parameters for a master node
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Hostname the node binds and advertises
    pub hostname: String,
    /// Port the node binds and advertises
    pub port: u16,
    /// Node id; a fresh random hex digest when absent
    pub node_id: Option<String>,
    /// Concurrent peer status polls per loop iteration
    pub poll_concurrency: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".into(),
            port: 9996,
            node_id: None,
            poll_concurrency: 8,
        }
    }
}

/// State shared between the node handle, its handlers, and its loops
pub(crate) struct MasterShared {
    pub membership: Mutex<MembershipState>,
    /// Nodes discovered through status divergence, drained by the
    /// master loop
    pub pending_joins: Mutex<VecDeque<(String, String)>>,
    pub client: RestClient,
}

/// A peer-to-peer control-plane node
pub struct MasterNode {
    node_id: String,
    node_url: String,
    bind_addr: String,
    poll_concurrency: usize,
    shared: Arc<MasterShared>,
    stop: StopSignal,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MasterNode {
    /// Create a master node; nothing runs until start()
    pub fn new(config: MasterConfig) -> Self {
        let node_id = config.node_id.unwrap_or_else(random_node_id);
        let node_url = format!("http://{}:{}", config.hostname, config.port);
        let bind_addr = format!("{}:{}", config.hostname, config.port);

        let shared = Arc::new(MasterShared {
            membership: Mutex::new(MembershipState::new(node_id.clone(), node_url.clone())),
            pending_joins: Mutex::new(VecDeque::new()),
            client: RestClient::new(),
        });

        Self {
            node_id,
            node_url,
            bind_addr,
            poll_concurrency: config.poll_concurrency.max(1),
            shared,
            stop: StopSignal::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Id of this node
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Advertised url of this node
    pub fn node_url(&self) -> &str {
        &self.node_url
    }

    /// Set the departed-master ledger timeout
    pub fn set_left_node_timeout(&self, secs: i64) -> bool {
        self.shared.membership.lock().set_left_timeout(secs)
    }

    /// Set the attached-worker idle timeout
    pub fn set_worker_node_timeout(&self, secs: i64) -> bool {
        self.shared.membership.lock().set_worker_timeout(secs)
    }

    /// Ids of the workers currently attached to this master
    pub fn connected_workers(&self) -> Vec<String> {
        self.shared.membership.lock().connected_workers()
    }

    /// Ids of the currently contactable peer masters
    pub fn connected_masters(&self) -> Vec<String> {
        self.shared.membership.lock().connected_masters()
    }

    /// Url of a contactable peer master
    pub fn url_for_connected_master(&self, node_id: &str) -> Option<String> {
        self.shared
            .membership
            .lock()
            .url_for_connected_master(node_id)
    }

    /// Whether this node currently sees a cluster majority
    pub fn is_in_quorum(&self) -> bool {
        self.shared.membership.lock().is_in_quorum()
    }

    pub(crate) fn shared(&self) -> Arc<MasterShared> {
        self.shared.clone()
    }

    pub(crate) fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Bind the REST surface and start the loops
    pub async fn start(&self) -> Result<SocketAddr> {
        self.start_with_routes(Vec::new()).await
    }

    /// Start with extra routes layered on the same listener, for nodes
    /// composing on top of the master surface
    pub(crate) async fn start_with_routes(&self, extra: Vec<Route>) -> Result<SocketAddr> {
        let mut server = RestServer::new();
        server.add_routes(self.routes());
        server.add_routes(extra);
        let (addr, server_task) = server.serve(&self.bind_addr, &self.stop).await?;

        let mut tasks = self.tasks.lock();
        tasks.push(server_task);
        tasks.push(tokio::spawn(run_master_loop(
            self.shared.clone(),
            self.stop.clone(),
            self.poll_concurrency,
        )));
        tasks.push(tokio::spawn(run_worker_aging_loop(
            self.shared.clone(),
            self.stop.clone(),
        )));

        info!("Master {} serving at {}", self.node_id, addr);
        Ok(addr)
    }

    /// Stop the loops and the listener, then wait for them to finish
    pub async fn shutdown(&self) {
        self.stop.stop();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Master task ended abnormally: {}", e);
            }
        }
        info!("Master {} shut down", self.node_id);
    }

    /// The master REST surface
    pub(crate) fn routes(&self) -> Vec<Route> {
        let cluster_status = {
            let shared = self.shared.clone();
            Route::new(HttpMethod::Get, "/cluster/status", move |_, _, _| {
                RouteResponse {
                    code: 200,
                    body: shared.membership.lock().status_body(false),
                }
            })
        };

        let internal_status = {
            let shared = self.shared.clone();
            Route::new(
                HttpMethod::Get,
                "/internal/master/status",
                move |_, _, _| RouteResponse {
                    code: 200,
                    body: shared.membership.lock().status_body(true),
                },
            )
        };

        let internal_status_worker = {
            let shared = self.shared.clone();
            Route::with_arg(
                HttpMethod::Get,
                "/internal/master/status",
                "workerId",
                move |_, _, arg| {
                    let mut membership = shared.membership.lock();
                    let body = membership.status_body(true);
                    if let Some(worker_id) = arg.filter(|value| !value.is_empty()) {
                        membership.heartbeat_worker(worker_id);
                    }
                    RouteResponse { code: 200, body }
                },
            )
        };

        let join = {
            let shared = self.shared.clone();
            Route::new(
                HttpMethod::Post,
                "/internal/master/join",
                move |_, body, _| handle_join(&shared, body),
            )
        };

        let leave = {
            let shared = self.shared.clone();
            Route::new(
                HttpMethod::Post,
                "/internal/master/leave",
                move |_, body, _| handle_leave(&shared, body),
            )
        };

        vec![
            cluster_status,
            internal_status,
            internal_status_worker,
            join,
            leave,
        ]
    }
}

fn handle_join(
    shared: &MasterShared,
    body: &std::collections::HashMap<String, String>,
) -> RouteResponse {
    let node_id = body.get("NodeId").cloned().unwrap_or_default();
    let node_url = body.get("NodeUrl").cloned().unwrap_or_default();

    // The url check runs second, so it names the missing argument when
    // both are absent.
    if node_id.is_empty() && !node_url.is_empty() {
        return RouteResponse::new(400).with("MissingArgument", "NodeId");
    }
    if node_url.is_empty() {
        return RouteResponse::new(400).with("MissingArgument", "NodeUrl");
    }

    let outcome = shared.membership.lock().join(&node_id, &node_url);
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

fn handle_leave(
    shared: &MasterShared,
    body: &std::collections::HashMap<String, String>,
) -> RouteResponse {
    let node_id = body.get("NodeId").cloned().unwrap_or_default();
    if node_id.is_empty() {
        return RouteResponse::new(400).with("MissingArgument", "NodeId");
    }

    let outcome = shared.membership.lock().leave(&node_id);
    match outcome {
        Ok(()) => RouteResponse::new(202)
            .with("RemovedNode", "True")
            .with("NodeId", node_id)
            .with("Message", "The node will be removed from the cluster"),
        Err(_) => RouteResponse::new(400)
            .with("RemovedNode", "False")
            .with("NodeId", node_id)
            .with("Message", "No node exists with the provided ID"),
    }
}

/// Master loop: poll every peer, age the ledger, drain join requests
async fn run_master_loop(
    shared: Arc<MasterShared>,
    stop: StopSignal,
    poll_concurrency: usize,
) {
    let mut stop = stop.listener();
    loop {
        master_tick(&shared, poll_concurrency).await;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(CLUSTER_LOOP_INTERVAL_SECS as u64)) => {}
            _ = stop.stopped() => break,
        }
    }
    debug!("Master loop stopped");
}

pub(crate) async fn master_tick(shared: &Arc<MasterShared>, poll_concurrency: usize) {
    // Snapshot under the lock, poll unlocked, commit per peer.
    let peers = shared.membership.lock().peers_snapshot();
    futures::stream::iter(peers)
        .for_each_concurrent(poll_concurrency, |peer| {
            let shared = shared.clone();
            async move {
                metrics::standard::STATUS_POLLS.inc();
                let response = shared
                    .client
                    .get(&format!("{}/internal/master/status", peer.url))
                    .await;
                let candidates = shared.membership.lock().integrate_peer_status(
                    &peer.id,
                    response.code,
                    &response.body,
                );
                if !candidates.is_empty() {
                    shared.pending_joins.lock().extend(candidates);
                }
            }
        })
        .await;

    shared
        .membership
        .lock()
        .age_left_ledger(CLUSTER_LOOP_INTERVAL_SECS);

    drain_pending_joins(shared).await;

    let (known, connected) = {
        let membership = shared.membership.lock();
        (
            membership.peer_count(),
            membership.connected_masters().len(),
        )
    };
    metrics::standard::KNOWN_MASTERS.set(known as i64);
    metrics::standard::CONTACTABLE_MASTERS.set(connected as i64);
}

/// Ask every newly discovered node to add us, then track it locally.
///
/// The requested set is seeded with the departed ledger so self-healing
/// cannot revive a peer that just left.
async fn drain_pending_joins(shared: &Arc<MasterShared>) {
    let (own_id, own_url, mut requested) = {
        let membership = shared.membership.lock();
        let requested: HashSet<String> = membership.left_ids().into_iter().collect();
        (
            membership.node_id().to_string(),
            membership.node_url().to_string(),
            requested,
        )
    };

    loop {
        let next = shared.pending_joins.lock().pop_front();
        let Some((node_id, node_url)) = next else {
            break;
        };
        if node_id == own_id || requested.contains(&node_id) {
            continue;
        }

        let mut body = std::collections::HashMap::new();
        body.insert("NodeId".to_string(), own_id.clone());
        body.insert("NodeUrl".to_string(), own_url.clone());
        let response = shared
            .client
            .post(&format!("{}/internal/master/join", node_url), &body)
            .await;
        debug!(
            "Join request to {} at {} returned {}",
            node_id, node_url, response.code
        );

        // Tracked for quorum purposes whether or not the join landed;
        // the next poll pass decides reachability.
        shared
            .membership
            .lock()
            .insert_peer_unchecked(&node_id, &node_url);
        requested.insert(node_id);
    }
}

/// Worker loop: age attached workers and drop the idle ones
async fn run_worker_aging_loop(shared: Arc<MasterShared>, stop: StopSignal) {
    let mut stop = stop.listener();
    loop {
        {
            let mut membership = shared.membership.lock();
            membership.age_workers(CLUSTER_LOOP_INTERVAL_SECS);
            metrics::standard::ATTACHED_WORKERS.set(membership.connected_workers().len() as i64);
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(CLUSTER_LOOP_INTERVAL_SECS as u64)) => {}
            _ = stop.stopped() => break,
        }
    }
    debug!("Worker aging loop stopped");
}
