//! Resource-manager node
//!
//! A master that also participates in ownership consensus: it votes on
//! peer claims, proposes its own, and commits approved claims against
//! the global state. Holds the master-local worker/group association
//! index consumed by later work dispatch.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::consensus::{ConsensusConfig, ConsensusState, Proposal, ResourceOperation, Vote};
use super::master::{MasterConfig, MasterNode, MasterShared};
use crate::error::Result;
use crate::metrics;
use crate::net::{HttpMethod, RestClient, Route, RouteResponse};
use crate::runtime::StopSignal;
use crate::state::{GlobalState, MasterState, Mode};
use crate::storage::{DataStore, S3Backend, StoreBackend, StoreCredentials};
use crate::CONSENSUS_LOOP_INTERVAL_SECS;

/// Construction parameters for a resource-manager node
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    pub master: MasterConfig,
    pub consensus: ConsensusConfig,
}

pub(crate) struct ManagerShared {
    pub consensus: Mutex<ConsensusState>,
    pub global: GlobalState,
    pub local: MasterState,
    /// Groups waiting for an outgoing claim request
    pub claim_queue: Mutex<VecDeque<String>>,
    pub master: Arc<MasterShared>,
    pub client: RestClient,
    pub max_managed_groups: Option<usize>,
}

/// A master node that manages resource groups
pub struct ResourceManagerNode {
    master: MasterNode,
    shared: Arc<ManagerShared>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ResourceManagerNode {
    /// Create a manager over an S3-compatible store
    pub async fn new(config: ManagerConfig, credentials: StoreCredentials) -> Result<Self> {
        let backend: Arc<dyn StoreBackend> = Arc::new(S3Backend::new(credentials));
        Self::with_backend(config, backend).await
    }

    /// Create a manager over any store backend; tests run against the
    /// in-memory one
    pub async fn with_backend(
        config: ManagerConfig,
        backend: Arc<dyn StoreBackend>,
    ) -> Result<Self> {
        let master = MasterNode::new(config.master);
        let store = DataStore::open(backend).await;
        let global = GlobalState::new(store, Mode::ReadWrite);
        let local = MasterState::new()?;

        let shared = Arc::new(ManagerShared {
            consensus: Mutex::new(ConsensusState::new(&config.consensus)),
            global,
            local,
            claim_queue: Mutex::new(VecDeque::new()),
            master: master.shared(),
            client: RestClient::new(),
            max_managed_groups: config.consensus.max_managed_groups,
        });

        Ok(Self {
            master,
            shared,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Id of this node
    pub fn node_id(&self) -> &str {
        self.master.node_id()
    }

    /// The underlying master surface
    pub fn master(&self) -> &MasterNode {
        &self.master
    }

    /// The shared global state this manager commits against
    pub fn global(&self) -> &GlobalState {
        &self.shared.global
    }

    /// The master-local worker/group association index
    pub fn local_state(&self) -> &MasterState {
        &self.shared.local
    }

    /// Set the pending-request age timeout
    pub fn set_request_age_timeout(&self, secs: i64) -> bool {
        self.shared.consensus.lock().set_age_timeout(secs)
    }

    /// Ask this manager to claim a resource group. The claim runs
    /// through the normal proposal path on the next loop pass.
    pub fn submit_claim(&self, group: &str) {
        let mut queue = self.shared.claim_queue.lock();
        if !queue.iter().any(|queued| queued == group) {
            queue.push_back(group.to_string());
        }
    }

    /// Queue a managed group for release back to the unassigned pool
    pub fn release_group(&self, group: &str) {
        let node_id = self.master.node_id().to_string();
        self.shared.consensus.lock().queue_release(&node_id, group);
    }

    /// Bind the REST surface (master routes plus the vote route) and
    /// start every loop
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = self.master.start_with_routes(self.routes()).await?;

        let stop = self.master.stop_signal();
        let node_id = self.master.node_id().to_string();
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(run_consensus_loop(
            self.shared.clone(),
            node_id.clone(),
            stop.clone(),
        )));
        tasks.push(tokio::spawn(run_claim_loop(
            self.shared.clone(),
            node_id,
            stop,
        )));
        drop(tasks);

        info!("Resource manager serving at {}", addr);
        Ok(addr)
    }

    /// Stop every loop, wait for them, then reconcile and release the
    /// store
    pub async fn shutdown(&self) {
        self.master.shutdown().await;
        let tasks: Vec<tokio::task::JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Manager task ended abnormally: {}", e);
            }
        }
        self.shared.global.close().await;
    }

    fn routes(&self) -> Vec<Route> {
        let vote = {
            let shared = self.shared.clone();
            Route::with_arg(
                HttpMethod::Post,
                "/internal/master/resources",
                "resourceId",
                move |_, body, _| handle_vote_request(&shared, body),
            )
        };
        vec![vote]
    }
}

fn handle_vote_request(
    shared: &ManagerShared,
    body: &std::collections::HashMap<String, String>,
) -> RouteResponse {
    let manager_id = body.get("ResourceManagerId").cloned().unwrap_or_default();
    let group = body.get("ResourceGroup").cloned().unwrap_or_default();
    let operation = body.get("ResourceOperation").cloned().unwrap_or_default();

    let vote = shared
        .consensus
        .lock()
        .handle_vote_request(&manager_id, &group);

    let code = match vote {
        Vote::Yay => 200,
        Vote::Nay => 202,
    };
    RouteResponse::new(code)
        .with("Vote", vote.as_str())
        .with("ResourceManagerId", manager_id)
        .with("ResourceGroup", group)
        .with("ResourceOperation", operation)
}

/// Consensus loop: commit decided proposals, expire votes, retry
/// releases, and enqueue at most one fresh claim candidate
async fn run_consensus_loop(
    shared: Arc<ManagerShared>,
    node_id: String,
    stop: StopSignal,
) {
    let mut stop = stop.listener();
    loop {
        consensus_tick(&shared, &node_id).await;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(CONSENSUS_LOOP_INTERVAL_SECS as u64)) => {}
            _ = stop.stopped() => break,
        }
    }
    debug!("Consensus loop stopped");
}

pub(crate) async fn consensus_tick(shared: &Arc<ManagerShared>, node_id: &str) {
    let in_quorum = shared.master.membership.lock().is_in_quorum();

    // Decided proposals commit outside the lock; the pending entry
    // survives a failed claim and retires on age instead.
    let ready = shared.consensus.lock().advance_pending(in_quorum);
    for group in ready {
        if shared.global.claim(node_id, &group).await {
            info!("Claimed resource group {}", group);
            metrics::standard::CLAIMS_COMMITTED.inc();
            shared.consensus.lock().remove_pending(&group);
        } else {
            warn!("Claim of {} did not commit, leaving proposal pending", group);
        }
    }

    shared.consensus.lock().tick_vote_history();

    // Queued releases retry until the drop lands.
    let releases = shared.consensus.lock().release_snapshot();
    for group in releases {
        if shared.global.drop_group(node_id, &group).await {
            info!("Released resource group {}", group);
            shared.consensus.lock().clear_release(&group);
        }
    }

    enqueue_claim_candidate(shared, node_id).await;

    metrics::standard::PENDING_PROPOSALS.set(shared.consensus.lock().pending_count() as i64);
}

/// Pick at most one unmanaged group to go after, subject to the
/// managed-group ceiling
async fn enqueue_claim_candidate(shared: &Arc<ManagerShared>, node_id: &str) {
    if let Some(ceiling) = shared.max_managed_groups {
        let managed = shared.global.list_managed(node_id).count().await;
        if managed >= ceiling {
            return;
        }
    }

    let mut unmanaged = Box::pin(shared.global.list_unmanaged());
    while let Some(group) = unmanaged.next().await {
        let has_history = shared.consensus.lock().has_local_history(&group);
        if has_history {
            continue;
        }
        let mut queue = shared.claim_queue.lock();
        if queue.iter().any(|queued| queued == &group) {
            continue;
        }
        queue.push_back(group);
        // One candidate per pass; the listing stops fetching here.
        break;
    }
}

/// Claim loop: turn queued groups into proposals and collect votes
async fn run_claim_loop(shared: Arc<ManagerShared>, node_id: String, stop: StopSignal) {
    let mut stop = stop.listener();
    loop {
        loop {
            let next = shared.claim_queue.lock().pop_front();
            let Some(group) = next else { break };
            send_claim_request(&shared, &node_id, &group).await;
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(CONSENSUS_LOOP_INTERVAL_SECS as u64)) => {}
            _ = stop.stopped() => break,
        }
    }
    debug!("Claim loop stopped");
}

/// Propose managing a group to every connected master and register the
/// votes that come back
pub(crate) async fn send_claim_request(
    shared: &Arc<ManagerShared>,
    node_id: &str,
    group: &str,
) {
    // Skip groups we are already proposing or have promised to someone
    // else; their history has to expire first.
    if shared.consensus.lock().has_local_history(group) {
        return;
    }

    let connected: Vec<(String, String)> = {
        let membership = shared.master.membership.lock();
        membership
            .connected_masters()
            .into_iter()
            .filter_map(|peer_id| {
                membership
                    .url_for_connected_master(&peer_id)
                    .map(|url| (peer_id, url))
            })
            .collect()
    };

    let quorum = connected.len() / 2 + 1;
    shared.consensus.lock().insert_pending(Proposal::new(
        node_id,
        ResourceOperation::Manage,
        group,
        quorum,
    ));
    debug!(
        "Proposing to manage {} with quorum {} over {} peers",
        group,
        quorum,
        connected.len()
    );

    let mut body = std::collections::HashMap::new();
    body.insert("ResourceManagerId".to_string(), node_id.to_string());
    body.insert("ResourceGroup".to_string(), group.to_string());
    body.insert(
        "ResourceOperation".to_string(),
        ResourceOperation::Manage.as_str().to_string(),
    );

    for (peer_id, url) in connected {
        if peer_id == node_id {
            continue;
        }
        let response = shared
            .client
            .post(
                &format!("{}/internal/master/resources/{}", url, group),
                &body,
            )
            .await;
        if response.code < 300 {
            let vote = if response.body.get("Vote").map(String::as_str) == Some("YAY") {
                Vote::Yay
            } else {
                Vote::Nay
            };
            shared.consensus.lock().register_vote(group, &peer_id, vote);
        }
    }
}
