//! Master membership state
//!
//! Tracks the peers one master knows about, the ledger of peers that
//! formally left, the queue-feeding status integration, and attached
//! workers. All methods are synchronous; the node layer snapshots under
//! the lock, performs network I/O unlocked, and reacquires to commit.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::error::{MeshError, Result};
use crate::{DEFAULT_LEFT_TIMEOUT_SECS, DEFAULT_WORKER_TIMEOUT_SECS};

/// Minimum accepted value for the membership timeouts in seconds
pub const MIN_TIMEOUT_SECS: i64 = 30;

/// Status-body value marking the reporting node itself
pub const SELF_INSTANCE: &str = "SelfInstance";

/// One known peer master
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterPeer {
    pub id: String,
    pub url: String,
    /// Updated only by status polls; new peers start unreachable
    pub contactable: bool,
}

/// Membership view held by a single master
pub struct MembershipState {
    node_id: String,
    node_url: String,
    peers: HashMap<String, MasterPeer>,
    /// Recently departed peers and their age in seconds
    left: HashMap<String, i64>,
    /// Attached workers and their idle seconds
    workers: HashMap<String, i64>,
    left_timeout: i64,
    worker_timeout: i64,
}

impl MembershipState {
    /// Create the membership view for one master
    pub fn new(node_id: String, node_url: String) -> Self {
        Self {
            node_id,
            node_url,
            peers: HashMap::new(),
            left: HashMap::new(),
            workers: HashMap::new(),
            left_timeout: DEFAULT_LEFT_TIMEOUT_SECS,
            worker_timeout: DEFAULT_WORKER_TIMEOUT_SECS,
        }
    }

    /// Id of this master
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Url of this master
    pub fn node_url(&self) -> &str {
        &self.node_url
    }

    /// Set the departed-peer ledger timeout; values under the minimum
    /// are rejected
    pub fn set_left_timeout(&mut self, secs: i64) -> bool {
        if secs < MIN_TIMEOUT_SECS {
            return false;
        }
        self.left_timeout = secs;
        true
    }

    /// Set the attached-worker idle timeout; values under the minimum
    /// are rejected
    pub fn set_worker_timeout(&mut self, secs: i64) -> bool {
        if secs < MIN_TIMEOUT_SECS {
            return false;
        }
        self.worker_timeout = secs;
        true
    }

    /// Snapshot of every known peer
    pub fn peers_snapshot(&self) -> Vec<MasterPeer> {
        self.peers.values().cloned().collect()
    }

    /// Number of known peers, self excluded
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Ids of the currently contactable peers
    pub fn connected_masters(&self) -> Vec<String> {
        let mut connected: Vec<String> = self
            .peers
            .values()
            .filter(|peer| peer.contactable)
            .map(|peer| peer.id.clone())
            .collect();
        connected.sort();
        connected
    }

    /// Url of a contactable peer, if known
    pub fn url_for_connected_master(&self, node_id: &str) -> Option<String> {
        self.peers
            .get(node_id)
            .filter(|peer| peer.contactable)
            .map(|peer| peer.url.clone())
    }

    /// Ids of the currently attached workers
    pub fn connected_workers(&self) -> Vec<String> {
        let mut workers: Vec<String> = self.workers.keys().cloned().collect();
        workers.sort();
        workers
    }

    /// Strict-majority quorum over self plus known peers.
    ///
    /// Ties are not quorum: two reachable nodes out of four known do
    /// not carry the cluster.
    pub fn is_in_quorum(&self) -> bool {
        let total = self.peers.len() + 1;
        let connected = self
            .peers
            .values()
            .filter(|peer| peer.contactable)
            .count()
            + 1;
        connected as f64 > 0.5 * total as f64
    }

    /// Accept a join for a new peer.
    ///
    /// The id collision is checked before the url collision so the
    /// response message is deterministic when both collide. Accepted
    /// peers are purged from the departed ledger and start unreachable.
    pub fn join(&mut self, node_id: &str, node_url: &str) -> Result<()> {
        let id_collision =
            node_id == self.node_id || self.peers.contains_key(node_id);
        let url_collision = node_url == self.node_url
            || self.peers.values().any(|peer| peer.url == node_url);

        if id_collision {
            return Err(MeshError::NodeIdCollision {
                node_id: node_id.to_string(),
            });
        }
        if url_collision {
            return Err(MeshError::NodeUrlCollision {
                node_url: node_url.to_string(),
            });
        }

        self.left.remove(node_id);
        self.peers.insert(
            node_id.to_string(),
            MasterPeer {
                id: node_id.to_string(),
                url: node_url.to_string(),
                contactable: false,
            },
        );
        info!("Accepted join of master {} at {}", node_id, node_url);
        Ok(())
    }

    /// Accept a leave for a known peer, recording it in the ledger so
    /// self-healing does not immediately revive it
    pub fn leave(&mut self, node_id: &str) -> Result<()> {
        if !self.peers.contains_key(node_id) {
            return Err(MeshError::UnknownNode {
                node_id: node_id.to_string(),
            });
        }
        self.left.insert(node_id.to_string(), 0);
        self.peers.remove(node_id);
        info!("Master {} left the cluster", node_id);
        Ok(())
    }

    /// Insert a peer found through the pending-join queue. No collision
    /// checks: re-inserting a known peer resets it to unreachable until
    /// the next poll.
    pub fn insert_peer_unchecked(&mut self, node_id: &str, node_url: &str) {
        self.peers.insert(
            node_id.to_string(),
            MasterPeer {
                id: node_id.to_string(),
                url: node_url.to_string(),
                contactable: false,
            },
        );
    }

    /// Ids currently in the departed ledger
    pub fn left_ids(&self) -> Vec<String> {
        self.left.keys().cloned().collect()
    }

    /// Whether the id is currently suppressed by the departed ledger
    pub fn is_departed(&self, node_id: &str) -> bool {
        self.left.contains_key(node_id)
    }

    /// Age the departed ledger by one loop interval, evicting entries
    /// whose age already exceeded the timeout
    pub fn age_left_ledger(&mut self, interval: i64) {
        let timeout = self.left_timeout;
        let expired: Vec<String> = self
            .left
            .iter()
            .filter(|(_, age)| **age > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            debug!("Departed master {} aged out of the ledger", id);
            self.left.remove(&id);
        }
        for age in self.left.values_mut() {
            *age += interval;
        }
    }

    /// Age attached workers by one loop interval, dropping the ones
    /// idle past the timeout
    pub fn age_workers(&mut self, interval: i64) {
        let timeout = self.worker_timeout;
        let expired: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, idle)| **idle >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            info!("Worker {} timed out and was detached", id);
            self.workers.remove(&id);
        }
        for idle in self.workers.values_mut() {
            *idle += interval;
        }
    }

    /// Reset a worker's idle counter; the heartbeat piggybacks on the
    /// internal status route
    pub fn heartbeat_worker(&mut self, worker_id: &str) {
        self.workers.insert(worker_id.to_string(), 0);
    }

    /// Build the cluster-status body.
    ///
    /// The internal variant adds a `URL-<peerId>` entry per peer so
    /// other nodes can self-heal from it. The ClusterSize denominator
    /// counts self plus every known peer, reachable or not.
    pub fn status_body(&self, internal: bool) -> HashMap<String, String> {
        let mut body = HashMap::new();
        let mut connected = 0;
        for peer in self.peers.values() {
            if peer.contactable {
                connected += 1;
            }
            body.insert(
                peer.id.clone(),
                if peer.contactable {
                    "Connected".to_string()
                } else {
                    "NotConnected".to_string()
                },
            );
        }

        body.insert(self.node_id.clone(), SELF_INSTANCE.to_string());
        connected += 1;
        let total = self.peers.len() + 1;

        let quorum_met = connected as f64 > 0.5 * total as f64;
        body.insert(
            "QuorumMet".to_string(),
            if quorum_met { "True" } else { "False" }.to_string(),
        );
        body.insert(
            "ClusterSize".to_string(),
            format!("{}/{}", connected, total),
        );

        if internal {
            for peer in self.peers.values() {
                body.insert(format!("URL-{}", peer.id), peer.url.clone());
            }
        }
        body
    }

    /// Commit the outcome of a status poll and derive join candidates.
    ///
    /// Updates the peer's contactable flag, then inspects the response
    /// body: if the peer does not list this node, the peer itself is a
    /// join target; every node the peer lists that is neither known nor
    /// in the departed ledger is a self-healing join target.
    pub fn integrate_peer_status(
        &mut self,
        peer_id: &str,
        code: u16,
        body: &HashMap<String, String>,
    ) -> Vec<(String, String)> {
        let mut join_candidates = Vec::new();

        let Some(peer) = self.peers.get_mut(peer_id) else {
            return join_candidates;
        };
        peer.contactable = code < 300;
        let peer_url = peer.url.clone();

        if !body.contains_key(&self.node_id) {
            join_candidates.push((peer_id.to_string(), peer_url));
        }

        for (remote_id, state) in body {
            if state != "Connected" && state != "NotConnected" {
                continue;
            }
            if remote_id == &self.node_id
                || self.peers.contains_key(remote_id)
                || self.left.contains_key(remote_id)
            {
                continue;
            }
            let remote_url = body
                .get(&format!("URL-{}", remote_id))
                .cloned()
                .unwrap_or_default();
            debug!(
                "Self-healing: peer {} advertised unknown master {}",
                peer_id, remote_id
            );
            join_candidates.push((remote_id.clone(), remote_url));
        }

        join_candidates
    }
}
