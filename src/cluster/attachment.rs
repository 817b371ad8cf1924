//! Worker-side master attachment state
//!
//! An ordered list of known masters with a cursor selecting the live
//! target. The worker probes the target every loop pass, mirrors the
//! cluster view it reports, and round-robins to the next master when
//! the target stays unreachable or out of quorum past the timeout.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::error::{MeshError, Result};
use crate::DEFAULT_MASTER_TIMEOUT_SECS;

/// Minimum accepted master fail-over timeout in seconds
pub const MIN_MASTER_TIMEOUT_SECS: i64 = 30;

/// One master the worker knows about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownMaster {
    pub id: String,
    pub url: String,
    /// Seconds since the master last confirmed quorum to us
    pub last_contacted_secs: i64,
}

/// Attachment state held by a single worker
pub struct AttachmentState {
    node_id: String,
    node_url: String,
    known: Vec<KnownMaster>,
    current: usize,
    in_cluster: bool,
    master_timeout: i64,
}

impl AttachmentState {
    /// Create the attachment view for one worker
    pub fn new(node_id: String, node_url: String) -> Self {
        Self {
            node_id,
            node_url,
            known: Vec::new(),
            current: 0,
            in_cluster: false,
            master_timeout: DEFAULT_MASTER_TIMEOUT_SECS,
        }
    }

    /// Id of this worker
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Set the fail-over timeout; values under the minimum are rejected
    pub fn set_master_timeout(&mut self, secs: i64) -> bool {
        if secs < MIN_MASTER_TIMEOUT_SECS {
            return false;
        }
        self.master_timeout = secs;
        true
    }

    /// Ids of every known master, in cursor order
    pub fn known_masters(&self) -> Vec<String> {
        self.known.iter().map(|master| master.id.clone()).collect()
    }

    /// Id of the master the cursor currently selects
    pub fn connected_master(&self) -> Option<String> {
        self.known.get(self.current).map(|master| master.id.clone())
    }

    /// Whether the worker is attached through a quorum-bearing master
    pub fn is_in_cluster(&self) -> bool {
        self.in_cluster
    }

    /// Publish the in-cluster flag computed by the loop pass
    pub fn set_in_cluster(&mut self, in_cluster: bool) {
        self.in_cluster = in_cluster;
    }

    /// Learn about a master. Same collision rules as the master-side
    /// join: id first, then url, against self and every known row.
    pub fn join(&mut self, node_id: &str, node_url: &str) -> Result<()> {
        let id_collision = node_id == self.node_id
            || self.known.iter().any(|master| master.id == node_id);
        let url_collision = node_url == self.node_url
            || self.known.iter().any(|master| master.url == node_url);

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

        self.known.push(KnownMaster {
            id: node_id.to_string(),
            url: node_url.to_string(),
            last_contacted_secs: 0,
        });
        info!("Worker learned about master {} at {}", node_id, node_url);
        Ok(())
    }

    /// Snapshot of the probe target for this loop pass
    pub fn current_target(&self) -> Option<KnownMaster> {
        self.known.get(self.current).cloned()
    }

    /// Commit the outcome of a probe: reset the counter on success,
    /// accumulate the loop interval otherwise
    pub fn record_probe(&mut self, ok: bool, interval: i64) {
        if let Some(target) = self.known.get_mut(self.current) {
            if ok {
                target.last_contacted_secs = 0;
            } else {
                target.last_contacted_secs += interval;
            }
        }
    }

    /// Mirror the cluster view reported by the connected master.
    ///
    /// Masters the response lists that we do not know are appended with
    /// the url from its `URL-<id>` entry; local rows the response no
    /// longer mentions are removed, except the current target. Removals
    /// re-anchor the cursor to the target's row.
    pub fn integrate_cluster_view(&mut self, body: &HashMap<String, String>) {
        let Some(target_id) = self.connected_master() else {
            return;
        };

        let remote_ids: Vec<&String> = body
            .iter()
            .filter(|(_, state)| *state == "Connected" || *state == "NotConnected")
            .map(|(id, _)| id)
            .collect();

        for remote_id in &remote_ids {
            if self.known.iter().any(|master| &master.id == *remote_id) {
                continue;
            }
            let url = body
                .get(&format!("URL-{}", remote_id))
                .cloned()
                .unwrap_or_default();
            debug!("Worker mirroring new master {}", remote_id);
            self.known.push(KnownMaster {
                id: (*remote_id).clone(),
                url,
                last_contacted_secs: 0,
            });
        }

        let before = self.known.len();
        self.known.retain(|master| {
            master.id == target_id || remote_ids.iter().any(|remote| **remote == master.id)
        });
        if self.known.len() != before {
            if let Some(index) = self.known.iter().position(|master| master.id == target_id) {
                self.current = index;
            }
        }
    }

    /// Rotate to the next master once the target has been silent past
    /// the timeout; the fresh target starts with a zeroed counter
    pub fn maybe_advance(&mut self) -> bool {
        if self.known.is_empty() {
            return false;
        }
        let stale = self
            .known
            .get(self.current)
            .map(|master| master.last_contacted_secs > self.master_timeout)
            .unwrap_or(false);
        if !stale {
            return false;
        }

        self.current = (self.current + 1) % self.known.len();
        if let Some(next) = self.known.get_mut(self.current) {
            next.last_contacted_secs = 0;
            info!("Worker rotating to master {}", next.id);
        }
        true
    }

    /// Build the worker-status body
    pub fn status_body(&self) -> HashMap<String, String> {
        let mut body = HashMap::new();
        for master in &self.known {
            body.insert(master.id.clone(), master.last_contacted_secs.to_string());
        }
        body.insert(
            "InCluster".to_string(),
            if self.in_cluster { "True" } else { "False" }.to_string(),
        );
        body.insert(
            "ConnectedTo".to_string(),
            self.connected_master().unwrap_or_else(|| "None".to_string()),
        );
        body
    }
}
