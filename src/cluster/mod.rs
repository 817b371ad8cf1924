//! Cluster nodes
//!
//! Master membership and quorum, worker attachment, and the
//! resource-group ownership consensus that runs on managing masters.

pub mod attachment;
pub mod consensus;
pub mod manager;
pub mod master;
pub mod membership;
pub mod worker;

pub use attachment::AttachmentState;
pub use consensus::{ConsensusConfig, ConsensusState, Proposal, ResourceOperation, Vote};
pub use manager::{ManagerConfig, ResourceManagerNode};
pub use master::{MasterConfig, MasterNode};
pub use membership::{MasterPeer, MembershipState};
pub use worker::{WorkerConfig, WorkerNode};

use rand::RngCore;

/// Fresh random 256-bit node id as a hex digest
pub fn random_node_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_node_id_shape() {
        let id = random_node_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, random_node_id());
    }
}
