//! Master-local worker/group association state
//!
//! Bijective index over (worker, resource group) associations owned by
//! a single master. The index lives in a temporary directory and is
//! destroyed with the instance; the per-worker association counter is
//! held in memory.

use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use tempfile::TempDir;
use tracing::warn;

use super::packed::{pack, unpack};
use crate::error::{MeshError, Result};

const ASSOCIATION_TABLE: TableDefinition<&str, &str> = TableDefinition::new("associations");

/// Ephemeral worker/group association index
pub struct MasterState {
    /// Keeps the backing directory alive for the lifetime of the state
    _dir: TempDir,
    db: Database,
    worker_refs: Mutex<HashMap<String, i64>>,
}

impl MasterState {
    /// Create the state on a fresh temporary directory
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("gridmesh-master-state")
            .tempdir()
            .map_err(|e| MeshError::LocalStoreError {
                message: format!("Failed to create state directory: {}", e),
            })?;
        let db = Database::create(dir.path().join("associations.redb")).map_err(|e| {
            MeshError::LocalStoreError {
                message: format!("Failed to open association store: {}", e),
            }
        })?;
        Ok(Self {
            _dir: dir,
            db,
            worker_refs: Mutex::new(HashMap::new()),
        })
    }

    /// Register a worker; rejects empty ids and duplicates
    pub fn add_worker(&self, worker: &str) -> bool {
        if worker.is_empty() {
            return false;
        }
        let mut refs = self.worker_refs.lock();
        if refs.contains_key(worker) {
            return false;
        }
        refs.insert(worker.to_string(), 0);
        true
    }

    /// Remove a worker; only possible once it has no associations
    pub fn remove_worker(&self, worker: &str) -> bool {
        let mut refs = self.worker_refs.lock();
        match refs.get(worker) {
            Some(count) if *count <= 0 => {
                refs.remove(worker);
                true
            }
            _ => false,
        }
    }

    /// Ids of every registered worker
    pub fn list_workers(&self) -> Vec<String> {
        let mut workers: Vec<String> = self.worker_refs.lock().keys().cloned().collect();
        workers.sort();
        workers
    }

    /// Associate a worker with a resource group, both directions
    pub fn add_association(&self, worker: &str, group: &str) -> bool {
        if worker.is_empty() || group.is_empty() {
            return false;
        }
        if !self.worker_refs.lock().contains_key(worker) {
            return false;
        }

        let worker_key = Self::worker_key(worker);
        let group_key = Self::group_key(group);

        let mut worker_groups = self.read_list(&worker_key);
        if worker_groups.iter().any(|existing| existing == group) {
            return false;
        }
        let mut group_workers = self.read_list(&group_key);
        if group_workers.iter().any(|existing| existing == worker) {
            return false;
        }

        worker_groups.push(group.to_string());
        group_workers.push(worker.to_string());

        let written =
            self.write_list(&worker_key, &worker_groups) && self.write_list(&group_key, &group_workers);
        if written {
            *self
                .worker_refs
                .lock()
                .entry(worker.to_string())
                .or_insert(0) += 1;
        }
        written
    }

    /// Remove an association, both directions
    pub fn remove_association(&self, worker: &str, group: &str) -> bool {
        if worker.is_empty() || group.is_empty() {
            return false;
        }
        if !self.worker_refs.lock().contains_key(worker) {
            return false;
        }

        let worker_key = Self::worker_key(worker);
        let group_key = Self::group_key(group);

        let mut worker_groups = self.read_list(&worker_key);
        let worker_had = worker_groups.iter().any(|existing| existing == group);
        worker_groups.retain(|existing| existing != group);

        let mut group_workers = self.read_list(&group_key);
        let group_had = group_workers.iter().any(|existing| existing == worker);
        group_workers.retain(|existing| existing != worker);

        let removed = worker_had
            && group_had
            && self.write_list(&worker_key, &worker_groups)
            && self.write_list(&group_key, &group_workers);
        if removed {
            if let Some(count) = self.worker_refs.lock().get_mut(worker) {
                *count -= 1;
            }
        }
        removed
    }

    /// Workers associated with a resource group
    pub fn workers_for_group(&self, group: &str) -> Vec<String> {
        self.read_list(&Self::group_key(group))
    }

    /// Resource groups associated with a worker
    pub fn groups_for_worker(&self, worker: &str) -> Vec<String> {
        self.read_list(&Self::worker_key(worker))
    }

    fn worker_key(worker: &str) -> String {
        format!("worker/{worker}")
    }

    fn group_key(group: &str) -> String {
        format!("group/{group}")
    }

    fn read_list(&self, key: &str) -> Vec<String> {
        let Ok(txn) = self.db.begin_read() else {
            return Vec::new();
        };
        let Ok(table) = txn.open_table(ASSOCIATION_TABLE) else {
            return Vec::new();
        };
        match table.get(key) {
            Ok(Some(value)) => unpack(value.value()).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    fn write_list(&self, key: &str, items: &[String]) -> bool {
        let packed = pack(items);
        let Ok(txn) = self.db.begin_write() else {
            return false;
        };
        {
            let mut table = match txn.open_table(ASSOCIATION_TABLE) {
                Ok(table) => table,
                Err(e) => {
                    warn!("Association table open failed: {}", e);
                    return false;
                }
            };
            if table.insert(key, packed.as_str()).is_err() {
                return false;
            }
        }
        txn.commit().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_lifecycle() {
        let state = MasterState::new().unwrap();
        assert!(state.add_worker("w1"));
        assert!(!state.add_worker("w1"));
        assert!(!state.add_worker(""));
        assert_eq!(state.list_workers(), vec!["w1"]);

        assert!(state.remove_worker("w1"));
        assert!(!state.remove_worker("w1"));
        assert!(state.list_workers().is_empty());
    }

    #[test]
    fn test_association_is_bijective() {
        let state = MasterState::new().unwrap();
        state.add_worker("w1");
        state.add_worker("w2");

        assert!(state.add_association("w1", "g1"));
        assert!(state.add_association("w2", "g1"));
        assert!(state.add_association("w1", "g2"));
        // Duplicate association is rejected
        assert!(!state.add_association("w1", "g1"));
        // Unknown worker is rejected
        assert!(!state.add_association("w3", "g1"));

        assert_eq!(state.workers_for_group("g1"), vec!["w1", "w2"]);
        assert_eq!(state.groups_for_worker("w1"), vec!["g1", "g2"]);
    }

    #[test]
    fn test_worker_removal_blocked_by_associations() {
        let state = MasterState::new().unwrap();
        state.add_worker("w1");
        state.add_association("w1", "g1");

        assert!(!state.remove_worker("w1"));
        assert!(state.remove_association("w1", "g1"));
        assert!(!state.remove_association("w1", "g1"));
        assert!(state.remove_worker("w1"));
    }
}
