//! Global resource-group state
//!
//! Prefix-structured key-value model over the object store that the
//! ownership protocol commits against:
//!
//! ```text
//! ResourceGroups/<groupId>                    = packed(size, memory, threads, count)
//! Resources/<groupId>/<resourceId>            = packed(size, memory, threads, payload)
//! Assignments/Unassigned/<groupId>            = "UNASSIGNED"
//! Assignments/Assigned/<managerId>/<groupId>  = "ASSIGNED"
//! ```
//!
//! Presence of an assignment marker alone encodes assignment; claim and
//! drop write the destination marker before deleting the source so a
//! crash between the two steps cannot lose the group.

use futures::stream::Stream;
use tracing::debug;

use super::packed::{pack, unpack};
use super::resource::{Resource, ResourceCost};
use crate::storage::DataStore;

const GROUPS_PREFIX: &str = "ResourceGroups/";
const UNASSIGNED_PREFIX: &str = "Assignments/Unassigned/";
const ASSIGNED_PREFIX: &str = "Assignments/Assigned/";
const UNASSIGNED_MARKER: &str = "UNASSIGNED";
const ASSIGNED_MARKER: &str = "ASSIGNED";

/// Access mode; every mutation fails in read-only mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
}

/// Aggregate row kept per resource group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct GroupRow {
    cost: ResourceCost,
    count: i64,
}

impl GroupRow {
    fn to_packed(self) -> String {
        pack(&[
            self.cost.size.to_string(),
            self.cost.memory.to_string(),
            self.cost.threads.to_string(),
            self.count.to_string(),
        ])
    }

    fn from_packed(raw: &str) -> Option<Self> {
        let fields = unpack(raw)?;
        if fields.len() < 4 {
            return None;
        }
        Some(Self {
            cost: ResourceCost {
                size: fields[0].parse().ok()?,
                memory: fields[1].parse().ok()?,
                threads: fields[2].parse().ok()?,
            },
            count: fields[3].parse().ok()?,
        })
    }
}

/// Shared global state of resource groups
pub struct GlobalState {
    store: DataStore,
    mode: Mode,
}

impl GlobalState {
    /// Create the state over an opened datastore
    pub fn new(store: DataStore, mode: Mode) -> Self {
        Self { store, mode }
    }

    fn group_key(group: &str) -> String {
        format!("{GROUPS_PREFIX}{group}")
    }

    fn resource_prefix(group: &str) -> String {
        format!("Resources/{group}/")
    }

    fn resource_key(group: &str, resource: &str) -> String {
        format!("Resources/{group}/{resource}")
    }

    fn unassigned_key(group: &str) -> String {
        format!("{UNASSIGNED_PREFIX}{group}")
    }

    fn assigned_prefix(manager: &str) -> String {
        format!("{ASSIGNED_PREFIX}{manager}/")
    }

    fn assigned_key(manager: &str, group: &str) -> String {
        format!("{ASSIGNED_PREFIX}{manager}/{group}")
    }

    fn writable(&self) -> bool {
        self.mode == Mode::ReadWrite
    }

    // ---------- group operations ----------

    /// Add an empty, unassigned resource group.
    ///
    /// Two-put sequence: the group row lands first, then the unassigned
    /// marker; the marker is what makes the group claimable.
    pub async fn add_group(&self, group: &str) -> bool {
        if !self.writable() || group.is_empty() {
            return false;
        }

        let group_key = Self::group_key(group);
        if !self.store.get_item(&group_key).await.is_empty() {
            return false;
        }

        let mut added = self
            .store
            .add_item(&group_key, &GroupRow::default().to_packed())
            .await;
        if added {
            added = self
                .store
                .add_item(&Self::unassigned_key(group), UNASSIGNED_MARKER)
                .await;
        }
        added
    }

    /// Remove an unassigned, empty resource group
    pub async fn remove_group(&self, group: &str) -> bool {
        if !self.writable() || group.is_empty() {
            return false;
        }

        let unassigned_key = Self::unassigned_key(group);
        if self.store.get_item(&unassigned_key).await != UNASSIGNED_MARKER {
            return false;
        }

        let group_key = Self::group_key(group);
        let Some(row) = GroupRow::from_packed(&self.store.get_item(&group_key).await) else {
            return false;
        };
        if row.count > 0 {
            return false;
        }

        let mut removed = self.store.delete_item(&group_key).await;
        removed &= self.store.delete_item(&unassigned_key).await;
        removed
    }

    /// Aggregate cost of a resource group; zero when the group is absent
    pub async fn group_cost(&self, group: &str) -> ResourceCost {
        GroupRow::from_packed(&self.store.get_item(&Self::group_key(group)).await)
            .map(|row| row.cost)
            .unwrap_or_default()
    }

    /// Number of member resources in a group; zero when absent
    pub async fn group_count(&self, group: &str) -> i64 {
        GroupRow::from_packed(&self.store.get_item(&Self::group_key(group)).await)
            .map(|row| row.count)
            .unwrap_or(0)
    }

    /// Lazily list every resource group
    pub fn list_groups(&self) -> impl Stream<Item = String> + 'static {
        self.store.list_items(GROUPS_PREFIX)
    }

    // ---------- ownership operations ----------

    /// Claim an unassigned group for the given manager.
    ///
    /// Succeeds only when the unassigned marker was present, the
    /// assigned marker was written, and the unassigned marker was
    /// deleted, in that order.
    pub async fn claim(&self, manager: &str, group: &str) -> bool {
        if !self.writable() {
            return false;
        }

        let unassigned_key = Self::unassigned_key(group);
        if self.store.get_item(&unassigned_key).await != UNASSIGNED_MARKER {
            return false;
        }

        if !self
            .store
            .add_item(&Self::assigned_key(manager, group), ASSIGNED_MARKER)
            .await
        {
            return false;
        }

        let claimed = self.store.delete_item(&unassigned_key).await;
        if claimed {
            debug!("Manager {} claimed resource group {}", manager, group);
        }
        claimed
    }

    /// Release a group the given manager holds, back to unassigned
    pub async fn drop_group(&self, manager: &str, group: &str) -> bool {
        if !self.writable() {
            return false;
        }

        let assigned_key = Self::assigned_key(manager, group);
        if self.store.get_item(&assigned_key).await != ASSIGNED_MARKER {
            return false;
        }

        if !self
            .store
            .add_item(&Self::unassigned_key(group), UNASSIGNED_MARKER)
            .await
        {
            return false;
        }

        let dropped = self.store.delete_item(&assigned_key).await;
        if dropped {
            debug!("Manager {} dropped resource group {}", manager, group);
        }
        dropped
    }

    /// Lazily list the groups managed by the given manager
    pub fn list_managed(&self, manager: &str) -> impl Stream<Item = String> + 'static {
        self.store.list_items(Self::assigned_prefix(manager))
    }

    /// Lazily list every unmanaged (unassigned) group
    pub fn list_unmanaged(&self) -> impl Stream<Item = String> + 'static {
        self.store.list_items(UNASSIGNED_PREFIX)
    }

    // ---------- resource operations ----------

    /// Write or overwrite a resource in a group.
    ///
    /// The group row is adjusted by the cost delta in the same call;
    /// the member count grows only when the resource is new. Fails when
    /// the group row is absent.
    pub async fn set_resource(&self, group: &str, resource_id: &str, resource: &Resource) -> bool {
        if !self.writable() || group.is_empty() || resource_id.is_empty() {
            return false;
        }
        if resource.payload().is_empty() {
            return false;
        }

        let group_key = Self::group_key(group);
        let Some(row) = GroupRow::from_packed(&self.store.get_item(&group_key).await) else {
            return false;
        };

        let resource_key = Self::resource_key(group, resource_id);
        let previous = Resource::from_packed(&self.store.get_item(&resource_key).await);
        let previous_cost = previous
            .as_ref()
            .map(|existing| existing.cost())
            .unwrap_or_default();

        if !self
            .store
            .add_item(&resource_key, &resource.to_packed())
            .await
        {
            return false;
        }

        let updated = GroupRow {
            cost: row.cost + resource.cost() - previous_cost,
            count: row.count + if previous.is_some() { 0 } else { 1 },
        };
        self.store.add_item(&group_key, &updated.to_packed()).await
    }

    /// Remove a resource from a group, adjusting the group row
    pub async fn remove_resource(&self, group: &str, resource_id: &str) -> bool {
        if !self.writable() || group.is_empty() || resource_id.is_empty() {
            return false;
        }

        let group_key = Self::group_key(group);
        let Some(row) = GroupRow::from_packed(&self.store.get_item(&group_key).await) else {
            return false;
        };

        let resource_key = Self::resource_key(group, resource_id);
        let existing = Resource::from_packed(&self.store.get_item(&resource_key).await);
        if !self.store.delete_item(&resource_key).await {
            return false;
        }

        let Some(existing) = existing else {
            return false;
        };
        let updated = GroupRow {
            cost: row.cost - existing.cost(),
            count: row.count - 1,
        };
        self.store.add_item(&group_key, &updated.to_packed()).await
    }

    /// Read a resource's payload; empty when absent
    pub async fn get_resource(&self, group: &str, resource_id: &str) -> String {
        Resource::from_packed(
            &self
                .store
                .get_item(&Self::resource_key(group, resource_id))
                .await,
        )
        .map(|resource| resource.payload().to_string())
        .unwrap_or_default()
    }

    /// Cost of one resource; zero when absent
    pub async fn resource_cost(&self, group: &str, resource_id: &str) -> ResourceCost {
        Resource::from_packed(
            &self
                .store
                .get_item(&Self::resource_key(group, resource_id))
                .await,
        )
        .map(|resource| resource.cost())
        .unwrap_or_default()
    }

    /// Lazily list the resources in a group
    pub fn list_resources(&self, group: &str) -> impl Stream<Item = String> + 'static {
        self.store.list_items(Self::resource_prefix(group))
    }

    /// Wipe the entire state under this instance's prefix
    pub async fn clear(&self) -> bool {
        if !self.writable() {
            return false;
        }
        self.store.drop_all().await
    }

    /// Block until the store's caches are reconciled, then drop them
    pub async fn close(&self) {
        self.store.close().await;
    }
}
