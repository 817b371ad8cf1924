//! Cluster state layers
//!
//! Global resource-group state shared through the object store, the
//! master-local association index, and the row encodings both use.

pub mod global;
pub mod master;
pub mod packed;
pub mod resource;

pub use global::{GlobalState, Mode};
pub use master::MasterState;
pub use resource::{Resource, ResourceCost};
