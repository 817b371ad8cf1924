//! Resources and their costs
//!
//! A resource is one serialized work item plus the cost of running it;
//! a resource group's row aggregates the costs of its members.

use sha2::{Digest, Sha256};

use super::packed::{pack, unpack};

/// Aggregated cost of a resource or resource group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceCost {
    /// Payload size in bytes
    pub size: i64,
    /// Memory requirement in bytes
    pub memory: i64,
    /// Threads required
    pub threads: i64,
}

impl ResourceCost {
    /// Create a cost from its parts
    pub fn new(size: i64, memory: i64, threads: i64) -> Self {
        Self {
            size,
            memory,
            threads,
        }
    }
}

impl std::ops::Add for ResourceCost {
    type Output = ResourceCost;

    fn add(self, other: ResourceCost) -> ResourceCost {
        ResourceCost {
            size: self.size + other.size,
            memory: self.memory + other.memory,
            threads: self.threads + other.threads,
        }
    }
}

impl std::ops::Sub for ResourceCost {
    type Output = ResourceCost;

    fn sub(self, other: ResourceCost) -> ResourceCost {
        ResourceCost {
            size: self.size - other.size,
            memory: self.memory - other.memory,
            threads: self.threads - other.threads,
        }
    }
}

/// One serialized work item with its cost
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    cost: ResourceCost,
    payload: String,
}

impl Resource {
    /// Create a resource from its cost and serialized payload
    pub fn new(cost: ResourceCost, payload: impl Into<String>) -> Self {
        Self {
            cost,
            payload: payload.into(),
        }
    }

    /// Cost of the resource
    pub fn cost(&self) -> ResourceCost {
        self.cost
    }

    /// Serialized payload
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Row encoding: (size, memory, threads, payload)
    pub fn to_packed(&self) -> String {
        pack(&[
            self.cost.size.to_string(),
            self.cost.memory.to_string(),
            self.cost.threads.to_string(),
            self.payload.clone(),
        ])
    }

    /// Decode a row; malformed rows decode to None
    pub fn from_packed(raw: &str) -> Option<Self> {
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
            payload: fields[3].clone(),
        })
    }

    /// Chained SHA-256 digest over the packed fields, in order
    pub fn unique_hash(&self) -> String {
        let fields = [
            self.cost.size.to_string(),
            self.cost.memory.to_string(),
            self.cost.threads.to_string(),
            self.payload.clone(),
        ];
        let mut current = String::new();
        for field in &fields {
            let mut hasher = Sha256::new();
            hasher.update(current.as_bytes());
            hasher.update(field.as_bytes());
            current = hasher
                .finalize()
                .iter()
                .map(|byte| format!("{:02x}", byte))
                .collect();
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_row_roundtrip() {
        let resource = Resource::new(ResourceCost::new(64, 1024, 2), "item-payload");
        let decoded = Resource::from_packed(&resource.to_packed()).unwrap();
        assert_eq!(decoded, resource);
    }

    #[test]
    fn test_malformed_rows_decode_to_none() {
        assert!(Resource::from_packed("").is_none());
        assert!(Resource::from_packed(&pack(&["1".into(), "2".into()])).is_none());
        assert!(Resource::from_packed(&pack(&[
            "x".into(),
            "0".into(),
            "0".into(),
            "p".into()
        ]))
        .is_none());
    }

    #[test]
    fn test_unique_hash_is_stable_and_payload_sensitive() {
        let first = Resource::new(ResourceCost::new(1, 2, 3), "payload");
        let second = Resource::new(ResourceCost::new(1, 2, 3), "payload");
        let third = Resource::new(ResourceCost::new(1, 2, 3), "different");

        assert_eq!(first.unique_hash(), second.unique_hash());
        assert_ne!(first.unique_hash(), third.unique_hash());
        assert_eq!(first.unique_hash().len(), 64);
    }

    #[test]
    fn test_cost_arithmetic() {
        let total = ResourceCost::new(10, 20, 2) + ResourceCost::new(5, 10, 1);
        assert_eq!(total, ResourceCost::new(15, 30, 3));
        assert_eq!(
            total - ResourceCost::new(5, 10, 1),
            ResourceCost::new(10, 20, 2)
        );
    }
}
