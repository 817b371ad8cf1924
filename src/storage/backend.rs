//! Provider seam for object storage
//!
//! Every operation fails soft: reads surface provider errors as empty
//! payloads or zero sizes, writes as a `false` return. Nothing crosses
//! this boundary as an error type.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

/// One page of a prefix listing
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Keys in this page, relative to the instance directory
    pub keys: Vec<String>,
    /// Marker to resume from when the listing was truncated
    pub next_marker: Option<String>,
    /// Whether more pages follow
    pub truncated: bool,
}

/// Object-store provider operations.
///
/// Keys are relative to the instance directory; the implementation owns
/// any bucket/prefix mapping.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Write an object, overwriting any existing one
    async fn put(&self, key: &str, data: Bytes) -> bool;

    /// Read an object; missing objects and provider errors read as empty
    async fn get(&self, key: &str) -> Bytes;

    /// Size of an object in bytes; missing objects and errors read as 0
    async fn head(&self, key: &str) -> i64;

    /// Delete an object; deleting a missing object succeeds
    async fn delete(&self, key: &str) -> bool;

    /// Fetch one page of keys under the prefix, resuming from `marker`
    async fn list_page(&self, prefix: &str, marker: Option<String>) -> ListPage;

    /// Delete a batch of keys in one provider call
    async fn bulk_delete(&self, keys: &[String]) -> bool;

    /// Whether `bulk_delete` maps to a single provider operation
    fn supports_bulk_delete(&self) -> bool {
        true
    }
}

/// In-memory backend used by tests.
///
/// Pages are deliberately small so listing pagination and truncation
/// behavior is exercised without a real provider.
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<String, Bytes>>,
    page_size: usize,
    bulk_delete_supported: bool,
}

impl MemoryBackend {
    /// Create a backend with the given listing page size
    pub fn new(page_size: usize) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            page_size: page_size.max(1),
            bulk_delete_supported: true,
        }
    }

    /// Create a backend whose provider lacks multi-object delete
    pub fn without_bulk_delete(page_size: usize) -> Self {
        Self {
            bulk_delete_supported: false,
            ..Self::new(page_size)
        }
    }

    /// Number of stored objects
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn put(&self, key: &str, data: Bytes) -> bool {
        if key.is_empty() {
            return false;
        }
        self.objects.lock().insert(key.to_string(), data);
        true
    }

    async fn get(&self, key: &str) -> Bytes {
        self.objects.lock().get(key).cloned().unwrap_or_default()
    }

    async fn head(&self, key: &str) -> i64 {
        self.objects
            .lock()
            .get(key)
            .map(|data| data.len() as i64)
            .unwrap_or(0)
    }

    async fn delete(&self, key: &str) -> bool {
        self.objects.lock().remove(key);
        true
    }

    async fn list_page(&self, prefix: &str, marker: Option<String>) -> ListPage {
        let objects = self.objects.lock();
        let range_start = match &marker {
            Some(marker) => Bound::Excluded(marker.clone()),
            None => Bound::Unbounded,
        };

        let mut keys = Vec::new();
        let mut truncated = false;
        for (key, _) in objects.range((range_start, Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                continue;
            }
            if keys.len() == self.page_size {
                truncated = true;
                break;
            }
            keys.push(key.clone());
        }

        let next_marker = if truncated { keys.last().cloned() } else { None };
        ListPage {
            keys,
            next_marker,
            truncated,
        }
    }

    async fn bulk_delete(&self, keys: &[String]) -> bool {
        if !self.bulk_delete_supported {
            return false;
        }
        let mut objects = self.objects.lock();
        for key in keys {
            objects.remove(key);
        }
        true
    }

    fn supports_bulk_delete(&self) -> bool {
        self.bulk_delete_supported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listing_paginates_with_markers() {
        let backend = MemoryBackend::new(2);
        for index in 0..5 {
            backend
                .put(&format!("rows/{index}"), Bytes::from_static(b"x"))
                .await;
        }

        let first = backend.list_page("rows/", None).await;
        assert_eq!(first.keys, vec!["rows/0", "rows/1"]);
        assert!(first.truncated);

        let second = backend.list_page("rows/", first.next_marker).await;
        assert_eq!(second.keys, vec!["rows/2", "rows/3"]);

        let third = backend.list_page("rows/", second.next_marker).await;
        assert_eq!(third.keys, vec!["rows/4"]);
        assert!(!third.truncated);
        assert!(third.next_marker.is_none());
    }

    #[tokio::test]
    async fn test_missing_object_reads_empty() {
        let backend = MemoryBackend::new(10);
        assert!(backend.get("absent").await.is_empty());
        assert_eq!(backend.head("absent").await, 0);
    }
}
