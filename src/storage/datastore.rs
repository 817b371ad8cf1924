//! Key-value datastore over an object-store backend
//!
//! Adds the cross-cutting bookkeeping the cluster state layers rely on:
//! a private metadata object tracking the stored byte total and a
//! free-form string map, and a per-instance size memoization map that
//! reconciles against the provider at every head.
//!
//! Keys starting with '.' are private: excluded from listings, from the
//! byte total, and from misc bookkeeping.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::Stream;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::backend::StoreBackend;
use crate::state::packed::{pack, unpack};

/// Key of the private metadata object
pub const METADATA_KEY: &str = ".datastore/metadata";

#[derive(Default)]
struct DataStoreInner {
    /// Sum of stored payload bytes over non-dot keys
    data_size: i64,
    /// Free-form metadata string map
    misc: HashMap<String, String>,
    /// Last authoritative size observed per key
    memoized: HashMap<String, i64>,
}

/// Datastore over a pluggable object-store backend
pub struct DataStore {
    backend: Arc<dyn StoreBackend>,
    inner: Mutex<DataStoreInner>,
}

impl DataStore {
    /// Open the datastore, loading any previously written metadata
    pub async fn open(backend: Arc<dyn StoreBackend>) -> Self {
        let store = Self {
            backend,
            inner: Mutex::new(DataStoreInner::default()),
        };
        store.load_metadata().await;
        store
    }

    /// Write an item. Dot keys are rejected; use the misc metadata map
    /// for private values.
    pub async fn add_item(&self, key: &str, value: &str) -> bool {
        if key.is_empty() || key.starts_with('.') {
            return false;
        }

        let previous_size = self.object_size(key).await;
        let added = self
            .backend
            .put(key, Bytes::from(value.as_bytes().to_vec()))
            .await;
        if added {
            {
                let mut inner = self.inner.lock();
                inner.data_size += value.len() as i64 - previous_size;
                inner.memoized.insert(key.to_string(), value.len() as i64);
            }
            self.write_metadata().await;
        }
        added
    }

    /// Read an item; missing items and provider errors read as empty
    pub async fn get_item(&self, key: &str) -> String {
        if key.is_empty() {
            return String::new();
        }
        String::from_utf8_lossy(&self.backend.get(key).await).into_owned()
    }

    /// Size of an item in bytes.
    ///
    /// The memoized value is authoritative while present; the entry is
    /// evicted once the provider agrees with it.
    pub async fn object_size(&self, key: &str) -> i64 {
        if key.is_empty() {
            return 0;
        }

        let cached = self.inner.lock().memoized.get(key).copied();
        let remote = self.backend.head(key).await;

        match cached {
            Some(cached) => {
                if cached == remote {
                    self.inner.lock().memoized.remove(key);
                }
                cached
            }
            None => remote,
        }
    }

    /// Delete an item
    pub async fn delete_item(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }

        let original_size = self.object_size(key).await;
        let deleted = self.backend.delete(key).await;
        if deleted && !key.starts_with('.') {
            {
                let mut inner = self.inner.lock();
                inner.data_size -= original_size;
                inner.memoized.remove(key);
            }
            self.write_metadata().await;
        }
        deleted
    }

    /// Lazily list keys under the prefix, prefix stripped.
    ///
    /// Pages are fetched on demand; dropping the stream stops any
    /// further page fetches. Dot keys are never yielded.
    pub fn list_items(&self, prefix: impl Into<String>) -> impl Stream<Item = String> + 'static {
        struct ListState {
            backend: Arc<dyn StoreBackend>,
            prefix: String,
            marker: Option<String>,
            queue: VecDeque<String>,
            done: bool,
        }

        let state = ListState {
            backend: self.backend.clone(),
            prefix: prefix.into(),
            marker: None,
            queue: VecDeque::new(),
            done: false,
        };

        futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(key) = state.queue.pop_front() {
                    return Some((key, state));
                }
                if state.done {
                    return None;
                }

                let marker = state.marker.take();
                let page = state.backend.list_page(&state.prefix, marker).await;
                state.done = !page.truncated;
                state.marker = page.next_marker;
                for key in page.keys {
                    if key.starts_with('.') {
                        continue;
                    }
                    if let Some(stripped) = key.strip_prefix(&state.prefix) {
                        if !stripped.is_empty() {
                            state.queue.push_back(stripped.to_string());
                        }
                    }
                }
            }
        })
    }

    /// Delete a batch of items in one provider call where supported,
    /// falling back to one-by-one deletes otherwise
    pub async fn bulk_delete(&self, keys: &[String]) -> bool {
        if keys.is_empty() {
            return true;
        }
        if !self.backend.supports_bulk_delete() {
            let mut all_deleted = true;
            for key in keys {
                all_deleted &= self.delete_item(key).await;
            }
            return all_deleted;
        }

        let mut reclaimed = 0;
        for key in keys {
            if !key.starts_with('.') {
                reclaimed += self.object_size(key).await;
            }
        }

        let deleted = self.backend.bulk_delete(keys).await;
        if deleted {
            {
                let mut inner = self.inner.lock();
                inner.data_size -= reclaimed;
                for key in keys {
                    inner.memoized.remove(key);
                }
            }
            self.write_metadata().await;
        }
        deleted
    }

    /// Delete every object of this instance, the metadata object
    /// included. Uses the provider's bulk path when supported.
    pub async fn drop_all(&self) -> bool {
        let mut all_deleted = true;
        loop {
            let page = self.backend.list_page("", None).await;
            if page.keys.is_empty() {
                break;
            }

            if self.backend.supports_bulk_delete() {
                all_deleted &= self.backend.bulk_delete(&page.keys).await;
            } else {
                for key in &page.keys {
                    if key.starts_with('.') {
                        all_deleted &= self.backend.delete(key).await;
                    } else {
                        all_deleted &= self.delete_item(key).await;
                    }
                }
            }

            if !page.truncated {
                break;
            }
            if !all_deleted {
                warn!("Bulk delete pass left objects behind");
                break;
            }
        }

        if all_deleted {
            let mut inner = self.inner.lock();
            inner.memoized.clear();
            inner.data_size = 0;
        }
        all_deleted
    }

    /// Tracked total of stored payload bytes
    pub fn size(&self) -> i64 {
        self.inner.lock().data_size
    }

    /// Read a misc metadata value, falling back to the given default
    pub fn misc_value(&self, key: &str, default: &str) -> String {
        self.inner
            .lock()
            .misc
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Set a misc metadata value and push the metadata object
    pub async fn set_misc_value(&self, key: &str, value: &str) {
        self.inner
            .lock()
            .misc
            .insert(key.to_string(), value.to_string());
        self.write_metadata().await;
    }

    /// Re-head memoized keys, evicting entries the provider agrees on.
    ///
    /// With `ensure_consistent` the pass repeats until the map drains,
    /// which is the fixed-point flush that close() performs.
    pub async fn flush(&self, ensure_consistent: bool) {
        loop {
            let keys: Vec<String> = self.inner.lock().memoized.keys().cloned().collect();
            for key in keys {
                self.object_size(&key).await;
            }

            if !ensure_consistent || self.inner.lock().memoized.is_empty() {
                break;
            }
            debug!("Memoization map not yet reconciled, flushing again");
        }
    }

    /// Block until the provider state is consistent, then drop caches
    pub async fn close(&self) {
        self.flush(true).await;
        self.inner.lock().memoized.clear();
    }

    async fn load_metadata(&self) {
        let raw = self.get_item_unchecked(METADATA_KEY).await;
        if raw.is_empty() {
            return;
        }
        let Some(fields) = unpack(&raw) else { return };
        if fields.len() < 2 {
            return;
        }

        let mut inner = self.inner.lock();
        inner.data_size = fields[0].parse().unwrap_or(0);
        if let Some(pairs) = unpack(&fields[1]) {
            for chunk in pairs.chunks(2) {
                if let [key, value] = chunk {
                    inner.misc.insert(key.clone(), value.clone());
                }
            }
        }
    }

    async fn write_metadata(&self) {
        let packed = {
            let inner = self.inner.lock();
            let mut flattened = Vec::with_capacity(inner.misc.len() * 2);
            for (key, value) in &inner.misc {
                flattened.push(key.clone());
                flattened.push(value.clone());
            }
            pack(&[inner.data_size.to_string(), pack(&flattened)])
        };
        self.backend
            .put(METADATA_KEY, Bytes::from(packed))
            .await;
        self.flush(false).await;
    }

    /// Raw read without the dot-key policy, for the metadata object
    async fn get_item_unchecked(&self, key: &str) -> String {
        String::from_utf8_lossy(&self.backend.get(key).await).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::MemoryBackend;
    use futures::StreamExt;

    async fn store() -> DataStore {
        DataStore::open(Arc::new(MemoryBackend::new(2))).await
    }

    #[tokio::test]
    async fn test_add_get_delete_roundtrip() {
        let store = store().await;
        assert!(store.add_item("alpha", "payload").await);
        assert_eq!(store.get_item("alpha").await, "payload");
        assert!(store.delete_item("alpha").await);
        assert_eq!(store.get_item("alpha").await, "");
    }

    #[tokio::test]
    async fn test_dot_keys_are_rejected_and_hidden() {
        let store = store().await;
        assert!(!store.add_item(".private/key", "x").await);
        assert!(store.add_item("visible", "x").await);

        let listed: Vec<String> = store.list_items("").collect().await;
        assert_eq!(listed, vec!["visible"]);
    }

    #[tokio::test]
    async fn test_size_tracks_mutations() {
        let store = store().await;
        store.add_item("a", "12345").await;
        store.add_item("b", "123").await;
        assert_eq!(store.size(), 8);

        store.add_item("a", "1").await;
        assert_eq!(store.size(), 4);

        store.delete_item("b").await;
        assert_eq!(store.size(), 1);
    }

    #[tokio::test]
    async fn test_metadata_survives_reopen() {
        let backend = Arc::new(MemoryBackend::new(10));
        let store = DataStore::open(backend.clone()).await;
        store.add_item("row", "12345678").await;
        store.set_misc_value("Owner", "n1").await;
        store.close().await;

        let reopened = DataStore::open(backend).await;
        assert_eq!(reopened.size(), 8);
        assert_eq!(reopened.misc_value("Owner", ""), "n1");
        assert_eq!(reopened.misc_value("Absent", "fallback"), "fallback");
    }

    #[tokio::test]
    async fn test_listing_strips_prefix_and_paginates() {
        let store = store().await;
        for index in 0..5 {
            store
                .add_item(&format!("rows/{index}"), "x")
                .await;
        }
        store.add_item("other/1", "x").await;

        let listed: Vec<String> = store.list_items("rows/").collect().await;
        assert_eq!(listed, vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_listing_terminates_early() {
        let store = store().await;
        for index in 0..10 {
            store.add_item(&format!("rows/{index}"), "x").await;
        }

        let first_two: Vec<String> = store.list_items("rows/").take(2).collect().await;
        assert_eq!(first_two, vec!["0", "1"]);
    }

    #[tokio::test]
    async fn test_bulk_delete_adjusts_size() {
        let store = store().await;
        store.add_item("a", "12345").await;
        store.add_item("b", "123").await;
        store.add_item("c", "1").await;

        assert!(
            store
                .bulk_delete(&["a".to_string(), "b".to_string()])
                .await
        );
        assert_eq!(store.size(), 1);
        assert_eq!(store.get_item("a").await, "");
        assert_eq!(store.get_item("c").await, "1");
    }

    #[tokio::test]
    async fn test_drop_all_clears_everything() {
        let backend = Arc::new(MemoryBackend::new(2));
        let store = DataStore::open(backend.clone()).await;
        for index in 0..5 {
            store.add_item(&format!("rows/{index}"), "x").await;
        }

        assert!(store.drop_all().await);
        assert_eq!(store.size(), 0);
        assert_eq!(backend.object_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_all_without_bulk_support() {
        let backend = Arc::new(MemoryBackend::without_bulk_delete(2));
        let store = DataStore::open(backend.clone()).await;
        for index in 0..5 {
            store.add_item(&format!("rows/{index}"), "x").await;
        }

        assert!(store.drop_all().await);
        // The metadata object is rewritten by the per-item path, so only
        // it may remain.
        assert!(backend.object_count() <= 1);
    }

    #[tokio::test]
    async fn test_memoization_reconciles_on_flush() {
        let store = store().await;
        store.add_item("row", "12345").await;
        assert_eq!(store.object_size("row").await, 5);

        store.flush(true).await;
        assert!(store.inner.lock().memoized.is_empty());
    }
}
