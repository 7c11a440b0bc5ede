//! In-memory LRU cache backend, capacity counted in entries.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CacheEntry, CacheStore};

const DEFAULT_CAPACITY: usize = 512;

struct Inner {
    entries: HashMap<String, CacheEntry>,
    /// Front = least recently used.
    order: Vec<String>,
}

pub(crate) struct MemoryStore {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
            capacity: capacity.unwrap_or(DEFAULT_CAPACITY).max(1),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get(key).cloned()?;
        if let Some(pos) = inner.order.iter().position(|k| k == key) {
            let key = inner.order.remove(pos);
            inner.order.push(key);
        }
        Some(entry)
    }

    async fn put(&self, key: String, entry: CacheEntry) {
        let mut inner = self.inner.lock();
        if inner.entries.insert(key.clone(), entry).is_none() {
            inner.order.push(key);
            while inner.order.len() > self.capacity {
                let evicted = inner.order.remove(0);
                inner.entries.remove(&evicted);
            }
        } else if let Some(pos) = inner.order.iter().position(|k| k == &key) {
            let key = inner.order.remove(pos);
            inner.order.push(key);
        }
    }

    async fn remove(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.entries.remove(key);
        inner.order.retain(|k| k != key);
    }

    async fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tag: u8) -> CacheEntry {
        CacheEntry {
            status: 200,
            headers: Vec::new(),
            body: vec![tag],
            stored_at: 0,
            vary: Vec::new(),
        }
    }

    #[tokio::test]
    async fn put_get_remove() {
        let store = MemoryStore::new(None);
        store.put("a".into(), entry(1)).await;
        assert_eq!(store.get("a").await.unwrap().body, vec![1]);
        assert_eq!(store.size().await, 1);
        store.remove("a").await;
        assert!(store.get("a").await.is_none());
        assert_eq!(store.size().await, 0);
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let store = MemoryStore::new(Some(2));
        store.put("a".into(), entry(1)).await;
        store.put("b".into(), entry(2)).await;
        // touch "a" so "b" becomes the eviction candidate
        let _ = store.get("a").await;
        store.put("c".into(), entry(3)).await;
        assert!(store.get("a").await.is_some());
        assert!(store.get("b").await.is_none());
        assert!(store.get("c").await.is_some());
    }

    #[tokio::test]
    async fn overwrite_does_not_grow() {
        let store = MemoryStore::new(Some(2));
        store.put("a".into(), entry(1)).await;
        store.put("a".into(), entry(9)).await;
        assert_eq!(store.size().await, 1);
        assert_eq!(store.get("a").await.unwrap().body, vec![9]);
    }
}
