//! On-disk cache backend: one content-addressed JSON file per entry.
//!
//! File names are the SHA-256 of the cache key, so arbitrary URLs never
//! touch path semantics. The directory is created on first write. All I/O
//! goes through tokio's fs so lookups never block the runtime.

use std::path::PathBuf;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{CacheEntry, CacheStore};

pub(crate) struct DiskStore {
    dir: PathBuf,
}

/// Serialization shape: the body travels base64-encoded so the file stays
/// valid JSON.
#[derive(Serialize, Deserialize)]
struct DiskEntry {
    status: u16,
    headers: Vec<(String, String)>,
    body_b64: String,
    stored_at: u64,
    vary: Vec<(String, String)>,
}

impl DiskStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let mut name = String::with_capacity(64 + 5);
        for byte in digest {
            name.push_str(&format!("{byte:02x}"));
        }
        name.push_str(".json");
        self.dir.join(name)
    }
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn get(&self, key: &str) -> Option<CacheEntry> {
        let raw = tokio::fs::read(self.path_for(key)).await.ok()?;
        let disk: DiskEntry = serde_json::from_slice(&raw).ok()?;
        let body = base64::engine::general_purpose::STANDARD
            .decode(&disk.body_b64)
            .ok()?;
        Some(CacheEntry {
            status: disk.status,
            headers: disk.headers,
            body,
            stored_at: disk.stored_at,
            vary: disk.vary,
        })
    }

    async fn put(&self, key: String, entry: CacheEntry) {
        let disk = DiskEntry {
            status: entry.status,
            headers: entry.headers,
            body_b64: base64::engine::general_purpose::STANDARD.encode(&entry.body),
            stored_at: entry.stored_at,
            vary: entry.vary,
        };
        let Ok(raw) = serde_json::to_vec(&disk) else {
            return;
        };
        if let Err(err) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(dir = %self.dir.display(), error = %err, "cache directory create failed");
            return;
        }
        let path = self.path_for(&key);
        if let Err(err) = tokio::fs::write(&path, raw).await {
            warn!(path = %path.display(), error = %err, "cache write failed");
        } else {
            debug!(path = %path.display(), "cache entry written");
        }
    }

    async fn remove(&self, key: &str) {
        let _ = tokio::fs::remove_file(self.path_for(key)).await;
    }

    async fn size(&self) -> usize {
        let Ok(mut dir) = tokio::fs::read_dir(&self.dir).await else {
            return 0;
        };
        let mut count = 0;
        while let Ok(Some(entry)) = dir.next_entry().await {
            if entry.path().extension().is_some_and(|e| e == "json") {
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> DiskStore {
        let dir = std::env::temp_dir().join(format!(
            "faith-disk-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        DiskStore::new(dir)
    }

    fn entry() -> CacheEntry {
        CacheEntry {
            status: 200,
            headers: vec![("content-type".into(), "text/plain".into())],
            body: b"on disk".to_vec(),
            stored_at: 1_700_000_000,
            vary: vec![("accept".into(), "text/plain".into())],
        }
    }

    #[tokio::test]
    async fn round_trip_and_remove() {
        let store = temp_store();
        assert!(store.get("k").await.is_none());
        store.put("k".into(), entry()).await;
        let got = store.get("k").await.unwrap();
        assert_eq!(got.body, b"on disk");
        assert_eq!(got.headers, entry().headers);
        assert_eq!(got.vary, entry().vary);
        assert_eq!(store.size().await, 1);
        store.remove("k").await;
        assert!(store.get("k").await.is_none());
    }

    #[tokio::test]
    async fn keys_are_content_addressed() {
        let store = temp_store();
        let a = store.path_for("GET http://example.com/a");
        let b = store.path_for("GET http://example.com/b");
        assert_ne!(a, b);
        // no URL bytes leak into the file name
        assert!(!a.to_string_lossy().contains("example"));
    }
}
