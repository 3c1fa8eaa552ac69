//! In-process session cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::traits::SessionCache;
use crate::error::CacheError;

struct CachedSession {
    value: Vec<u8>,
    expires_at: Instant,
}

/// `SessionCache` backed by a `HashMap`.
///
/// Expired entries are invisible to `get` right away and are dropped from
/// memory by [`MemoryCache::purge_expired`].
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CachedSession>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Expired sessions purged");
        }
        removed
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl SessionCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .await
            .insert(key.to_string(), CachedSession { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<u64, CacheError> {
        let removed = self.entries.lock().await.remove(key);
        // An expired entry counts as already gone.
        Ok(removed.is_some_and(|e| e.expires_at > Instant::now()) as u64)
    }
}

/// Spawn a background task that purges expired sessions every `every`.
pub fn spawn_sweep_task(cache: Arc<MemoryCache>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            cache.purge_expired().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(40);

    #[tokio::test]
    async fn set_get_delete() {
        let cache = MemoryCache::new();
        assert!(cache.get("U1").await.unwrap().is_none());

        cache.set("U1", b"one".to_vec(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("U1").await.unwrap().unwrap(), b"one");

        assert_eq!(cache.delete("U1").await.unwrap(), 1);
        assert_eq!(cache.delete("U1").await.unwrap(), 0);
        assert!(cache.get("U1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = MemoryCache::new();
        cache.set("U1", b"one".to_vec(), SHORT).await.unwrap();
        tokio::time::sleep(SHORT * 2).await;
        assert!(cache.get("U1").await.unwrap().is_none());
        assert_eq!(cache.delete("U1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn set_refreshes_ttl() {
        let cache = MemoryCache::new();
        cache.set("U1", b"one".to_vec(), SHORT * 3).await.unwrap();
        tokio::time::sleep(SHORT * 2).await;
        cache.set("U1", b"two".to_vec(), SHORT * 3).await.unwrap();
        tokio::time::sleep(SHORT * 2).await;
        assert_eq!(cache.get("U1").await.unwrap().unwrap(), b"two");
    }

    #[tokio::test]
    async fn purge_drops_only_expired() {
        let cache = MemoryCache::new();
        cache.set("old", b"x".to_vec(), SHORT).await.unwrap();
        cache.set("new", b"y".to_vec(), Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(SHORT * 2).await;

        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.len().await, 1);
        assert!(cache.get("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_task_runs() {
        let cache = Arc::new(MemoryCache::new());
        cache.set("old", b"x".to_vec(), SHORT).await.unwrap();
        let handle = spawn_sweep_task(cache.clone(), SHORT);
        tokio::time::sleep(SHORT * 4).await;
        assert!(cache.is_empty().await);
        handle.abort();
    }
}
