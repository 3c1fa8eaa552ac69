//! Per-user mutation locks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Hands out one async mutex per key so read-modify-write cycles on the same
/// session never interleave.
///
/// Entries no other task holds are pruned once the map grows past
/// `prune_at`.
pub struct KeyedLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    prune_at: usize,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::with_prune_threshold(1024)
    }

    pub fn with_prune_threshold(prune_at: usize) -> Self {
        Self {
            locks: std::sync::Mutex::new(HashMap::new()),
            prune_at: prune_at.max(1),
        }
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            if locks.len() >= self.prune_at {
                // Only the map holds an idle entry.
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new()
    }
}
