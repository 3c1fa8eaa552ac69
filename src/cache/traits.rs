//! Session cache contract.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheError;

/// Keyed byte store with a per-entry TTL.
///
/// Every `set` replaces the whole value and restarts its TTL.
#[async_trait]
pub trait SessionCache: Send + Sync {
    /// `None` when the key is missing or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Remove the key, returning how many entries were deleted.
    async fn delete(&self, key: &str) -> Result<u64, CacheError>;
}
