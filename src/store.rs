use async_trait::async_trait;

use crate::entry::{StorageMode, StoredEntry};
use crate::error::CacheError;

/// A store is a common interface for storing, reading and deleting cache entries.
///
/// Stores are type-agnostic and work with `StoredEntry`, which holds either typed
/// values (in-process stores) or serialized JSON (distributed stores).
///
/// The store implementation is responsible for cleaning up expired data on its own,
/// using `entry.meta().stale_until()` as the physical expiration.
#[async_trait]
pub trait Store: Send + Sync {
    /// A name for logs and events.
    ///
    /// # Example
    /// - "hashmap"
    /// - "moka"
    /// - "redis"
    fn name(&self) -> &'static str;

    /// Returns the storage mode preference for this store.
    ///
    /// Default implementation returns `Serialized` for safety.
    fn storage_mode(&self) -> StorageMode {
        StorageMode::Serialized
    }

    /// Return the cached entry, or `None` for cache misses.
    ///
    /// Entries past their fail-safe window may be omitted.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredEntry>, CacheError>;

    /// Sets the entry for the given key, replacing any previous entry.
    async fn set(&self, namespace: &str, key: &str, entry: StoredEntry) -> Result<(), CacheError>;

    /// Removes the key(s) from the store. Removing a missing key is not an error.
    async fn remove(&self, namespace: &str, keys: &[&str]) -> Result<(), CacheError>;
}
