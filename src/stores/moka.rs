use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use std::time::{Duration, Instant};

use crate::entry::{StorageMode, StoredEntry};
use crate::error::CacheError;
use crate::store::Store;
use crate::utils::{build_cache_key, now_ms};

/// Configuration for MokaStore.
#[derive(Debug, Clone)]
pub struct MokaStoreConfig {
    /// Maximum number of entries the cache can hold.
    pub max_capacity: u64,

    /// Time to idle: entries are expired if not accessed within this duration.
    /// `None` means entries don't expire based on idle time.
    pub time_to_idle: Option<Duration>,
}

impl Default for MokaStoreConfig {
    fn default() -> Self {
        MokaStoreConfig {
            max_capacity: 10_000,
            time_to_idle: None,
        }
    }
}

/// Evicts every entry once its fail-safe window (or freshness window) is over.
struct EntryExpiry;

impl EntryExpiry {
    fn remaining(entry: &StoredEntry) -> Duration {
        let left = entry.meta().stale_until() - now_ms();
        Duration::from_millis(left.max(0) as u64)
    }
}

impl Expiry<String, StoredEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(Self::remaining(value))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(Self::remaining(value))
    }
}

/// High-performance concurrent in-process store using Moka.
///
/// Entries are stored typed and evicted by Moka once their fail-safe window ends,
/// or earlier when `max_capacity` is reached.
pub struct MokaStore {
    cache: Cache<String, StoredEntry>,
}

impl MokaStore {
    /// Create a new MokaStore with the given configuration.
    ///
    /// # Example
    /// ```ignore
    /// let store = MokaStore::new(MokaStoreConfig {
    ///     max_capacity: 10_000,
    ///     time_to_idle: Some(Duration::from_secs(60)),
    /// });
    /// ```
    pub fn new(config: MokaStoreConfig) -> Self {
        let mut builder = Cache::builder()
            .max_capacity(config.max_capacity)
            .expire_after(EntryExpiry);

        if let Some(tti) = config.time_to_idle {
            builder = builder.time_to_idle(tti);
        }

        MokaStore {
            cache: builder.build(),
        }
    }

    /// Get cache statistics (entry count, weighted size).
    pub fn stats(&self) -> (u64, u64) {
        (self.cache.entry_count(), self.cache.weighted_size())
    }
}

#[async_trait]
impl Store for MokaStore {
    fn name(&self) -> &'static str {
        "moka"
    }

    fn storage_mode(&self) -> StorageMode {
        StorageMode::Typed
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredEntry>, CacheError> {
        let cache_key = build_cache_key(&namespace, key);

        match self.cache.get(&cache_key).await {
            Some(entry) if entry.meta().stale_until() <= now_ms() => {
                self.cache.invalidate(&cache_key).await;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn set(&self, namespace: &str, key: &str, entry: StoredEntry) -> Result<(), CacheError> {
        let cache_key = build_cache_key(&namespace, key);
        self.cache.insert(cache_key, entry).await;
        Ok(())
    }

    async fn remove(&self, namespace: &str, keys: &[&str]) -> Result<(), CacheError> {
        for key in keys {
            let cache_key = build_cache_key(&namespace, key);
            self.cache.invalidate(&cache_key).await;
        }

        Ok(())
    }
}
