use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::entry::{StorageMode, StoredEntry};
use crate::error::CacheError;
use crate::store::Store;
use crate::utils::{build_cache_key, now_ms};

/// Configuration for eviction on set operations.
#[derive(Debug, Clone)]
pub struct EvictOnSetConfig {
    /// Provide a number between 0 and 1 to calculate whether eviction should run on each set.
    ///
    /// - `1.0` -> run eviction on every `set`
    /// - `0.5` -> run eviction on every 2nd `set` (on average)
    /// - `0.0` -> disable eviction
    pub frequency: f64,

    /// Remove items until the number of items in the map is lower than `max_items`.
    pub max_items: usize,
}

/// Configuration for HashMapStore.
#[derive(Debug, Clone, Default)]
pub struct HashMapStoreConfig {
    /// Remove expired entries on every `set` operation.
    pub evict_on_set: Option<EvictOnSetConfig>,

    /// Keep entries serialized, the way a distributed store holds them. One such map
    /// can be shared by several caches as their second level.
    pub serialized: bool,
}

/// Thread-safe in-process store using a HashMap behind an RwLock.
///
/// Entries are kept typed, so reads are a reference-count bump. Suitable for
/// moderate concurrency and small to medium cache sizes; `MokaStore` scales better.
pub struct HashMapStore {
    state: RwLock<HashMap<String, StoredEntry>>,
    evict_on_set: Option<EvictOnSetConfig>,
    mode: StorageMode,
}

impl HashMapStore {
    /// Create a new HashMapStore with the given configuration.
    pub fn new(config: HashMapStoreConfig) -> Self {
        HashMapStore {
            state: RwLock::new(HashMap::new()),
            evict_on_set: config.evict_on_set,
            mode: if config.serialized {
                StorageMode::Serialized
            } else {
                StorageMode::Typed
            },
        }
    }

    /// Number of entries currently held, expired ones included.
    pub async fn len(&self) -> usize {
        self.state.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Run eviction if configured and random check passes.
    async fn maybe_evict(&self) {
        let Some(ref config) = self.evict_on_set else {
            return;
        };

        if config.frequency <= 0.0 {
            return;
        }

        let should_evict =
            config.frequency >= 1.0 || rand::thread_rng().gen_bool(config.frequency);
        if !should_evict {
            return;
        }

        let mut state = self.state.write().await;
        let now = now_ms();

        // First delete all expired entries
        state.retain(|_, v| v.meta().stale_until() > now);

        // If still over max_items, remove the ones expiring first
        if state.len() > config.max_items {
            let mut entries: Vec<_> = state
                .iter()
                .map(|(k, v)| (k.clone(), v.meta().stale_until()))
                .collect();
            entries.sort_by_key(|(_, expires)| *expires);

            let to_remove = state.len() - config.max_items;
            for (key, _) in entries.into_iter().take(to_remove) {
                state.remove(&key);
            }
        }
    }
}

#[async_trait]
impl Store for HashMapStore {
    fn name(&self) -> &'static str {
        "hashmap"
    }

    fn storage_mode(&self) -> StorageMode {
        self.mode
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredEntry>, CacheError> {
        let cache_key = build_cache_key(&namespace, key);
        let state = self.state.read().await;

        let Some(stored) = state.get(&cache_key) else {
            return Ok(None);
        };

        if stored.meta().stale_until() <= now_ms() {
            drop(state);
            let mut state = self.state.write().await;
            // Re-check under the write lock, a fresher entry may have landed meanwhile.
            if state
                .get(&cache_key)
                .is_some_and(|e| e.meta().stale_until() <= now_ms())
            {
                state.remove(&cache_key);
            }
            return Ok(None);
        }

        Ok(Some(stored.clone()))
    }

    async fn set(&self, namespace: &str, key: &str, entry: StoredEntry) -> Result<(), CacheError> {
        let cache_key = build_cache_key(&namespace, key);
        let entry = entry.convert_for_mode(self.mode)?;

        {
            let mut state = self.state.write().await;
            state.insert(cache_key, entry);
        }

        self.maybe_evict().await;
        Ok(())
    }

    async fn remove(&self, namespace: &str, keys: &[&str]) -> Result<(), CacheError> {
        let mut state = self.state.write().await;

        for key in keys {
            let cache_key = build_cache_key(&namespace, key);
            state.remove(&cache_key);
        }

        Ok(())
    }
}
