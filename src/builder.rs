//! Builder API for assembling a cache instance.

use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::auto_recovery::AutoRecoveryQueue;
use crate::backplane::{Backplane, BackplaneAccessor};
use crate::cache::Cache;
use crate::error::CacheError;
use crate::events::EventHub;
use crate::lock::KeyLockRegistry;
use crate::options::CacheOptions;
use crate::orchestrator::CacheCore;
use crate::store::Store;
use crate::stores::memory::{HashMapStore, HashMapStoreConfig};
use crate::tiered::TieredStore;

/// Builder for a [`Cache`].
///
/// Only the options are required. Without a memory store a [`HashMapStore`] is used;
/// the distributed store and the backplane are optional.
///
/// # Example
///
/// ```ignore
/// use hybrid_cache::{CacheBuilder, CacheOptions, MokaStore, MokaStoreConfig, RedisBackplane};
///
/// let cache: Cache<Product> = CacheBuilder::new(CacheOptions::new("products"))
///     .with_memory_store(Arc::new(MokaStore::new(MokaStoreConfig::default())))
///     .with_distributed_store(Arc::new(redis_store))
///     .with_backplane(Arc::new(RedisBackplane::new(config).await?))
///     .build()
///     .await?;
/// ```
pub struct CacheBuilder {
    options: CacheOptions,
    memory: Option<Arc<dyn Store>>,
    distributed: Option<Arc<dyn Store>>,
    backplane: Option<Arc<dyn Backplane>>,
    events: EventHub,
}

impl CacheBuilder {
    pub fn new(options: CacheOptions) -> Self {
        CacheBuilder {
            options,
            memory: None,
            distributed: None,
            backplane: None,
            events: EventHub::new(),
        }
    }

    pub fn with_memory_store(mut self, store: Arc<dyn Store>) -> Self {
        self.memory = Some(store);
        self
    }

    pub fn with_distributed_store(mut self, store: Arc<dyn Store>) -> Self {
        self.distributed = Some(store);
        self
    }

    pub fn with_backplane(mut self, backplane: Arc<dyn Backplane>) -> Self {
        self.backplane = Some(backplane);
        self
    }

    /// Use an existing event hub, e.g. to subscribe before the backplane starts.
    pub fn with_events(mut self, events: EventHub) -> Self {
        self.events = events;
        self
    }

    /// Build the cache and start its background work.
    ///
    /// Fails when the backplane subscription cannot be established.
    pub async fn build<V>(self) -> Result<Cache<V>, CacheError>
    where
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let CacheBuilder {
            options,
            memory,
            distributed,
            backplane,
            events,
        } = self;

        let instance_id = options
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let memory = memory.unwrap_or_else(|| {
            Arc::new(HashMapStore::new(HashMapStoreConfig::default())) as Arc<dyn Store>
        });

        let store = Arc::new(TieredStore::new(
            options.cache_name.clone(),
            memory,
            distributed,
            options.distributed_circuit_break_duration,
            events.clone(),
        ));
        let recovery = Arc::new(AutoRecoveryQueue::new(
            options.auto_recovery.clone(),
            events.clone(),
        ));
        let shutdown = CancellationToken::new();

        let accessor = match backplane {
            Some(transport) => {
                let accessor = Arc::new(BackplaneAccessor::new(
                    instance_id.clone(),
                    transport,
                    store.clone(),
                    recovery.clone(),
                    events.clone(),
                    &options,
                ));
                accessor.start(shutdown.child_token()).await?;
                Some(accessor)
            }
            None => None,
        };

        if options.auto_recovery.enabled {
            AutoRecoveryQueue::spawn_worker(
                recovery.clone(),
                store.clone(),
                accessor.clone(),
                shutdown.child_token(),
            );
        }

        tracing::info!(
            cache = %options.cache_name,
            instance = %instance_id,
            distributed = store.has_distributed(),
            backplane = accessor.is_some(),
            "cache started"
        );

        let core = CacheCore {
            options,
            instance_id,
            store,
            locks: KeyLockRegistry::new(),
            accessor,
            recovery,
            events,
            shutdown,
        };
        Ok(Cache::from_core(Arc::new(core)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::MemoryBackplane;

    #[tokio::test]
    async fn test_builder_defaults() {
        let cache: Cache<String> = CacheBuilder::new(CacheOptions::new("users"))
            .build()
            .await
            .unwrap();

        assert_eq!(cache.name(), "users");
        // A random instance id is generated.
        assert_eq!(cache.instance_id().len(), 36);
    }

    #[tokio::test]
    async fn test_builder_with_all_parts() {
        let distributed: Arc<dyn Store> = Arc::new(HashMapStore::new(HashMapStoreConfig {
            serialized: true,
            ..Default::default()
        }));
        let options = CacheOptions::new("counters").with_instance_id("node-1");
        let cache: Cache<u64> = CacheBuilder::new(options)
            .with_memory_store(Arc::new(HashMapStore::new(HashMapStoreConfig::default())))
            .with_distributed_store(distributed.clone())
            .with_backplane(Arc::new(MemoryBackplane::new()))
            .build()
            .await
            .unwrap();

        assert_eq!(cache.instance_id(), "node-1");
        cache.set("visits", 42).await.unwrap();

        let stored = distributed.get("counters", "visits").await.unwrap().unwrap();
        assert_eq!(stored.into_typed::<u64>().unwrap().value, 42);
    }
}
