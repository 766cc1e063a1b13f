use serde::{Serialize, de::DeserializeOwned};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::auto_recovery::DrainReport;
use crate::backplane::BackplaneAction;
use crate::error::{BoxError, CacheError};
use crate::events::{CacheEvent, EventHub};
use crate::options::EntryOptions;
use crate::orchestrator::{CacheCore, FactoryContext};
use crate::utils::now_ms;

/// A hybrid cache for values of type `V`.
///
/// Cloning is cheap; all clones share the same stores, locks and backplane
/// subscription. Background work stops once the last clone is dropped.
///
/// # Example
/// ```ignore
/// let cache: Cache<User> = CacheBuilder::new(CacheOptions::new("users"))
///     .with_distributed_store(Arc::new(redis_store))
///     .with_backplane(Arc::new(redis_backplane))
///     .build()
///     .await?;
///
/// let user = cache
///     .get_or_set("user:123", |ctx| async move { db.load_user(&ctx.key).await })
///     .await?;
/// ```
pub struct Cache<V> {
    core: Arc<CacheCore>,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for Cache<V> {
    fn clone(&self) -> Self {
        Cache {
            core: Arc::clone(&self.core),
            _value: PhantomData,
        }
    }
}

impl<V> Cache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn from_core(core: Arc<CacheCore>) -> Self {
        Cache {
            core,
            _value: PhantomData,
        }
    }

    /// Return the cached value, or run `factory` to produce it.
    ///
    /// Concurrent callers for the same key share one factory execution.
    pub async fn get_or_set<F, Fut>(&self, key: &str, factory: F) -> Result<V, CacheError>
    where
        F: FnOnce(FactoryContext<V>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, BoxError>> + Send + 'static,
    {
        let options = self.core.options.default_entry_options.clone();
        self.core.get_or_set(key, factory, &options, None).await
    }

    /// [`get_or_set`](Self::get_or_set) with per-call options.
    pub async fn get_or_set_with_options<F, Fut>(
        &self,
        key: &str,
        factory: F,
        options: &EntryOptions,
    ) -> Result<V, CacheError>
    where
        F: FnOnce(FactoryContext<V>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, BoxError>> + Send + 'static,
    {
        self.core.get_or_set(key, factory, options, None).await
    }

    /// [`get_or_set`](Self::get_or_set) that gives up when `token` is cancelled.
    ///
    /// Cancelling aborts this call's lock wait and its own factory execution. An
    /// execution started by another caller, or left running in the background, is
    /// not affected.
    pub async fn get_or_set_cancellable<F, Fut>(
        &self,
        key: &str,
        factory: F,
        options: &EntryOptions,
        token: &CancellationToken,
    ) -> Result<V, CacheError>
    where
        F: FnOnce(FactoryContext<V>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, BoxError>> + Send + 'static,
    {
        self.core.get_or_set(key, factory, options, Some(token)).await
    }

    /// Return the value if a fresh one is cached.
    pub async fn try_get(&self, key: &str) -> Result<Option<V>, CacheError> {
        let entry = self.core.store.get_typed::<V>(key).await?;
        match entry {
            Some(entry) if entry.is_fresh(now_ms()) => {
                self.core.events.emit(CacheEvent::Hit {
                    key: key.to_string(),
                    stale: false,
                });
                Ok(Some(entry.value))
            }
            _ => {
                self.core.events.emit(CacheEvent::Miss {
                    key: key.to_string(),
                });
                Ok(None)
            }
        }
    }

    /// Return the cached value, or `default` without caching it.
    pub async fn get_or_default(&self, key: &str, default: V) -> Result<V, CacheError> {
        Ok(self.try_get(key).await?.unwrap_or(default))
    }

    /// Store a value and notify other instances.
    pub async fn set(&self, key: &str, value: V) -> Result<(), CacheError> {
        let options = self.core.options.default_entry_options.clone();
        self.set_with_options(key, value, &options).await
    }

    pub async fn set_with_options(
        &self,
        key: &str,
        value: V,
        options: &EntryOptions,
    ) -> Result<(), CacheError> {
        self.core.commit(key, &value, options).await
    }

    /// Remove the key everywhere. Removing a missing key is a no-op.
    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let options = self.core.options.default_entry_options.clone();
        self.remove_with_options(key, &options).await
    }

    pub async fn remove_with_options(
        &self,
        key: &str,
        options: &EntryOptions,
    ) -> Result<(), CacheError> {
        let outcome = self.core.store.remove(key, options).await?;
        let timestamp = self.core.store.clock().next();
        self.core
            .propagate(key, BackplaneAction::Remove, timestamp, options, outcome)
            .await
    }

    /// Mark the entry as no longer fresh, keeping it as fail-safe fallback.
    ///
    /// Without fail-safe in `options` this is a remove.
    pub async fn expire(&self, key: &str) -> Result<(), CacheError> {
        let options = self.core.options.default_entry_options.clone();
        self.expire_with_options(key, &options).await
    }

    pub async fn expire_with_options(
        &self,
        key: &str,
        options: &EntryOptions,
    ) -> Result<(), CacheError> {
        if !options.is_fail_safe_enabled {
            return self.remove_with_options(key, options).await;
        }
        let outcome = self.core.store.expire(key, options).await?;
        let timestamp = self.core.store.clock().next();
        self.core
            .propagate(key, BackplaneAction::Expire, timestamp, options, outcome)
            .await
    }

    pub fn events(&self) -> &EventHub {
        &self.core.events
    }

    pub fn name(&self) -> &str {
        &self.core.options.cache_name
    }

    /// Identifies this instance on the backplane.
    pub fn instance_id(&self) -> &str {
        &self.core.instance_id
    }

    /// Number of notifications waiting for auto-recovery.
    pub fn auto_recovery_len(&self) -> usize {
        self.core.recovery.len()
    }

    /// Keys scheduled for a forced re-check after the auto-recovery queue overflowed.
    pub fn pending_resync(&self) -> Vec<String> {
        self.core.recovery.pending_resync()
    }

    /// Retry queued notifications now instead of waiting for the background worker.
    pub async fn flush_auto_recovery(&self) -> DrainReport {
        self.core
            .recovery
            .drain_and_retry(&self.core.store, self.core.accessor.as_deref())
            .await
    }

    /// A handle for callers outside the async runtime.
    pub fn blocking(&self, handle: Handle) -> BlockingCache<V> {
        BlockingCache {
            cache: self.clone(),
            handle,
        }
    }
}

/// Blocking front-end for threads that are not running on the runtime.
///
/// Every method blocks the current thread; calling them from inside an async task
/// panics.
pub struct BlockingCache<V> {
    cache: Cache<V>,
    handle: Handle,
}

impl<V> BlockingCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Like [`Cache::get_or_set`], with a synchronous factory run on the blocking pool.
    pub fn get_or_set<F>(&self, key: &str, factory: F) -> Result<V, CacheError>
    where
        F: FnOnce(FactoryContext<V>) -> Result<V, BoxError> + Send + 'static,
    {
        self.handle.block_on(self.cache.get_or_set(key, |ctx| async move {
            match tokio::task::spawn_blocking(move || factory(ctx)).await {
                Ok(result) => result,
                Err(e) => Err(Box::new(e) as BoxError),
            }
        }))
    }

    pub fn try_get(&self, key: &str) -> Result<Option<V>, CacheError> {
        self.handle.block_on(self.cache.try_get(key))
    }

    pub fn set(&self, key: &str, value: V) -> Result<(), CacheError> {
        self.handle.block_on(self.cache.set(key, value))
    }

    pub fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.handle.block_on(self.cache.remove(key))
    }
}
