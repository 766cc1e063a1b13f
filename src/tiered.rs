use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreaker;
use crate::entry::{Entry, EntryMeta, StorageMode, StoredEntry};
use crate::error::CacheError;
use crate::events::{CacheEvent, EventHub};
use crate::options::EntryOptions;
use crate::store::Store;
use crate::timing::Clock;
use crate::utils::now_ms;

/// Result of a write that may have partially failed.
///
/// The in-process store is authoritative, so a failed distributed write does not fail
/// the operation; it is reported here so the caller can schedule a replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub distributed_failed: bool,
}

/// Which mutation to (re)apply to the distributed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DistributedOp {
    Set,
    Remove,
    Expire,
}

/// Two-level store: an in-process store in front of an optional distributed store.
///
/// Reads check the in-process store first. When it has nothing fresh, the distributed
/// store is consulted and a newer copy found there is written back to the in-process
/// store before being returned.
pub struct TieredStore {
    namespace: String,
    memory: Arc<dyn Store>,
    distributed: Option<Arc<dyn Store>>,
    breaker: CircuitBreaker,
    clock: Clock,
    events: EventHub,
}

impl TieredStore {
    /// Create a new two-level store.
    ///
    /// # Example
    /// ```ignore
    /// let tiered = TieredStore::new(
    ///     "users",
    ///     Arc::new(MokaStore::new(MokaStoreConfig::default())),
    ///     Some(Arc::new(redis_store)),
    ///     Duration::from_secs(5),
    ///     EventHub::new(),
    /// );
    /// ```
    pub fn new(
        namespace: impl Into<String>,
        memory: Arc<dyn Store>,
        distributed: Option<Arc<dyn Store>>,
        break_duration: Duration,
        events: EventHub,
    ) -> Self {
        TieredStore {
            namespace: namespace.into(),
            memory,
            distributed,
            breaker: CircuitBreaker::new("distributed", break_duration),
            clock: Clock::new(),
            events,
        }
    }

    /// Orders writes made through this store.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn has_distributed(&self) -> bool {
        self.distributed.is_some()
    }

    /// Read an entry, merging both levels.
    pub async fn get(&self, key: &str) -> Result<Option<StoredEntry>, CacheError> {
        let local = self.memory.get(&self.namespace, key).await?;

        if let Some(entry) = &local
            && entry.meta().is_fresh(now_ms())
        {
            return Ok(local);
        }

        let Some(remote) = self.get_distributed(key).await else {
            return Ok(local);
        };

        let remote_is_newer = local
            .as_ref()
            .is_none_or(|l| remote.meta().last_modified > l.meta().last_modified);
        if !remote_is_newer {
            return Ok(local);
        }

        tracing::debug!(cache = %self.namespace, key = %key, "read-through from distributed store");
        self.set_local(key, remote.clone()).await?;
        Ok(Some(remote))
    }

    /// Read and convert an entry to `V`.
    ///
    /// A serialized entry is cached back typed in the in-process store so later reads
    /// skip deserialization. Undecodable distributed payloads are treated as misses.
    pub async fn get_typed<V>(&self, key: &str) -> Result<Option<Entry<V>>, CacheError>
    where
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let Some(stored) = self.get(key).await? else {
            return Ok(None);
        };

        match stored {
            StoredEntry::Typed { .. } => stored.into_typed().map(Some),
            StoredEntry::Serialized { .. } => match stored.into_typed::<V>() {
                Ok(entry) => {
                    if self.memory.storage_mode() == StorageMode::Typed {
                        let typed = StoredEntry::from_typed_with_serializer(
                            entry.value.clone(),
                            entry.meta,
                        );
                        self.set_local(key, typed).await?;
                    }
                    Ok(Some(entry))
                }
                Err(e) => {
                    tracing::warn!(
                        cache = %self.namespace,
                        key = %key,
                        error = %e,
                        "dropping undecodable entry"
                    );
                    self.events.emit(CacheEvent::DistributedStoreError {
                        key: key.to_string(),
                        error: e.to_string(),
                    });
                    Ok(None)
                }
            },
        }
    }

    /// Write through both levels.
    pub async fn set(
        &self,
        key: &str,
        entry: StoredEntry,
        options: &EntryOptions,
    ) -> Result<WriteOutcome, CacheError> {
        self.set_local(key, entry.clone()).await?;
        self.run_distributed(key, DistributedOp::Set, Some(entry), options)
            .await
    }

    /// Remove from both levels. Removing a missing key is a no-op.
    pub async fn remove(
        &self,
        key: &str,
        options: &EntryOptions,
    ) -> Result<WriteOutcome, CacheError> {
        self.remove_local(key).await?;
        self.run_distributed(key, DistributedOp::Remove, None, options)
            .await
    }

    /// Mark the entry as no longer fresh on both levels, keeping fail-safe material.
    pub async fn expire(
        &self,
        key: &str,
        options: &EntryOptions,
    ) -> Result<WriteOutcome, CacheError> {
        self.expire_local(key).await?;
        self.run_distributed(key, DistributedOp::Expire, None, options)
            .await
    }

    /// Metadata of the in-process copy, if any.
    pub async fn local_meta(&self, key: &str) -> Result<Option<EntryMeta>, CacheError> {
        Ok(self
            .memory
            .get(&self.namespace, key)
            .await?
            .map(|e| *e.meta()))
    }

    pub(crate) async fn set_local(&self, key: &str, entry: StoredEntry) -> Result<(), CacheError> {
        self.clock.observe(entry.meta().last_modified);
        let entry = entry.convert_for_mode(self.memory.storage_mode())?;
        self.memory.set(&self.namespace, key, entry).await
    }

    pub(crate) async fn remove_local(&self, key: &str) -> Result<(), CacheError> {
        self.memory.remove(&self.namespace, &[key]).await
    }

    /// Downgrade the in-process copy; entries without fail-safe are removed.
    pub(crate) async fn expire_local(&self, key: &str) -> Result<(), CacheError> {
        let Some(entry) = self.memory.get(&self.namespace, key).await? else {
            return Ok(());
        };
        if entry.meta().is_fail_safe_enabled {
            let meta = entry.meta().expired_at(now_ms());
            self.memory
                .set(&self.namespace, key, entry.with_meta(meta))
                .await
        } else {
            self.remove_local(key).await
        }
    }

    /// Copy the distributed entry into the in-process store when it is at least as
    /// recent as `min_timestamp`. Returns whether the local copy was refreshed.
    pub(crate) async fn refresh_local_from_distributed(
        &self,
        key: &str,
        min_timestamp: i64,
    ) -> Result<bool, CacheError> {
        match self.get_distributed(key).await {
            Some(remote) if remote.meta().last_modified >= min_timestamp => {
                self.set_local(key, remote).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Read only the distributed level. Errors are logged and read as a miss.
    pub(crate) async fn get_distributed(&self, key: &str) -> Option<StoredEntry> {
        let distributed = self.distributed.as_ref()?;
        if !self.breaker.is_usable() {
            return None;
        }

        match distributed.get(&self.namespace, key).await {
            Ok(entry) => {
                self.breaker.record_success();
                entry
            }
            Err(e) => {
                self.breaker.record_failure();
                self.report_distributed_error(key, &e);
                None
            }
        }
    }

    /// Re-apply a distributed mutation that previously failed.
    ///
    /// `Set` replays whatever the in-process store currently holds.
    pub(crate) async fn replay_distributed(&self, key: &str, op: DistributedOp) -> bool {
        let entry = match op {
            DistributedOp::Set => match self.memory.get(&self.namespace, key).await {
                Ok(Some(entry)) => Some(entry),
                // Nothing left to replay.
                Ok(None) => return true,
                Err(_) => return false,
            },
            DistributedOp::Remove | DistributedOp::Expire => None,
        };
        let foreground = EntryOptions::default().with_background_distributed_operations(false);
        matches!(
            self.run_distributed(key, op, entry, &foreground).await,
            Ok(WriteOutcome {
                distributed_failed: false
            })
        )
    }

    async fn run_distributed(
        &self,
        key: &str,
        op: DistributedOp,
        entry: Option<StoredEntry>,
        options: &EntryOptions,
    ) -> Result<WriteOutcome, CacheError> {
        let Some(distributed) = self.distributed.clone() else {
            return Ok(WriteOutcome::default());
        };

        if !self.breaker.is_usable() {
            tracing::debug!(
                cache = %self.namespace,
                key = %key,
                ?op,
                "distributed store unavailable, skipping"
            );
            return Ok(WriteOutcome {
                distributed_failed: true,
            });
        }

        let entry = match entry {
            Some(entry) => Some(entry.convert_for_mode(distributed.storage_mode())?),
            None => None,
        };

        if options.allow_background_distributed_operations {
            let namespace = self.namespace.clone();
            let key = key.to_string();
            let events = self.events.clone();
            tokio::spawn(async move {
                let result =
                    apply_distributed(distributed.as_ref(), &namespace, &key, op, entry).await;
                if let Err(e) = result {
                    tracing::warn!(
                        cache = %namespace,
                        key = %key,
                        error = %e,
                        "background distributed operation failed"
                    );
                    events.emit(CacheEvent::DistributedStoreError {
                        key,
                        error: e.to_string(),
                    });
                }
            });
            return Ok(WriteOutcome::default());
        }

        match apply_distributed(distributed.as_ref(), &self.namespace, key, op, entry).await {
            Ok(()) => {
                self.breaker.record_success();
                Ok(WriteOutcome::default())
            }
            Err(e) => {
                self.breaker.record_failure();
                self.report_distributed_error(key, &e);
                Ok(WriteOutcome {
                    distributed_failed: true,
                })
            }
        }
    }

    fn report_distributed_error(&self, key: &str, error: &CacheError) {
        tracing::warn!(
            cache = %self.namespace,
            key = %key,
            error = %error,
            "distributed store error"
        );
        self.events.emit(CacheEvent::DistributedStoreError {
            key: key.to_string(),
            error: error.to_string(),
        });
    }
}

async fn apply_distributed(
    store: &dyn Store,
    namespace: &str,
    key: &str,
    op: DistributedOp,
    entry: Option<StoredEntry>,
) -> Result<(), CacheError> {
    match (op, entry) {
        (DistributedOp::Set, Some(entry)) => store.set(namespace, key, entry).await,
        (DistributedOp::Set, None) | (DistributedOp::Remove, _) => {
            store.remove(namespace, &[key]).await
        }
        (DistributedOp::Expire, _) => match store.get(namespace, key).await? {
            Some(current) if current.meta().is_fail_safe_enabled => {
                let meta = current.meta().expired_at(now_ms());
                store.set(namespace, key, current.with_meta(meta)).await
            }
            Some(_) => store.remove(namespace, &[key]).await,
            None => Ok(()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::{HashMapStore, HashMapStoreConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A distributed store that can be switched off.
    struct FlakyStore {
        inner: HashMapStore,
        down: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            FlakyStore {
                inner: HashMapStore::new(HashMapStoreConfig::default()),
                down: AtomicBool::new(false),
            }
        }

        fn check(&self, key: &str) -> Result<(), CacheError> {
            if self.down.load(Ordering::SeqCst) {
                Err(CacheError::operation("flaky", key, "connection refused"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn get(&self, ns: &str, key: &str) -> Result<Option<StoredEntry>, CacheError> {
            self.check(key)?;
            self.inner.get(ns, key).await
        }

        async fn set(&self, ns: &str, key: &str, entry: StoredEntry) -> Result<(), CacheError> {
            self.check(key)?;
            self.inner.set(ns, key, entry).await
        }

        async fn remove(&self, ns: &str, keys: &[&str]) -> Result<(), CacheError> {
            self.check(keys.first().copied().unwrap_or_default())?;
            self.inner.remove(ns, keys).await
        }
    }

    fn tiered(distributed: Option<Arc<dyn Store>>) -> (TieredStore, Arc<dyn Store>) {
        let memory: Arc<dyn Store> = Arc::new(HashMapStore::new(HashMapStoreConfig::default()));
        let store = TieredStore::new(
            "users",
            memory.clone(),
            distributed,
            Duration::ZERO,
            EventHub::new(),
        );
        (store, memory)
    }

    fn entry(value: &str, duration_ms: i64, last_modified: i64) -> StoredEntry {
        let meta = EntryMeta::new(now_ms(), duration_ms, Some(300_000), last_modified);
        StoredEntry::from_typed_with_serializer(value.to_string(), meta)
    }

    #[tokio::test]
    async fn test_read_through_populates_memory() {
        let remote: Arc<dyn Store> = Arc::new(FlakyStore::new());
        let (store, memory) = tiered(Some(remote.clone()));

        let serialized = entry("remote", 60_000, 5).to_serialized().unwrap();
        remote.set("users", "key1", serialized).await.unwrap();
        assert!(memory.get("users", "key1").await.unwrap().is_none());

        let found: Entry<String> = store.get_typed("key1").await.unwrap().unwrap();
        assert_eq!(found.value, "remote");
        assert_eq!(found.meta.last_modified, 5);

        // Cached back typed, so the next read stays local.
        let local = memory.get("users", "key1").await.unwrap().unwrap();
        assert!(matches!(local, StoredEntry::Typed { .. }));
    }

    #[tokio::test]
    async fn test_newer_distributed_entry_replaces_stale_local() {
        let remote: Arc<dyn Store> = Arc::new(FlakyStore::new());
        let (store, memory) = tiered(Some(remote.clone()));

        memory.set("users", "key1", entry("old", 0, 1)).await.unwrap();
        remote
            .set("users", "key1", entry("new", 60_000, 2).to_serialized().unwrap())
            .await
            .unwrap();

        let found: Entry<String> = store.get_typed("key1").await.unwrap().unwrap();
        assert_eq!(found.value, "new");
    }

    #[tokio::test]
    async fn test_older_distributed_entry_does_not_clobber_local() {
        let remote: Arc<dyn Store> = Arc::new(FlakyStore::new());
        let (store, memory) = tiered(Some(remote.clone()));

        memory.set("users", "key1", entry("local", 0, 9)).await.unwrap();
        remote
            .set("users", "key1", entry("remote", 60_000, 9).to_serialized().unwrap())
            .await
            .unwrap();

        let found: Entry<String> = store.get_typed("key1").await.unwrap().unwrap();
        assert_eq!(found.value, "local");
    }

    #[tokio::test]
    async fn test_distributed_failure_does_not_fail_write() {
        let flaky = Arc::new(FlakyStore::new());
        flaky.down.store(true, Ordering::SeqCst);
        let (store, memory) = tiered(Some(flaky.clone()));

        let outcome = store
            .set("key1", entry("v", 60_000, 1), &EntryOptions::default())
            .await
            .unwrap();
        assert!(outcome.distributed_failed);
        assert!(memory.get("users", "key1").await.unwrap().is_some());

        // Reads degrade to the local copy.
        let found: Entry<String> = store.get_typed("key1").await.unwrap().unwrap();
        assert_eq!(found.value, "v");

        // Once the store is back, the write can be replayed.
        flaky.down.store(false, Ordering::SeqCst);
        assert!(store.replay_distributed("key1", DistributedOp::Set).await);
        assert!(flaky.inner.get("users", "key1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let remote: Arc<dyn Store> = Arc::new(FlakyStore::new());
        let (store, _memory) = tiered(Some(remote));
        let options = EntryOptions::default();

        store.set("key1", entry("v", 60_000, 1), &options).await.unwrap();
        for _ in 0..3 {
            let outcome = store.remove("key1", &options).await.unwrap();
            assert!(!outcome.distributed_failed);
            assert!(store.get("key1").await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_expire_keeps_fail_safe_material() {
        let remote: Arc<dyn Store> = Arc::new(FlakyStore::new());
        let (store, _memory) = tiered(Some(remote.clone()));
        let options = EntryOptions::default();

        store.set("key1", entry("v", 60_000, 1), &options).await.unwrap();
        store.expire("key1", &options).await.unwrap();

        let local = store.local_meta("key1").await.unwrap().unwrap();
        assert!(local.is_stale(now_ms()));
        let remote_entry = remote.get("users", "key1").await.unwrap().unwrap();
        assert!(remote_entry.meta().is_stale(now_ms()));
    }

    #[tokio::test]
    async fn test_expire_without_fail_safe_removes() {
        let (store, memory) = tiered(None);
        let meta = EntryMeta::new(now_ms(), 60_000, None, 1);
        memory
            .set("users", "key1", StoredEntry::from_typed(1u8, meta))
            .await
            .unwrap();

        store.expire("key1", &EntryOptions::default()).await.unwrap();
        assert!(store.local_meta("key1").await.unwrap().is_none());
    }
}
