//! The `get_or_set` state machine.
//!
//! ```text
//! lookup ── fresh ──────────────────────────────────────────────▶ value
//!   │          └─ past eager-refresh point: refresh in background
//!   ▼
//! key lock (lock_timeout) ── timed out ──▶ stale value | LockTimeout
//!   ▼
//! re-check ── fresh ──▶ value
//!   ▼
//! factory ── soft timeout + stale ──▶ stale value, factory continues in background
//!   │     ── hard timeout ──────────▶ fail-safe | FactoryTimeout
//!   │     ── error ─────────────────▶ fail-safe | Factory
//!   ▼
//! write through, publish Set ──▶ value
//! ```

use serde::{Serialize, de::DeserializeOwned};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auto_recovery::{AutoRecoveryItem, AutoRecoveryQueue};
use crate::backplane::{BackplaneAccessor, BackplaneAction, BackplaneMessage};
use crate::entry::{Entry, EntryMeta, Freshness, StoredEntry};
use crate::error::{BoxError, CacheError};
use crate::events::{CacheEvent, EventHub};
use crate::lock::{KeyLockGuard, KeyLockRegistry};
use crate::options::{CacheOptions, EntryOptions};
use crate::tiered::{TieredStore, WriteOutcome};
use crate::timing::{duration_ms, eager_refresh_at};
use crate::utils::now_ms;

/// What a factory gets to work with.
#[derive(Debug, Clone)]
pub struct FactoryContext<V> {
    pub key: String,
    /// The stale value being replaced, if any.
    pub stale_value: Option<V>,
    /// Cancelled when the caller gives up on this execution.
    pub cancellation: CancellationToken,
}

/// A factory running on its own task.
///
/// Dropping it cancels and aborts the task unless it was detached into a background
/// continuation.
struct FactoryTask<V> {
    handle: JoinHandle<Result<V, BoxError>>,
    token: CancellationToken,
    detached: bool,
}

impl<V: Send + 'static> FactoryTask<V> {
    fn spawn<F, Fut>(factory: F, context: FactoryContext<V>) -> Self
    where
        F: FnOnce(FactoryContext<V>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, BoxError>> + Send + 'static,
    {
        let token = context.cancellation.clone();
        FactoryTask {
            handle: tokio::spawn(factory(context)),
            token,
            detached: false,
        }
    }

    async fn wait(&mut self) -> Result<V, BoxError> {
        match (&mut self.handle).await {
            Ok(result) => result,
            Err(join_error) => Err(Box::new(join_error)),
        }
    }

    fn detach(mut self) -> Self {
        self.detached = true;
        self
    }

    fn abort(&self) {
        self.token.cancel();
        self.handle.abort();
    }
}

impl<V> Drop for FactoryTask<V> {
    fn drop(&mut self) {
        if !self.detached {
            self.token.cancel();
            self.handle.abort();
        }
    }
}

/// State shared by every handle of one cache instance.
pub(crate) struct CacheCore {
    pub(crate) options: CacheOptions,
    pub(crate) instance_id: String,
    pub(crate) store: Arc<TieredStore>,
    pub(crate) locks: KeyLockRegistry,
    pub(crate) accessor: Option<Arc<BackplaneAccessor>>,
    pub(crate) recovery: Arc<AutoRecoveryQueue>,
    pub(crate) events: EventHub,
    pub(crate) shutdown: CancellationToken,
}

impl Drop for CacheCore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl CacheCore {
    fn name(&self) -> &str {
        &self.options.cache_name
    }

    pub(crate) async fn get_or_set<V, F, Fut>(
        self: &Arc<Self>,
        key: &str,
        factory: F,
        options: &EntryOptions,
        cancellation: Option<&CancellationToken>,
    ) -> Result<V, CacheError>
    where
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce(FactoryContext<V>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, BoxError>> + Send + 'static,
    {
        let Some(token) = cancellation else {
            return self.execute(key, factory, options).await;
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!(cache = %self.name(), key = %key, "get_or_set cancelled");
                Err(CacheError::Cancelled { key: key.to_string() })
            }
            result = self.execute(key, factory, options) => result,
        }
    }

    async fn execute<V, F, Fut>(
        self: &Arc<Self>,
        key: &str,
        factory: F,
        options: &EntryOptions,
    ) -> Result<V, CacheError>
    where
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce(FactoryContext<V>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, BoxError>> + Send + 'static,
    {
        let cached = self.store.get_typed::<V>(key).await?;
        let now = now_ms();

        if let Some(entry) = &cached
            && entry.is_fresh(now)
        {
            tracing::debug!(cache = %self.name(), key = %key, "cache hit");
            self.events.emit(CacheEvent::Hit {
                key: key.to_string(),
                stale: false,
            });
            let refresh_at = eager_refresh_at(
                entry.meta.created_at,
                entry.meta.duration_ms,
                options.eager_refresh_threshold,
            );
            if refresh_at.is_some_and(|at| now >= at) {
                self.spawn_eager_refresh(key, factory, options.clone(), entry.clone());
            }
            return Ok(entry.value.clone());
        }

        let stale = usable_stale(cached, now);
        tracing::debug!(
            cache = %self.name(),
            key = %key,
            has_stale = stale.is_some(),
            "cache miss"
        );
        self.events.emit(CacheEvent::Miss {
            key: key.to_string(),
        });

        let guard = match self.locks.acquire(key, options.lock_timeout).await {
            Ok(guard) => guard,
            Err(_) => {
                tracing::warn!(
                    cache = %self.name(),
                    key = %key,
                    timeout = ?options.lock_timeout,
                    "lock acquisition timed out"
                );
                self.events.emit(CacheEvent::LockTimeout {
                    key: key.to_string(),
                });
                return match stale {
                    Some(entry) => Ok(entry.value),
                    None => Err(CacheError::LockTimeout {
                        key: key.to_string(),
                        timeout: options.lock_timeout.unwrap_or_default(),
                    }),
                };
            }
        };

        // Another caller may have refreshed the entry while we waited.
        let cached = self.store.get_typed::<V>(key).await?;
        let now = now_ms();
        if let Some(entry) = &cached
            && entry.is_fresh(now)
        {
            self.events.emit(CacheEvent::Hit {
                key: key.to_string(),
                stale: false,
            });
            return Ok(entry.value.clone());
        }
        let stale = usable_stale(cached, now);

        let context = FactoryContext {
            key: key.to_string(),
            stale_value: stale.as_ref().map(|entry| entry.value.clone()),
            cancellation: CancellationToken::new(),
        };
        let task = FactoryTask::spawn(factory, context);
        self.run_factory(key, task, stale, guard, options).await
    }

    async fn run_factory<V>(
        self: &Arc<Self>,
        key: &str,
        mut task: FactoryTask<V>,
        stale: Option<Entry<V>>,
        guard: KeyLockGuard,
        options: &EntryOptions,
    ) -> Result<V, CacheError>
    where
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let hard = options.factory_hard_timeout;

        // The soft timeout only matters when there is something to fall back to.
        if let Some(soft) = options.factory_soft_timeout
            && stale.is_some()
            && hard.is_none_or(|hard| soft < hard)
        {
            let waited = tokio::time::timeout(soft, task.wait()).await;
            match waited {
                Ok(result) => return self.complete(key, result, stale, guard, options).await,
                Err(_) => {
                    tracing::debug!(
                        cache = %self.name(),
                        key = %key,
                        ?soft,
                        "factory soft timeout, serving stale value"
                    );
                    self.events.emit(CacheEvent::FactorySoftTimeout {
                        key: key.to_string(),
                    });
                    let limit = match hard {
                        Some(hard) if !options.allow_timed_out_factory_background_completion => {
                            Some(hard.saturating_sub(soft))
                        }
                        _ => None,
                    };
                    self.spawn_background_completion(
                        key,
                        task.detach(),
                        guard,
                        options.clone(),
                        limit,
                    );
                    return match stale {
                        Some(entry) => Ok(entry.value),
                        None => Err(CacheError::FactoryTimeout {
                            key: key.to_string(),
                            timeout: soft,
                        }),
                    };
                }
            }
        }

        let Some(hard) = hard else {
            let result = task.wait().await;
            return self.complete(key, result, stale, guard, options).await;
        };

        let waited = tokio::time::timeout(hard, task.wait()).await;
        match waited {
            Ok(result) => self.complete(key, result, stale, guard, options).await,
            Err(_) => {
                tracing::warn!(cache = %self.name(), key = %key, ?hard, "factory hard timeout");
                self.events.emit(CacheEvent::FactoryHardTimeout {
                    key: key.to_string(),
                });
                if options.allow_timed_out_factory_background_completion {
                    self.spawn_background_completion(
                        key,
                        task.detach(),
                        guard,
                        options.clone(),
                        None,
                    );
                } else {
                    drop(task);
                    drop(guard);
                }
                let error = CacheError::FactoryTimeout {
                    key: key.to_string(),
                    timeout: hard,
                };
                self.fail_safe_or(key, stale, error, options).await
            }
        }
    }

    async fn complete<V>(
        self: &Arc<Self>,
        key: &str,
        result: Result<V, BoxError>,
        stale: Option<Entry<V>>,
        guard: KeyLockGuard,
        options: &EntryOptions,
    ) -> Result<V, CacheError>
    where
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        match result {
            Ok(value) => {
                self.events.emit(CacheEvent::FactorySuccess {
                    key: key.to_string(),
                });
                self.commit(key, &value, options).await?;
                drop(guard);
                Ok(value)
            }
            Err(source) => {
                drop(guard);
                tracing::warn!(cache = %self.name(), key = %key, error = %source, "factory failed");
                self.events.emit(CacheEvent::FactoryError {
                    key: key.to_string(),
                    error: source.to_string(),
                });
                let error = CacheError::factory(
                    key,
                    Arc::from(source),
                    self.options.rethrow_original_errors,
                );
                self.fail_safe_or(key, stale, error, options).await
            }
        }
    }

    /// Serve the stale value when fail-safe allows it, otherwise surface `error`.
    async fn fail_safe_or<V>(
        &self,
        key: &str,
        stale: Option<Entry<V>>,
        error: CacheError,
        options: &EntryOptions,
    ) -> Result<V, CacheError>
    where
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let Some(entry) = stale.filter(|_| options.is_fail_safe_enabled) else {
            return Err(error);
        };

        tracing::warn!(
            cache = %self.name(),
            key = %key,
            error = %error,
            "fail-safe activated, serving stale value"
        );
        self.events.emit(CacheEvent::FailSafeActivated {
            key: key.to_string(),
        });

        // Keep serving the stale value for a while instead of hammering the factory.
        let throttle = duration_ms(options.fail_safe_throttle_duration);
        if throttle > 0 {
            let meta = entry.meta.throttled(now_ms(), throttle);
            let throttled = StoredEntry::from_typed_with_serializer(entry.value.clone(), meta);
            if let Err(e) = self.store.set_local(key, throttled).await {
                tracing::warn!(
                    cache = %self.name(),
                    key = %key,
                    error = %e,
                    "failed to save throttled entry"
                );
            }
        }

        Ok(entry.value)
    }

    /// Store a freshly produced value and announce it.
    pub(crate) async fn commit<V>(
        self: &Arc<Self>,
        key: &str,
        value: &V,
        options: &EntryOptions,
    ) -> Result<(), CacheError>
    where
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let meta = EntryMeta::from_options(options, now_ms(), self.store.clock().next());
        let entry = StoredEntry::from_typed_with_serializer(value.clone(), meta);
        let outcome = self.store.set(key, entry, options).await?;
        self.propagate(key, BackplaneAction::Set, meta.last_modified, options, outcome)
            .await
    }

    /// Publish a mutation to the other instances; whatever cannot be delivered now goes
    /// to the auto-recovery queue.
    pub(crate) async fn propagate(
        self: &Arc<Self>,
        key: &str,
        action: BackplaneAction,
        timestamp: i64,
        options: &EntryOptions,
        outcome: WriteOutcome,
    ) -> Result<(), CacheError> {
        let accessor = self
            .accessor
            .clone()
            .filter(|_| !options.skip_backplane_notifications);

        let Some(accessor) = accessor else {
            if outcome.distributed_failed {
                let message = BackplaneMessage::new(&self.instance_id, key, action, timestamp);
                self.recovery.enqueue(
                    AutoRecoveryItem::new(message, options.clone())
                        .with_distributed_pending(true)
                        .with_publish_pending(false),
                );
            }
            return Ok(());
        };

        let message = accessor.message(key, action, timestamp, options);

        if options.allow_background_backplane_operations && !options.rethrow_backplane_errors {
            let core = Arc::clone(self);
            let options = options.clone();
            tokio::spawn(async move {
                let published = accessor
                    .publish(&message, &options, false)
                    .await
                    .unwrap_or(false);
                core.after_publish(message, &options, published, outcome);
            });
            return Ok(());
        }

        match accessor.publish(&message, options, false).await {
            Ok(published) => {
                self.after_publish(message, options, published, outcome);
                Ok(())
            }
            Err(e) => {
                self.after_publish(message, options, false, outcome);
                Err(e)
            }
        }
    }

    fn after_publish(
        &self,
        message: BackplaneMessage,
        options: &EntryOptions,
        published: bool,
        outcome: WriteOutcome,
    ) {
        if published && !outcome.distributed_failed {
            return;
        }
        self.recovery.enqueue(
            AutoRecoveryItem::new(message, options.clone())
                .with_distributed_pending(outcome.distributed_failed)
                .with_publish_pending(!published),
        );
    }

    fn spawn_background_completion<V>(
        self: &Arc<Self>,
        key: &str,
        mut task: FactoryTask<V>,
        guard: KeyLockGuard,
        options: EntryOptions,
        limit: Option<Duration>,
    ) where
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let core = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            // Holds the key lock until the factory is done.
            let _guard = guard;

            let result = match limit {
                None => task.wait().await,
                Some(limit) => match tokio::time::timeout(limit, task.wait()).await {
                    Ok(result) => result,
                    Err(_) => {
                        task.abort();
                        tracing::warn!(
                            cache = %core.name(),
                            key = %key,
                            "background factory exceeded hard timeout"
                        );
                        core.events.emit(CacheEvent::BackgroundFactoryError {
                            key,
                            error: "hard timeout".to_string(),
                        });
                        return;
                    }
                },
            };

            core.finish_background(&key, result, &options).await;
        });
    }

    async fn finish_background<V>(
        self: &Arc<Self>,
        key: &str,
        result: Result<V, BoxError>,
        options: &EntryOptions,
    ) where
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let error = match result {
            Ok(value) => match self.commit(key, &value, options).await {
                Ok(()) => {
                    tracing::debug!(
                        cache = %self.name(),
                        key = %key,
                        "background factory completed"
                    );
                    self.events.emit(CacheEvent::BackgroundFactorySuccess {
                        key: key.to_string(),
                    });
                    return;
                }
                Err(e) => e.to_string(),
            },
            Err(e) => e.to_string(),
        };

        tracing::warn!(
            cache = %self.name(),
            key = %key,
            error = %error,
            "background factory failed"
        );
        self.events.emit(CacheEvent::BackgroundFactoryError {
            key: key.to_string(),
            error,
        });
    }

    fn spawn_eager_refresh<V, F, Fut>(
        self: &Arc<Self>,
        key: &str,
        factory: F,
        options: EntryOptions,
        current: Entry<V>,
    ) where
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce(FactoryContext<V>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, BoxError>> + Send + 'static,
    {
        let Some(guard) = self.locks.try_acquire(key) else {
            tracing::trace!(cache = %self.name(), key = %key, "refresh already in flight");
            return;
        };

        tracing::debug!(cache = %self.name(), key = %key, "eager refresh");
        self.events.emit(CacheEvent::EagerRefresh {
            key: key.to_string(),
        });

        let core = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            let _guard = guard;

            // Skip when someone replaced the entry since it was read.
            match core.store.local_meta(&key).await {
                Ok(Some(meta)) if meta.last_modified != current.meta.last_modified => return,
                _ => {}
            }

            let context = FactoryContext {
                key: key.clone(),
                stale_value: Some(current.value),
                cancellation: CancellationToken::new(),
            };
            let mut task = FactoryTask::spawn(factory, context);
            let result = match options.factory_hard_timeout {
                None => task.wait().await,
                Some(hard) => match tokio::time::timeout(hard, task.wait()).await {
                    Ok(result) => result,
                    Err(_) => Err(Box::new(CacheError::FactoryTimeout {
                        key: key.clone(),
                        timeout: hard,
                    }) as BoxError),
                },
            };
            core.finish_background(&key, result, &options).await;
        });
    }
}

/// The entry if it can still serve as a fail-safe fallback.
fn usable_stale<V>(entry: Option<Entry<V>>, now: i64) -> Option<Entry<V>> {
    entry.filter(|entry| entry.freshness(now) == Freshness::StaleUsable)
}
