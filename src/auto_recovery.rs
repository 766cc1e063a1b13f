//! Bounded retry queue for notifications and distributed writes that could not be
//! delivered.
//!
//! Items are keyed by cache key: the item with the newest message wins and inherits
//! the pending work of the one it replaces. When the queue overflows, the oldest item
//! is evicted and its key is remembered in a resync set instead. Resyncing a key
//! re-reads it from the distributed store and announces its current state, so other
//! instances converge even though the original notification was lost.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backplane::accessor::PublishOutcome;
use crate::backplane::{BackplaneAccessor, BackplaneAction, BackplaneMessage};
use crate::events::{CacheEvent, EventHub};
use crate::options::{AutoRecoveryOptions, EntryOptions};
use crate::tiered::{DistributedOp, TieredStore};
use crate::timing::backoff_delay;
use crate::utils::{now_ms, now_us};

/// A notification waiting to be retried.
#[derive(Debug, Clone)]
pub struct AutoRecoveryItem {
    pub message: BackplaneMessage,
    pub options: EntryOptions,
    /// Failed retries so far.
    pub attempts: u32,
    /// Unix ms.
    pub enqueued_at: i64,
    pub next_attempt_at: Instant,
    /// The distributed store still has to receive this mutation.
    pub distributed_pending: bool,
    /// The message still has to be published.
    pub publish_pending: bool,
}

impl AutoRecoveryItem {
    /// A message that failed to publish; retried right away on the next drain.
    pub fn new(message: BackplaneMessage, options: EntryOptions) -> Self {
        AutoRecoveryItem {
            message,
            options,
            attempts: 0,
            enqueued_at: now_ms(),
            next_attempt_at: Instant::now(),
            distributed_pending: false,
            publish_pending: true,
        }
    }

    pub fn with_distributed_pending(mut self, pending: bool) -> Self {
        self.distributed_pending = pending;
        self
    }

    pub fn with_publish_pending(mut self, pending: bool) -> Self {
        self.publish_pending = pending;
        self
    }

    pub fn key(&self) -> &str {
        &self.message.cache_key
    }

    fn distributed_op(&self) -> DistributedOp {
        match self.message.action {
            BackplaneAction::Set => DistributedOp::Set,
            BackplaneAction::Remove => DistributedOp::Remove,
            BackplaneAction::Expire => DistributedOp::Expire,
        }
    }
}

/// Counters for one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub retried: usize,
    pub dropped: usize,
    pub resynced: usize,
}

enum Attempt {
    Delivered,
    Superseded,
    Unavailable,
    Failed,
}

enum Eviction {
    Resync(String),
    Dropped(String, u32),
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<AutoRecoveryItem>,
    resync: HashSet<String>,
}

pub struct AutoRecoveryQueue {
    options: AutoRecoveryOptions,
    state: Mutex<QueueState>,
    wake: Notify,
    events: EventHub,
}

impl AutoRecoveryQueue {
    pub fn new(options: AutoRecoveryOptions, events: EventHub) -> Self {
        AutoRecoveryQueue {
            options,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an item. A queued item for the same key is replaced only when its message
    /// is not newer; either way the survivor keeps the pending work of both.
    pub fn enqueue(&self, item: AutoRecoveryItem) {
        let key = item.key().to_string();
        if !self.options.enabled {
            tracing::warn!(key = %key, "auto-recovery disabled, notification dropped");
            return;
        }

        let evicted = {
            let mut state = self.state();
            merge(&mut state.items, item, false);
            self.enforce_capacity(&mut state)
        };

        tracing::debug!(key = %key, "queued for auto-recovery");
        self.events.emit(CacheEvent::AutoRecoveryQueued { key });
        self.report_evicted(evicted);
    }

    /// Drop the queued item for `key`. Returns whether there was one.
    pub fn remove_by_key(&self, key: &str) -> bool {
        let mut state = self.state();
        let before = state.items.len();
        state.items.retain(|queued| queued.key() != key);
        state.items.len() != before
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys waiting for a forced re-check, sorted.
    pub fn pending_resync(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state().resync.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Wake the worker for an immediate drain.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    fn is_idle(&self) -> bool {
        let state = self.state();
        state.items.is_empty() && state.resync.is_empty()
    }

    /// Evict the oldest items beyond capacity, turning them into resync keys.
    ///
    /// Once the resync set is full too, evicted items are given up.
    fn enforce_capacity(&self, state: &mut QueueState) -> Vec<Eviction> {
        let mut evicted = Vec::new();
        while state.items.len() > self.options.max_queue_size {
            let Some(oldest) = state.items.pop_front() else {
                break;
            };
            let key = oldest.message.cache_key;
            if state.resync.contains(&key) || state.resync.len() < self.options.max_resync_keys {
                state.resync.insert(key.clone());
                evicted.push(Eviction::Resync(key));
            } else {
                evicted.push(Eviction::Dropped(key, oldest.attempts));
            }
        }
        evicted
    }

    fn report_evicted(&self, evicted: Vec<Eviction>) {
        for eviction in evicted {
            match eviction {
                Eviction::Resync(key) => {
                    tracing::warn!(
                        key = %key,
                        "auto-recovery queue full, key scheduled for resync"
                    );
                    self.events
                        .emit(CacheEvent::AutoRecoveryResyncScheduled { key });
                }
                Eviction::Dropped(key, attempts) => {
                    tracing::error!(
                        key = %key,
                        "auto-recovery queue and resync set full, notification dropped"
                    );
                    self.events
                        .emit(CacheEvent::AutoRecoveryFailed { key, attempts });
                }
            }
        }
    }

    fn take_due(&self, now: Instant) -> Vec<AutoRecoveryItem> {
        let mut state = self.state();
        let (due, waiting): (VecDeque<_>, VecDeque<_>) = state
            .items
            .drain(..)
            .partition(|item| item.next_attempt_at <= now);
        state.items = waiting;
        due.into()
    }

    /// Put items back at the head of the queue, merged with anything queued for the
    /// same key in the meantime.
    fn requeue(&self, items: Vec<AutoRecoveryItem>) {
        let evicted = {
            let mut state = self.state();
            for item in items.into_iter().rev() {
                merge(&mut state.items, item, true);
            }
            self.enforce_capacity(&mut state)
        };
        self.report_evicted(evicted);
    }

    /// Retry every due item once.
    ///
    /// Stops early, without consuming attempts, as soon as the backplane reports
    /// itself unavailable.
    pub async fn drain_and_retry(
        &self,
        store: &TieredStore,
        accessor: Option<&BackplaneAccessor>,
    ) -> DrainReport {
        let mut report = DrainReport::default();

        if !self.resync_keys(store, accessor, &mut report).await {
            return report;
        }

        let mut due = self.take_due(Instant::now()).into_iter();
        let mut retry = Vec::new();

        while let Some(mut item) = due.next() {
            match self.retry_item(&mut item, store, accessor).await {
                Attempt::Delivered => {
                    report.delivered += 1;
                    tracing::debug!(
                        key = %item.key(),
                        attempts = item.attempts,
                        "auto-recovery delivered"
                    );
                    self.events.emit(CacheEvent::AutoRecoverySucceeded {
                        key: item.message.cache_key,
                    });
                }
                Attempt::Superseded => {
                    report.dropped += 1;
                    tracing::debug!(
                        key = %item.key(),
                        "auto-recovery item superseded by a newer write"
                    );
                }
                Attempt::Unavailable => {
                    retry.push(item);
                    retry.extend(due.by_ref());
                    break;
                }
                Attempt::Failed => {
                    item.attempts += 1;
                    if item.attempts >= self.options.max_retry_attempts {
                        report.dropped += 1;
                        tracing::error!(
                            key = %item.key(),
                            attempts = item.attempts,
                            action = ?item.message.action,
                            "auto-recovery permanently failed"
                        );
                        self.events.emit(CacheEvent::AutoRecoveryFailed {
                            key: item.message.cache_key,
                            attempts: item.attempts,
                        });
                    } else {
                        report.retried += 1;
                        let delay =
                            backoff_delay(&self.options.backoff, self.options.delay, item.attempts);
                        item.next_attempt_at = Instant::now() + delay;
                        retry.push(item);
                    }
                }
            }
        }

        self.requeue(retry);
        report
    }

    async fn retry_item(
        &self,
        item: &mut AutoRecoveryItem,
        store: &TieredStore,
        accessor: Option<&BackplaneAccessor>,
    ) -> Attempt {
        let key = item.message.cache_key.clone();

        if item.message.action == BackplaneAction::Set
            && let Ok(Some(meta)) = store.local_meta(&key).await
            && meta.last_modified > item.message.timestamp
        {
            return Attempt::Superseded;
        }

        if item.distributed_pending {
            if !store.replay_distributed(&key, item.distributed_op()).await {
                return Attempt::Failed;
            }
            item.distributed_pending = false;
        }

        if item.publish_pending
            && let Some(accessor) = accessor
        {
            match accessor.try_publish(&item.message).await {
                PublishOutcome::Published => item.publish_pending = false,
                PublishOutcome::Skipped => return Attempt::Unavailable,
                PublishOutcome::Failed(_) => return Attempt::Failed,
            }
        }

        Attempt::Delivered
    }

    /// Re-check every key in the resync set. Returns `false` when draining should stop.
    async fn resync_keys(
        &self,
        store: &TieredStore,
        accessor: Option<&BackplaneAccessor>,
        report: &mut DrainReport,
    ) -> bool {
        let keys = self.pending_resync();
        for key in keys {
            if !resync(&key, store, accessor).await {
                return false;
            }
            self.state().resync.remove(&key);
            report.resynced += 1;
        }
        true
    }

    /// Run the periodic drain loop until `shutdown` is cancelled.
    pub fn spawn_worker(
        queue: Arc<Self>,
        store: Arc<TieredStore>,
        accessor: Option<Arc<BackplaneAccessor>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let interval = queue.options.drain_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                    _ = queue.wake.notified() => {}
                }

                if queue.is_idle() {
                    continue;
                }
                let report = queue.drain_and_retry(&store, accessor.as_deref()).await;
                if report != DrainReport::default() {
                    tracing::debug!(?report, remaining = queue.len(), "auto-recovery drain");
                }
            }
            tracing::debug!("auto-recovery worker stopped");
        })
    }
}

/// Insert `item`, keeping only the newest message per key.
///
/// Ties go to `item`. The pending flags of both items are combined.
fn merge(items: &mut VecDeque<AutoRecoveryItem>, mut item: AutoRecoveryItem, at_front: bool) {
    if let Some(pos) = items.iter().position(|queued| queued.key() == item.key()) {
        let queued = &mut items[pos];
        if queued.message.timestamp > item.message.timestamp {
            queued.distributed_pending |= item.distributed_pending;
            queued.publish_pending |= item.publish_pending;
            return;
        }
        if let Some(older) = items.remove(pos) {
            item.distributed_pending |= older.distributed_pending;
            item.publish_pending |= older.publish_pending;
        }
    }
    if at_front {
        items.push_front(item);
    } else {
        items.push_back(item);
    }
}

/// Bring the local copy of `key` up to date and announce its state.
async fn resync(key: &str, store: &TieredStore, accessor: Option<&BackplaneAccessor>) -> bool {
    let local = store.local_meta(key).await.ok().flatten();
    if store.has_distributed() {
        let newer_than = local.map_or(i64::MIN, |meta| meta.last_modified + 1);
        if let Err(e) = store.refresh_local_from_distributed(key, newer_than).await {
            tracing::warn!(key = %key, error = %e, "resync could not refresh local copy");
        }
    }

    let Some(accessor) = accessor else {
        return true;
    };

    // Expire makes receivers re-fetch without dropping their fail-safe copy.
    let message = match store.local_meta(key).await {
        Ok(Some(meta)) => accessor.message(
            key,
            BackplaneAction::Set,
            meta.last_modified,
            &EntryOptions::default(),
        ),
        _ => BackplaneMessage::new(accessor.instance_id(), key, BackplaneAction::Expire, now_us()),
    };

    matches!(accessor.try_publish(&message).await, PublishOutcome::Published)
}
