//! Per-key locks granting at most one in-flight factory execution per key.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// The lock for a key could not be acquired within the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimedOut;

/// Registry of per-key locks.
///
/// Locks are created on demand and dropped from the table as soon as no guard or
/// waiter refers to them, so the table only holds keys that are currently contended.
#[derive(Clone, Default)]
pub struct KeyLockRegistry {
    locks: Arc<LockTable>,
}

/// Holds the lock for one key. Released on drop.
pub struct KeyLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockTable>,
    key: String,
}

impl KeyLockRegistry {
    pub fn new() -> Self {
        KeyLockRegistry {
            locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for the lock on `key`, up to `timeout` (`None` waits forever).
    pub async fn acquire(
        &self,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<KeyLockGuard, LockTimedOut> {
        let lock = self.lock_for(key);

        let guard = match timeout {
            None => lock.lock_owned().await,
            Some(timeout) => match tokio::time::timeout(timeout, lock.lock_owned()).await {
                Ok(guard) => guard,
                Err(_) => {
                    release_entry(&self.locks, key);
                    tracing::debug!(key = %key, ?timeout, "timed out waiting for key lock");
                    return Err(LockTimedOut);
                }
            },
        };

        Ok(KeyLockGuard {
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
            key: key.to_string(),
        })
    }

    /// Take the lock on `key` only if nobody holds it.
    pub fn try_acquire(&self, key: &str) -> Option<KeyLockGuard> {
        let lock = self.lock_for(key);
        match lock.try_lock_owned() {
            Ok(guard) => Some(KeyLockGuard {
                guard: Some(guard),
                locks: Arc::clone(&self.locks),
                key: key.to_string(),
            }),
            Err(_) => {
                release_entry(&self.locks, key);
                None
            }
        }
    }

    /// Number of keys that currently have a lock allocated.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl KeyLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        // Unlock and drop our reference before checking whether the table entry is
        // still referenced by anyone.
        drop(self.guard.take());
        release_entry(&self.locks, &self.key);
    }
}

/// Remove the table entry for `key` when only the table references the lock.
///
/// Runs under the shard lock, so a concurrent `lock_for` either sees the entry (and
/// bumps the count before this check) or inserts a fresh one afterwards.
fn release_entry(locks: &LockTable, key: &str) {
    locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
}
