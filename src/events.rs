//! Fire-and-forget notifications about what the cache is doing.
//!
//! Subscribers are plain function handles. They are invoked synchronously on the
//! emitting task, so they should be cheap (buffer, count, forward to a channel).
//!
//! # Example
//!
//! ```ignore
//! cache.events().subscribe(|event| {
//!     if let CacheEvent::FailSafeActivated { key } = event {
//!         tracing::warn!(%key, "serving stale data");
//!     }
//! });
//! ```

use std::sync::{Arc, RwLock};

use crate::backplane::BackplaneMessage;

/// Events emitted by the cache.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// A lookup found a fresh entry.
    Hit { key: String, stale: bool },
    /// A lookup found nothing usable.
    Miss { key: String },
    /// The factory produced a value.
    FactorySuccess { key: String },
    /// The factory returned an error.
    FactoryError { key: String, error: String },
    /// The soft timeout elapsed and a stale value was returned.
    FactorySoftTimeout { key: String },
    /// The hard timeout elapsed.
    FactoryHardTimeout { key: String },
    /// A factory left running after a timeout completed.
    BackgroundFactorySuccess { key: String },
    /// A factory left running after a timeout failed.
    BackgroundFactoryError { key: String, error: String },
    /// A stale value was served because the factory failed.
    FailSafeActivated { key: String },
    /// The per-key lock could not be acquired in time.
    LockTimeout { key: String },
    /// A fresh hit triggered a background refresh.
    EagerRefresh { key: String },
    /// A distributed store operation failed.
    DistributedStoreError { key: String, error: String },
    /// A backplane message was published.
    MessagePublished { message: BackplaneMessage },
    /// Publishing a backplane message failed.
    MessagePublishFailed {
        message: BackplaneMessage,
        error: String,
    },
    /// A backplane message from another instance was applied.
    MessageReceived { message: BackplaneMessage },
    /// An item was queued for auto-recovery.
    AutoRecoveryQueued { key: String },
    /// A queued item was delivered.
    AutoRecoverySucceeded { key: String },
    /// An item ran out of attempts and was dropped.
    AutoRecoveryFailed { key: String, attempts: u32 },
    /// The queue overflowed and the key was marked for a forced re-check.
    AutoRecoveryResyncScheduled { key: String },
}

type Handler = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// A list of subscribers receiving every [`CacheEvent`].
#[derive(Clone, Default)]
pub struct EventHub {
    handlers: Arc<RwLock<Vec<Handler>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for all future events.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push(Arc::new(handler));
        }
    }

    /// Deliver an event to every handler.
    pub fn emit(&self, event: CacheEvent) {
        // Clone the list so handlers may subscribe without deadlocking.
        let handlers = match self.handlers.read() {
            Ok(handlers) if !handlers.is_empty() => handlers.clone(),
            _ => return,
        };
        for handler in handlers {
            handler(&event);
        }
    }
}
