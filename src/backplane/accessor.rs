use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    Backplane, BackplaneAction, BackplaneError, BackplaneMessage, TransportEvent, channel_name,
};
use crate::auto_recovery::AutoRecoveryQueue;
use crate::circuit_breaker::{CircuitBreaker, Transition};
use crate::error::{CacheError, SharedError};
use crate::events::{CacheEvent, EventHub};
use crate::options::{CacheOptions, EntryOptions};
use crate::tiered::TieredStore;

const RECEIVE_BUFFER: usize = 1024;

/// Result of a single publish attempt.
#[derive(Debug, Clone)]
pub(crate) enum PublishOutcome {
    Published,
    /// The circuit is open; nothing was sent.
    Skipped,
    Failed(SharedError),
}

/// Publishes this instance's mutations and applies the ones from other instances.
pub struct BackplaneAccessor {
    instance_id: String,
    channel: String,
    transport: Arc<dyn Backplane>,
    breaker: CircuitBreaker,
    store: Arc<TieredStore>,
    recovery: Arc<AutoRecoveryQueue>,
    events: EventHub,
    rethrow_original_errors: bool,
}

impl BackplaneAccessor {
    pub fn new(
        instance_id: impl Into<String>,
        transport: Arc<dyn Backplane>,
        store: Arc<TieredStore>,
        recovery: Arc<AutoRecoveryQueue>,
        events: EventHub,
        options: &CacheOptions,
    ) -> Self {
        BackplaneAccessor {
            instance_id: instance_id.into(),
            channel: channel_name(&options.cache_name),
            transport,
            breaker: CircuitBreaker::new("backplane", options.backplane_circuit_break_duration),
            store,
            recovery,
            events,
            rethrow_original_errors: options.rethrow_original_errors,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Whether publishing is currently attempted.
    pub fn is_usable(&self) -> bool {
        self.breaker.is_usable()
    }

    /// Build a message from this instance. `Expire` becomes `Remove` when the entry
    /// has no fail-safe copy to fall back to.
    pub fn message(
        &self,
        key: &str,
        action: BackplaneAction,
        timestamp: i64,
        options: &EntryOptions,
    ) -> BackplaneMessage {
        let action = match action {
            BackplaneAction::Expire if !options.is_fail_safe_enabled => BackplaneAction::Remove,
            other => other,
        };
        BackplaneMessage::new(&self.instance_id, key, action, timestamp)
    }

    /// Publish a message to the other instances.
    ///
    /// Returns `Ok(false)` when the message was not delivered and should be queued for
    /// auto-recovery. Transport errors are returned only with
    /// `rethrow_backplane_errors`, wrapped or original depending on
    /// `rethrow_original_errors`.
    pub async fn publish(
        &self,
        message: &BackplaneMessage,
        options: &EntryOptions,
        is_auto_recovery: bool,
    ) -> Result<bool, CacheError> {
        if !self.is_usable() {
            tracing::debug!(key = %message.cache_key, "backplane unavailable, publish skipped");
            return Ok(false);
        }

        if !is_auto_recovery {
            // This message supersedes whatever is still queued for the key.
            self.recovery.remove_by_key(&message.cache_key);
        }

        match self.try_publish(message).await {
            PublishOutcome::Published => Ok(true),
            PublishOutcome::Skipped => Ok(false),
            PublishOutcome::Failed(source) => {
                if !options.rethrow_backplane_errors {
                    return Ok(false);
                }
                if self.rethrow_original_errors {
                    Err(CacheError::Original(source))
                } else {
                    Err(CacheError::backplane(&message.cache_key, source))
                }
            }
        }
    }

    /// One attempt at sending `message`, without queueing or rethrowing.
    pub(crate) async fn try_publish(&self, message: &BackplaneMessage) -> PublishOutcome {
        if !self.breaker.is_usable() {
            return PublishOutcome::Skipped;
        }

        let result = match message.encode() {
            Ok(payload) => self
                .transport
                .publish(&self.channel, payload)
                .await
                .map_err(|e| Arc::new(e) as SharedError),
            Err(e) => Err(Arc::new(e) as SharedError),
        };

        match result {
            Ok(()) => {
                if self.breaker.record_success() == Transition::Closed {
                    self.recovery.trigger();
                }
                tracing::trace!(
                    instance = %self.instance_id,
                    key = %message.cache_key,
                    action = ?message.action,
                    "backplane message published"
                );
                self.events.emit(CacheEvent::MessagePublished {
                    message: message.clone(),
                });
                PublishOutcome::Published
            }
            Err(error) => {
                self.breaker.record_failure();
                tracing::warn!(
                    instance = %self.instance_id,
                    key = %message.cache_key,
                    transport = self.transport.name(),
                    error = %error,
                    "backplane publish failed"
                );
                self.events.emit(CacheEvent::MessagePublishFailed {
                    message: message.clone(),
                    error: error.to_string(),
                });
                PublishOutcome::Failed(error)
            }
        }
    }

    /// Apply a message delivered by the transport.
    ///
    /// Messages from this instance are ignored. For the others, a local copy that is
    /// as new as the message or newer wins.
    pub async fn on_message_received(&self, payload: &[u8]) {
        let message = match BackplaneMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    instance = %self.instance_id,
                    error = %e,
                    "dropping malformed backplane message"
                );
                return;
            }
        };

        if message.source_instance_id == self.instance_id {
            return;
        }
        self.store.clock().observe(message.timestamp);

        match self.apply(&message).await {
            Ok(true) => {
                tracing::debug!(
                    instance = %self.instance_id,
                    source = %message.source_instance_id,
                    key = %message.cache_key,
                    action = ?message.action,
                    "applied backplane message"
                );
                self.events.emit(CacheEvent::MessageReceived { message });
            }
            Ok(false) => {
                tracing::trace!(key = %message.cache_key, "local copy is newer, message ignored");
            }
            Err(e) => {
                tracing::warn!(
                    key = %message.cache_key,
                    error = %e,
                    "failed to apply backplane message"
                );
            }
        }
    }

    async fn apply(&self, message: &BackplaneMessage) -> Result<bool, CacheError> {
        let key = message.cache_key.as_str();
        let local = self.store.local_meta(key).await?;
        let local_ts = local.map(|meta| meta.last_modified);

        match message.action {
            BackplaneAction::Set => {
                if local_ts.is_some_and(|ts| ts >= message.timestamp) {
                    return Ok(false);
                }
                if !self
                    .store
                    .refresh_local_from_distributed(key, message.timestamp)
                    .await?
                {
                    self.store.expire_local(key).await?;
                }
            }
            BackplaneAction::Remove => {
                if local_ts.is_some_and(|ts| ts >= message.timestamp) {
                    return Ok(false);
                }
                self.store.remove_local(key).await?;
            }
            BackplaneAction::Expire => {
                if local_ts.is_some_and(|ts| ts >= message.timestamp) {
                    return Ok(false);
                }
                self.store.expire_local(key).await?;
            }
        }
        Ok(true)
    }

    /// The transport reconnected: messages may have been missed in both directions.
    pub(crate) fn handle_reconnect(&self) {
        tracing::info!(
            instance = %self.instance_id,
            channel = %self.channel,
            "backplane reconnected"
        );
        self.breaker.reset();
        self.recovery.trigger();
    }

    /// Subscribe to the channel and apply incoming messages until `shutdown`.
    pub async fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<(), CacheError> {
        let (tx, mut rx) = mpsc::channel(RECEIVE_BUFFER);
        self.transport
            .subscribe(&self.channel, tx)
            .await
            .map_err(|e: BackplaneError| CacheError::Backplane {
                key: String::new(),
                message: format!("failed to subscribe to '{}'", self.channel),
                source: Some(Arc::new(e)),
            })?;

        let accessor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(TransportEvent::Message(payload)) => {
                            accessor.on_message_received(&payload).await;
                        }
                        Some(TransportEvent::Reconnected) => accessor.handle_reconnect(),
                        None => break,
                    },
                }
            }
            tracing::debug!(instance = %accessor.instance_id, "backplane listener stopped");
        });

        tracing::info!(
            instance = %self.instance_id,
            channel = %self.channel,
            transport = self.transport.name(),
            "backplane listener started"
        );
        Ok(())
    }
}
