//! Cross-instance notifications.
//!
//! Every committed write, remove or expire is announced on a pub/sub channel so that
//! other instances can drop or refresh their in-process copy. Delivery is best-effort;
//! messages that cannot be published are retried by the auto-recovery queue.
//!
//! ```text
//! Instance 1: cache.set("key1")
//!   ↓
//! Backplane: PUBLISH hybrid-cache:users {"source":"i1","key":"key1","action":"Set",...}
//!   ↓
//! Instance 2: accessor receives → refreshes or expires its local copy
//! Instance 1: accessor receives → ignores its own message
//! ```

pub mod accessor;
pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::CacheError;

pub use accessor::BackplaneAccessor;
pub use memory::MemoryBackplane;
pub use redis::{RedisBackplane, RedisBackplaneConfig};

/// What happened to the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackplaneAction {
    Set,
    Remove,
    Expire,
}

/// A notification about a cache key, sent to every other instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackplaneMessage {
    #[serde(rename = "source")]
    pub source_instance_id: String,
    #[serde(rename = "key")]
    pub cache_key: String,
    pub action: BackplaneAction,
    /// `last_modified` of the entry this message is about.
    pub timestamp: i64,
}

impl BackplaneMessage {
    pub fn new(
        source_instance_id: impl Into<String>,
        cache_key: impl Into<String>,
        action: BackplaneAction,
        timestamp: i64,
    ) -> Self {
        BackplaneMessage {
            source_instance_id: source_instance_id.into(),
            cache_key: cache_key.into(),
            action,
            timestamp,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        serde_json::to_vec(self)
            .map_err(|e| CacheError::Serialization(format!("Serialization failed: {}", e)))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CacheError> {
        serde_json::from_slice(payload)
            .map_err(|e| CacheError::Serialization(format!("Deserialization failed: {}", e)))
    }
}

/// Failure reported by a backplane transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackplaneError {
    /// The transport is not connected.
    #[error("backplane unavailable: {0}")]
    Unavailable(String),
    /// The transport accepted the call but it failed.
    #[error("backplane publish failed: {0}")]
    Publish(String),
    /// Subscribing to the channel failed.
    #[error("backplane subscribe failed: {0}")]
    Subscribe(String),
}

/// What a transport delivers to its subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw bytes of an incoming message.
    Message(Vec<u8>),
    /// The connection was lost and re-established; messages may have been missed.
    Reconnected,
}

/// A pub/sub channel shared by all instances of a cache.
#[async_trait]
pub trait Backplane: Send + Sync {
    /// A name for logs.
    fn name(&self) -> &'static str;

    /// Publish raw message bytes on `channel`.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BackplaneError>;

    /// Start delivering messages from `channel` to `sender`.
    ///
    /// Delivery continues until the receiving side is dropped.
    async fn subscribe(
        &self,
        channel: &str,
        sender: mpsc::Sender<TransportEvent>,
    ) -> Result<(), BackplaneError>;
}

/// The channel name used by a cache.
pub fn channel_name(cache_name: &str) -> String {
    format!("hybrid-cache:{}", cache_name)
}
