//! hybrid-cache - A two-level cache with stampede protection and cross-instance sync
//!
//! This library provides a caching layer in front of expensive operations with:
//! - One factory execution per key at a time (stampede protection)
//! - Soft and hard factory timeouts with background completion
//! - Fail-safe: serving stale values when the factory fails
//! - Eager refresh of entries about to expire
//! - An in-process store backed by an optional distributed store
//! - A backplane keeping the in-process copies of several instances in sync, with
//!   automatic recovery of notifications that could not be delivered
//!
//! # Example
//!
//! ```ignore
//! use hybrid_cache::{Cache, CacheBuilder, CacheOptions, EntryOptions};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), hybrid_cache::CacheError> {
//!     let options = CacheOptions::new("users").with_default_entry_options(
//!         EntryOptions::default()
//!             .with_duration(Duration::from_secs(60))
//!             .with_fail_safe(Duration::from_secs(3600))
//!             .with_soft_timeout(Duration::from_millis(100)),
//!     );
//!     let users: Cache<String> = CacheBuilder::new(options).build().await?;
//!
//!     // The factory receives the key being loaded.
//!     let user = users
//!         .get_or_set("user:123", |ctx| async move {
//!             Ok(format!("User data for {}", ctx.key))
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

mod auto_recovery;
pub mod backplane;
mod builder;
mod cache;
mod circuit_breaker;
mod entry;
mod error;
mod events;
mod lock;
mod options;
mod orchestrator;
mod store;
pub mod stores;
mod tiered;
mod timing;
mod utils;

// Re-export public API
pub use auto_recovery::{AutoRecoveryItem, AutoRecoveryQueue, DrainReport};
pub use backplane::{
    Backplane, BackplaneAccessor, BackplaneAction, BackplaneError, BackplaneMessage,
    MemoryBackplane, RedisBackplane, RedisBackplaneConfig, TransportEvent,
};
pub use builder::CacheBuilder;
pub use cache::{BlockingCache, Cache};
pub use entry::{Entry, EntryMeta, Freshness, StorageMode, StoredEntry};
pub use error::{BoxError, CacheError, SharedError};
pub use events::{CacheEvent, EventHub};
pub use lock::{KeyLockGuard, KeyLockRegistry, LockTimedOut};
pub use options::{AutoRecoveryOptions, BackoffPolicy, CacheOptions, EntryOptions};
pub use orchestrator::FactoryContext;
pub use store::Store;
pub use stores::memory::{EvictOnSetConfig, HashMapStore, HashMapStoreConfig};
pub use stores::moka::{MokaStore, MokaStoreConfig};
pub use stores::redis::{RedisStore, RedisStoreConfig};
pub use tiered::{TieredStore, WriteOutcome};
pub use timing::Clock;
