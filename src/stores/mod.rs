//! Store implementations for the cache library.
//!
//! `HashMapStore` and `MokaStore` are in-process stores (typed), `RedisStore` is a
//! distributed store (serialized).

pub mod memory;
pub mod moka;
pub mod redis;

pub use memory::{EvictOnSetConfig, HashMapStore, HashMapStoreConfig};
pub use moka::{MokaStore, MokaStoreConfig};
pub use redis::{RedisStore, RedisStoreConfig};
