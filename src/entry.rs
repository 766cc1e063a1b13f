use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::CacheError;
use crate::options::EntryOptions;
use crate::timing::{duration_ms, with_jitter};

/// Freshness metadata shared by typed and serialized entries.
///
/// All points in time are unix milliseconds, except `last_modified` which comes from
/// the logical [`Clock`](crate::timing::Clock).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub created_at: i64,
    pub duration_ms: i64,
    pub is_fail_safe_enabled: bool,
    pub fail_safe_max_duration_ms: i64,
    pub last_modified: i64,
}

/// Where an entry stands relative to its freshness windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Before `created_at + duration`.
    Fresh,
    /// Past its duration but within the fail-safe window.
    StaleUsable,
    /// Not usable anymore.
    Expired,
}

impl EntryMeta {
    /// Create metadata, clamping the duration so it never exceeds the fail-safe window.
    pub fn new(
        created_at: i64,
        duration_ms: i64,
        fail_safe_max_duration_ms: Option<i64>,
        last_modified: i64,
    ) -> Self {
        let duration_ms = duration_ms.max(0);
        match fail_safe_max_duration_ms {
            Some(max) => EntryMeta {
                created_at,
                duration_ms: duration_ms.min(max.max(0)),
                is_fail_safe_enabled: true,
                fail_safe_max_duration_ms: max.max(0),
                last_modified,
            },
            None => EntryMeta {
                created_at,
                duration_ms,
                is_fail_safe_enabled: false,
                fail_safe_max_duration_ms: duration_ms,
                last_modified,
            },
        }
    }

    /// Metadata for a value produced now, with jitter applied to the duration.
    pub fn from_options(options: &EntryOptions, now: i64, last_modified: i64) -> Self {
        let duration = with_jitter(options.duration, options.jitter_max_duration);
        let fail_safe = options
            .is_fail_safe_enabled
            .then(|| duration_ms(options.fail_safe_max_duration));
        EntryMeta::new(now, duration_ms(duration), fail_safe, last_modified)
    }

    /// Unix milliseconds until which the entry is fresh.
    pub fn fresh_until(&self) -> i64 {
        self.created_at.saturating_add(self.duration_ms)
    }

    /// Unix milliseconds after which the entry must not be used at all.
    ///
    /// Stores use this as their physical expiration.
    pub fn stale_until(&self) -> i64 {
        if self.is_fail_safe_enabled {
            self.created_at.saturating_add(self.fail_safe_max_duration_ms)
        } else {
            self.fresh_until()
        }
    }

    pub fn freshness(&self, now_ms: i64) -> Freshness {
        if now_ms < self.fresh_until() {
            Freshness::Fresh
        } else if self.is_fail_safe_enabled && now_ms < self.stale_until() {
            Freshness::StaleUsable
        } else {
            Freshness::Expired
        }
    }

    /// Check if the entry is still fresh (not yet stale).
    pub fn is_fresh(&self, now_ms: i64) -> bool {
        self.freshness(now_ms) == Freshness::Fresh
    }

    /// Check if the entry is stale but still usable as fail-safe material.
    pub fn is_stale(&self, now_ms: i64) -> bool {
        self.freshness(now_ms) == Freshness::StaleUsable
    }

    /// Check if the entry has expired and should not be used.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.freshness(now_ms) == Freshness::Expired
    }

    /// A copy that is no longer fresh at `now_ms` but keeps its fail-safe window.
    pub fn expired_at(&self, now_ms: i64) -> Self {
        let elapsed = (now_ms - self.created_at).max(0);
        EntryMeta {
            duration_ms: self.duration_ms.min(elapsed),
            ..*self
        }
    }

    /// A copy that is fresh for `throttle_ms` from `now_ms`, without moving the
    /// original fail-safe deadline.
    pub fn throttled(&self, now_ms: i64, throttle_ms: i64) -> Self {
        let remaining = (self.stale_until() - now_ms).max(0);
        EntryMeta {
            created_at: now_ms,
            duration_ms: throttle_ms.clamp(0, remaining),
            is_fail_safe_enabled: self.is_fail_safe_enabled,
            fail_safe_max_duration_ms: remaining,
            last_modified: self.last_modified,
        }
    }
}

/// A cache entry containing a value and its freshness metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<V> {
    /// The cached value.
    pub value: V,

    pub meta: EntryMeta,
}

impl<V> Entry<V> {
    /// Create a new cache entry.
    pub fn new(value: V, meta: EntryMeta) -> Self {
        Entry { value, meta }
    }

    pub fn freshness(&self, now_ms: i64) -> Freshness {
        self.meta.freshness(now_ms)
    }

    pub fn is_fresh(&self, now_ms: i64) -> bool {
        self.meta.is_fresh(now_ms)
    }
}

type ValueSerializer = Arc<dyn Fn() -> Result<String, CacheError> + Send + Sync>;

/// Type-erased storage entry that supports both typed and serialized storage.
///
/// This enum allows stores to be type-agnostic while still supporting zero-copy
/// storage for in-memory stores (via `Typed`) and serialization for distributed
/// stores (via `Serialized`). Metadata lives outside the payload in both variants so
/// it can be rewritten (expire, throttle) without knowing the value type.
#[derive(Clone)]
pub enum StoredEntry {
    /// For in-memory stores: zero-copy storage of typed values.
    ///
    /// The serializer converts the value to JSON when the entry has to travel to a
    /// distributed store.
    Typed {
        value: Arc<dyn Any + Send + Sync>,
        meta: EntryMeta,
        serializer: Option<ValueSerializer>,
    },
    /// For distributed stores: the value serialized as JSON.
    Serialized { data: String, meta: EntryMeta },
}

impl fmt::Debug for StoredEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoredEntry::Typed { meta, .. } => f.debug_struct("Typed").field("meta", meta).finish(),
            StoredEntry::Serialized { data, meta } => f
                .debug_struct("Serialized")
                .field("data", data)
                .field("meta", meta)
                .finish(),
        }
    }
}

/// Storage mode preference for stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Store prefers typed values (in-memory stores).
    Typed,
    /// Store prefers serialized values (distributed stores).
    Serialized,
}

/// The wire envelope written by distributed stores.
#[derive(Serialize, Deserialize)]
struct WireEntry<'a> {
    meta: EntryMeta,
    #[serde(borrow)]
    data: std::borrow::Cow<'a, str>,
}

impl StoredEntry {
    /// Create a StoredEntry from a typed value without serialization support.
    pub fn from_typed<V>(value: V, meta: EntryMeta) -> Self
    where
        V: Send + Sync + 'static,
    {
        StoredEntry::Typed {
            value: Arc::new(value),
            meta,
            serializer: None,
        }
    }

    /// Create a StoredEntry from a typed value with serialization support, so the
    /// entry can also be written to a distributed store.
    pub fn from_typed_with_serializer<V>(value: V, meta: EntryMeta) -> Self
    where
        V: Serialize + Send + Sync + 'static,
    {
        let value_arc = Arc::new(value);
        let value_for_serializer = value_arc.clone();

        let serializer: ValueSerializer = Arc::new(move || {
            serde_json::to_string(value_for_serializer.as_ref())
                .map_err(|e| CacheError::Serialization(format!("Serialization failed: {}", e)))
        });

        StoredEntry::Typed {
            value: value_arc,
            meta,
            serializer: Some(serializer),
        }
    }

    /// Create a StoredEntry from serialized data.
    pub fn from_serialized(data: String, meta: EntryMeta) -> Self {
        StoredEntry::Serialized { data, meta }
    }

    /// Convert StoredEntry to a typed Entry<V>.
    ///
    /// - `Typed`: downcasts the Arc value to V and clones it
    /// - `Serialized`: deserializes the JSON payload to V
    pub fn into_typed<V>(self) -> Result<Entry<V>, CacheError>
    where
        V: Clone + for<'de> Deserialize<'de> + Send + Sync + 'static,
    {
        match self {
            StoredEntry::Typed { value, meta, .. } => {
                let typed_arc = value
                    .downcast::<V>()
                    .map_err(|_| CacheError::Serialization("Type downcast failed".to_string()))?;
                Ok(Entry::new((*typed_arc).clone(), meta))
            }
            StoredEntry::Serialized { data, meta } => {
                let value: V = serde_json::from_str(&data).map_err(|e| {
                    CacheError::Serialization(format!("Deserialization failed: {}", e))
                })?;
                Ok(Entry::new(value, meta))
            }
        }
    }

    pub fn meta(&self) -> &EntryMeta {
        match self {
            StoredEntry::Typed { meta, .. } => meta,
            StoredEntry::Serialized { meta, .. } => meta,
        }
    }

    /// The same payload with new metadata.
    pub fn with_meta(self, new_meta: EntryMeta) -> Self {
        match self {
            StoredEntry::Typed {
                value, serializer, ..
            } => StoredEntry::Typed {
                value,
                meta: new_meta,
                serializer,
            },
            StoredEntry::Serialized { data, .. } => StoredEntry::Serialized {
                data,
                meta: new_meta,
            },
        }
    }

    /// Convert a Typed entry to Serialized format using the stored serializer.
    pub fn to_serialized(self) -> Result<Self, CacheError> {
        match self {
            StoredEntry::Serialized { .. } => Ok(self),
            StoredEntry::Typed {
                serializer: Some(ser),
                meta,
                ..
            } => Ok(StoredEntry::Serialized { data: ser()?, meta }),
            StoredEntry::Typed {
                serializer: None, ..
            } => Err(CacheError::Serialization(
                "Cannot serialize Typed entry: no serializer available".to_string(),
            )),
        }
    }

    /// Convert StoredEntry to match the target storage mode.
    ///
    /// Serialized entries are kept as they are for typed stores; they are
    /// deserialized lazily by `into_typed`.
    pub fn convert_for_mode(self, target_mode: StorageMode) -> Result<Self, CacheError> {
        match (&self, target_mode) {
            (StoredEntry::Typed { .. }, StorageMode::Serialized) => self.to_serialized(),
            _ => Ok(self),
        }
    }

    /// Encode a serialized entry, metadata included, for a distributed store.
    pub fn to_wire(&self) -> Result<String, CacheError> {
        let StoredEntry::Serialized { data, meta } = self else {
            return Err(CacheError::Serialization(
                "Only serialized entries can be written to the wire".to_string(),
            ));
        };
        serde_json::to_string(&WireEntry {
            meta: *meta,
            data: std::borrow::Cow::Borrowed(data),
        })
        .map_err(|e| CacheError::Serialization(format!("Serialization failed: {}", e)))
    }

    /// Decode an entry previously produced by [`StoredEntry::to_wire`].
    pub fn from_wire(raw: &str) -> Result<Self, CacheError> {
        let wire: WireEntry<'_> = serde_json::from_str(raw)
            .map_err(|e| CacheError::Serialization(format!("Deserialization failed: {}", e)))?;
        Ok(StoredEntry::Serialized {
            data: wire.data.into_owned(),
            meta: wire.meta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn meta(created_at: i64, duration_ms: i64, fail_safe: Option<i64>) -> EntryMeta {
        EntryMeta::new(created_at, duration_ms, fail_safe, 1)
    }

    #[test]
    fn test_freshness_boundary_without_fail_safe() {
        let m = meta(0, 100, None);
        assert_eq!(m.freshness(99), Freshness::Fresh);
        assert_eq!(m.freshness(100), Freshness::Expired);
        assert_eq!(m.freshness(101), Freshness::Expired);
        assert_eq!(m.stale_until(), 100);
    }

    #[test]
    fn test_freshness_boundary_with_fail_safe() {
        let m = meta(0, 100, Some(500));
        assert_eq!(m.freshness(99), Freshness::Fresh);
        assert_eq!(m.freshness(101), Freshness::StaleUsable);
        assert_eq!(m.freshness(200), Freshness::StaleUsable);
        assert_eq!(m.freshness(500), Freshness::Expired);
    }

    #[test]
    fn test_duration_clamped_to_fail_safe_window() {
        let m = meta(0, 1_000, Some(500));
        assert_eq!(m.duration_ms, 500);
        assert!(m.duration_ms <= m.fail_safe_max_duration_ms);
    }

    #[test]
    fn test_expired_at_keeps_fail_safe_window() {
        let m = meta(1_000, 10_000, Some(60_000));
        let expired = m.expired_at(2_000);
        assert_eq!(expired.freshness(2_000), Freshness::StaleUsable);
        assert_eq!(expired.stale_until(), m.stale_until());
        assert_eq!(expired.last_modified, m.last_modified);

        // Expiring an entry that is already stale changes nothing.
        assert_eq!(m.expired_at(20_000), m);
    }

    #[test]
    fn test_throttled_does_not_extend_fail_safe() {
        let m = meta(0, 100, Some(1_000));
        let throttled = m.throttled(500, 200);
        assert_eq!(throttled.freshness(600), Freshness::Fresh);
        assert_eq!(throttled.freshness(800), Freshness::StaleUsable);
        assert_eq!(throttled.stale_until(), m.stale_until());

        // Throttle longer than the remaining window is cut short.
        let near_end = m.throttled(950, 200);
        assert_eq!(near_end.fresh_until(), 1_000);
    }

    #[test]
    fn test_typed_and_serialized_conversion() {
        let m = meta(0, 100, Some(500));
        let typed = StoredEntry::from_typed_with_serializer("hello".to_string(), m);
        let serialized = typed.clone().convert_for_mode(StorageMode::Serialized).unwrap();
        assert!(matches!(
            serialized,
            StoredEntry::Serialized { ref data, .. } if data == "\"hello\""
        ));

        let back: Entry<String> = serialized.into_typed().unwrap();
        assert_eq!(back, Entry::new("hello".to_string(), m));

        let without_serializer = StoredEntry::from_typed(42u32, m);
        assert!(without_serializer.to_serialized().is_err());
    }

    #[test]
    fn test_downcast_to_wrong_type_fails() {
        let entry = StoredEntry::from_typed(42u32, meta(0, 100, None));
        let result = entry.into_typed::<String>();
        assert!(matches!(result, Err(CacheError::Serialization(_))));
    }

    #[test]
    fn test_with_meta_replaces_metadata_only() {
        let entry = StoredEntry::from_typed("v".to_string(), meta(0, 100, Some(500)));
        let new_meta = entry.meta().expired_at(50);
        let replaced = entry.with_meta(new_meta);
        assert_eq!(*replaced.meta(), new_meta);
        assert_eq!(replaced.into_typed::<String>().unwrap().value, "v");
    }

    proptest! {
        #[test]
        fn test_wire_round_trip(
            value in ".*",
            created_at in 0i64..4_000_000_000_000,
            duration_ms in 0i64..1_000_000,
            fail_safe in proptest::option::of(0i64..10_000_000),
            last_modified in any::<i64>(),
        ) {
            let m = EntryMeta::new(created_at, duration_ms, fail_safe, last_modified);
            let entry = Entry::new(value.clone(), m);

            let stored = StoredEntry::from_typed_with_serializer(value, m)
                .to_serialized()
                .unwrap();
            let wire = stored.to_wire().unwrap();
            let decoded: Entry<String> = StoredEntry::from_wire(&wire)
                .unwrap()
                .into_typed()
                .unwrap();

            prop_assert_eq!(decoded, entry);
        }
    }
}
