//! Configuration for cache entries and cache instances.

use std::time::Duration;

/// Per-entry options. A cache-wide default lives in [`CacheOptions`]; every call can
/// pass its own copy.
#[derive(Debug, Clone)]
pub struct EntryOptions {
    /// How long an entry stays fresh.
    pub duration: Duration,

    /// Allow serving expired entries as a fallback when the factory fails.
    pub is_fail_safe_enabled: bool,

    /// Upper bound on how long an entry may be used as fail-safe material.
    pub fail_safe_max_duration: Duration,

    /// After a fail-safe activation the stale value is treated as fresh for this long,
    /// so the factory is not hammered while the source is down.
    pub fail_safe_throttle_duration: Duration,

    /// Give up waiting for the factory after this long when a stale value exists.
    pub factory_soft_timeout: Option<Duration>,

    /// Give up waiting for the factory after this long in any case.
    pub factory_hard_timeout: Option<Duration>,

    /// Let a timed out factory keep running and populate the cache when it completes.
    pub allow_timed_out_factory_background_completion: bool,

    /// Maximum time to wait for the per-key lock. `None` waits forever.
    pub lock_timeout: Option<Duration>,

    /// Fraction of `duration` after which a fresh hit triggers a background refresh.
    pub eager_refresh_threshold: Option<f32>,

    /// Random extra duration added on every write.
    pub jitter_max_duration: Option<Duration>,

    /// Surface backplane errors to the caller instead of queueing for auto-recovery.
    pub rethrow_backplane_errors: bool,

    /// Do not notify other instances about this write.
    pub skip_backplane_notifications: bool,

    /// Write to the distributed store without waiting for it.
    pub allow_background_distributed_operations: bool,

    /// Publish backplane notifications without waiting for them.
    pub allow_background_backplane_operations: bool,
}

impl Default for EntryOptions {
    fn default() -> Self {
        EntryOptions {
            duration: Duration::from_secs(30),
            is_fail_safe_enabled: false,
            fail_safe_max_duration: Duration::from_secs(24 * 60 * 60),
            fail_safe_throttle_duration: Duration::from_secs(30),
            factory_soft_timeout: None,
            factory_hard_timeout: None,
            allow_timed_out_factory_background_completion: true,
            lock_timeout: None,
            eager_refresh_threshold: None,
            jitter_max_duration: None,
            rethrow_backplane_errors: false,
            skip_backplane_notifications: false,
            allow_background_distributed_operations: false,
            allow_background_backplane_operations: true,
        }
    }
}

impl EntryOptions {
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Enable fail-safe with the given maximum staleness window.
    pub fn with_fail_safe(mut self, max_duration: Duration) -> Self {
        self.is_fail_safe_enabled = true;
        self.fail_safe_max_duration = max_duration;
        self
    }

    pub fn with_fail_safe_throttle(mut self, throttle: Duration) -> Self {
        self.fail_safe_throttle_duration = throttle;
        self
    }

    pub fn with_soft_timeout(mut self, timeout: Duration) -> Self {
        self.factory_soft_timeout = Some(timeout);
        self
    }

    pub fn with_hard_timeout(mut self, timeout: Duration) -> Self {
        self.factory_hard_timeout = Some(timeout);
        self
    }

    pub fn with_background_completion(mut self, allow: bool) -> Self {
        self.allow_timed_out_factory_background_completion = allow;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn with_eager_refresh(mut self, threshold: f32) -> Self {
        self.eager_refresh_threshold = Some(threshold);
        self
    }

    pub fn with_jitter(mut self, max: Duration) -> Self {
        self.jitter_max_duration = Some(max);
        self
    }

    pub fn with_rethrow_backplane_errors(mut self, rethrow: bool) -> Self {
        self.rethrow_backplane_errors = rethrow;
        self
    }

    pub fn with_skip_backplane_notifications(mut self, skip: bool) -> Self {
        self.skip_backplane_notifications = skip;
        self
    }

    pub fn with_background_distributed_operations(mut self, allow: bool) -> Self {
        self.allow_background_distributed_operations = allow;
        self
    }

    pub fn with_background_backplane_operations(mut self, allow: bool) -> Self {
        self.allow_background_backplane_operations = allow;
        self
    }
}

/// How the delay between auto-recovery attempts grows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Always wait `AutoRecoveryOptions::delay`.
    Fixed,
    /// Double the delay on every attempt, up to `max`.
    Exponential { max: Duration },
}

/// Configuration for the auto-recovery queue.
#[derive(Debug, Clone)]
pub struct AutoRecoveryOptions {
    pub enabled: bool,

    /// Maximum number of queued items. The oldest item is evicted on overflow.
    pub max_queue_size: usize,

    /// Maximum number of keys waiting for a resync after an overflow. Items evicted
    /// beyond this are reported as failed.
    pub max_resync_keys: usize,

    /// Attempts after which an item is reported as permanently failed.
    pub max_retry_attempts: u32,

    /// Base delay between attempts.
    pub delay: Duration,

    pub backoff: BackoffPolicy,

    /// How often the background worker checks the queue.
    pub drain_interval: Duration,
}

impl Default for AutoRecoveryOptions {
    fn default() -> Self {
        AutoRecoveryOptions {
            enabled: true,
            max_queue_size: 1_000,
            max_resync_keys: 10_000,
            max_retry_attempts: 10,
            delay: Duration::from_secs(2),
            backoff: BackoffPolicy::Exponential {
                max: Duration::from_secs(60),
            },
            drain_interval: Duration::from_secs(1),
        }
    }
}

/// Cache-wide configuration.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Used as namespace in the stores and as the backplane channel suffix.
    pub cache_name: String,

    /// Identifies this instance on the backplane. Generated when `None`.
    pub instance_id: Option<String>,

    pub default_entry_options: EntryOptions,

    /// Surface the original factory/transport errors instead of wrapped cache errors.
    pub rethrow_original_errors: bool,

    /// How long the backplane stays unused after a failure.
    pub backplane_circuit_break_duration: Duration,

    /// How long the distributed store stays unused after a failure.
    pub distributed_circuit_break_duration: Duration,

    pub auto_recovery: AutoRecoveryOptions,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            cache_name: "default".to_string(),
            instance_id: None,
            default_entry_options: EntryOptions::default(),
            rethrow_original_errors: false,
            backplane_circuit_break_duration: Duration::from_secs(5),
            distributed_circuit_break_duration: Duration::ZERO,
            auto_recovery: AutoRecoveryOptions::default(),
        }
    }
}

impl CacheOptions {
    pub fn new(cache_name: impl Into<String>) -> Self {
        CacheOptions {
            cache_name: cache_name.into(),
            ..Default::default()
        }
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn with_default_entry_options(mut self, options: EntryOptions) -> Self {
        self.default_entry_options = options;
        self
    }

    pub fn with_rethrow_original_errors(mut self, rethrow: bool) -> Self {
        self.rethrow_original_errors = rethrow;
        self
    }

    pub fn with_backplane_circuit_break(mut self, duration: Duration) -> Self {
        self.backplane_circuit_break_duration = duration;
        self
    }

    pub fn with_distributed_circuit_break(mut self, duration: Duration) -> Self {
        self.distributed_circuit_break_duration = duration;
        self
    }

    pub fn with_auto_recovery(mut self, options: AutoRecoveryOptions) -> Self {
        self.auto_recovery = options;
        self
    }
}
