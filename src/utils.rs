//! Shared utilities for the cache library.

use std::fmt::Display;
use std::time::{SystemTime, UNIX_EPOCH};

/// Build a composite cache key from the cache name and key.
///
/// Format: `{cache_name}::{key}`
pub fn build_cache_key<N: Display>(cache_name: &N, key: &str) -> String {
    format!("{}::{}", cache_name, key)
}

/// Get the current time in milliseconds since UNIX epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Get the current time in microseconds since UNIX epoch.
pub(crate) fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_cache_key() {
        let key = build_cache_key(&"users", "user:123");
        assert_eq!(key, "users::user:123");
    }

    #[test]
    fn test_now_ms_is_positive() {
        let now = now_ms();
        assert!(now > 0);
        assert!(now_us() / 1000 >= now);
    }
}
