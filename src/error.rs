use std::sync::Arc;
use std::time::Duration;

/// A boxed error returned by user factories and transports.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A shareable error, so `CacheError` can stay `Clone`.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Error type for cache operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// The user factory returned an error.
    #[error("factory failed for key '{key}': {source}")]
    Factory {
        key: String,
        #[source]
        source: SharedError,
    },

    /// The factory did not complete within its hard timeout.
    #[error("factory for key '{key}' timed out after {timeout:?}")]
    FactoryTimeout { key: String, timeout: Duration },

    /// The per-key lock could not be acquired in time.
    #[error("could not acquire the lock for key '{key}' within {timeout:?}")]
    LockTimeout { key: String, timeout: Duration },

    /// A store operation failed.
    #[error("[{tier}] cache error for key '{key}': {message}")]
    Operation {
        tier: String,
        key: String,
        message: String,
    },

    /// Publishing to or consuming from the backplane failed.
    #[error("backplane error for key '{key}': {message}")]
    Backplane {
        key: String,
        message: String,
        #[source]
        source: Option<SharedError>,
    },

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The caller cancelled the operation.
    #[error("operation for key '{key}' was cancelled")]
    Cancelled { key: String },

    /// The underlying error, surfaced as-is when `rethrow_original_errors` is enabled.
    #[error(transparent)]
    Original(SharedError),
}

impl CacheError {
    /// Create a new operation error.
    pub fn operation(
        tier: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CacheError::Operation {
            tier: tier.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    /// Wrap a transport failure into a backplane error.
    pub fn backplane(key: impl Into<String>, source: SharedError) -> Self {
        CacheError::Backplane {
            key: key.into(),
            message: "an error occurred while working with the backplane".to_string(),
            source: Some(source),
        }
    }

    /// Wrap a factory failure, or surface it untouched when `original` is set.
    pub(crate) fn factory(key: &str, source: SharedError, original: bool) -> Self {
        if original {
            CacheError::Original(source)
        } else {
            CacheError::Factory {
                key: key.to_string(),
                source,
            }
        }
    }

    /// Whether this error is one of the timeout kinds.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CacheError::FactoryTimeout { .. } | CacheError::LockTimeout { .. }
        )
    }
}
