use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// The outcome of a failed fetch.
///
/// A single fetch can be awaited by any number of coalesced callers, which is why this error is
/// cheaply [`Clone`]able and every caller observes the very same error. Fetch errors are never
/// stored in the cache.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The fetcher itself returned an error.
    #[error("fetch failed: {0:#}")]
    Failed(Arc<anyhow::Error>),
    /// The fetcher did not settle within the configured fetch timeout.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The fetch was dropped before it settled, for example because it panicked or the runtime
    /// shut down.
    #[error("fetch was cancelled")]
    Cancelled,
}

impl FetchError {
    /// Wraps an error returned by a fetcher.
    pub fn from_err<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Failed(Arc::new(err.into()))
    }

    pub(crate) fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Parameters could not be turned into a cache key.
#[derive(Debug, Error)]
#[error("failed to normalize cache key parameters")]
pub struct KeyError(#[from] serde_json::Error);

/// An error handing out a cache instance from the [`CacheRegistry`](crate::CacheRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No settings exist for the requested cache.
    #[error("no cache configured with name `{0}`")]
    UnknownCache(String),
    /// The cache was already created for a different value type.
    #[error("cache `{name}` holds values of type `{existing}`, not `{requested}`")]
    TypeMismatch {
        name: String,
        existing: &'static str,
        requested: &'static str,
    },
}
