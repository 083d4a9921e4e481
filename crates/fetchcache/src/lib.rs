//! In-memory caching of fetched values.
//!
//! Values are kept in namespaced, size-bounded [`Cache`] instances with least-recently-used
//! eviction and per-entry TTLs. Concurrent lookups of the same key are coalesced onto a single
//! fetch, and stale values can be served while they are refreshed in the background.
//!
//! Cache instances are usually obtained from a [`CacheRegistry`] that is created once from the
//! [`Config`], and keys are derived from request parameters with [`normalize_params`].

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
pub mod key;
pub mod logging;
pub mod registry;
pub mod store;
pub mod utils;

#[cfg(test)]
mod tests;

pub use cache::{Cache, CacheStats, FetchOptions, RefreshErrorHook};
pub use config::{CacheConfigs, CacheSettings, Config};
pub use entry::{CacheEntry, Metadata, SetOptions, is_stale};
pub use error::{FetchError, KeyError, RegistryError};
pub use key::{normalize_key, normalize_params};
pub use registry::{CacheName, CacheRegistry};
pub use store::EntryStore;
