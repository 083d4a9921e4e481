use std::any::{Any, type_name};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use parking_lot::Mutex;

use crate::cache::{Cache, CacheStats, RefreshErrorHook};
use crate::config::{CacheConfigs, CacheSettings};
use crate::error::RegistryError;

/// The cache instances every deployment has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheName {
    /// Scraped and extracted pages.
    Scrape,
    /// Search results.
    Search,
    /// User data lookups.
    User,
}

impl CacheName {
    pub const ALL: [CacheName; 3] = [Self::Scrape, Self::Search, Self::User];
}

impl AsRef<str> for CacheName {
    fn as_ref(&self) -> &str {
        match self {
            Self::Scrape => "scrape",
            Self::Search => "search",
            Self::User => "user",
        }
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// Type-erased access to a cache instance of any value type.
trait AnyCache: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn value_type(&self) -> &'static str;
    fn stats(&self) -> CacheStats;
    fn prune(&self) -> usize;
}

impl<T: Clone + Send + Sync + 'static> AnyCache for Cache<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn value_type(&self) -> &'static str {
        type_name::<T>()
    }

    fn stats(&self) -> CacheStats {
        Cache::stats(self)
    }

    fn prune(&self) -> usize {
        Cache::prune(self)
    }
}

/// Hands out the process-wide cache instances.
///
/// The registry is created once at startup from the configuration and then passed to whatever
/// needs caching, usually behind an `Arc`. Each instance is created on first use and lives as
/// long as the registry. Instances are namespaced by their name, and every instance holds values
/// of exactly one type.
pub struct CacheRegistry {
    configs: CacheConfigs,
    on_refresh_error: Option<RefreshErrorHook>,
    instances: Mutex<BTreeMap<String, Box<dyn AnyCache>>>,
}

impl fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let created: Vec<_> = self
            .instances
            .try_lock()
            .map(|instances| instances.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("CacheRegistry")
            .field("configs", &self.configs)
            .field("created", &created)
            .finish()
    }
}

impl CacheRegistry {
    /// Creates a registry for the caches in `configs`.
    ///
    /// `custom` caches named like a built-in cache are ignored with a warning. Configuration
    /// files are rejected with such entries when loading.
    pub fn new(configs: CacheConfigs) -> Self {
        for name in configs.shadowed_custom_names() {
            tracing::warn!(cache = name, "Ignoring custom cache that shadows a built-in cache");
        }
        Self {
            configs,
            on_refresh_error: None,
            instances: Default::default(),
        }
    }

    /// Installs `hook` on every cache created from now on.
    pub fn with_refresh_error_hook(mut self, hook: RefreshErrorHook) -> Self {
        self.on_refresh_error = Some(hook);
        self
    }

    /// The settings of the cache called `name`, if it is configured.
    pub fn settings(&self, name: &str) -> Option<&CacheSettings> {
        match name {
            "scrape" => Some(&self.configs.scrape),
            "search" => Some(&self.configs.search),
            "user" => Some(&self.configs.user),
            custom => self.configs.custom.get(custom),
        }
    }

    /// The names of all configured caches, created or not.
    pub fn names(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        CacheName::ALL
            .iter()
            .map(|name| name.to_string())
            .chain(self.configs.custom.keys().cloned())
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }

    /// Returns the cache called `name`, creating it on first use.
    ///
    /// Every call for the same name returns a handle to the same instance. The value type is
    /// fixed by the first call.
    pub fn cache<T>(&self, name: impl AsRef<str>) -> Result<Cache<T>, RegistryError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let name = name.as_ref();
        let mut instances = self.instances.lock();

        if let Some(instance) = instances.get(name) {
            return instance
                .as_any()
                .downcast_ref::<Cache<T>>()
                .cloned()
                .ok_or_else(|| RegistryError::TypeMismatch {
                    name: name.to_owned(),
                    existing: instance.value_type(),
                    requested: type_name::<T>(),
                });
        }

        let settings = *self
            .settings(name)
            .ok_or_else(|| RegistryError::UnknownCache(name.to_owned()))?;
        tracing::debug!(
            cache = name,
            max_entries = settings.max_entries.get(),
            default_ttl = ?settings.default_ttl,
            "Creating cache"
        );

        let cache = Cache::<T>::with_refresh_error_hook(
            name,
            settings,
            self.on_refresh_error.clone(),
        );
        instances.insert(name.to_owned(), Box::new(cache.clone()));
        Ok(cache)
    }

    /// Stats of all caches created so far, ordered by name.
    pub fn stats(&self) -> Vec<CacheStats> {
        self.instances
            .lock()
            .values()
            .map(|instance| instance.stats())
            .collect()
    }

    /// Prunes stale entries of all caches created so far, returning how many were removed.
    pub fn prune(&self) -> usize {
        self.instances
            .lock()
            .values()
            .map(|instance| instance.prune())
            .sum()
    }
}
