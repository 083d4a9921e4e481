//! Service configuration, loaded from YAML.
//!
//! Every section falls back to its defaults, so a configuration file only needs to name the
//! values it changes. Unknown keys are ignored.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::registry::CacheName;

/// How log lines are rendered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `pretty` on a terminal, `simplified` otherwise.
    Auto,
    /// Multi-line and colored.
    Pretty,
    /// One line per event, without colors.
    Simplified,
    /// JSON lines.
    Json,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// Verbosity of the cache crates, dependencies log at `info` at most.
    ///
    /// Ignored if `RUST_LOG` is set.
    #[serde(deserialize_with = "level_from_str")]
    pub level: LevelFilter,
    pub format: LogFormat,
    /// Sets `RUST_BACKTRACE` on startup.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// Address of the statsd server, taken from `STATSD_SERVER` by default.
    ///
    /// Metrics are not reported without one.
    pub statsd: Option<String>,
    /// Prepended to the name of every metric.
    pub prefix: String,
    /// Tags sent along with every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: std::env::var("STATSD_SERVER").ok(),
            prefix: "fetchcache".to_owned(),
            custom_tags: Default::default(),
        }
    }
}

const fn non_zero(n: usize) -> NonZeroUsize {
    match NonZeroUsize::new(n) {
        Some(n) => n,
        None => panic!("capacity must be non-zero"),
    }
}

/// Settings of a single cache instance.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum number of entries held in memory.
    ///
    /// Inserting a new key into a full cache evicts the least recently used entry.
    /// A value of `0` is rejected when parsing the configuration.
    pub max_entries: NonZeroUsize,

    /// Time-to-live of entries that were stored without an explicit TTL.
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Upper bound for a single fetch.
    ///
    /// A fetch that has not settled in time is abandoned and reported as
    /// [`FetchError::Timeout`](crate::FetchError::Timeout) to every waiting caller, so the
    /// key becomes fetchable again. `None` waits forever.
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Option<Duration>,

    /// Whether reading an entry marks it as recently used for eviction purposes.
    ///
    /// This never extends the TTL of the entry.
    pub update_age_on_access: bool,
}

impl CacheSettings {
    const fn with_limits(
        max_entries: usize,
        default_ttl: Duration,
        fetch_timeout: Option<Duration>,
    ) -> Self {
        Self {
            max_entries: non_zero(max_entries),
            default_ttl,
            fetch_timeout,
            update_age_on_access: true,
        }
    }

    /// Settings for the cache of scraped pages.
    pub const fn scrape() -> Self {
        Self::with_limits(
            500,
            Duration::from_secs(3600),
            Some(Duration::from_secs(60)),
        )
    }

    /// Settings for the cache of search results.
    pub const fn search() -> Self {
        Self::with_limits(200, Duration::from_secs(15 * 60), Some(Duration::from_secs(30)))
    }

    /// Settings for the cache of user data lookups.
    pub const fn user() -> Self {
        Self::with_limits(100, Duration::from_secs(5 * 60), Some(Duration::from_secs(10)))
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::with_limits(1000, Duration::from_secs(5 * 60), None)
    }
}

/// Settings of all the cache instances the registry can hand out.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfigs {
    /// Scraped and extracted pages.
    pub scrape: CacheSettings,
    /// Search results.
    pub search: CacheSettings,
    /// User data lookups.
    pub user: CacheSettings,
    /// Additional caches, keyed by their namespace.
    pub custom: BTreeMap<String, CacheSettings>,
}

impl CacheConfigs {
    /// Names of `custom` caches that shadow one of the built-in caches.
    pub fn shadowed_custom_names(&self) -> impl Iterator<Item = &str> {
        self.custom
            .keys()
            .map(String::as_str)
            .filter(|name| CacheName::ALL.iter().any(|builtin| builtin.to_string() == *name))
    }
}

impl Default for CacheConfigs {
    fn default() -> Self {
        Self {
            scrape: CacheSettings::scrape(),
            search: CacheSettings::search(),
            user: CacheSettings::user(),
            custom: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: Logging,
    pub metrics: Metrics,
    /// Where to report errors and background refresh failures, if anywhere.
    pub sentry_dsn: Option<Dsn>,
    /// Sizes and expiry of the cache instances.
    pub caches: CacheConfigs,
}

impl Config {
    /// Loads the configuration file at `path`, or the defaults if there is none.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open config file {}", path.display()))?;
        Self::from_reader(file)
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut yaml = String::new();
        reader
            .read_to_string(&mut yaml)
            .context("failed to read config file")?;
        // an empty document would silently parse as `null`
        anyhow::ensure!(!yaml.trim().is_empty(), "config file is empty");
        let config: Self = serde_yaml::from_str(&yaml).context("invalid config YAML")?;
        if let Some(name) = config.caches.shadowed_custom_names().next() {
            anyhow::bail!("custom cache `{name}` clashes with the built-in cache of that name");
        }
        Ok(config)
    }
}

fn level_from_str<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    const LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

    let level = String::deserialize(deserializer)?;
    if !LEVELS.contains(&level.as_str()) {
        return Err(de::Error::unknown_variant(&level, LEVELS));
    }
    level.parse().map_err(de::Error::custom)
}
