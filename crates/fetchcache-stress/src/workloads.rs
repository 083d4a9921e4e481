use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use fetchcache::{Cache, FetchError, FetchOptions, normalize_params};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// Name of the cache in the registry.
    pub cache: String,
    /// Number of distinct keys requested, uniformly at random.
    pub keys: usize,
    pub concurrency: usize,
    /// How long a simulated upstream fetch takes.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Share of fetches that fail, between `0` and `1`.
    #[serde(default)]
    pub failure_rate: f64,
    /// TTL of fetched values, instead of the default TTL of the cache.
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,
    #[serde(default)]
    pub stale_while_revalidate: bool,
}

/// The simulated upstream response.
pub type Payload = Arc<str>;

/// Parameters of a simulated request, turned into the cache key.
#[derive(Debug, Serialize)]
struct Request<'a> {
    cache: &'a str,
    query: String,
    page: Option<u32>,
}

/// Performs one lookup against `cache`, fetching from the simulated upstream on a miss.
///
/// Every started upstream fetch is counted in `fetches`. Returns whether the lookup succeeded.
/// Failing lookups are part of the workload and are not treated as errors.
pub async fn process_request(
    cache: &Cache<Payload>,
    workload: &Workload,
    fetches: &Arc<AtomicUsize>,
) -> Result<bool> {
    let (query, page, fails) = {
        let mut rng = rand::rng();
        let n = rng.random_range(0..workload.keys.max(1));
        let fails = rng.random_bool(workload.failure_rate.clamp(0.0, 1.0));
        (n / 10, (n % 10 != 0).then_some((n % 10) as u32), fails)
    };

    let params = Request {
        cache: &workload.cache,
        query: format!("query {query}"),
        page,
    };
    let key = normalize_params(&params)?;

    let latency = workload.latency;
    let fetches = Arc::clone(fetches);
    let fetcher = move || async move {
        fetches.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(latency).await;
        if fails {
            anyhow::bail!("simulated upstream failure");
        }
        Ok(Payload::from(format!("results for {query}/{}", page.unwrap_or(0))))
    };

    let mut options =
        FetchOptions::default().stale_while_revalidate(workload.stale_while_revalidate);
    if let Some(ttl) = workload.ttl {
        options = options.ttl(ttl);
    }

    match cache.get_or_fetch(&key, fetcher, options).await {
        Ok(_) => Ok(true),
        Err(FetchError::Cancelled) => anyhow::bail!("fetch for `{key}` was cancelled"),
        Err(_) => Ok(false),
    }
}
