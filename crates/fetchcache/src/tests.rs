use std::sync::Arc;
use std::time::Duration;

use fetchcache_test::{self as test, CountingFetcher};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::time;

use crate::{Cache, CacheSettings, FetchError, FetchOptions, RefreshErrorHook, SetOptions};

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn settings(max_entries: usize) -> CacheSettings {
    CacheSettings {
        max_entries: max_entries.try_into().unwrap(),
        default_ttl: Duration::from_secs(60),
        fetch_timeout: None,
        update_age_on_access: true,
    }
}

fn cache(max_entries: usize) -> Cache<String> {
    Cache::new("test", settings(max_entries))
}

/// A cache reporting refresh failures into the returned list, as `(key, error)` pairs.
fn cache_with_hook() -> (Cache<String>, Arc<Mutex<Vec<(String, String)>>>) {
    let failures = Arc::new(Mutex::new(Vec::new()));
    let hook: RefreshErrorHook = {
        let failures = Arc::clone(&failures);
        Arc::new(move |key, err| failures.lock().push((key.to_owned(), err.to_string())))
    };
    let cache = Cache::with_refresh_error_hook("test", settings(10), Some(hook));
    (cache, failures)
}

fn swr() -> FetchOptions {
    FetchOptions::default().stale_while_revalidate(true)
}

/// Stores `value` for `key` and lets it go stale.
async fn store_stale(cache: &Cache<String>, key: &str, value: &str) {
    cache.set_with(key, value.into(), SetOptions::default().ttl(ms(10)));
    time::advance(ms(20)).await;
    assert!(cache.is_stale(key));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_lookups_are_coalesced() {
    test::setup();
    let cache = cache(10);
    let fetcher = CountingFetcher::new();

    let lookups: Vec<_> = (0..5)
        .map(|_| {
            cache.get_or_fetch(
                "k",
                fetcher.ok("A".to_owned(), ms(50)),
                FetchOptions::default(),
            )
        })
        .collect();
    assert_eq!(cache.stats().in_flight, 1);

    let results = futures::future::join_all(lookups).await;
    for result in results {
        assert_eq!(result.unwrap(), "A");
    }
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(cache.stats().in_flight, 0);
    assert_eq!(cache.get("k").as_deref(), Some("A"));
}

#[tokio::test(start_paused = true)]
async fn test_fresh_hit_skips_fetch() {
    test::setup();
    let cache = cache(10);
    let fetcher = CountingFetcher::new();
    cache.set("k", "cached".into());

    let value = cache
        .get_or_fetch("k", fetcher.ok("fetched".to_owned(), ms(50)), swr())
        .now_or_never()
        .expect("fresh hits resolve immediately")
        .unwrap();
    assert_eq!(value, "cached");
    assert_eq!(fetcher.calls(), 0);
    assert_eq!(cache.stats().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_coalesced_failure() {
    test::setup();
    let cache = cache(10);
    let fetcher = CountingFetcher::new();

    let lookups: Vec<_> = (0..3)
        .map(|_| {
            cache.get_or_fetch(
                "k",
                fetcher.err::<String>("upstream returned 502", ms(50)),
                FetchOptions::default(),
            )
        })
        .collect();

    for result in futures::future::join_all(lookups).await {
        let err = result.unwrap_err();
        assert!(matches!(err, FetchError::Failed(_)));
        assert_eq!(err.to_string(), "fetch failed: upstream returned 502");
    }
    assert_eq!(fetcher.calls(), 1);
    assert!(!cache.has("k"));
    assert_eq!(cache.stats().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_not_cached() {
    test::setup();
    let cache = cache(10);
    let fetcher = CountingFetcher::new();

    let result = cache
        .get_or_fetch("k", fetcher.err::<String>("down", ms(10)), FetchOptions::default())
        .await;
    assert!(result.is_err());

    let value = cache
        .get_or_fetch("k", fetcher.ok("B".to_owned(), ms(10)), FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(value, "B");
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_refetch_keeps_stale_entry() {
    test::setup();
    let cache = cache(10);
    let fetcher = CountingFetcher::new();
    store_stale(&cache, "k", "old").await;

    let result = cache
        .get_or_fetch("k", fetcher.err::<String>("down", ms(10)), FetchOptions::default())
        .await;
    assert!(result.is_err());
    assert_eq!(cache.get("k").as_deref(), Some("old"));
}

#[tokio::test(start_paused = true)]
async fn test_stale_while_revalidate() {
    test::setup();
    let cache = cache(10);
    let fetcher = CountingFetcher::new();
    store_stale(&cache, "k", "old").await;

    let value = cache
        .get_or_fetch("k", fetcher.ok("new".to_owned(), ms(50)), swr())
        .now_or_never()
        .expect("stale values are served immediately")
        .unwrap();
    assert_eq!(value, "old");
    assert_eq!(cache.stats().in_flight, 1);

    time::sleep(ms(60)).await;
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(cache.get("k").as_deref(), Some("new"));
    assert!(!cache.is_stale("k"));
    assert_eq!(cache.stats().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stale_while_revalidate_refreshes_once() {
    test::setup();
    let cache = cache(10);
    let fetcher = CountingFetcher::new();
    store_stale(&cache, "k", "old").await;

    for _ in 0..3 {
        let value = cache
            .get_or_fetch("k", fetcher.ok("new".to_owned(), ms(50)), swr())
            .await
            .unwrap();
        assert_eq!(value, "old");
    }

    time::sleep(ms(60)).await;
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(cache.get("k").as_deref(), Some("new"));
}

#[tokio::test(start_paused = true)]
async fn test_stale_while_revalidate_without_entry() {
    test::setup();
    let cache = cache(10);
    let fetcher = CountingFetcher::new();

    // nothing to serve, so the caller has to wait for the fetch
    let value = cache
        .get_or_fetch("k", fetcher.ok("new".to_owned(), ms(50)), swr())
        .await
        .unwrap();
    assert_eq!(value, "new");
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_refresh_reaches_hook() {
    test::setup();
    let (cache, failures) = cache_with_hook();
    let fetcher = CountingFetcher::new();
    store_stale(&cache, "k", "old").await;

    let value = cache
        .get_or_fetch("k", fetcher.err::<String>("down", ms(50)), swr())
        .await
        .unwrap();
    assert_eq!(value, "old");
    assert!(failures.lock().is_empty());

    time::sleep(ms(60)).await;
    assert_eq!(
        *failures.lock(),
        [("test:k".to_owned(), "fetch failed: down".to_owned())]
    );
    assert_eq!(cache.get("k").as_deref(), Some("old"));
    assert!(cache.is_stale("k"));
    assert_eq!(cache.stats().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_foreground_failure_skips_hook() {
    test::setup();
    let (cache, failures) = cache_with_hook();
    let fetcher = CountingFetcher::new();

    let result = cache
        .get_or_fetch("k", fetcher.err::<String>("down", ms(10)), FetchOptions::default())
        .await;
    assert!(result.is_err());
    assert!(failures.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lookup_joins_running_refresh() {
    test::setup();
    let cache = cache(10);
    let fetcher = CountingFetcher::new();
    store_stale(&cache, "k", "old").await;

    let stale = cache
        .get_or_fetch("k", fetcher.ok("new".to_owned(), ms(50)), swr())
        .await
        .unwrap();
    assert_eq!(stale, "old");

    let value = cache
        .get_or_fetch(
            "k",
            fetcher.ok("other".to_owned(), ms(50)),
            FetchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(value, "new");
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_force() {
    test::setup();
    let cache = cache(10);
    let fetcher = CountingFetcher::new();
    cache.set("k", "old".into());

    let force = FetchOptions::default().force(true);
    let first = cache.get_or_fetch("k", fetcher.ok("new".to_owned(), ms(50)), force);
    // a forced lookup still joins a fetch that is already running
    let second = cache.get_or_fetch("k", fetcher.ok("newer".to_owned(), ms(50)), force);

    let (first, second) = futures::join!(first, second);
    assert_eq!(first.unwrap(), "new");
    assert_eq!(second.unwrap(), "new");
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(cache.get("k").as_deref(), Some("new"));
}

#[tokio::test(start_paused = true)]
async fn test_fetch_timeout() {
    test::setup();
    let settings = CacheSettings {
        fetch_timeout: Some(ms(100)),
        ..settings(10)
    };
    let cache = Cache::<String>::new("test", settings);
    let fetcher = CountingFetcher::new();

    let slow = cache.get_or_fetch(
        "k",
        fetcher.ok("slow".to_owned(), Duration::from_secs(1)),
        FetchOptions::default(),
    );
    let joined = cache.get_or_fetch(
        "k",
        fetcher.ok("joined".to_owned(), ms(10)),
        FetchOptions::default(),
    );
    let (slow, joined) = futures::join!(slow, joined);
    assert!(matches!(slow, Err(FetchError::Timeout(timeout)) if timeout == ms(100)));
    assert!(matches!(joined, Err(FetchError::Timeout(_))));
    assert_eq!(cache.stats().in_flight, 0);
    assert!(!cache.has("k"));

    let value = cache
        .get_or_fetch("k", fetcher.ok("fast".to_owned(), ms(10)), FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(value, "fast");
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_fetcher() {
    fn panicking() -> anyhow::Result<String> {
        panic!("fetcher panicked");
    }

    test::setup();
    let cache = cache(10);
    let fetcher = CountingFetcher::new();

    let result = cache
        .get_or_fetch("k", || async { panicking() }, FetchOptions::default())
        .await;
    assert!(matches!(result, Err(FetchError::Cancelled)));
    assert_eq!(cache.stats().in_flight, 0);

    // the key is not stuck behind the dead fetch
    let value = cache
        .get_or_fetch("k", fetcher.ok("A".to_owned(), ms(10)), FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(value, "A");
}

#[tokio::test(start_paused = true)]
async fn test_dropped_lookup_completes_fetch() {
    test::setup();
    let cache = cache(10);
    let fetcher = CountingFetcher::new();

    drop(cache.get_or_fetch(
        "k",
        fetcher.ok("A".to_owned(), ms(50)),
        FetchOptions::default(),
    ));
    assert_eq!(cache.stats().in_flight, 1);

    time::sleep(ms(60)).await;
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(cache.get("k").as_deref(), Some("A"));
}

#[test]
fn test_lookup_on_shut_down_runtime() {
    test::setup();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let handle = runtime.handle().clone();
    runtime.shutdown_background();
    let _guard = handle.enter();

    let cache = cache(10);
    let fetcher = CountingFetcher::new();

    let lookup = cache.get_or_fetch(
        "k",
        fetcher.ok("A".to_owned(), ms(10)),
        FetchOptions::default(),
    );
    let result = futures::executor::block_on(lookup);
    assert!(matches!(result, Err(FetchError::Cancelled)));
    assert_eq!(cache.stats().in_flight, 0);

    // a refresh that cannot be spawned leaves the stale entry alone
    cache.set_with("s", "old".into(), SetOptions::default().ttl(Duration::ZERO));
    std::thread::sleep(ms(1));
    let value = cache
        .get_or_fetch("s", fetcher.ok("new".to_owned(), ms(10)), swr())
        .now_or_never()
        .unwrap()
        .unwrap();
    assert_eq!(value, "old");
    assert_eq!(cache.stats().in_flight, 0);
    assert_eq!(cache.get("s").as_deref(), Some("old"));
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_coalescing_across_threads() {
    test::setup();
    let cache = cache(100);

    for round in 0..50 {
        let key = format!("k{round}");
        let fetcher = CountingFetcher::new();
        let barrier = Arc::new(tokio::sync::Barrier::new(16));

        let lookups: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let key = key.clone();
                let fetcher = fetcher.clone();
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    let fetch = fetcher.ok(format!("value {round}"), ms(10));
                    cache
                        .get_or_fetch(&key, fetch, FetchOptions::default())
                        .await
                })
            })
            .collect();

        for lookup in futures::future::join_all(lookups).await {
            assert_eq!(lookup.unwrap().unwrap(), format!("value {round}"));
        }
        assert_eq!(fetcher.calls(), 1, "round {round}");
    }
    assert_eq!(cache.stats().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_write_during_fetch() {
    test::setup();
    let cache = cache(10);
    let fetcher = CountingFetcher::new();

    let lookup = cache.get_or_fetch(
        "k",
        fetcher.ok("fetched".to_owned(), ms(50)),
        FetchOptions::default(),
    );
    cache.set("k", "written".into());
    assert_eq!(cache.get("k").as_deref(), Some("written"));

    assert_eq!(lookup.await.unwrap(), "fetched");
    assert_eq!(cache.get("k").as_deref(), Some("fetched"));
}

#[tokio::test(start_paused = true)]
async fn test_fetch_ttl() {
    test::setup();
    let cache = cache(10);
    let fetcher = CountingFetcher::new();

    let options = FetchOptions::default().ttl(ms(10));
    cache
        .get_or_fetch("short", fetcher.ok("A".to_owned(), Duration::ZERO), options)
        .await
        .unwrap();
    cache
        .get_or_fetch(
            "default",
            fetcher.ok("B".to_owned(), Duration::ZERO),
            FetchOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(cache.get_entry("short").unwrap().ttl, ms(10));
    assert_eq!(
        cache.get_entry("default").unwrap().ttl,
        Duration::from_secs(60)
    );

    time::advance(ms(20)).await;
    assert!(cache.is_stale("short"));
    assert!(!cache.is_stale("default"));
}

#[tokio::test(start_paused = true)]
async fn test_fetched_values_are_evicted() {
    test::setup();
    let cache = cache(2);
    let fetcher = CountingFetcher::new();

    for key in ["a", "b", "c"] {
        cache
            .get_or_fetch(key, fetcher.ok(key.to_owned(), ms(1)), FetchOptions::default())
            .await
            .unwrap();
    }

    assert!(!cache.has("a"));
    assert!(cache.has("b"));
    assert!(cache.has("c"));
    assert_eq!(cache.stats().size, 2);
}

#[test]
fn test_reads_update_recency() {
    let cache = cache(2);
    cache.set("a", "1".into());
    cache.set("b", "2".into());
    cache.get("a");

    cache.set("c", "3".into());
    assert!(cache.has("a"));
    assert!(!cache.has("b"));
}

#[test]
fn test_reads_without_recency() {
    let settings = CacheSettings {
        update_age_on_access: false,
        ..settings(2)
    };
    let cache = Cache::<String>::new("test", settings);
    cache.set("a", "1".into());
    cache.set("b", "2".into());
    cache.get("a");

    cache.set("c", "3".into());
    assert!(!cache.has("a"));
    assert!(cache.has("b"));
}

#[tokio::test(start_paused = true)]
async fn test_prune() {
    let cache = cache(10);
    cache.set_with("short", "1".into(), SetOptions::default().ttl(ms(10)));
    cache.set("long", "2".into());
    assert_eq!(cache.prune(), 0);

    time::advance(ms(20)).await;
    // stale entries are still readable until pruned
    assert_eq!(cache.get("short").as_deref(), Some("1"));
    assert_eq!(cache.prune(), 1);
    assert!(!cache.has("short"));
    assert!(cache.has("long"));
}

#[tokio::test(start_paused = true)]
async fn test_is_stale() {
    let cache = cache(10);
    assert!(cache.is_stale("missing"));

    cache.set_with("k", "v".into(), SetOptions::default().ttl(ms(10)));
    time::advance(ms(5)).await;
    assert!(!cache.is_stale("k"));

    time::advance(ms(10)).await;
    assert!(cache.is_stale("k"));
    // stale values are still returned by plain reads
    assert_eq!(cache.get("k").as_deref(), Some("v"));
}

#[test]
fn test_stats() {
    let cache = cache(10);
    cache.set("a", "1".into());
    cache.set("b", "2".into());

    let stats = cache.stats();
    assert_eq!(stats.namespace, "test");
    assert_eq!(stats.size, 2);
    assert_eq!(stats.max_size, 10);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.keys, ["b", "a"]);

    insta::assert_snapshot!(serde_json::to_string_pretty(&stats).unwrap(), @r#"
    {
      "namespace": "test",
      "size": 2,
      "max_size": 10,
      "in_flight": 0,
      "keys": [
        "b",
        "a"
      ]
    }
    "#);
}

#[test]
fn test_get_and_set_many() {
    let cache = cache(10);
    cache.set_many([("a", "1".to_owned()), ("b", "2".to_owned())]);

    let found = cache.get_many(["a", "b", "missing"]);
    assert_eq!(found.len(), 2);
    assert_eq!(found["a"], "1");
    assert_eq!(found["b"], "2");
    assert!(!found.contains_key("missing"));
}

#[test]
fn test_delete_and_clear() {
    let cache = cache(10);
    cache.set("a", "1".into());
    cache.set("b", "2".into());

    assert!(cache.delete("a"));
    assert!(!cache.delete("a"));
    assert_eq!(cache.get("a"), None);

    cache.clear();
    assert_eq!(cache.stats().size, 0);
}

#[test]
fn test_entry_metadata() {
    let cache = cache(10);
    let metadata = [("status".to_owned(), serde_json::json!(200))].into();
    cache.set_with(
        "k",
        "v".into(),
        SetOptions::default().validator("\"v1\"").metadata(metadata),
    );

    let entry = cache.get_entry("k").unwrap();
    assert_eq!(entry.value, "v");
    assert_eq!(entry.validator.as_deref(), Some("\"v1\""));
    assert_eq!(entry.metadata.unwrap()["status"], 200);
}
