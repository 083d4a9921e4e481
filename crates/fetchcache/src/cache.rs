use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared, TryFutureExt};
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};
use serde::Serialize;
use tokio::time::Instant;

use crate::config::CacheSettings;
use crate::entry::{self, CacheEntry, SetOptions};
use crate::error::FetchError;
use crate::store::EntryStore;
use crate::utils::defer::defer;

type FetchResult<T> = Result<T, FetchError>;
type FetchChannel<T> = Shared<oneshot::Receiver<FetchResult<T>>>;

/// Invoked with the fully qualified key whenever a background refresh fails.
///
/// Callers of a stale-while-revalidate lookup have already received the stale value by the time
/// the refresh settles, so this is the only place such failures surface.
pub type RefreshErrorHook = Arc<dyn Fn(&str, &FetchError) + Send + Sync>;

/// Options of [`Cache::get_or_fetch`].
#[derive(Clone, Copy, Debug, Default)]
pub struct FetchOptions {
    /// TTL of the fetched value, instead of the cache's default.
    pub ttl: Option<Duration>,
    /// Ignores a fresh cached value. A fetch that is already running is still joined.
    pub force: bool,
    /// Serves a cached value immediately even if it is stale, refreshing it in the background.
    pub stale_while_revalidate: bool,
}

impl FetchOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn stale_while_revalidate(mut self, stale_while_revalidate: bool) -> Self {
        self.stale_while_revalidate = stale_while_revalidate;
        self
    }
}

/// A diagnostic snapshot of a cache instance.
///
/// This is not authoritative for anything, capacity is enforced by the cache itself.
#[derive(Clone, Debug, Serialize)]
pub struct CacheStats {
    pub namespace: String,
    /// Number of entries, stale ones included.
    pub size: usize,
    pub max_size: usize,
    /// Number of fetches currently running.
    pub in_flight: usize,
    /// Keys without their namespace, most recently used first.
    pub keys: Vec<String>,
}

/// A fetch that is currently running for a key.
struct InFlight<T> {
    /// Identifies the fetch that registered this record, only that fetch may remove it.
    id: u64,
    channel: FetchChannel<T>,
}

/// A registered fetch whose task has not been spawned yet.
#[must_use = "the fetch stays registered until its task is spawned or dropped"]
struct PendingFetch<T> {
    runtime: tokio::runtime::Handle,
    task: BoxFuture<'static, ()>,
    channel: FetchChannel<T>,
}

impl<T> PendingFetch<T> {
    /// Spawns the task, returning the channel its result is sent to.
    ///
    /// If the runtime is already shut down the task is dropped without running, which clears the
    /// registration and resolves the channel to [`FetchError::Cancelled`].
    fn spawn(self) -> FetchChannel<T> {
        self.runtime.spawn(self.task);
        self.channel
    }
}

struct CacheState<T> {
    entries: EntryStore<T>,
    in_flight: HashMap<String, InFlight<T>>,
    next_fetch_id: u64,
}

impl<T> CacheState<T> {
    fn remove_in_flight(&mut self, key: &str, id: u64) {
        if self.in_flight.get(key).is_some_and(|fetch| fetch.id == id) {
            self.in_flight.remove(key);
        }
    }
}

struct CacheInner<T> {
    namespace: String,
    settings: CacheSettings,
    /// The entries and the running fetches share a lock, so that looking for a running fetch and
    /// registering a new one is a single step.
    state: Mutex<CacheState<T>>,
    on_refresh_error: Option<RefreshErrorHook>,
}

/// A namespaced, size-bounded in-memory cache that coalesces concurrent fetches.
///
/// Values are stored with a TTL and evicted least-recently-used once `max_entries` is reached.
/// [`get_or_fetch`](Self::get_or_fetch) guarantees that at most one fetch runs per key at any
/// time: concurrent lookups of a missing key all wait for the same fetch, and stale values can
/// optionally be served while a single background refresh replaces them.
///
/// Failed fetches are never cached, the next lookup of the key simply fetches again.
///
/// `Cache` is a cheap handle, clones refer to the same instance.
pub struct Cache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for Cache<T> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Cache {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Cache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Cache");
        debug
            .field("namespace", &self.inner.namespace)
            .field("settings", &self.inner.settings);
        if let Some(state) = self.inner.state.try_lock() {
            debug
                .field("entries", &state.entries.len())
                .field("running fetches", &state.in_flight.len());
        }
        debug.finish()
    }
}

impl<T> Cache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(namespace: impl Into<String>, settings: CacheSettings) -> Self {
        Self::with_refresh_error_hook(namespace, settings, None)
    }

    /// Creates a cache that reports failed background refreshes to `on_refresh_error`.
    pub fn with_refresh_error_hook(
        namespace: impl Into<String>,
        settings: CacheSettings,
        on_refresh_error: Option<RefreshErrorHook>,
    ) -> Self {
        let entries = EntryStore::new(settings.max_entries, settings.default_ttl)
            .with_update_age_on_access(settings.update_age_on_access);
        let state = CacheState {
            entries,
            in_flight: HashMap::new(),
            next_fetch_id: 0,
        };

        Cache {
            inner: Arc::new(CacheInner {
                namespace: namespace.into(),
                settings,
                state: Mutex::new(state),
                on_refresh_error,
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    fn qualify(&self, key: &str) -> String {
        format!("{}:{key}", self.inner.namespace)
    }

    /// Returns the cached value for `key`, even if it is stale.
    pub fn get(&self, key: &str) -> Option<T> {
        let key = self.qualify(key);
        let mut state = self.inner.state.lock();
        state.entries.get(&key).map(|entry| entry.value.clone())
    }

    /// Returns the full entry for `key`, even if it is stale.
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry<T>> {
        let key = self.qualify(key);
        let mut state = self.inner.state.lock();
        state.entries.get(&key).cloned()
    }

    /// Whether `key` is missing or has outlived its TTL.
    pub fn is_stale(&self, key: &str) -> bool {
        let key = self.qualify(key);
        let state = self.inner.state.lock();
        entry::is_stale(state.entries.peek(&key), Instant::now())
    }

    /// Stores `value` with the default TTL of the cache.
    pub fn set(&self, key: &str, value: T) {
        self.set_with(key, value, SetOptions::default())
    }

    /// Stores `value` for `key`.
    ///
    /// Writing a key while a fetch for it is running is allowed, but the value is replaced once
    /// that fetch succeeds.
    pub fn set_with(&self, key: &str, value: T, options: SetOptions) {
        let key = self.qualify(key);
        let mut state = self.inner.state.lock();
        if state.in_flight.contains_key(&key) {
            tracing::debug!(
                cache = self.namespace(),
                key = %key,
                "Writing entry while a fetch is running"
            );
        }
        self.store_locked(&mut state, key, value, options);
    }

    pub fn has(&self, key: &str) -> bool {
        let key = self.qualify(key);
        self.inner.state.lock().entries.has(&key)
    }

    pub fn delete(&self, key: &str) -> bool {
        let key = self.qualify(key);
        self.inner.state.lock().entries.delete(&key)
    }

    /// Removes all entries. Running fetches are not affected and will still store their results.
    pub fn clear(&self) {
        self.inner.state.lock().entries.clear();
    }

    /// Removes all entries that have outlived their TTL, returning how many were removed.
    pub fn prune(&self) -> usize {
        let name = self.namespace();
        let pruned = self.inner.state.lock().entries.prune(Instant::now());
        if pruned > 0 {
            tracing::debug!(cache = name, pruned, "Pruned stale entries");
            metric!(counter("caches.pruned") += pruned as i64, "cache" => name);
        }
        pruned
    }

    /// Returns the cached values of all `keys` that are present, stale or not.
    pub fn get_many<'k, I>(&self, keys: I) -> HashMap<String, T>
    where
        I: IntoIterator<Item = &'k str>,
    {
        keys.into_iter()
            .filter_map(|key| Some((key.to_owned(), self.get(key)?)))
            .collect()
    }

    /// Stores all `entries` with the default TTL of the cache.
    pub fn set_many<I, K>(&self, entries: I)
    where
        I: IntoIterator<Item = (K, T)>,
        K: AsRef<str>,
    {
        for (key, value) in entries {
            self.set(key.as_ref(), value);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let prefix = self.qualify("");
        let state = self.inner.state.lock();
        CacheStats {
            namespace: self.inner.namespace.clone(),
            size: state.entries.len(),
            max_size: state.entries.max_entries(),
            in_flight: state.in_flight.len(),
            keys: state
                .entries
                .keys()
                .map(|key| key.strip_prefix(&prefix).unwrap_or(key).to_owned())
                .collect(),
        }
    }

    /// Returns the value for `key`, fetching it with `fetcher` if needed.
    ///
    /// The lookup proceeds as follows:
    ///
    /// 1. A fresh cached value is returned right away, unless `force` is set.
    /// 2. With `stale_while_revalidate`, any cached value is returned right away. If no fetch is
    ///    running for `key`, `fetcher` is started in the background to refresh the value. A failing
    ///    refresh is reported to the refresh error hook of the cache, not to this caller.
    /// 3. If a fetch is already running for `key`, its result is shared with this caller.
    /// 4. Otherwise `fetcher` is started and its result returned. A successful result is stored
    ///    with the `ttl` of the options or the default TTL of the cache.
    ///
    /// The decision and the registration of a new fetch happen before this function returns,
    /// the returned future only waits for the result. Fetches run as tasks on the current tokio
    /// runtime and complete even if the returned future is dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime and a fetch needs to be started.
    pub fn get_or_fetch<F, Fut, E>(
        &self,
        key: &str,
        fetcher: F,
        options: FetchOptions,
    ) -> BoxFuture<'static, FetchResult<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        let name = self.namespace();
        metric!(counter("caches.access") += 1, "cache" => name);

        let key = self.qualify(key);
        let now = Instant::now();
        let mut state = self.inner.state.lock();

        let cached = state
            .entries
            .get(&key)
            .map(|entry| (entry.value.clone(), entry.is_stale_at(now)));
        let has_entry = cached.is_some();

        match cached {
            Some((value, false)) if !options.force => {
                metric!(counter("caches.memory.hit") += 1, "cache" => name);
                tracing::trace!(cache = name, key = %key, "Fresh cache hit");
                return future::ready(Ok(value)).boxed();
            }
            Some((value, _)) if options.stale_while_revalidate => {
                metric!(counter("caches.memory.stale_hit") += 1, "cache" => name);
                if state.in_flight.contains_key(&key) {
                    tracing::trace!(cache = name, key = %key, "Serving stale entry, refresh running");
                } else {
                    tracing::trace!(cache = name, key = %key, "Serving stale entry, spawning refresh");
                    let fetch = self.register_fetch(&mut state, key, fetcher, options.ttl, true);
                    drop(state);
                    // Nobody waits for the refresh, its task stores the result.
                    let _ = fetch.spawn();
                }
                return future::ready(Ok(value)).boxed();
            }
            _ => {}
        }

        let channel = match state.in_flight.get(&key) {
            Some(fetch) => {
                // A concurrent lookup was deduplicated.
                metric!(counter("caches.channel.hit") += 1, "cache" => name);
                tracing::trace!(cache = name, key = %key, "Joining running fetch");
                fetch.channel.clone()
            }
            None => {
                if !has_entry {
                    metric!(counter("caches.memory.miss") += 1, "cache" => name);
                }
                let fetch = self.register_fetch(&mut state, key, fetcher, options.ttl, false);
                drop(state);
                fetch.spawn()
            }
        };

        channel
            .unwrap_or_else(|_cancelled| Err(FetchError::Cancelled))
            .boxed()
    }

    /// Registers `fetcher` as the running fetch for `key` and prepares its task.
    ///
    /// Must only be called if no fetch is running for `key`. The returned [`PendingFetch`] has to
    /// be spawned after `state` is unlocked: a runtime that is shutting down drops the task right
    /// away, and the cleanup of a dropped task locks `state` again.
    ///
    /// Once the fetch settles, its result is stored (if successful) and the registration removed
    /// in one step. The `is_refresh` flag marks background refreshes, whose failures go to the
    /// refresh error hook.
    fn register_fetch<F, Fut, E>(
        &self,
        state: &mut CacheState<T>,
        key: String,
        fetcher: F,
        ttl: Option<Duration>,
        is_refresh: bool,
    ) -> PendingFetch<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error>,
    {
        // Fail before registering anything when there is no runtime to run the fetch on.
        let runtime = tokio::runtime::Handle::current();

        let name = self.namespace();
        metric!(
            counter("caches.channel.miss") += 1,
            "cache" => name,
            "is_refresh" => if is_refresh { "true" } else { "false" },
        );
        tracing::debug!(cache = name, key = %key, is_refresh, "Spawning fetch");

        let id = state.next_fetch_id;
        state.next_fetch_id = state.next_fetch_id.wrapping_add(1);

        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        let evicted = state.in_flight.insert(
            key.clone(),
            InFlight {
                id,
                channel: channel.clone(),
            },
        );
        debug_assert!(evicted.is_none());

        // Clears the registration if the task panics or is dropped before settling, in which case
        // the sender is dropped as well and all waiting callers see `Cancelled`.
        let cleanup = {
            let this = self.clone();
            let key = key.clone();
            defer(move || this.inner.state.lock().remove_in_flight(&key, id))
        };

        let this = self.clone();
        let timeout = self.inner.settings.fetch_timeout;
        let task = async move {
            // Background refreshes outlive the request that triggered them, so they get their own
            // transaction instead of attaching to the parent one.
            let transaction = is_refresh.then(|| {
                let span = sentry::configure_scope(|scope| scope.get_span());
                let ctx = sentry::TransactionContext::continue_from_span(
                    "Lazy Cache Refresh",
                    "spawn_refresh",
                    span,
                );
                let transaction = sentry::start_transaction(ctx);
                sentry::configure_scope(|scope| scope.set_span(Some(transaction.clone().into())));
                transaction
            });

            let start = Instant::now();
            let fetch = async move { fetcher().await.map_err(FetchError::from_err) };
            let result = match timeout {
                Some(timeout) => tokio::time::timeout(timeout, fetch)
                    .await
                    .unwrap_or_else(|_elapsed| Err(FetchError::Timeout(timeout))),
                None => fetch.await,
            };
            metric!(
                timer("caches.fetch.duration") = start.elapsed(),
                "cache" => this.namespace(),
                "is_refresh" => if is_refresh { "true" } else { "false" },
            );

            this.settle(&key, id, ttl, &result, is_refresh);
            cleanup.disarm();

            if let Some(transaction) = transaction {
                transaction.finish();
            }
            sender.send(result).ok();
        };

        PendingFetch {
            runtime,
            task: task.bind_hub(Hub::new_from_top(Hub::current())).boxed(),
            channel,
        }
    }

    /// Stores the result of a fetch and removes its registration.
    fn settle(
        &self,
        key: &str,
        id: u64,
        ttl: Option<Duration>,
        result: &FetchResult<T>,
        is_refresh: bool,
    ) {
        let name = self.namespace();
        {
            let mut state = self.inner.state.lock();
            if let Ok(value) = result {
                let options = SetOptions {
                    ttl,
                    ..Default::default()
                };
                self.store_locked(&mut state, key.to_owned(), value.clone(), options);
            }
            state.remove_in_flight(key, id);
        }

        let Err(err) = result else {
            tracing::debug!(cache = name, key, is_refresh, "Fetch succeeded");
            return;
        };

        metric!(
            counter("caches.fetch.failure") += 1,
            "cache" => name,
            "reason" => err.metrics_tag(),
            "is_refresh" => if is_refresh { "true" } else { "false" },
        );
        if let FetchError::Timeout(_) = err {
            metric!(counter("caches.fetch.timeout") += 1, "cache" => name);
        }

        if is_refresh {
            metric!(counter("caches.refresh.failure") += 1, "cache" => name);
            tracing::warn!(
                cache = name,
                key,
                error = err as &dyn std::error::Error,
                "Background refresh failed, keeping stale entry"
            );
            if let Some(hook) = &self.inner.on_refresh_error {
                hook(key, err);
            }
        } else if let FetchError::Timeout(_) = err {
            tracing::warn!(
                cache = name,
                key,
                error = err as &dyn std::error::Error,
                "Fetch timed out"
            );
        } else {
            tracing::debug!(
                cache = name,
                key,
                error = err as &dyn std::error::Error,
                "Fetch failed"
            );
        }
    }

    fn store_locked(&self, state: &mut CacheState<T>, key: String, value: T, options: SetOptions) {
        let name = self.namespace();
        if let Some((evicted, _)) = state.entries.set(key, value, options) {
            metric!(counter("caches.evicted") += 1, "cache" => name);
            tracing::trace!(cache = name, key = %evicted, "Evicted least recently used entry");
        }
        metric!(gauge("caches.size") = state.entries.len() as u64, "cache" => name);
    }
}
