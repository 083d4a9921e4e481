//! Helpers for testing caches.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Fetchers created by a [`CountingFetcher`] sleep on the tokio clock. Run tests that depend
//!    on their timing with `#[tokio::test(start_paused = true)]`, so that time only advances
//!    when every task is idle and the outcome does not depend on the machine.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// A boxed fetcher, as accepted by `Cache::get_or_fetch`.
pub type Fetcher<T> = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send>;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `fetchcache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("fetchcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates fetchers with scripted results and counts how many of them were started.
///
/// Clones share the same counter.
#[derive(Clone, Debug, Default)]
pub struct CountingFetcher {
    calls: Arc<AtomicUsize>,
}

impl CountingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many of the created fetchers have been started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// A fetcher that resolves to `value` after `delay`.
    pub fn ok<T: Send + 'static>(&self, value: T, delay: Duration) -> Fetcher<T> {
        self.fetcher(delay, move || Ok(value))
    }

    /// A fetcher that fails with `message` after `delay`.
    pub fn err<T: Send + 'static>(&self, message: &str, delay: Duration) -> Fetcher<T> {
        let message = message.to_owned();
        self.fetcher(delay, move || Err(anyhow::Error::msg(message)))
    }

    fn fetcher<T, R>(&self, delay: Duration, result: R) -> Fetcher<T>
    where
        T: Send + 'static,
        R: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let calls = Arc::clone(&self.calls);
        Box::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                result()
            }
            .boxed()
        })
    }
}
