//! Statsd reporting for cache operations.
//!
//! Metrics are sent through a process-wide client that is configured once at startup with
//! [`configure_statsd`]. Until then, and in tests, every [`metric!`](crate::metric) is a no-op.

use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::{Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static METRICS_CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// Traits needed by the [`metric!`](crate::metric) macro.
pub mod prelude {
    pub use cadence::prelude::*;
}

/// A statsd client that attaches a fixed set of tags to everything it sends.
#[derive(Debug)]
pub struct MetricsClient {
    statsd: StatsdClient,
    default_tags: Vec<(String, String)>,
}

impl MetricsClient {
    /// The underlying client, used to start building a metric.
    pub fn statsd(&self) -> &StatsdClient {
        &self.statsd
    }

    /// Adds the default tags to `metric` and sends it.
    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.default_tags
            .iter()
            .fold(metric, |metric, (tag, value)| metric.with_tag(tag, value))
            .send()
    }
}

/// Starts reporting metrics to the statsd server at `host`.
///
/// Every metric name is prefixed with `prefix` and carries `tags` in addition to its own. The
/// client can only be configured once, later calls log a warning and leave it unchanged.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    tags: BTreeMap<String, String>,
) -> Result<()> {
    let addrs: Vec<_> = host
        .to_socket_addrs()
        .context("failed to resolve statsd host")?
        .collect();
    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket.set_nonblocking(true)?;
    let sink = UdpMetricSink::from(&addrs[..], socket).context("failed to create statsd sink")?;

    let client = MetricsClient {
        statsd: StatsdClient::from_sink(prefix, sink),
        default_tags: tags.into_iter().collect(),
    };
    match METRICS_CLIENT.set(client) {
        Ok(()) => tracing::info!(addrs = ?addrs, prefix, "Reporting metrics to statsd"),
        Err(_) => tracing::warn!("Metrics are already being reported, ignoring configuration"),
    }
    Ok(())
}

/// Runs `f` with the configured client, or returns the default if there is none.
///
/// Prefer the [`metric!`](crate::metric) macro.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    METRICS_CLIENT.get().map(f).unwrap_or_default()
}

/// Emits a counter, gauge, timer or histogram, with optional tags.
///
/// ```
/// use std::time::Duration;
///
/// fetchcache::metric!(counter("caches.access") += 1, "cache" => "search");
/// fetchcache::metric!(gauge("caches.size") = 42u64, "cache" => "search");
/// fetchcache::metric!(timer("caches.fetch.duration") = Duration::from_millis(3));
/// ```
#[macro_export]
macro_rules! metric {
    (@send $method:ident, $id:expr, $value:expr $(, $k:expr => $v:expr)*) => {{
        use $crate::metrics::prelude::*;
        $crate::metrics::with_client(|client| {
            client.send_metric(client.statsd().$method($id, $value) $(.with_tag($k, $v))*);
        })
    }};

    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send count_with_tags, $id, $value $(, $k => $v)*)
    };

    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send gauge_with_tags, $id, $value $(, $k => $v)*)
    };

    (timer($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send time_with_tags, $id, $value $(, $k => $v)*)
    };

    (histogram($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metric!(@send histogram_with_tags, $id, $value $(, $k => $v)*)
    };
}
