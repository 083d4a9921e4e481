use std::collections::BTreeMap;
use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::pin::Pin;

use fetchcache::Config;
use fetchcache::logging::{ensure_log_error, init_json_logging, init_logging};
use fetchcache::metrics;

pub struct Options<'a> {
    pub config: &'a Config,
    /// Use the configured logging instead of discarding everything.
    pub verbose: bool,
}

#[derive(Default)]
pub struct Guard {
    sentry: Option<sentry::ClientInitGuard>,
    pub udp_sink: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

/// Sets up logging, error reporting and metrics the way a production deployment would.
///
/// Unless `verbose` is set, logs go through the production JSON formatter into the void, and
/// metrics without a configured statsd server are sent to a local sink that is polled by the
/// returned [`Guard`].
///
/// # Safety
/// Modifies the environment via [`init_logging`], see its documentation.
pub unsafe fn init(options: Options<'_>) -> Guard {
    let Options { config, verbose } = options;
    let mut guard = Guard::default();

    if let Some(dsn) = &config.sentry_dsn {
        guard.sentry = Some(sentry::init(sentry::ClientOptions {
            dsn: Some(dsn.clone()),
            release: sentry::release_name!(),
            traces_sample_rate: 1.0,
            ..Default::default()
        }));
    }

    if verbose {
        // SAFETY: forwarded to the caller.
        unsafe { init_logging(config) };
    } else {
        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void:
        init_json_logging("INFO,fetchcache=DEBUG", || NoopWriter);
    }

    let statsd = match &config.metrics.statsd {
        Some(statsd) => Some(statsd.clone()),
        None => local_statsd_sink(&mut guard),
    };
    if let Some(statsd) = statsd {
        // have some default tags, just to be closer to the real world config
        let mut tags = config.metrics.custom_tags.clone();
        tags.extend(BTreeMap::from([
            ("host".to_owned(), "stresstest".to_owned()),
            ("env".to_owned(), "stresstest".to_owned()),
        ]));

        if let Err(err) = metrics::configure_statsd(&config.metrics.prefix, statsd, tags) {
            ensure_log_error(&err);
        }
    }

    guard
}

/// Binds a local UDP socket swallowing all metrics, returning its address.
fn local_statsd_sink(guard: &mut Guard) -> Option<String> {
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = UdpSocket::bind(addr).ok()?;
    listener.set_nonblocking(true).ok()?;
    let socket = listener.local_addr().ok()?;

    guard.udp_sink = Some(Box::pin(async move {
        let Ok(listener) = tokio::net::UdpSocket::from_std(listener) else {
            return;
        };
        let mut buf = Vec::with_capacity(1024);
        loop {
            buf.clear();
            if listener.recv_buf(&mut buf).await.is_err() {
                return;
            }
        }
    }));

    Some(format!("127.0.0.1:{}", socket.port()))
}

struct NoopWriter;
impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // try to prevent the compiler from optimizing away all the formatting code:
        let buf = std::hint::black_box(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
