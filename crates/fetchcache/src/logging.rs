//! Process-wide `tracing` setup.
//!
//! Logs are filtered with `RUST_LOG` if set, otherwise by the configured level, which keeps
//! dependencies at `INFO` and only raises the verbosity of the cache crates. Every setup also
//! installs the sentry layer, so errors become sentry events and warnings become sentry logs.

use std::env;

use sentry::integrations::tracing::EventFilter;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{Config, LogFormat};

/// The `RUST_LOG` equivalent of a configured level.
fn default_filter(level: LevelFilter) -> String {
    if level <= LevelFilter::INFO {
        return level.to_string().to_uppercase();
    }
    let level = level.to_string().to_uppercase();
    format!("INFO,fetchcache={level},fetchcache_stress={level}")
}

fn sentry_layer<S>() -> impl Layer<S>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    sentry::integrations::tracing::layer().event_filter(|metadata| match *metadata.level() {
        tracing::Level::ERROR => EventFilter::Event | EventFilter::Log,
        tracing::Level::WARN | tracing::Level::INFO => EventFilter::Log,
        tracing::Level::DEBUG | tracing::Level::TRACE => EventFilter::Ignore,
    })
}

/// A JSON lines formatter writing to `make_writer`, with span context and source locations.
fn json_layer<W>(make_writer: W) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(make_writer)
        .boxed()
}

/// Installs JSON logging into `make_writer`, filtered by `env_filter`.
///
/// This is the format production deployments log in. It is exposed separately so that tools can
/// exercise the full formatting machinery while discarding the output.
pub fn init_json_logging<W>(env_filter: &str, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(json_layer(make_writer).with_filter(EnvFilter::new(env_filter)))
        .with(sentry_layer())
        .init();
}

/// Initializes logging as configured.
///
/// `RUST_LOG` takes precedence over [`Logging::level`](crate::config::Logging::level). If
/// [`Logging::enable_backtraces`](crate::config::Logging::enable_backtraces) is set, this also
/// sets `RUST_BACKTRACE`.
///
/// # Safety
/// This modifies the environment with [`std::env::set_var`], so it must be called before any
/// other threads are spawned.
pub unsafe fn init_logging(config: &Config) {
    let logging = &config.logging;
    if logging.enable_backtraces {
        // SAFETY: Forwarded to the caller.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let filter = env::var("RUST_LOG").unwrap_or_else(|_| default_filter(logging.level));

    let format = match logging.format {
        LogFormat::Auto if console::user_attended() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    };
    let fmt_layer = match format {
        LogFormat::Json => json_layer(std::io::stdout),
        LogFormat::Simplified => tracing_subscriber::fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .compact()
            .with_ansi(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .pretty()
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(EnvFilter::new(filter)))
        .with(sentry_layer())
        .init();
}

/// Logs `error`, falling back to `stderr` while no logger accepts errors.
pub fn ensure_log_error(error: &anyhow::Error) {
    let logged = tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current();
    if logged {
        tracing::error!("{error:?}");
    } else {
        eprintln!("{error:?}");
    }
}
