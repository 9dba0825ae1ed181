//! Logging initialization using the `tracing` ecosystem.
//!
//! - Console output (colored, human-readable)
//! - Optional file output with daily rotation via `tracing-appender`, plain or
//!   JSON lines
//! - Level from `RUST_LOG` when set, otherwise from [`LoggingConfig::level`]

use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn file_layer(config: &LoggingConfig) -> Option<BoxedLayer> {
    let dir = config.dir.as_deref()?;
    let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
    let layer = if config.json {
        fmt::layer().json().with_writer(appender).with_target(true).boxed()
    } else {
        fmt::layer()
            .with_writer(appender)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    };
    Some(layer)
}

/// Install the global tracing subscriber. Call once at program start.
pub fn init_logging(config: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(file_layer(config))
        .with(env_filter)
        .with(console_layer)
        .init();
}
