//! Tracing initialization.
//!
//! Controlled by `O4_LOG` (an `EnvFilter` directive string, default `warn`;
//! the legacy `DEBUG` variable bumps the default to `debug`) and
//! `O4_LOG_FORMAT=json` for machine-readable stderr output. Diagnostics go
//! to stderr; stdout belongs to the record pipeline.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

pub fn init() {
    let default = if std::env::var("DEBUG").is_ok_and(|v| !v.is_empty()) {
        "debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_env("O4_LOG").unwrap_or_else(|_| EnvFilter::new(default));

    let json = std::env::var("O4_LOG_FORMAT").is_ok_and(|v| v == "json");
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .without_time()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
