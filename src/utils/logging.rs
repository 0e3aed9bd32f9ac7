//! Logging initialization for the handler and for plugin processes
//!
//! All output goes to stderr. Stdout of the handler carries the native kernel
//! channel and must never receive log lines.
//!
//! - Respects the RUST_LOG environment variable
//! - Falls back to a configured filter, then to "info"
//!
//! # Usage
//! ```rust
//! use plugin_handler::utils::init_logging;
//!
//! init_logging(None); // Uses RUST_LOG or defaults to "info"
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Resolve the effective filter: RUST_LOG, then `filter`, then "info"
fn resolve_filter(filter: Option<&str>) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::new("info"),
    }
}

/// Initialize human-readable logging to stderr
///
/// # Arguments
/// * `filter` - Optional log filter from config (e.g., "info", "plugin_handler=debug").
///              RUST_LOG takes precedence when set.
pub fn init_logging(filter: Option<&str>) {
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .with(resolve_filter(filter))
        .try_init();
}

/// Initialize logging inside a plugin process
///
/// Defaults to "{namespace}=info,plugin_handler=info" unless RUST_LOG or `filter`
/// says otherwise. ANSI colours are off since stderr may be a framed channel.
pub fn init_plugin_logging(namespace: &str, filter: Option<&str>) {
    let default_filter = format!("{}=info,plugin_handler=info", namespace);
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(filter.unwrap_or(&default_filter))
    };

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_ansi(false),
        )
        .with(env_filter)
        .try_init();
}

/// Initialize JSON-lines logging to stderr (for log aggregation)
#[cfg(feature = "json-logging")]
pub fn init_json_logging(filter: Option<&str>) {
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(resolve_filter(filter))
        .try_init();
}

/// Initialize logging from the handler's [`LoggingConfig`](crate::config::LoggingConfig)
///
/// JSON output needs the `json-logging` feature; without it the human-readable
/// format is used.
pub fn init_logging_from_config(config: &crate::config::LoggingConfig) {
    let filter = config.filter.as_deref();

    if config.json_format {
        #[cfg(feature = "json-logging")]
        {
            init_json_logging(filter);
        }
        #[cfg(not(feature = "json-logging"))]
        {
            init_logging(filter);
        }
    } else {
        init_logging(filter);
    }
}
