//! Process-level utilities: logging setup and shutdown signals

pub mod logging;
pub mod signal;

pub use logging::{init_logging, init_logging_from_config, init_plugin_logging};
#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use signal::wait_for_shutdown_signal;
