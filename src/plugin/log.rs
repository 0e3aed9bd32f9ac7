//! Log sink for plugin-originated log lines

use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::plugin::ipc::protocol::LogLevel;

/// Destination for `log` ops sent by plugins
pub trait LogSink: Send + Sync {
    fn log(&self, namespace: &str, level: LogLevel, args: &[Value]);
}

/// Emits plugin log lines as `tracing` events tagged with the plugin namespace
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, namespace: &str, level: LogLevel, args: &[Value]) {
        let line = render_args(args);
        match level {
            LogLevel::Critical => error!(plugin = %namespace, critical = true, "{}", line),
            LogLevel::Error => error!(plugin = %namespace, "{}", line),
            LogLevel::Warn => warn!(plugin = %namespace, "{}", line),
            LogLevel::Info => info!(plugin = %namespace, "{}", line),
            LogLevel::Debug => debug!(plugin = %namespace, "{}", line),
            LogLevel::Verbose => trace!(plugin = %namespace, "{}", line),
        }
    }
}

/// Join log arguments with spaces; strings are written without quotes
pub fn render_args(args: &[Value]) -> String {
    args.iter()
        .map(|arg| match arg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_args() {
        let line = render_args(&[json!("user"), json!(42), json!({"a": 1}), json!(null)]);
        assert_eq!(line, r#"user 42 {"a":1} null"#);
    }
}
