//! Configuration management for the plugin handler
//!
//! Handles configuration loading (JSON or TOML) and validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::plugin::ipc::protocol::ModuleIdentity;

/// Plugin handler configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Identity announced to the kernel
    #[serde(default)]
    pub identity: ModuleIdentity,

    /// Plugin process supervision
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// How plugin processes are launched
    #[serde(default)]
    pub launch: LaunchConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Plugin supervision configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Time a plugin has to send its verification verdict
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Time an unloading plugin has to exit after SIGTERM before it is killed
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Time to wait for a stopped command handler module before skipping it
    #[serde(default = "default_command_handler_wait_ms")]
    pub command_handler_wait_ms: u64,

    /// Interval between support package probes
    #[serde(default = "default_install_poll_interval_ms")]
    pub install_poll_interval_ms: u64,

    /// Failed probes before installation is requested again
    #[serde(default = "default_install_retry_budget")]
    pub install_retry_budget: u32,

    /// Upper bound on dependency installation (None = wait indefinitely)
    #[serde(default)]
    pub install_deadline_ms: Option<u64>,

    /// Support package source handed to the installer (None = nothing to install or probe)
    #[serde(default)]
    pub support_package_dir: Option<PathBuf>,

    /// Where the installed support package appears, relative to the plugin directory
    #[serde(default = "default_support_package_probe")]
    pub support_package_probe: PathBuf,
}

fn default_handshake_timeout_ms() -> u64 {
    30_000
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

fn default_command_handler_wait_ms() -> u64 {
    10_000
}

fn default_install_poll_interval_ms() -> u64 {
    100
}

fn default_install_retry_budget() -> u32 {
    50
}

fn default_support_package_probe() -> PathBuf {
    PathBuf::from("node_modules/@nocom_bot/nocom-atype-support")
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            command_handler_wait_ms: default_command_handler_wait_ms(),
            install_poll_interval_ms: default_install_poll_interval_ms(),
            install_retry_budget: default_install_retry_budget(),
            install_deadline_ms: None,
            support_package_dir: None,
            support_package_probe: default_support_package_probe(),
        }
    }
}

impl SupervisorConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn install_poll_interval(&self) -> Duration {
        Duration::from_millis(self.install_poll_interval_ms)
    }

    pub fn install_deadline(&self) -> Option<Duration> {
        self.install_deadline_ms.map(Duration::from_millis)
    }
}

/// Plugin launch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Interpreter for plugins whose entry point runs directly
    #[serde(default = "default_script_runner")]
    pub script_runner: String,

    /// Launcher for plugins whose entry point is untranspiled source
    #[serde(default = "default_source_launcher")]
    pub source_launcher: String,

    /// Extra arguments placed before the entry point for the source launcher
    #[serde(default)]
    pub source_launcher_args: Vec<String>,
}

fn default_script_runner() -> String {
    "node".to_string()
}

fn default_source_launcher() -> String {
    "tsx".to_string()
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            script_runner: default_script_runner(),
            source_launcher: default_source_launcher(),
            source_launcher_args: Vec::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (e.g. "info", "plugin_handler=debug"); RUST_LOG takes precedence
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON lines (requires the `json-logging` feature)
    #[serde(default)]
    pub json_format: bool,
}

impl HandlerConfig {
    /// Load configuration from JSON file
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HandlerConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HandlerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration, choosing the format by file extension
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_file(path),
            Some("json") => Self::from_json_file(path),
            other => Err(anyhow::anyhow!(
                "Unsupported config format {:?} for {}",
                other,
                path.display()
            )),
        }
    }

    /// Save configuration to JSON file
    pub fn to_json_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.identity.module.is_empty() || self.identity.namespace.is_empty() {
            return Err(anyhow::anyhow!(
                "identity.module and identity.namespace must not be empty"
            ));
        }

        self.supervisor.validate()?;

        if self.launch.script_runner.trim().is_empty() {
            return Err(anyhow::anyhow!("launch.script_runner must not be empty"));
        }
        if self.launch.source_launcher.trim().is_empty() {
            return Err(anyhow::anyhow!("launch.source_launcher must not be empty"));
        }

        Ok(())
    }
}

impl SupervisorConfig {
    /// Validate supervisor configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.handshake_timeout_ms == 0 {
            return Err(anyhow::anyhow!(
                "handshake_timeout_ms must be greater than 0"
            ));
        }

        if self.install_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!(
                "install_poll_interval_ms must be greater than 0"
            ));
        }

        if self.install_retry_budget == 0 {
            return Err(anyhow::anyhow!(
                "install_retry_budget must be greater than 0"
            ));
        }

        if self.support_package_probe.is_absolute() {
            return Err(anyhow::anyhow!(
                "support_package_probe must be relative to the plugin directory"
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HandlerConfig::default();
        assert_eq!(config.identity.module, "pl_handler");
        assert_eq!(config.identity.namespace, "pluginhandler_a");
        assert_eq!(config.supervisor.handshake_timeout(), Duration::from_secs(30));
        assert_eq!(config.supervisor.command_handler_wait_ms, 10_000);
        assert_eq!(config.supervisor.stop_grace(), Duration::from_secs(5));
        assert_eq!(config.supervisor.install_poll_interval(), Duration::from_millis(100));
        assert!(config.supervisor.install_deadline().is_none());
        assert_eq!(config.launch.script_runner, "node");
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: HandlerConfig =
            serde_json::from_str(r#"{"supervisor": {"handshake_timeout_ms": 500}}"#).unwrap();
        assert_eq!(config.supervisor.handshake_timeout_ms, 500);
        assert_eq!(config.supervisor.install_retry_budget, 50);
        assert_eq!(config.identity.display_name, "A-Type Plugin Handler");
    }

    #[test]
    fn test_from_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("handler.toml");
        std::fs::write(
            &toml_path,
            "[launch]\nscript_runner = \"bun\"\n\n[supervisor]\ninstall_deadline_ms = 2000\n",
        )
        .unwrap();
        let config = HandlerConfig::from_file(&toml_path).unwrap();
        assert_eq!(config.launch.script_runner, "bun");
        assert_eq!(config.supervisor.install_deadline(), Some(Duration::from_secs(2)));

        let json_path = dir.path().join("handler.json");
        config.to_json_file(&json_path).unwrap();
        let reloaded = HandlerConfig::from_file(&json_path).unwrap();
        assert_eq!(reloaded.launch.script_runner, "bun");

        assert!(HandlerConfig::from_file(&dir.path().join("handler.yaml")).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = HandlerConfig::default();
        config.supervisor.handshake_timeout_ms = 0;
        assert!(config.validate().is_err());
    }
}
