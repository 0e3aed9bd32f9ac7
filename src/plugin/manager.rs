//! Plugin manager
//!
//! Owns one [`ProcessSupervisor`] per loaded plugin, keyed by namespace, and exposes
//! the handler's kernel-facing commands.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::plugin::host::{HostChannel, Responder};
use crate::plugin::log::{LogSink, TracingLogSink};
use crate::plugin::manifest::{read_manifest_value, ManifestValidator, PluginManifest, ValidationResult};
use crate::plugin::process::PluginLauncher;
use crate::plugin::supervisor::ProcessSupervisor;
use crate::plugin::traits::{KernelApi, PluginError, PluginState};

const UNLOAD_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A plugin that exited or crashed on its own no longer holds its namespace
fn has_departed(state: &PluginState) -> bool {
    matches!(state, PluginState::Stopped | PluginState::Failed(_))
}

/// Summary of a loaded plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSummary {
    pub namespace: String,
    pub name: String,
    pub version: String,
    pub state: String,
}

/// Plugin manager coordinates all loaded plugins
pub struct PluginManager {
    kernel: Arc<dyn KernelApi>,
    launcher: Arc<dyn PluginLauncher>,
    log_sink: Arc<dyn LogSink>,
    config: SupervisorConfig,
    /// Kernel temp directory, once known
    temp_dir: RwLock<Option<PathBuf>>,
    /// Loaded plugins (namespace -> supervisor)
    plugins: Mutex<HashMap<String, Arc<ProcessSupervisor>>>,
}

impl PluginManager {
    pub fn new(
        kernel: Arc<dyn KernelApi>,
        launcher: Arc<dyn PluginLauncher>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            kernel,
            launcher,
            log_sink: Arc::new(TracingLogSink),
            config,
            temp_dir: RwLock::new(None),
            plugins: Mutex::new(HashMap::new()),
        }
    }

    /// Set the destination for plugin log lines
    pub fn with_log_sink(mut self, log_sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = log_sink;
        self
    }

    /// Record the kernel temp directory handed to plugins launched from now on
    pub fn set_temp_dir(&self, temp_dir: PathBuf) {
        *self.temp_dir.write().unwrap_or_else(PoisonError::into_inner) = Some(temp_dir);
    }

    pub fn temp_dir(&self) -> Option<PathBuf> {
        self.temp_dir
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Manifest compliance report for the plugin in `plugin_dir`
    pub fn check_plugin(&self, plugin_dir: &Path) -> Result<Value, PluginError> {
        let value = read_manifest_value(plugin_dir)?;
        match ManifestValidator::new().validate(&value) {
            ValidationResult::Valid => {
                let manifest = PluginManifest::from_value(value)?;
                Ok(manifest.compliance_report())
            }
            ValidationResult::Invalid(errors) => {
                Err(PluginError::InvalidManifest(errors.join("; ")))
            }
        }
    }

    /// Load and start the plugin in `plugin_dir`, returning its namespace
    pub async fn load_plugin(&self, plugin_dir: &Path) -> Result<String, PluginError> {
        let manifest = PluginManifest::load(plugin_dir)?;
        let namespace = manifest.plugin_namespace.clone();
        info!("Loading plugin: {} ({:?})", namespace, plugin_dir);

        let supervisor = Arc::new(
            ProcessSupervisor::new(plugin_dir, Arc::clone(&self.kernel), Arc::clone(&self.launcher))
                .with_config(self.config.clone())
                .with_log_sink(Arc::clone(&self.log_sink))
                .with_temp_dir(self.temp_dir()),
        );

        let departed = {
            // The slot is reserved before starting so concurrent loads cannot share a namespace
            let mut plugins = self.plugins.lock().await;
            let departed = match plugins.get(&namespace) {
                Some(existing) if has_departed(&existing.state()) => plugins.remove(&namespace),
                Some(_) => return Err(PluginError::DuplicateNamespace(namespace)),
                None => None,
            };
            plugins.insert(namespace.clone(), Arc::clone(&supervisor));
            departed
        };
        if let Some(departed) = departed {
            debug!("Replacing departed plugin {} ({})", namespace, departed.state());
            departed.force_stop().await;
        }

        if let Err(e) = supervisor.start().await {
            let mut plugins = self.plugins.lock().await;
            if plugins
                .get(&namespace)
                .is_some_and(|current| Arc::ptr_eq(current, &supervisor))
            {
                plugins.remove(&namespace);
            }
            return Err(e);
        }

        info!("Plugin {} loaded", namespace);
        Ok(namespace)
    }

    /// Stop and forget the plugin serving `namespace`
    pub async fn unload_plugin(&self, namespace: &str) -> Result<(), PluginError> {
        let supervisor = self
            .plugins
            .lock()
            .await
            .remove(namespace)
            .ok_or_else(|| PluginError::PluginNotFound(namespace.to_string()))?;

        info!("Unloading plugin: {}", namespace);
        match supervisor.stop().await {
            Ok(()) => {
                let grace = self.config.stop_grace();
                let exited = timeout(grace, async {
                    while supervisor.state() == PluginState::Stopping {
                        sleep(UNLOAD_POLL_INTERVAL).await;
                    }
                })
                .await
                .is_ok();
                if !exited {
                    warn!("Plugin {} did not exit within {:?}, killing", namespace, grace);
                }
            }
            Err(e) => warn!("Graceful stop of {} failed, killing: {}", namespace, e),
        }
        // Reaps the process and detaches the router either way
        supervisor.force_stop().await;
        Ok(())
    }

    /// Call `func_name` in the plugin serving `namespace`
    pub async fn call(
        &self,
        namespace: &str,
        func_name: &str,
        args: Vec<Value>,
    ) -> Result<Value, PluginError> {
        let supervisor = self
            .get(namespace)
            .await
            .ok_or_else(|| PluginError::PluginNotFound(namespace.to_string()))?;
        supervisor.call(func_name, args).await
    }

    pub async fn get(&self, namespace: &str) -> Option<Arc<ProcessSupervisor>> {
        self.plugins.lock().await.get(namespace).cloned()
    }

    /// Summaries of every loaded plugin
    pub async fn list(&self) -> Vec<PluginSummary> {
        let plugins = self.plugins.lock().await;
        let mut summaries: Vec<PluginSummary> = plugins
            .iter()
            .map(|(namespace, supervisor)| {
                let manifest = supervisor.manifest();
                PluginSummary {
                    namespace: namespace.clone(),
                    name: manifest
                        .as_ref()
                        .map(|m| m.plugin_name.clone())
                        .unwrap_or_default(),
                    version: manifest
                        .as_ref()
                        .map(|m| m.plugin_version.clone())
                        .unwrap_or_default(),
                    state: supervisor.state().to_string(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        summaries
    }

    /// Kill every plugin
    pub async fn shutdown(&self) {
        let plugins: Vec<(String, Arc<ProcessSupervisor>)> =
            self.plugins.lock().await.drain().collect();
        for (namespace, supervisor) in plugins {
            info!("Shutting down plugin {}", namespace);
            supervisor.force_stop().await;
        }
    }

    /// Register the manager's commands on the kernel channel
    pub fn register_commands(self: &Arc<Self>, host: &HostChannel) {
        let manager = Arc::clone(self);
        host.register_command("check_plugin", move |_from: String, data: Value, responder: Responder| {
            let manager = Arc::clone(&manager);
            async move { manager.handle_check_plugin(data, responder) }
        });

        let manager = Arc::clone(self);
        host.register_command("load_plugin", move |_from: String, data: Value, responder: Responder| {
            let manager = Arc::clone(&manager);
            async move { manager.handle_load_plugin(data, responder).await }
        });

        let manager = Arc::clone(self);
        host.register_command("unload_plugin", move |_from: String, data: Value, responder: Responder| {
            let manager = Arc::clone(&manager);
            async move { manager.handle_unload_plugin(data, responder).await }
        });

        let manager = Arc::clone(self);
        host.register_command("plugin_call", move |_from: String, data: Value, responder: Responder| {
            let manager = Arc::clone(&manager);
            async move { manager.handle_plugin_call(data, responder).await }
        });

        let manager = Arc::clone(self);
        host.register_command("list_plugins", move |_from: String, _data: Value, responder: Responder| {
            let manager = Arc::clone(&manager);
            async move { manager.handle_list_plugins(responder).await }
        });
    }

    fn handle_check_plugin(&self, data: Value, responder: Responder) {
        if let Some(pathname) = data.get("pathname").and_then(Value::as_str) {
            match self.check_plugin(Path::new(pathname)) {
                Ok(report) => responder.ok(report),
                Err(e) => responder.respond(
                    Some(Value::String(manifest_error_text(&e))),
                    Some(json!({ "compliant": false })),
                ),
            }
        } else if data.get("filename").and_then(Value::as_str).is_some() {
            responder.respond(
                Some(Value::String(
                    "Archive packages are not supported; extract the plugin and pass its pathname"
                        .to_string(),
                )),
                Some(json!({ "compliant": false })),
            );
        } else {
            responder.respond(
                Some(Value::String("No filename or pathname provided".to_string())),
                Some(Value::Null),
            );
        }
    }

    async fn handle_load_plugin(&self, data: Value, responder: Responder) {
        let Some(path) = data.get("path").and_then(Value::as_str) else {
            responder.fail("No path provided");
            return;
        };
        match self.load_plugin(Path::new(path)).await {
            Ok(namespace) => responder.ok(json!({ "success": true, "namespace": namespace })),
            Err(e) => responder.respond(
                Some(Value::String(e.to_string())),
                Some(json!({ "success": false })),
            ),
        }
    }

    async fn handle_unload_plugin(&self, data: Value, responder: Responder) {
        let Some(namespace) = data.get("namespace").and_then(Value::as_str) else {
            responder.fail("No namespace provided");
            return;
        };
        match self.unload_plugin(namespace).await {
            Ok(()) => responder.ok(json!({ "success": true })),
            Err(e) => responder.respond(
                Some(Value::String(e.to_string())),
                Some(json!({ "success": false })),
            ),
        }
    }

    /// Resolver side of `callPluginFunction`: answers `{ returnData, error }`
    async fn handle_plugin_call(&self, data: Value, responder: Responder) {
        let namespace = data.get("namespace").and_then(Value::as_str).unwrap_or_default();
        let func_name = data.get("funcName").and_then(Value::as_str).unwrap_or_default();
        let args = match data.get("args") {
            Some(Value::Array(args)) => args.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other.clone()],
        };

        let reply = match self.call(namespace, func_name, args).await {
            Ok(value) => json!({ "returnData": value, "error": null }),
            Err(PluginError::Remote(error)) => json!({ "returnData": null, "error": error }),
            Err(e) => json!({ "returnData": null, "error": e.to_string() }),
        };
        responder.ok(reply);
    }

    async fn handle_list_plugins(&self, responder: Responder) {
        let plugins: Vec<Value> = self
            .list()
            .await
            .into_iter()
            .map(|p| {
                json!({
                    "namespace": p.namespace,
                    "pluginName": p.name,
                    "version": p.version,
                    "state": p.state,
                })
            })
            .collect();
        responder.ok(Value::Array(plugins));
    }
}

/// Manifest errors are reported without the error-kind prefix
fn manifest_error_text(error: &PluginError) -> String {
    match error {
        PluginError::InvalidManifest(reason) => reason.clone(),
        other => other.to_string(),
    }
}
