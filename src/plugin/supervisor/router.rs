//! Routing of plugin-originated operations
//!
//! Most ops are proxied to the kernel and answered with a `completion` carrying
//! either data or an `error` field. Failures of the proxied target are reported as
//! data; nothing here fails the plugin.

use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::plugin::ipc::protocol::{Completion, DatabaseOp, DatabaseRequest, PluginOp, SupervisorOp};
use crate::plugin::ipc::transport::{self, MessageReader};
use crate::plugin::log::LogSink;
use crate::plugin::supervisor::{GateSignal, SupervisorShared};
use crate::plugin::traits::{ApiResponse, KernelApi, PluginError};

const CORE_MODULE: &str = "core";
const COMMAND_HANDLER_TYPE: &str = "cmd_handler";

/// Entry of `core.get_registered_modules`
#[derive(Debug, Deserialize)]
struct RegisteredModule {
    #[serde(rename = "moduleID")]
    module_id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    running: bool,
}

/// Dispatches ops read from one plugin process
#[derive(Clone)]
pub(crate) struct OpRouter {
    namespace: String,
    kernel: Arc<dyn KernelApi>,
    log_sink: Arc<dyn LogSink>,
    command_handler_wait_ms: u64,
    shared: Arc<SupervisorShared>,
}

impl OpRouter {
    pub(crate) fn new(
        namespace: String,
        kernel: Arc<dyn KernelApi>,
        log_sink: Arc<dyn LogSink>,
        command_handler_wait_ms: u64,
        shared: Arc<SupervisorShared>,
    ) -> Self {
        Self {
            namespace,
            kernel,
            log_sink,
            command_handler_wait_ms,
            shared,
        }
    }

    /// Read ops until the plugin's stream closes
    pub(crate) async fn run<R>(self, mut reader: MessageReader<R>)
    where
        R: AsyncRead + Unpin,
    {
        let reason = loop {
            match transport::next_message::<_, PluginOp>(&mut reader).await {
                Some(Ok(op)) => self.route(op),
                Some(Err(PluginError::Serialization(e))) => {
                    warn!("Malformed op from plugin {}: {}", self.namespace, e);
                }
                Some(Err(e)) => break format!("Child process error: {}", e),
                None => break "Child process closed its channel".to_string(),
            }
        };

        info!("Plugin {} disconnected", self.namespace);
        self.shared.transport_closed(reason);
    }

    fn route(&self, op: PluginOp) {
        debug!("Plugin {} op {}", self.namespace, op.name());
        match op {
            PluginOp::Verify { allow } => match self.shared.take_gate() {
                Some(gate) => {
                    let _ = gate.send(GateSignal::Verified(allow));
                }
                None => warn!("Plugin {} sent verify outside the gate", self.namespace),
            },
            PluginOp::Log { level, args } => self.log_sink.log(&self.namespace, level, &args),
            PluginOp::Completion(completion) => {
                let nonce = completion.nonce.clone();
                let handled = match completion.into_result() {
                    Ok(data) => self.shared.calls.resolve(&nonce, data),
                    Err(error) => self.shared.calls.reject(&nonce, PluginError::Remote(error)),
                };
                if !handled {
                    debug!("Ignoring completion for unknown nonce {}", nonce);
                }
            }
            PluginOp::Exit { code, reason } => {
                let router = self.clone();
                tokio::spawn(async move { router.handle_exit(code, reason).await });
            }
            PluginOp::CallPluginFunction {
                namespace,
                func_name,
                args,
                nonce,
            } => {
                let router = self.clone();
                self.spawn_reply(async move {
                    router.call_plugin_function(nonce, namespace, func_name, args).await
                })
            }
            PluginOp::CallModuleApi {
                module_id,
                cmd,
                value,
                nonce,
            } => {
                let router = self.clone();
                self.spawn_reply(async move {
                    router.call_module_api(nonce, module_id, cmd, value).await
                })
            }
            PluginOp::RegisterCommand {
                command_name,
                func_name,
                description,
                args,
                compatibility,
                nonce,
            } => {
                let router = self.clone();
                self.spawn_reply(async move {
                    router
                        .register_command(nonce, command_name, func_name, description, args, compatibility)
                        .await
                })
            }
            PluginOp::WaitForModule {
                module_namespace,
                timeout,
                nonce,
            } => {
                let router = self.clone();
                self.spawn_reply(async move {
                    router.wait_for_module(nonce, module_namespace, timeout).await
                })
            }
            PluginOp::Database(request) => {
                let router = self.clone();
                self.spawn_reply(async move { router.database(request).await })
            }
        }
    }

    /// Run a proxied op in its own task and send its completion back
    fn spawn_reply<F>(&self, reply: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let completion = reply.await;
            shared.send(SupervisorOp::Completion(completion));
        });
    }

    pub(crate) async fn call_plugin_function(
        &self,
        nonce: String,
        namespace: String,
        func_name: String,
        args: Vec<Value>,
    ) -> Completion {
        let info = match self
            .kernel
            .call_api(
                CORE_MODULE,
                "get_plugin_namespace_info",
                json!({ "namespace": namespace }),
            )
            .await
        {
            Ok(ApiResponse::NotFound) => {
                return Completion::err(nonce, "Incompatible kernel: namespace lookup unavailable")
            }
            Ok(info) => info,
            Err(e) => return Completion::err(nonce, e.to_string()),
        };

        let resolver = match (
            info.field("exist").and_then(Value::as_bool),
            info.field("resolver").and_then(Value::as_str),
        ) {
            (Some(true), Some(resolver)) => resolver.to_string(),
            _ => return Completion::err(nonce, "Namespace not found"),
        };

        let payload = json!({ "namespace": namespace, "funcName": func_name, "args": args });
        match self.kernel.call_api(&resolver, "plugin_call", payload).await {
            Ok(response @ ApiResponse::Found { .. }) => {
                let data = response.field("returnData").cloned();
                let error = response
                    .field("error")
                    .cloned()
                    .or_else(|| response.error().cloned());
                Completion::with(nonce, data, error)
            }
            Ok(ApiResponse::NotFound) => Completion::err(nonce, "Module resolver failed"),
            Err(e) => Completion::err(nonce, e.to_string()),
        }
    }

    pub(crate) async fn call_module_api(
        &self,
        nonce: String,
        module_id: String,
        cmd: String,
        value: Value,
    ) -> Completion {
        match self.kernel.call_api(&module_id, &cmd, value).await {
            Ok(ApiResponse::Found { data, error }) => Completion::with(nonce, Some(data), error),
            Ok(ApiResponse::NotFound) => {
                Completion::err(nonce, format!("Function {} not found on {}", cmd, module_id))
            }
            Err(e) => Completion::err(nonce, e.to_string()),
        }
    }

    /// Offer the command to each command handler module in order; the first that
    /// answers owns it
    pub(crate) async fn register_command(
        &self,
        nonce: String,
        command_name: String,
        func_name: String,
        description: Value,
        args: Value,
        compatibility: Value,
    ) -> Completion {
        let modules = match self
            .kernel
            .call_api(CORE_MODULE, "get_registered_modules", json!({}))
            .await
        {
            Ok(ApiResponse::Found { data, .. }) => data,
            Ok(ApiResponse::NotFound) => {
                return Completion::err(nonce, "Incompatible kernel: module listing unavailable")
            }
            Err(e) => return Completion::err(nonce, e.to_string()),
        };

        let candidates = modules
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|m| serde_json::from_value::<RegisteredModule>(m.clone()).ok())
                    .filter(|m| m.kind == COMMAND_HANDLER_TYPE)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let payload = json!({
            "namespace": self.namespace,
            "command": command_name,
            "funcName": func_name,
            "description": description,
            "args": args,
            "compatibility": compatibility,
        });

        for handler in candidates {
            if !handler.running && !self.await_module(&handler.namespace).await {
                debug!(
                    "Command handler {} did not come up, skipping",
                    handler.module_id
                );
                continue;
            }

            match self
                .kernel
                .call_api(&handler.module_id, "register_cmd", payload.clone())
                .await
            {
                Ok(response @ ApiResponse::Found { .. }) => {
                    let success = response
                        .field("success")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    let error = response
                        .field("error")
                        .cloned()
                        .or_else(|| response.error().cloned());
                    info!(
                        "Command {} of plugin {} registered with {} (success: {})",
                        command_name, self.namespace, handler.module_id, success
                    );
                    return Completion::with(nonce, Some(json!({ "success": success })), error);
                }
                Ok(ApiResponse::NotFound) => continue,
                Err(e) => {
                    warn!("register_cmd on {} failed: {}", handler.module_id, e);
                    continue;
                }
            }
        }

        Completion::err(nonce, "Command handler is not installed")
    }

    /// Wait for a stopped module; false if it did not come up
    async fn await_module(&self, module_namespace: &str) -> bool {
        match self
            .kernel
            .call_api(
                CORE_MODULE,
                "wait_for_module",
                json!({ "moduleNamespace": module_namespace, "timeout": self.command_handler_wait_ms }),
            )
            .await
        {
            Ok(response) => response.error().is_none()
                && response.field("success").and_then(Value::as_bool) == Some(true),
            Err(_) => false,
        }
    }

    pub(crate) async fn wait_for_module(
        &self,
        nonce: String,
        module_namespace: String,
        timeout: u64,
    ) -> Completion {
        match self
            .kernel
            .call_api(
                CORE_MODULE,
                "wait_for_module",
                json!({ "moduleNamespace": module_namespace, "timeout": timeout }),
            )
            .await
        {
            Ok(response @ ApiResponse::Found { .. }) => {
                let success = response
                    .field("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Completion::with(
                    nonce,
                    Some(json!({ "success": success })),
                    response.error().cloned(),
                )
            }
            Ok(ApiResponse::NotFound) => Completion::ok(nonce, json!({ "success": false })),
            Err(e) => Completion::err(nonce, e.to_string()),
        }
    }

    async fn handle_exit(&self, code: Option<i32>, reason: Option<String>) {
        info!(
            "Plugin {} exiting (code: {:?}, reason: {:?})",
            self.namespace, code, reason
        );
        match self
            .kernel
            .call_api(
                CORE_MODULE,
                "unregister_plugin",
                json!({ "namespace": self.namespace }),
            )
            .await
        {
            Ok(ApiResponse::Found { error: None, .. }) => {}
            Ok(other) => warn!(
                "Kernel did not unregister plugin {}: {:?}",
                self.namespace, other
            ),
            Err(e) => warn!("Failed to unregister plugin {}: {}", self.namespace, e),
        }
    }

    /// Proxy a database op to the module serving `database_id`
    pub(crate) async fn database(&self, request: DatabaseRequest) -> Completion {
        let DatabaseRequest {
            op,
            database_id,
            table,
            key,
            value,
            nonce,
        } = request;

        let resolver = match self
            .kernel
            .call_api(
                CORE_MODULE,
                "get_database_resolver",
                json!({ "databaseID": database_id }),
            )
            .await
        {
            Ok(response) => response
                .field("resolver")
                .and_then(Value::as_str)
                .map(str::to_string),
            Err(e) => return Completion::err(nonce, e.to_string()),
        };
        let Some(resolver) = resolver else {
            return Completion::err(nonce, format!("Database resolver for {} not found", database_id));
        };

        let mut payload = json!({ "databaseID": database_id, "table": table });
        if let Some(key) = key {
            payload["key"] = Value::String(key);
        }
        if let Some(value) = value {
            payload["value"] = value;
        }

        let response = self
            .kernel
            .call_api(&resolver, op.resolver_command(), payload)
            .await;
        let outcome = match response {
            Ok(ApiResponse::Found { data, error: None }) => Some(data),
            Ok(other) => {
                debug!("Database {} {} on {} declined: {:?}", database_id, op.resolver_command(), resolver, other);
                None
            }
            Err(e) => {
                debug!("Database {} call to {} failed: {}", database_id, resolver, e);
                None
            }
        };

        match op {
            DatabaseOp::Get => Completion::ok(nonce, outcome.unwrap_or(Value::Null)),
            DatabaseOp::Set | DatabaseOp::Delete | DatabaseOp::DeleteTable => {
                let success = outcome.map(|data| write_succeeded(&data)).unwrap_or(false);
                Completion::ok(nonce, Value::Bool(success))
            }
        }
    }
}

/// Interpret a resolver's reply to a write: a bare boolean, an object with a
/// `success` flag, or anything else meaning success
fn write_succeeded(data: &Value) -> bool {
    match data {
        Value::Bool(ok) => *ok,
        Value::Object(map) => map.get("success").and_then(Value::as_bool).unwrap_or(true),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_succeeded_shapes() {
        assert!(write_succeeded(&json!(true)));
        assert!(!write_succeeded(&json!(false)));
        assert!(!write_succeeded(&json!({"success": false})));
        assert!(write_succeeded(&json!({"success": true})));
        assert!(write_succeeded(&Value::Null));
    }
}
