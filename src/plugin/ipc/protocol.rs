//! IPC message protocol
//!
//! Defines the messages exchanged with the kernel core (`type`-tagged) and between
//! the supervisor and a plugin process (`op`-tagged). All messages are JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kernel protocol version this handler speaks
pub const SUPPORTED_PROTOCOL_VERSION: &str = "1";

/// Whether a handshake's `protocolVersion` matches [`SUPPORTED_PROTOCOL_VERSION`]
///
/// Kernels send the version either as a string or as a bare number.
pub fn protocol_version_matches(version: &Value) -> bool {
    match version {
        Value::String(s) => s == SUPPORTED_PROTOCOL_VERSION,
        Value::Number(n) => n.to_string() == SUPPORTED_PROTOCOL_VERSION,
        _ => false,
    }
}

/// Identity this module announces to the kernel on handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleIdentity {
    /// Module id used by other modules to address this one
    pub module: String,
    pub display_name: String,
    pub namespace: String,
}

impl Default for ModuleIdentity {
    fn default() -> Self {
        Self {
            module: "pl_handler".to_string(),
            display_name: "A-Type Plugin Handler".to_string(),
            namespace: "pluginhandler_a".to_string(),
        }
    }
}

/// Message from the kernel core to this module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum KernelMessage {
    /// First message of every session
    Handshake {
        protocol_version: Value,
        #[serde(default)]
        config: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Another module calls one of our commands
    Call {
        from: String,
        cmd: String,
        #[serde(default)]
        data: Value,
        nonce: String,
    },
    /// Reply to one of our outbound calls
    Response {
        nonce: String,
        exists: bool,
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

/// Message from this module to the kernel core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ModuleMessage {
    HandshakeSuccess {
        module: String,
        display_name: String,
        namespace: String,
    },
    HandshakeFail {
        error: String,
    },
    /// Outbound call to another module
    Call {
        to: String,
        cmd: String,
        data: Value,
        nonce: String,
    },
    /// Reply to an inbound call
    Response {
        to: String,
        nonce: String,
        exists: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
}

impl ModuleMessage {
    pub fn handshake_success(identity: &ModuleIdentity) -> Self {
        ModuleMessage::HandshakeSuccess {
            module: identity.module.clone(),
            display_name: identity.display_name.clone(),
            namespace: identity.namespace.clone(),
        }
    }
}

/// Reply to a nonce-carrying op, in either direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Completion {
    pub fn ok(nonce: impl Into<String>, data: Value) -> Self {
        Self {
            nonce: nonce.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn err(nonce: impl Into<String>, error: impl Into<Value>) -> Self {
        Self {
            nonce: nonce.into(),
            data: None,
            error: Some(error.into()),
        }
    }

    /// A reply carrying both fields, as proxied from a kernel response
    pub fn with(nonce: impl Into<String>, data: Option<Value>, error: Option<Value>) -> Self {
        Self {
            nonce: nonce.into(),
            data,
            error: error.filter(|e| !e.is_null()),
        }
    }

    /// Success value, or the error payload when one is present
    pub fn into_result(self) -> Result<Value, Value> {
        match self.error {
            Some(error) if !error.is_null() => Err(error),
            _ => Ok(self.data.unwrap_or(Value::Null)),
        }
    }
}

/// Log severity carried by `log` ops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Critical,
    Error,
    Warn,
    Info,
    Debug,
    Verbose,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Critical => "critical",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "verbose",
        };
        f.write_str(s)
    }
}

/// Database operation requested by a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DatabaseOp {
    Get,
    Set,
    Delete,
    DeleteTable,
}

impl DatabaseOp {
    /// Command invoked on the database resolver module
    pub fn resolver_command(&self) -> &'static str {
        match self {
            DatabaseOp::Get => "db_get",
            DatabaseOp::Set => "db_set",
            DatabaseOp::Delete => "db_delete",
            DatabaseOp::DeleteTable => "db_delete_table",
        }
    }
}

/// Payload of a `database` op
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseRequest {
    #[serde(rename = "dbOp")]
    pub op: DatabaseOp,
    #[serde(rename = "databaseID")]
    pub database_id: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub nonce: String,
}

/// Operation sent by a plugin process to its supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum PluginOp {
    /// Verification gate verdict
    #[serde(rename = "verify")]
    Verify { allow: bool },

    /// Call a function exported by another plugin namespace
    #[serde(rename = "callPluginFunction", rename_all = "camelCase")]
    CallPluginFunction {
        namespace: String,
        func_name: String,
        #[serde(default)]
        args: Vec<Value>,
        nonce: String,
    },

    /// Call a kernel module API
    #[serde(rename = "callModuleAPI")]
    CallModuleApi {
        #[serde(rename = "moduleID")]
        module_id: String,
        cmd: String,
        #[serde(default)]
        value: Value,
        nonce: String,
    },

    /// Register a chat command with the first accepting command handler
    #[serde(rename = "registerCommand", rename_all = "camelCase")]
    RegisterCommand {
        command_name: String,
        func_name: String,
        #[serde(default)]
        description: Value,
        #[serde(default)]
        args: Value,
        #[serde(default)]
        compatibility: Value,
        nonce: String,
    },

    /// Plugin is exiting on its own
    #[serde(rename = "exit")]
    Exit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Wait for a kernel module to come up
    #[serde(rename = "waitForModule", rename_all = "camelCase")]
    WaitForModule {
        module_namespace: String,
        timeout: u64,
        nonce: String,
    },

    /// Fire-and-forget log line
    #[serde(rename = "log")]
    Log {
        level: LogLevel,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Reply to an `invoke` from the supervisor
    #[serde(rename = "completion")]
    Completion(Completion),

    /// Proxied database access
    #[serde(rename = "database")]
    Database(DatabaseRequest),
}

impl PluginOp {
    /// Operation name, for logging
    pub fn name(&self) -> &'static str {
        match self {
            PluginOp::Verify { .. } => "verify",
            PluginOp::CallPluginFunction { .. } => "callPluginFunction",
            PluginOp::CallModuleApi { .. } => "callModuleAPI",
            PluginOp::RegisterCommand { .. } => "registerCommand",
            PluginOp::Exit { .. } => "exit",
            PluginOp::WaitForModule { .. } => "waitForModule",
            PluginOp::Log { .. } => "log",
            PluginOp::Completion(_) => "completion",
            PluginOp::Database(_) => "database",
        }
    }
}

/// Operation sent by the supervisor to a plugin process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum SupervisorOp {
    /// Run a function the plugin registered
    #[serde(rename = "invoke", rename_all = "camelCase")]
    Invoke {
        func_name: String,
        #[serde(default)]
        args: Vec<Value>,
        nonce: String,
    },

    /// Reply to a nonce-carrying plugin op
    #[serde(rename = "completion")]
    Completion(Completion),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handshake_wire_shape() {
        let msg: KernelMessage = serde_json::from_value(json!({
            "type": "handshake",
            "protocolVersion": "1",
            "config": {}
        }))
        .unwrap();
        match msg {
            KernelMessage::Handshake { protocol_version, .. } => {
                assert!(protocol_version_matches(&protocol_version));
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let ack = serde_json::to_value(ModuleMessage::handshake_success(&ModuleIdentity::default()))
            .unwrap();
        assert_eq!(
            ack,
            json!({
                "type": "handshake_success",
                "module": "pl_handler",
                "displayName": "A-Type Plugin Handler",
                "namespace": "pluginhandler_a"
            })
        );
    }

    #[test]
    fn test_protocol_version_forms() {
        assert!(protocol_version_matches(&json!("1")));
        assert!(protocol_version_matches(&json!(1)));
        assert!(!protocol_version_matches(&json!("2")));
        assert!(!protocol_version_matches(&json!(null)));
    }

    #[test]
    fn test_plugin_op_tags() {
        let op: PluginOp = serde_json::from_value(json!({
            "op": "callModuleAPI",
            "moduleID": "core",
            "cmd": "get_temp_folder",
            "value": null,
            "nonce": "n1"
        }))
        .unwrap();
        assert_eq!(op.name(), "callModuleAPI");

        let op: PluginOp = serde_json::from_value(json!({
            "op": "database",
            "dbOp": "set",
            "databaseID": "main",
            "table": "users",
            "key": "u1",
            "value": {"name": "a"},
            "nonce": "n2"
        }))
        .unwrap();
        match op {
            PluginOp::Database(req) => {
                assert_eq!(req.op, DatabaseOp::Set);
                assert_eq!(req.op.resolver_command(), "db_set");
                assert_eq!(req.key.as_deref(), Some("u1"));
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[test]
    fn test_completion_null_error_is_success() {
        let c: Completion =
            serde_json::from_value(json!({"nonce": "n", "data": 5, "error": null})).unwrap();
        assert_eq!(c.into_result(), Ok(json!(5)));

        let c = Completion::err("n", "bad");
        assert_eq!(c.into_result(), Err(json!("bad")));
    }

    #[test]
    fn test_invoke_serializes_camel_case() {
        let op = SupervisorOp::Invoke {
            func_name: "greet".into(),
            args: vec![json!("bob")],
            nonce: "abc".into(),
        };
        assert_eq!(
            serde_json::to_value(op).unwrap(),
            json!({"op": "invoke", "funcName": "greet", "args": ["bob"], "nonce": "abc"})
        );
    }
}
