//! Plugin system traits and interfaces
//!
//! Defines the error type, the plugin lifecycle state and the seams shared by the
//! host channel, the process supervisor and the plugin runtime.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Plugin process lifecycle state
///
/// `Created → Installing → Spawned → AwaitingHandshake → Running → Stopping → Stopped`,
/// with `Failed` reachable from any pre-running state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginState {
    /// Supervisor constructed, nothing launched yet
    Created,
    /// Waiting for dependency installation to settle
    Installing,
    /// Child process launched, transport not yet read
    Spawned,
    /// Waiting for the child's verification message
    AwaitingHandshake,
    /// Verified and dispatching
    Running,
    /// Graceful termination requested
    Stopping,
    /// Child gone
    Stopped,
    /// Start aborted
    Failed(String),
}

impl PluginState {
    pub fn is_running(&self) -> bool {
        matches!(self, PluginState::Running)
    }

    /// Whether `start()` may (re)launch from this state
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            PluginState::Created | PluginState::Stopped | PluginState::Failed(_)
        )
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginState::Created => write!(f, "created"),
            PluginState::Installing => write!(f, "installing"),
            PluginState::Spawned => write!(f, "spawned"),
            PluginState::AwaitingHandshake => write!(f, "awaiting_handshake"),
            PluginState::Running => write!(f, "running"),
            PluginState::Stopping => write!(f, "stopping"),
            PluginState::Stopped => write!(f, "stopped"),
            PluginState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Result of a kernel API call
///
/// `NotFound` means the target module or command does not exist; `Found` means the
/// call machinery worked, whatever the target decided (`error` carries a decline).
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    Found { data: Value, error: Option<Value> },
    NotFound,
}

impl ApiResponse {
    /// Build a `Found` response, treating a JSON `null` error as no error
    pub fn found(data: Value, error: Option<Value>) -> Self {
        ApiResponse::Found {
            data,
            error: error.filter(|e| !e.is_null()),
        }
    }

    pub fn exists(&self) -> bool {
        matches!(self, ApiResponse::Found { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            ApiResponse::Found { data, .. } => Some(data),
            ApiResponse::NotFound => None,
        }
    }

    pub fn error(&self) -> Option<&Value> {
        match self {
            ApiResponse::Found { error, .. } => error.as_ref(),
            ApiResponse::NotFound => None,
        }
    }

    /// Look up a key inside the `data` object
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data().and_then(|d| d.get(key)).filter(|v| !v.is_null())
    }
}

/// Kernel API - how the handler reaches the core and other kernel modules
///
/// Implemented by [`crate::plugin::host::HostChannel`]; tests substitute an
/// in-process kernel.
#[async_trait]
pub trait KernelApi: Send + Sync {
    /// Call `cmd` on `module_id`. No timeout is applied at this layer.
    async fn call_api(
        &self,
        module_id: &str,
        cmd: &str,
        data: Value,
    ) -> Result<ApiResponse, PluginError>;
}

/// Plugin system errors
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("IPC communication error: {0}")]
    Ipc(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid plugin manifest: {0}")]
    InvalidManifest(String),

    #[error("Dependency installation failed: {0}")]
    Install(String),

    #[error("Failed to spawn plugin process: {0}")]
    Spawn(String),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("DRM triggered: plugin denied verification")]
    DrmRejected,

    #[error("Child process error: {0}")]
    ProcessError(String),

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("Plugin not started")]
    NotRunning,

    #[error("Channel not connected")]
    NotConnected,

    #[error("Function {0} already registered")]
    DuplicateFunction(String),

    #[error("Namespace {0} is already loaded")]
    DuplicateNamespace(String),

    #[error("verify() has already been called")]
    AlreadyVerified,

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Remote error: {0}")]
    Remote(Value),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PluginError {
    /// Short reason recorded in `PluginState::Failed`
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        PluginError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for PluginError {
    fn from(e: std::io::Error) -> Self {
        PluginError::Ipc(e.to_string())
    }
}
