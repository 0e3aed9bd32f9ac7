//! Plugin system
//!
//! The handler sits between the kernel and its plugins:
//!
//! - [`host`]: the handler's own channel to the kernel (handshake, command dispatch, API calls)
//! - [`supervisor`]: one child process per plugin, with install, launch, verification and op routing
//! - [`runtime`]: the library a plugin process links against to talk back to its supervisor
//! - [`manager`]: the set of loaded plugins and the kernel-facing commands over it
//! - [`ipc`]: wire messages, framing and nonce-keyed call tracking shared by all of the above

pub mod host;
pub mod installer;
pub mod ipc;
pub mod log;
pub mod manager;
pub mod manifest;
pub mod process;
pub mod runtime;
pub mod supervisor;
pub mod traits;

pub use host::{ChannelState, CommandHandler, HostChannel, Responder};
pub use installer::DependencyInstaller;
pub use log::{LogSink, TracingLogSink};
pub use manager::{PluginManager, PluginSummary};
pub use manifest::{ManifestValidator, PluginManifest, Subclass, ValidationResult};
pub use process::{
    ChildProcess, CommandLauncher, LaunchPlan, LaunchedPlugin, PluginLauncher, ProcessControl,
};
pub use runtime::{CommandInfo, Database, PluginFunction, PluginRuntime};
pub use supervisor::ProcessSupervisor;
pub use traits::{ApiResponse, KernelApi, PluginError, PluginState};
