//! A-Type plugin handler
//!
//! A kernel module that hosts plugins as isolated child processes. The handler
//! speaks the kernel's module protocol on its own stdin/stdout, and speaks a
//! nonce-correlated op protocol with each plugin over either a native stdio
//! channel or a magic-header framed channel.
//!
//! ## Layout
//!
//! 1. [`plugin::host`]: kernel handshake and command dispatch for the handler itself
//! 2. [`plugin::manager`]: loaded plugins keyed by namespace
//! 3. [`plugin::supervisor`]: install, launch, verify and route ops for one plugin
//! 4. [`plugin::runtime`]: the in-plugin side of the op protocol
//! 5. [`config`]: handler configuration (JSON or TOML)

pub mod config;
pub mod plugin;
pub mod utils;

pub use config::{HandlerConfig, LaunchConfig, LoggingConfig, SupervisorConfig};
pub use plugin::{
    HostChannel, KernelApi, PluginError, PluginManager, PluginRuntime, PluginState,
    ProcessSupervisor,
};
