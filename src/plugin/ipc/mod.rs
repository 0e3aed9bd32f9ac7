//! IPC layer for the plugin handler
//!
//! Message types, the nonce-keyed call registry, the magic-header frame codec and
//! the per-connection transport binding shared by the host channel, the process
//! supervisor and the plugin runtime.

pub mod frame;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use frame::{FrameCodec, FrameError, MAGIC};
pub use protocol::{
    Completion, DatabaseOp, DatabaseRequest, KernelMessage, LogLevel, ModuleIdentity,
    ModuleMessage, PluginOp, SupervisorOp,
};
pub use registry::{CallRegistry, Nonce, NonceStyle, PendingResponse};
pub use transport::{BoxedReader, BoxedWriter, TransportKind};
