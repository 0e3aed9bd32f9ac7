//! Host channel
//!
//! The handler's own connection to the kernel core. The first inbound message must
//! be a `handshake`; after a successful handshake the channel dispatches inbound
//! `call`s to registered [`CommandHandler`]s and matches inbound `response`s to
//! outstanding [`HostChannel::call_api`] calls.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::plugin::ipc::protocol::{
    protocol_version_matches, KernelMessage, ModuleIdentity, ModuleMessage,
};
use crate::plugin::ipc::registry::{CallRegistry, NonceStyle};
use crate::plugin::ipc::transport::{self, MessageReader, TransportKind};
use crate::plugin::traits::{ApiResponse, KernelApi, PluginError};

const KERNEL_PEER: &str = "kernel";

/// Host channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    AwaitingHandshake,
    Dispatching,
    Exited,
}

/// Handler for an inbound kernel command
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle a call from module `from`. The answer goes through `responder`.
    async fn handle(&self, from: String, data: Value, responder: Responder);
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(String, Value, Responder) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, from: String, data: Value, responder: Responder) {
        (self)(from, data, responder).await
    }
}

/// One-shot reply handle for an inbound call
///
/// Consumed by [`respond`](Self::respond). Dropping it unanswered sends an error
/// response so the caller is never left waiting.
pub struct Responder {
    to: String,
    nonce: String,
    outgoing: mpsc::UnboundedSender<ModuleMessage>,
    answered: bool,
}

impl Responder {
    fn new(to: String, nonce: String, outgoing: mpsc::UnboundedSender<ModuleMessage>) -> Self {
        Self {
            to,
            nonce,
            outgoing,
            answered: false,
        }
    }

    /// Module that made the call
    pub fn caller(&self) -> &str {
        &self.to
    }

    /// Send the response
    pub fn respond(mut self, error: Option<Value>, data: Option<Value>) {
        self.send(error, data);
    }

    /// Successful response carrying `data`
    pub fn ok(self, data: Value) {
        self.respond(None, Some(data));
    }

    /// Error response
    pub fn fail(self, error: impl Into<Value>) {
        self.respond(Some(error.into()), None);
    }

    fn send(&mut self, error: Option<Value>, data: Option<Value>) {
        self.answered = true;
        let message = ModuleMessage::Response {
            to: self.to.clone(),
            nonce: self.nonce.clone(),
            exists: true,
            data,
            error,
        };
        if self.outgoing.send(message).is_err() {
            debug!("Dropping response to {}: channel closed", self.to);
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.answered {
            warn!(
                "Command handler for call {} from {} finished without responding",
                self.nonce, self.to
            );
            self.send(
                Some(Value::String("Command handler did not respond".to_string())),
                None,
            );
        }
    }
}

struct HostInner {
    identity: ModuleIdentity,
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    calls: CallRegistry<ApiResponse>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<ModuleMessage>>>,
    state: Mutex<ChannelState>,
    kernel_config: Mutex<Value>,
}

/// Connection to the kernel core
#[derive(Clone)]
pub struct HostChannel {
    inner: Arc<HostInner>,
}

impl HostChannel {
    pub fn new(identity: ModuleIdentity) -> Self {
        Self {
            inner: Arc::new(HostInner {
                identity,
                handlers: RwLock::new(HashMap::new()),
                calls: CallRegistry::new(NonceStyle::Uuid),
                outgoing: Mutex::new(None),
                state: Mutex::new(ChannelState::AwaitingHandshake),
                kernel_config: Mutex::new(Value::Null),
            }),
        }
    }

    pub fn identity(&self) -> &ModuleIdentity {
        &self.inner.identity
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Config object the kernel sent with the handshake
    pub fn kernel_config(&self) -> Value {
        self.inner
            .kernel_config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of outbound calls still awaiting a response
    pub fn pending_count(&self) -> usize {
        self.inner.calls.pending_count()
    }

    /// Register (or replace) the handler for `cmd`
    pub fn register_command<H>(&self, cmd: impl Into<String>, handler: H)
    where
        H: CommandHandler + 'static,
    {
        let cmd = cmd.into();
        debug!("Registering command {}", cmd);
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cmd, Arc::new(handler));
    }

    fn set_state(&self, state: ChannelState) {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Run the handshake on `reader`/`writer` and start dispatching
    ///
    /// Returns the dispatch task, which finishes when the kernel closes the
    /// channel. A protocol version mismatch answers `handshake_fail` and returns
    /// [`PluginError::HandshakeRejected`].
    pub async fn connect<R, W>(
        &self,
        reader: R,
        writer: W,
        kind: TransportKind,
    ) -> Result<JoinHandle<()>, PluginError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, writer) = transport::bind(reader, writer, kind);
        let (outgoing, writer_handle) =
            transport::spawn_writer::<_, ModuleMessage>(writer, KERNEL_PEER.to_string());

        let first = transport::next_message::<_, KernelMessage>(&mut reader).await;
        let rejection = match first {
            Some(Ok(KernelMessage::Handshake {
                protocol_version,
                config,
                ..
            })) => {
                if protocol_version_matches(&protocol_version) {
                    *self
                        .inner
                        .kernel_config
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = config;
                    None
                } else {
                    Some(format!(
                        "Unsupported protocol version: {}",
                        protocol_version
                    ))
                }
            }
            Some(Ok(other)) => Some(format!("Expected handshake, got {:?}", other)),
            Some(Err(e)) => Some(format!("Failed to read handshake: {}", e)),
            None => {
                self.set_state(ChannelState::Exited);
                return Err(PluginError::HandshakeRejected(
                    "Connection closed before handshake".to_string(),
                ));
            }
        };

        if let Some(reason) = rejection {
            error!("Kernel handshake failed: {}", reason);
            let _ = outgoing.send(ModuleMessage::HandshakeFail {
                error: reason.clone(),
            });
            drop(outgoing);
            // Let the writer flush the rejection before reporting
            let _ = writer_handle.await;
            self.set_state(ChannelState::Exited);
            return Err(PluginError::HandshakeRejected(reason));
        }

        let _ = outgoing.send(ModuleMessage::handshake_success(&self.inner.identity));
        *self
            .inner
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outgoing.clone());
        self.set_state(ChannelState::Dispatching);
        info!(
            "Handshake with kernel complete, serving as {} ({})",
            self.inner.identity.module, self.inner.identity.namespace
        );

        let channel = self.clone();
        Ok(tokio::spawn(async move {
            channel.dispatch(reader, outgoing).await;
        }))
    }

    /// Convenience for `connect` followed by awaiting the dispatch task
    pub async fn serve<R, W>(&self, reader: R, writer: W, kind: TransportKind) -> Result<(), PluginError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let dispatch = self.connect(reader, writer, kind).await?;
        dispatch
            .await
            .map_err(|e| PluginError::Ipc(format!("Dispatch task failed: {}", e)))
    }

    async fn dispatch<R>(
        &self,
        mut reader: MessageReader<R>,
        outgoing: mpsc::UnboundedSender<ModuleMessage>,
    ) where
        R: AsyncRead + Unpin,
    {
        while let Some(result) = transport::next_message::<_, KernelMessage>(&mut reader).await {
            match result {
                Ok(KernelMessage::Call {
                    from,
                    cmd,
                    data,
                    nonce,
                }) => self.handle_call(from, cmd, data, nonce, &outgoing),
                Ok(KernelMessage::Response {
                    nonce,
                    exists,
                    data,
                    error,
                }) => {
                    let response = if exists {
                        ApiResponse::found(data, error)
                    } else {
                        ApiResponse::NotFound
                    };
                    if !self.inner.calls.resolve(&nonce, response) {
                        debug!("Ignoring response for unknown nonce {}", nonce);
                    }
                }
                Ok(KernelMessage::Handshake { .. }) => {
                    warn!("Ignoring repeated handshake from kernel");
                }
                Err(PluginError::Serialization(e)) => {
                    warn!("Malformed message from kernel: {}", e);
                }
                Err(e) => {
                    error!("Error reading from kernel: {}", e);
                    break;
                }
            }
        }

        info!("Kernel channel closed");
        self.inner
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.set_state(ChannelState::Exited);
    }

    fn handle_call(
        &self,
        from: String,
        cmd: String,
        data: Value,
        nonce: String,
        outgoing: &mpsc::UnboundedSender<ModuleMessage>,
    ) {
        let handler = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&cmd)
            .cloned();

        match handler {
            Some(handler) => {
                debug!("Dispatching {} from {}", cmd, from);
                let responder = Responder::new(from.clone(), nonce, outgoing.clone());
                tokio::spawn(async move {
                    handler.handle(from, data, responder).await;
                });
            }
            None => {
                debug!("Unknown command {} from {}", cmd, from);
                let _ = outgoing.send(ModuleMessage::Response {
                    to: from,
                    nonce,
                    exists: false,
                    data: None,
                    error: None,
                });
            }
        }
    }

    /// Call `cmd` on kernel module `module_id`
    pub async fn call_api(
        &self,
        module_id: &str,
        cmd: &str,
        data: Value,
    ) -> Result<ApiResponse, PluginError> {
        let outgoing = self
            .inner
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PluginError::NotConnected)?;

        let (nonce, pending) = self.inner.calls.open_tagged(module_id);
        let message = ModuleMessage::Call {
            to: module_id.to_string(),
            cmd: cmd.to_string(),
            data,
            nonce: nonce.clone(),
        };
        if outgoing.send(message).is_err() {
            self.inner.calls.reject(&nonce, PluginError::NotConnected);
        }
        pending.await
    }
}

#[async_trait]
impl KernelApi for HostChannel {
    async fn call_api(
        &self,
        module_id: &str,
        cmd: &str,
        data: Value,
    ) -> Result<ApiResponse, PluginError> {
        HostChannel::call_api(self, module_id, cmd, data).await
    }
}
