//! Plugin runtime library
//!
//! Linked into a plugin process to talk to its supervisor. A plugin must call
//! [`PluginRuntime::verify`] once, early, or its supervisor gives up on it.
//!
//! ```no_run
//! use plugin_handler::plugin::runtime::PluginRuntime;
//! use serde_json::{json, Value};
//!
//! # async fn plugin_main() -> Result<(), plugin_handler::plugin::PluginError> {
//! let runtime = PluginRuntime::from_stdio();
//! runtime.register_function("greet", |args: Vec<Value>| async move {
//!     Ok::<_, anyhow::Error>(json!(format!("hello {}", args[0])))
//! })?;
//! runtime.verify(true)?;
//! runtime.wait_closed().await;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::plugin::ipc::protocol::{Completion, DatabaseOp, DatabaseRequest, LogLevel, PluginOp, SupervisorOp};
use crate::plugin::ipc::registry::{CallRegistry, Nonce, NonceStyle};
use crate::plugin::ipc::transport::{self, MessageReader, TransportKind};
use crate::plugin::process::{NAMESPACE_ENV_VAR, TEMP_DIR_ENV_VAR};
use crate::plugin::traits::PluginError;

/// A function the supervisor (or another plugin) can invoke by name
#[async_trait]
pub trait PluginFunction: Send + Sync {
    async fn invoke(&self, args: Vec<Value>) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> PluginFunction for F
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn invoke(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        (self)(args).await
    }
}

/// Metadata passed along with a command registration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandInfo {
    pub description: Value,
    pub args: Value,
    pub compatibility: Value,
}

struct RuntimeInner {
    calls: CallRegistry<Value>,
    functions: RwLock<HashMap<String, Arc<dyn PluginFunction>>>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<PluginOp>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    verified: AtomicBool,
}

/// Connection from a plugin process to its supervisor
#[derive(Clone)]
pub struct PluginRuntime {
    inner: Arc<RuntimeInner>,
}

impl PluginRuntime {
    /// Connect over the process's standard streams
    ///
    /// The transport comes from `PHANDLER_TRANSPORT`: native talks over
    /// stdin/stdout, framed reads stdin and writes stderr.
    ///
    /// Under the native transport nothing else may write to stdout: the stream
    /// has no resync point, so a stray `println!` ends the connection. Use
    /// [`PluginRuntime::log`] or stderr instead.
    pub fn from_stdio() -> Self {
        let kind = TransportKind::from_env();
        match kind {
            TransportKind::Native => Self::connect(tokio::io::stdin(), tokio::io::stdout(), kind),
            TransportKind::Framed => Self::connect(tokio::io::stdin(), tokio::io::stderr(), kind),
        }
    }

    /// Connect over an arbitrary reader/writer pair
    pub fn connect<R, W>(reader: R, writer: W, kind: TransportKind) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = transport::bind(reader, writer, kind);
        let (outgoing, writer_task) =
            transport::spawn_writer::<_, PluginOp>(writer, "supervisor".to_string());

        let runtime = Self {
            inner: Arc::new(RuntimeInner {
                calls: CallRegistry::new(NonceStyle::Uuid),
                functions: RwLock::new(HashMap::new()),
                outgoing: Mutex::new(Some(outgoing)),
                writer_task: Mutex::new(Some(writer_task)),
                dispatch_task: Mutex::new(None),
                verified: AtomicBool::new(false),
            }),
        };

        let dispatcher = runtime.clone();
        let dispatch_task = tokio::spawn(async move { dispatcher.dispatch(reader).await });
        *runtime
            .inner
            .dispatch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(dispatch_task);
        runtime
    }

    /// Namespace assigned by the launcher, if any
    pub fn namespace() -> Option<String> {
        std::env::var(NAMESPACE_ENV_VAR).ok()
    }

    /// Kernel temp directory passed by the launcher, if any
    pub fn temp_dir() -> Option<PathBuf> {
        std::env::var_os(TEMP_DIR_ENV_VAR).map(PathBuf::from)
    }

    /// Calls to the supervisor still awaiting a completion
    pub fn pending_count(&self) -> usize {
        self.inner.calls.pending_count()
    }

    /// Wait until the supervisor closes the channel
    pub async fn wait_closed(&self) {
        let task = self
            .inner
            .dispatch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn send(&self, op: PluginOp) -> Result<(), PluginError> {
        let outgoing = self
            .inner
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PluginError::NotConnected)?;
        outgoing.send(op).map_err(|_| PluginError::NotConnected)
    }

    /// Send a nonce-carrying op and wait for its completion
    async fn request(&self, build: impl FnOnce(Nonce) -> PluginOp) -> Result<Value, PluginError> {
        let (nonce, pending) = self.inner.calls.open();
        if let Err(e) = self.send(build(nonce.clone())) {
            self.inner.calls.reject(&nonce, e);
        }
        pending.await
    }

    /// Pass or fail the supervisor's verification gate. Only the first call counts.
    pub fn verify(&self, allow: bool) -> Result<(), PluginError> {
        if self.inner.verified.swap(true, Ordering::SeqCst) {
            return Err(PluginError::AlreadyVerified);
        }
        self.send(PluginOp::Verify { allow })
    }

    /// Call a function exported by the plugin serving `namespace`
    pub async fn call_remote_plugin_function(
        &self,
        namespace: &str,
        func_name: &str,
        args: Vec<Value>,
    ) -> Result<Value, PluginError> {
        self.request(|nonce| PluginOp::CallPluginFunction {
            namespace: namespace.to_string(),
            func_name: func_name.to_string(),
            args,
            nonce,
        })
        .await
    }

    /// Call a kernel module command
    pub async fn call_module_api(
        &self,
        module_id: &str,
        cmd: &str,
        value: Value,
    ) -> Result<Value, PluginError> {
        self.request(|nonce| PluginOp::CallModuleApi {
            module_id: module_id.to_string(),
            cmd: cmd.to_string(),
            value,
            nonce,
        })
        .await
    }

    /// Wait for a kernel module; true if it came up within `timeout`
    pub async fn wait_for_module(
        &self,
        module_namespace: &str,
        timeout: Duration,
    ) -> Result<bool, PluginError> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let data = self
            .request(|nonce| PluginOp::WaitForModule {
                module_namespace: module_namespace.to_string(),
                timeout: timeout_ms,
                nonce,
            })
            .await?;
        Ok(success_flag(&data))
    }

    /// Register `name` for invocation. Names are unique within the process.
    pub fn register_function<F>(&self, name: &str, function: F) -> Result<(), PluginError>
    where
        F: PluginFunction + 'static,
    {
        let mut functions = self
            .inner
            .functions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if functions.contains_key(name) {
            return Err(PluginError::DuplicateFunction(name.to_string()));
        }
        functions.insert(name.to_string(), Arc::new(function));
        Ok(())
    }

    /// Register a chat command backed by `handler`; true if a command handler accepted it
    pub async fn register_command<F>(
        &self,
        command_name: &str,
        info: CommandInfo,
        handler: F,
    ) -> Result<bool, PluginError>
    where
        F: PluginFunction + 'static,
    {
        let func_name = {
            let mut functions = self
                .inner
                .functions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let mut name = random_function_name();
            while functions.contains_key(&name) {
                name = random_function_name();
            }
            functions.insert(name.clone(), Arc::new(handler));
            name
        };
        self.register_command_by_name(command_name, info, &func_name)
            .await
    }

    /// Register a chat command backed by an already registered function
    pub async fn register_command_by_name(
        &self,
        command_name: &str,
        info: CommandInfo,
        func_name: &str,
    ) -> Result<bool, PluginError> {
        let data = self
            .request(|nonce| PluginOp::RegisterCommand {
                command_name: command_name.to_string(),
                func_name: func_name.to_string(),
                description: info.description,
                args: info.args,
                compatibility: info.compatibility,
                nonce,
            })
            .await?;
        Ok(success_flag(&data))
    }

    /// Handle on the database `database_id`
    pub fn database(&self, database_id: &str) -> Database {
        Database {
            runtime: self.clone(),
            database_id: database_id.to_string(),
        }
    }

    /// Send a log line to the supervisor
    pub fn log(&self, level: LogLevel, args: Vec<Value>) {
        if let Err(e) = self.send(PluginOp::Log { level, args }) {
            debug!("Dropping log line: {}", e);
        }
    }

    pub fn critical(&self, message: impl Into<Value>) {
        self.log(LogLevel::Critical, vec![message.into()]);
    }

    pub fn error(&self, message: impl Into<Value>) {
        self.log(LogLevel::Error, vec![message.into()]);
    }

    pub fn warn(&self, message: impl Into<Value>) {
        self.log(LogLevel::Warn, vec![message.into()]);
    }

    pub fn info(&self, message: impl Into<Value>) {
        self.log(LogLevel::Info, vec![message.into()]);
    }

    pub fn debug(&self, message: impl Into<Value>) {
        self.log(LogLevel::Debug, vec![message.into()]);
    }

    pub fn verbose(&self, message: impl Into<Value>) {
        self.log(LogLevel::Verbose, vec![message.into()]);
    }

    /// Announce exit and flush everything queued for the supervisor
    ///
    /// The caller terminates the process afterwards.
    pub async fn exit(&self, code: i32, reason: Option<String>) {
        if let Err(e) = self.send(PluginOp::Exit {
            code: Some(code),
            reason,
        }) {
            warn!("Could not announce exit: {}", e);
        }

        self.inner
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let writer = self
            .inner
            .writer_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }

    async fn dispatch<R>(&self, mut reader: MessageReader<R>)
    where
        R: AsyncRead + Unpin,
    {
        while let Some(result) = transport::next_message::<_, SupervisorOp>(&mut reader).await {
            match result {
                Ok(SupervisorOp::Completion(completion)) => {
                    let nonce = completion.nonce.clone();
                    let handled = match completion.into_result() {
                        Ok(data) => self.inner.calls.resolve(&nonce, data),
                        Err(error) => self.inner.calls.reject(&nonce, PluginError::Remote(error)),
                    };
                    if !handled {
                        debug!("Ignoring completion for unknown nonce {}", nonce);
                    }
                }
                Ok(SupervisorOp::Invoke {
                    func_name,
                    args,
                    nonce,
                }) => {
                    let runtime = self.clone();
                    tokio::spawn(async move {
                        let completion = runtime.invoke(&func_name, args, nonce).await;
                        if let Err(e) = runtime.send(PluginOp::Completion(completion)) {
                            debug!("Dropping reply for {}: {}", func_name, e);
                        }
                    });
                }
                Err(PluginError::Serialization(e)) => {
                    warn!("Malformed op from supervisor: {}", e);
                }
                Err(e) => {
                    warn!("Supervisor channel failed: {}", e);
                    break;
                }
            }
        }
        debug!("Supervisor channel closed");
    }

    async fn invoke(&self, func_name: &str, args: Vec<Value>, nonce: String) -> Completion {
        let function = self
            .inner
            .functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(func_name)
            .cloned();

        match function {
            Some(function) => match function.invoke(args).await {
                Ok(value) => Completion::ok(nonce, value),
                // Debug formatting carries the context chain and any captured backtrace
                Err(e) => Completion::err(nonce, format!("{:?}", e)),
            },
            None => Completion::err(nonce, format!("Function {} not found", func_name)),
        }
    }
}

/// Database bound to one database id
pub struct Database {
    runtime: PluginRuntime,
    database_id: String,
}

impl Database {
    pub fn id(&self) -> &str {
        &self.database_id
    }

    async fn query(
        &self,
        op: DatabaseOp,
        table: &str,
        key: Option<&str>,
        value: Option<Value>,
    ) -> Result<Value, PluginError> {
        self.runtime
            .request(|nonce| {
                PluginOp::Database(DatabaseRequest {
                    op,
                    database_id: self.database_id.clone(),
                    table: table.to_string(),
                    key: key.map(str::to_string),
                    value,
                    nonce,
                })
            })
            .await
    }

    /// Value stored under `key`, or null
    pub async fn get(&self, table: &str, key: &str) -> Result<Value, PluginError> {
        self.query(DatabaseOp::Get, table, Some(key), None).await
    }

    pub async fn set(&self, table: &str, key: &str, value: Value) -> Result<bool, PluginError> {
        let data = self.query(DatabaseOp::Set, table, Some(key), Some(value)).await?;
        Ok(data == json!(true))
    }

    pub async fn delete(&self, table: &str, key: &str) -> Result<bool, PluginError> {
        let data = self.query(DatabaseOp::Delete, table, Some(key), None).await?;
        Ok(data == json!(true))
    }

    pub async fn delete_table(&self, table: &str) -> Result<bool, PluginError> {
        let data = self.query(DatabaseOp::DeleteTable, table, None, None).await?;
        Ok(data == json!(true))
    }
}

fn random_function_name() -> String {
    format!("cmd_{}", hex::encode(rand::random::<[u8; 8]>()))
}

/// `success` flag of a `{ success }` reply
fn success_flag(data: &Value) -> bool {
    data.get("success").and_then(Value::as_bool).unwrap_or(false)
}
