//! Test utilities for plugin handler tests
//!
//! Provides a scripted in-process kernel, a launcher that hands out in-memory pipes
//! instead of child processes, and plugin directory fixtures.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use plugin_handler::config::SupervisorConfig;
use plugin_handler::plugin::ipc::protocol::{LogLevel, PluginOp, SupervisorOp};
use plugin_handler::plugin::ipc::transport::{self, MessageReader};
use plugin_handler::plugin::{
    ApiResponse, KernelApi, LaunchPlan, LaunchedPlugin, LogSink, PluginError, PluginLauncher,
    PluginRuntime, ProcessControl, ProcessSupervisor,
};

type Script = Box<dyn Fn(&Value) -> ApiResponse + Send + Sync>;

/// One call received by [`MockKernel`]
#[derive(Debug, Clone)]
pub struct KernelCall {
    pub module: String,
    pub cmd: String,
    pub data: Value,
}

/// Kernel stand-in answering from per-command scripts
///
/// Commands without a script answer `NotFound`.
#[derive(Default)]
pub struct MockKernel {
    scripts: Mutex<HashMap<(String, String), Script>>,
    calls: Mutex<Vec<KernelCall>>,
}

impl MockKernel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer `module.cmd` with whatever `script` returns for the request data
    pub fn on<F>(&self, module: &str, cmd: &str, script: F)
    where
        F: Fn(&Value) -> ApiResponse + Send + Sync + 'static,
    {
        self.scripts
            .lock()
            .unwrap()
            .insert((module.to_string(), cmd.to_string()), Box::new(script));
    }

    /// Answer `module.cmd` with a fixed successful payload
    pub fn reply(&self, module: &str, cmd: &str, data: Value) {
        self.on(module, cmd, move |_| ApiResponse::found(data.clone(), None));
    }

    pub fn calls(&self) -> Vec<KernelCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Request payloads sent to `module.cmd`, in order
    pub fn calls_to(&self, module: &str, cmd: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|c| c.module == module && c.cmd == cmd)
            .map(|c| c.data)
            .collect()
    }

    /// Wait until `module.cmd` has been called, returning the first payload
    pub async fn wait_for_call(&self, module: &str, cmd: &str) -> Value {
        for _ in 0..200 {
            if let Some(data) = self.calls_to(module, cmd).into_iter().next() {
                return data;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{}.{} was never called", module, cmd);
    }
}

#[async_trait]
impl KernelApi for MockKernel {
    async fn call_api(
        &self,
        module_id: &str,
        cmd: &str,
        data: Value,
    ) -> Result<ApiResponse, PluginError> {
        self.calls.lock().unwrap().push(KernelCall {
            module: module_id.to_string(),
            cmd: cmd.to_string(),
            data: data.clone(),
        });
        let scripts = self.scripts.lock().unwrap();
        Ok(match scripts.get(&(module_id.to_string(), cmd.to_string())) {
            Some(script) => script(&data),
            None => ApiResponse::NotFound,
        })
    }
}

/// What the test can observe about process control
#[derive(Clone, Default)]
pub struct ControlProbe {
    terminated: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
}

impl ControlProbe {
    pub fn terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

struct MockControl {
    probe: ControlProbe,
}

#[async_trait]
impl ProcessControl for MockControl {
    fn id(&self) -> Option<u32> {
        (!self.probe.killed()).then_some(4242)
    }

    fn terminate(&mut self) -> Result<(), PluginError> {
        self.probe.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), PluginError> {
        self.probe.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// The plugin's end of an in-memory launch
pub struct ChildEnd {
    pub plan: LaunchPlan,
    pub stream: DuplexStream,
    pub probe: ControlProbe,
}

impl ChildEnd {
    /// Run the plugin side with the real runtime library
    pub fn into_runtime(self) -> (PluginRuntime, ControlProbe) {
        let kind = self.plan.transport();
        let (reader, writer) = tokio::io::split(self.stream);
        (PluginRuntime::connect(reader, writer, kind), self.probe)
    }

    /// Drive the plugin side by hand
    pub fn into_raw(self) -> (RawPlugin, ControlProbe) {
        let kind = self.plan.transport();
        let (reader, writer) = tokio::io::split(self.stream);
        let (reader, writer) = transport::bind(reader, writer, kind);
        let (ops, _writer_task) = transport::spawn_writer::<_, PluginOp>(writer, "test".to_string());
        (RawPlugin { reader, ops }, self.probe)
    }
}

/// Hand-driven plugin side speaking raw ops
pub struct RawPlugin {
    reader: MessageReader<ReadHalf<DuplexStream>>,
    pub ops: mpsc::UnboundedSender<PluginOp>,
}

impl RawPlugin {
    pub fn send(&self, op: PluginOp) {
        self.ops.send(op).unwrap();
    }

    /// Next op from the supervisor
    pub async fn next(&mut self) -> SupervisorOp {
        tokio::time::timeout(Duration::from_secs(5), transport::next_message(&mut self.reader))
            .await
            .expect("timed out waiting for supervisor")
            .expect("supervisor closed the channel")
            .expect("malformed supervisor op")
    }
}

/// Launcher handing out in-memory pipes
pub struct DuplexLauncher {
    children: mpsc::UnboundedSender<ChildEnd>,
}

impl DuplexLauncher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ChildEnd>) {
        let (children, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { children }), rx)
    }
}

#[async_trait]
impl PluginLauncher for DuplexLauncher {
    async fn launch(&self, plan: &LaunchPlan) -> Result<LaunchedPlugin, PluginError> {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (reader, writer): (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) =
            tokio::io::split(ours);
        let probe = ControlProbe::default();

        self.children
            .send(ChildEnd {
                plan: plan.clone(),
                stream: theirs,
                probe: probe.clone(),
            })
            .map_err(|_| PluginError::Spawn("test dropped the launch receiver".to_string()))?;

        Ok(LaunchedPlugin {
            reader: Box::new(reader),
            writer: Box::new(writer),
            control: Box::new(MockControl { probe }),
        })
    }
}

/// Log sink remembering every line
#[derive(Default)]
pub struct RecordingLogSink {
    lines: Mutex<Vec<(String, LogLevel, Vec<Value>)>>,
}

impl RecordingLogSink {
    pub fn lines(&self) -> Vec<(String, LogLevel, Vec<Value>)> {
        self.lines.lock().unwrap().clone()
    }
}

impl LogSink for RecordingLogSink {
    fn log(&self, namespace: &str, level: LogLevel, args: &[Value]) {
        self.lines
            .lock()
            .unwrap()
            .push((namespace.to_string(), level, args.to_vec()));
    }
}

/// Plugin directory with a manifest and an already-installed support package
pub struct PluginDir {
    pub dir: TempDir,
}

impl PluginDir {
    pub fn new(namespace: &str) -> Self {
        Self::with_subclass(namespace, 0)
    }

    pub fn with_subclass(namespace: &str, subclass: u8) -> Self {
        let entry = if subclass == 1 { "src/index.ts" } else { "index.mjs" };
        Self::with_manifest(json!({
            "formatVersion": 0,
            "pluginName": format!("{} plugin", namespace),
            "pluginNamespace": namespace,
            "pluginVersion": "1.2.3",
            "entryPoint": entry,
            "author": "tester",
            "subclass": subclass
        }))
    }

    pub fn with_manifest(manifest: Value) -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("plugin.json"),
            serde_json::to_string_pretty(&manifest).unwrap(),
        )
        .unwrap();

        let support = dir
            .path()
            .join(SupervisorConfig::default().support_package_probe);
        std::fs::create_dir_all(&support).unwrap();
        std::fs::write(support.join("index.js"), "export {};\n").unwrap();
        std::fs::write(support.join("package.json"), r#"{"name": "support"}"#).unwrap();

        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Supervision settings that keep tests quick
pub fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        install_poll_interval_ms: 1,
        handshake_timeout_ms: 5_000,
        command_handler_wait_ms: 100,
        stop_grace_ms: 50,
        ..SupervisorConfig::default()
    }
}

/// Kernel, launcher and log sink wired together
pub struct Harness {
    pub kernel: Arc<MockKernel>,
    pub launcher: Arc<DuplexLauncher>,
    pub children: mpsc::UnboundedReceiver<ChildEnd>,
    pub logs: Arc<RecordingLogSink>,
}

impl Harness {
    pub fn new() -> Self {
        let (launcher, children) = DuplexLauncher::new();
        Self {
            kernel: MockKernel::new(),
            launcher,
            children,
            logs: Arc::new(RecordingLogSink::default()),
        }
    }

    pub fn supervisor(&self, plugin_dir: &Path) -> Arc<ProcessSupervisor> {
        self.supervisor_with(plugin_dir, fast_config())
    }

    pub fn supervisor_with(&self, plugin_dir: &Path, config: SupervisorConfig) -> Arc<ProcessSupervisor> {
        Arc::new(
            ProcessSupervisor::new(
                plugin_dir,
                self.kernel.clone() as Arc<dyn KernelApi>,
                self.launcher.clone() as Arc<dyn PluginLauncher>,
            )
            .with_config(config)
            .with_log_sink(self.logs.clone() as Arc<dyn LogSink>),
        )
    }

    /// Next launched plugin
    pub async fn next_child(&mut self) -> ChildEnd {
        tokio::time::timeout(Duration::from_secs(5), self.children.recv())
            .await
            .expect("timed out waiting for launch")
            .expect("launcher dropped")
    }

    /// Start `supervisor` with a runtime-backed plugin that verifies
    pub async fn start_verified(
        &mut self,
        supervisor: &Arc<ProcessSupervisor>,
    ) -> (PluginRuntime, ControlProbe) {
        let starting = {
            let supervisor = Arc::clone(supervisor);
            tokio::spawn(async move { supervisor.start().await })
        };
        let (runtime, probe) = self.next_child().await.into_runtime();
        runtime.verify(true).unwrap();
        starting.await.unwrap().unwrap();
        (runtime, probe)
    }
}
