//! Plugin process supervision
//!
//! A [`ProcessSupervisor`] owns one plugin process: it validates the manifest,
//! installs dependencies, launches the entry point, holds the verification gate and
//! routes the plugin's ops for as long as it runs.

mod router;

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::plugin::installer::DependencyInstaller;
use crate::plugin::ipc::protocol::SupervisorOp;
use crate::plugin::ipc::registry::{CallRegistry, NonceStyle};
use crate::plugin::ipc::transport;
use crate::plugin::log::{LogSink, TracingLogSink};
use crate::plugin::manifest::PluginManifest;
use crate::plugin::process::{LaunchPlan, PluginLauncher, ProcessControl};
use crate::plugin::traits::{KernelApi, PluginError, PluginState};

use router::OpRouter;

/// Outcome delivered to the verification gate
#[derive(Debug)]
pub(crate) enum GateSignal {
    /// The plugin's verdict
    Verified(bool),
    /// The plugin's stream closed or failed before a verdict
    TransportClosed(String),
}

fn is_starting(state: &PluginState) -> bool {
    matches!(
        state,
        PluginState::Installing | PluginState::Spawned | PluginState::AwaitingHandshake
    )
}

fn stopped_while_starting() -> PluginError {
    PluginError::ProcessError("Plugin was stopped while starting".to_string())
}

/// State shared between the supervisor and its router task
pub(crate) struct SupervisorShared {
    state: Mutex<PluginState>,
    calls: CallRegistry<Value>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<SupervisorOp>>>,
    gate: Mutex<Option<oneshot::Sender<GateSignal>>>,
}

impl SupervisorShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(PluginState::Created),
            calls: CallRegistry::new(NonceStyle::RandomHex),
            outgoing: Mutex::new(None),
            gate: Mutex::new(None),
        }
    }

    fn state(&self) -> PluginState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Claim the plugin for a launch; `Ok(false)` when it is already running
    fn begin_start(&self) -> Result<bool, PluginState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_running() {
            return Ok(false);
        }
        if !state.can_start() {
            return Err(state.clone());
        }
        *state = PluginState::Installing;
        Ok(true)
    }

    /// Move a launch in progress to `next`; false once it has been stopped
    fn advance_start(&self, next: PluginState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !is_starting(&state) {
            return false;
        }
        *state = next;
        true
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<SupervisorOp>> {
        self.outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Queue `op` for the plugin; false if the plugin is gone
    pub(crate) fn send(&self, op: SupervisorOp) -> bool {
        match self.sender() {
            Some(tx) => tx.send(op).is_ok(),
            None => false,
        }
    }

    pub(crate) fn take_gate(&self) -> Option<oneshot::Sender<GateSignal>> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn close_outgoing(&self) {
        self.outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Called by the router when the plugin's stream ends
    pub(crate) fn transport_closed(&self, reason: String) {
        if let Some(gate) = self.take_gate() {
            let _ = gate.send(GateSignal::TransportClosed(reason));
        }
        self.close_outgoing();

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, PluginState::Running | PluginState::Stopping) {
            *state = PluginState::Stopped;
        }
    }
}

/// Supervisor for one plugin process
pub struct ProcessSupervisor {
    plugin_dir: PathBuf,
    kernel: Arc<dyn KernelApi>,
    launcher: Arc<dyn PluginLauncher>,
    log_sink: Arc<dyn LogSink>,
    config: SupervisorConfig,
    temp_dir: Option<PathBuf>,
    shared: Arc<SupervisorShared>,
    manifest: Mutex<Option<PluginManifest>>,
    control: tokio::sync::Mutex<Option<Box<dyn ProcessControl>>>,
    router_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessSupervisor {
    /// Create a supervisor for the plugin in `plugin_dir`
    pub fn new<P: AsRef<Path>>(
        plugin_dir: P,
        kernel: Arc<dyn KernelApi>,
        launcher: Arc<dyn PluginLauncher>,
    ) -> Self {
        Self {
            plugin_dir: plugin_dir.as_ref().to_path_buf(),
            kernel,
            launcher,
            log_sink: Arc::new(TracingLogSink),
            config: SupervisorConfig::default(),
            temp_dir: None,
            shared: Arc::new(SupervisorShared::new()),
            manifest: Mutex::new(None),
            control: tokio::sync::Mutex::new(None),
            router_task: Mutex::new(None),
        }
    }

    /// Set supervision parameters
    pub fn with_config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the destination for plugin log lines
    pub fn with_log_sink(mut self, log_sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = log_sink;
        self
    }

    /// Set the kernel temp directory handed to the plugin
    pub fn with_temp_dir(mut self, temp_dir: Option<PathBuf>) -> Self {
        self.temp_dir = temp_dir;
        self
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn state(&self) -> PluginState {
        self.shared.state()
    }

    /// Manifest read by the last `start()`
    pub fn manifest(&self) -> Option<PluginManifest> {
        self.manifest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Calls to the plugin still awaiting a completion
    pub fn pending_count(&self) -> usize {
        self.shared.calls.pending_count()
    }

    /// Start the plugin and wait for it to pass the verification gate
    ///
    /// A no-op when already running. Only one launch runs at a time; a concurrent
    /// `start()` is refused while it is in progress.
    pub async fn start(&self) -> Result<(), PluginError> {
        match self.shared.begin_start() {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(state) => {
                return Err(PluginError::ProcessError(format!(
                    "Plugin in {:?} cannot be started while {}",
                    self.plugin_dir, state
                )))
            }
        }

        match self.launch_and_verify().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Plugin in {:?} failed to start: {}", self.plugin_dir, e);
                // A force_stop() during the launch keeps its Stopped state
                self.shared.advance_start(PluginState::Failed(e.reason()));
                Err(e)
            }
        }
    }

    async fn launch_and_verify(&self) -> Result<(), PluginError> {
        let manifest = PluginManifest::load(&self.plugin_dir)?;
        let namespace = manifest.plugin_namespace.clone();
        *self.manifest.lock().unwrap_or_else(PoisonError::into_inner) = Some(manifest.clone());

        DependencyInstaller::new(Arc::clone(&self.kernel), &self.config)
            .install(&self.plugin_dir)
            .await?;

        let plan = LaunchPlan {
            namespace: namespace.clone(),
            plugin_dir: self.plugin_dir.clone(),
            entry_point: manifest.entry_path(&self.plugin_dir),
            subclass: manifest.subclass,
            temp_dir: self.temp_dir.clone(),
        };
        let launched = self.launcher.launch(&plan).await?;
        *self.control.lock().await = Some(launched.control);
        if !self.shared.advance_start(PluginState::Spawned) {
            self.teardown().await;
            return Err(stopped_while_starting());
        }

        let (reader, writer) = transport::bind(launched.reader, launched.writer, plan.transport());
        let (outgoing, _writer_task) =
            transport::spawn_writer::<_, SupervisorOp>(writer, namespace.clone());
        *self
            .shared
            .outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outgoing);

        let (gate_tx, gate_rx) = oneshot::channel();
        *self.shared.gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(gate_tx);
        if !self.shared.advance_start(PluginState::AwaitingHandshake) {
            self.teardown().await;
            return Err(stopped_while_starting());
        }

        let router = OpRouter::new(
            namespace.clone(),
            Arc::clone(&self.kernel),
            Arc::clone(&self.log_sink),
            self.config.command_handler_wait_ms,
            Arc::clone(&self.shared),
        );
        *self.router_task.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(tokio::spawn(router.run(reader)));

        debug!(
            "Waiting up to {:?} for plugin {} to verify",
            self.config.handshake_timeout(),
            namespace
        );
        let verdict = match timeout(self.config.handshake_timeout(), gate_rx).await {
            Ok(Ok(GateSignal::Verified(true))) => Ok(()),
            Ok(Ok(GateSignal::Verified(false))) => Err(PluginError::DrmRejected),
            Ok(Ok(GateSignal::TransportClosed(reason))) => Err(PluginError::ProcessError(reason)),
            Ok(Err(_)) => Err(PluginError::ProcessError(
                "Plugin stopped before verification".to_string(),
            )),
            Err(_) => Err(PluginError::Timeout(format!(
                "plugin {} to verify",
                namespace
            ))),
        };

        match verdict {
            Ok(()) if self.shared.advance_start(PluginState::Running) => {
                info!("Plugin {} verified and running", namespace);
                Ok(())
            }
            Ok(()) => {
                self.teardown().await;
                Err(stopped_while_starting())
            }
            Err(e) => {
                self.teardown().await;
                Err(e)
            }
        }
    }

    /// Ask the plugin to exit gracefully. A no-op unless running.
    pub async fn stop(&self) -> Result<(), PluginError> {
        if !self.state().is_running() {
            return Ok(());
        }

        let mut control = self.control.lock().await;
        if let Some(control) = control.as_mut() {
            control.terminate()?;
        }
        {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.is_running() {
                *state = PluginState::Stopping;
            }
        }
        info!("Stopping plugin in {:?}", self.plugin_dir);
        Ok(())
    }

    /// Kill the plugin immediately, from any state
    ///
    /// Calls still awaiting the plugin are left pending.
    pub async fn force_stop(&self) {
        // Published first so a launch in progress sees it at its next step
        {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !matches!(*state, PluginState::Created | PluginState::Failed(_)) {
                *state = PluginState::Stopped;
            }
        }

        let had_process = self.teardown().await;
        if had_process {
            info!("Force-stopped plugin in {:?}", self.plugin_dir);
        }
    }

    /// Kill the process and detach from it; true if there was one
    async fn teardown(&self) -> bool {
        // Dropping the gate sender wakes a pending start()
        self.shared.take_gate();
        self.shared.close_outgoing();
        if let Some(task) = self
            .router_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        let control = self.control.lock().await.take();
        match control {
            Some(mut control) => {
                if let Err(e) = control.kill().await {
                    warn!("Failed to kill plugin in {:?}: {}", self.plugin_dir, e);
                }
                true
            }
            None => false,
        }
    }

    /// Invoke `func_name` inside the plugin
    pub async fn call(&self, func_name: &str, args: Vec<Value>) -> Result<Value, PluginError> {
        if !self.state().is_running() {
            return Err(PluginError::NotRunning);
        }
        let outgoing = self.shared.sender().ok_or(PluginError::NotRunning)?;

        let (nonce, pending) = self.shared.calls.open();
        let invoke = SupervisorOp::Invoke {
            func_name: func_name.to_string(),
            args,
            nonce: nonce.clone(),
        };
        if outgoing.send(invoke).is_err() {
            self.shared.calls.reject(&nonce, PluginError::NotRunning);
        }
        pending.await
    }
}
