//! Plugin process launching and control
//!
//! Launches plugin entry points as separate processes and hands their pipes to the
//! supervisor. The launcher is a trait so supervision can be driven without real
//! processes.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::LaunchConfig;
use crate::plugin::ipc::transport::{BoxedReader, BoxedWriter, TransportKind};
use crate::plugin::manifest::Subclass;
use crate::plugin::traits::PluginError;

/// Environment variable carrying the plugin's namespace
pub const NAMESPACE_ENV_VAR: &str = "PHANDLER_PLUGIN_NAMESPACE";

/// Environment variable carrying the kernel's temp directory
pub const TEMP_DIR_ENV_VAR: &str = "PHANDLER_TEMP_DIR";

/// Everything needed to launch one plugin
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub namespace: String,
    pub plugin_dir: PathBuf,
    /// Absolute path of the entry point
    pub entry_point: PathBuf,
    pub subclass: Subclass,
    /// Kernel temp directory, when known
    pub temp_dir: Option<PathBuf>,
}

impl LaunchPlan {
    pub fn transport(&self) -> TransportKind {
        self.subclass.transport()
    }
}

/// Control over a launched plugin process
#[async_trait]
pub trait ProcessControl: Send {
    /// OS process id, if still running
    fn id(&self) -> Option<u32>;

    /// Ask the process to exit (SIGTERM where available)
    fn terminate(&mut self) -> Result<(), PluginError>;

    /// Kill the process and reap it
    async fn kill(&mut self) -> Result<(), PluginError>;
}

/// A launched plugin: its message pipes plus process control
pub struct LaunchedPlugin {
    /// Bytes from the plugin
    pub reader: BoxedReader,
    /// Bytes to the plugin
    pub writer: BoxedWriter,
    pub control: Box<dyn ProcessControl>,
}

/// Starts plugin processes
#[async_trait]
pub trait PluginLauncher: Send + Sync {
    async fn launch(&self, plan: &LaunchPlan) -> Result<LaunchedPlugin, PluginError>;
}

/// Launches plugins as child processes
///
/// Direct scripts run under the script runner and talk over stdin/stdout with the
/// native transport. Source plugins run under the source launcher and talk framed
/// over stdin/stderr, leaving stdout free for ordinary output, which is forwarded to
/// the log.
///
/// Under the native transport stdout belongs to the channel: every byte printed
/// there is read as a length prefix. One stray write desyncs the stream for good
/// and the plugin is treated as gone, so such plugins log through the runtime or
/// stderr.
pub struct CommandLauncher {
    script_runner: String,
    source_launcher: String,
    source_launcher_args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(config: &LaunchConfig) -> Self {
        Self {
            script_runner: config.script_runner.clone(),
            source_launcher: config.source_launcher.clone(),
            source_launcher_args: config.source_launcher_args.clone(),
        }
    }

    fn command(&self, plan: &LaunchPlan) -> Command {
        let mut command = match plan.subclass {
            Subclass::DirectScript => Command::new(&self.script_runner),
            Subclass::SourceNeedsTranspile => {
                let mut command = Command::new(&self.source_launcher);
                command.args(&self.source_launcher_args);
                command
            }
        };
        command
            .arg(&plan.entry_point)
            .current_dir(&plan.plugin_dir)
            .env(TransportKind::ENV_VAR, plan.transport().as_str())
            .env(NAMESPACE_ENV_VAR, &plan.namespace)
            .stdin(Stdio::piped())
            .kill_on_drop(true);
        if let Some(temp_dir) = &plan.temp_dir {
            command.env(TEMP_DIR_ENV_VAR, temp_dir);
        }

        match plan.transport() {
            TransportKind::Native => {
                // stdout carries the length-delimited stream and nothing else
                command.stdout(Stdio::piped()).stderr(Stdio::inherit());
            }
            TransportKind::Framed => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
        }
        command
    }
}

#[async_trait]
impl PluginLauncher for CommandLauncher {
    async fn launch(&self, plan: &LaunchPlan) -> Result<LaunchedPlugin, PluginError> {
        info!("Spawning plugin process: {}", plan.namespace);

        if !plan.entry_point.is_file() {
            return Err(PluginError::Spawn(format!(
                "Entry point not found: {:?}",
                plan.entry_point
            )));
        }

        let mut command = self.command(plan);
        debug!("Spawning process: {:?}", command);

        let mut child = command.spawn().map_err(|e| {
            PluginError::Spawn(format!("Failed to spawn plugin process: {}", e))
        })?;

        let writer = child
            .stdin
            .take()
            .ok_or_else(|| PluginError::Spawn("Plugin stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::Spawn("Plugin stdout not captured".to_string()))?;

        let reader: BoxedReader = match plan.transport() {
            TransportKind::Native => Box::new(stdout),
            TransportKind::Framed => {
                let stderr = child.stderr.take().ok_or_else(|| {
                    PluginError::Spawn("Plugin stderr not captured".to_string())
                })?;
                forward_output(plan.namespace.clone(), stdout);
                Box::new(stderr)
            }
        };

        Ok(LaunchedPlugin {
            reader,
            writer: Box::new(writer),
            control: Box::new(ChildProcess {
                namespace: plan.namespace.clone(),
                child,
            }),
        })
    }
}

/// Forward a plugin's plain output to the log, line by line
fn forward_output<R>(namespace: String, output: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(output).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(plugin = %namespace, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    debug!("Stopped reading output of {}: {}", namespace, e);
                    break;
                }
            }
        }
    });
}

/// A spawned plugin child process
pub struct ChildProcess {
    namespace: String,
    child: Child,
}

#[async_trait]
impl ProcessControl for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn terminate(&mut self) -> Result<(), PluginError> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };

        #[cfg(all(unix, feature = "nix"))]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let pid = i32::try_from(pid).map_err(|_| {
                PluginError::ProcessError(format!("Invalid pid {} for {}", pid, self.namespace))
            })?;
            debug!("Sending SIGTERM to plugin {} (pid {})", self.namespace, pid);
            return kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(|e| {
                PluginError::ProcessError(format!(
                    "Failed to signal plugin {}: {}",
                    self.namespace, e
                ))
            });
        }

        #[cfg(not(all(unix, feature = "nix")))]
        {
            debug!("Killing plugin {} (pid {})", self.namespace, pid);
            self.child.start_kill().map_err(|e| {
                PluginError::ProcessError(format!("Failed to stop plugin {}: {}", self.namespace, e))
            })
        }
    }

    async fn kill(&mut self) -> Result<(), PluginError> {
        debug!("Killing plugin process: {}", self.namespace);
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill plugin process {}: {}", self.namespace, e);
        }
        Ok(())
    }
}
