//! plugin-handler binary
//!
//! Speaks the kernel module protocol on stdin/stdout and hosts A-Type plugins
//! as child processes until the kernel closes the channel.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tracing::{error, info, warn};

use plugin_handler::config::HandlerConfig;
use plugin_handler::plugin::ipc::TransportKind;
use plugin_handler::plugin::{
    ApiResponse, CommandLauncher, HostChannel, KernelApi, PluginError, PluginManager,
};
use plugin_handler::utils::{init_logging_from_config, wait_for_shutdown_signal};

/// A-Type plugin handler
#[derive(Parser)]
#[command(name = "plugin-handler")]
#[command(about = "Process-isolated host for A-Type plugins")]
#[command(version)]
struct Cli {
    /// Configuration file path (.json or .toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, overriding the configured one (RUST_LOG still wins)
    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match cli.config.as_deref() {
        Some(path) => match HandlerConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config {}: {:#}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => HandlerConfig::default(),
    };
    if let Some(filter) = cli.log_filter {
        config.logging.filter = Some(filter);
    }

    init_logging_from_config(&config.logging);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Plugin handler exiting: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: HandlerConfig) -> anyhow::Result<()> {
    let host = HostChannel::new(config.identity.clone());
    let kernel: Arc<dyn KernelApi> = Arc::new(host.clone());
    let launcher = Arc::new(CommandLauncher::new(&config.launch));
    let manager = Arc::new(PluginManager::new(
        kernel,
        launcher,
        config.supervisor.clone(),
    ));
    manager.register_commands(&host);

    let dispatch = match host
        .connect(tokio::io::stdin(), tokio::io::stdout(), TransportKind::Native)
        .await
    {
        Ok(dispatch) => dispatch,
        Err(e @ PluginError::HandshakeRejected(_)) => return Err(e.into()),
        Err(e) => return Err(anyhow::anyhow!("Kernel connection failed: {}", e)),
    };

    match host.call_api("core", "get_temp_folder", json!({})).await? {
        ApiResponse::NotFound => {
            manager.shutdown().await;
            return Err(anyhow::anyhow!("Unsupported kernel version"));
        }
        response => match response.data().and_then(|d| d.as_str()) {
            Some(dir) => {
                info!("Kernel temp directory: {}", dir);
                manager.set_temp_dir(PathBuf::from(dir));
            }
            None => warn!("get_temp_folder returned no path: {:?}", response),
        },
    }

    tokio::select! {
        result = dispatch => {
            if let Err(e) = result {
                warn!("Kernel dispatch task ended abnormally: {}", e);
            }
            info!("Kernel closed the channel");
        }
        _ = wait_for_shutdown_signal() => {}
    }

    manager.shutdown().await;
    info!("Plugin handler stopped");
    Ok(())
}
