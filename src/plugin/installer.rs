//! Dependency installation for plugin directories
//!
//! Installation itself is done by the kernel (`pnpm_install_specific`,
//! `pnpm_install`). The kernel reports completion before the package manager has
//! finished linking, so when a support package source is configured the package is
//! probed for until it appears. Without one there is nothing to wait for.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::plugin::traits::{ApiResponse, KernelApi, PluginError};

const CORE_MODULE: &str = "core";

/// Installs a plugin's dependencies through the kernel
pub struct DependencyInstaller {
    kernel: Arc<dyn KernelApi>,
    support_package_dir: Option<PathBuf>,
    support_package_probe: PathBuf,
    poll_interval: Duration,
    retry_budget: u32,
    deadline: Option<Duration>,
}

impl DependencyInstaller {
    pub fn new(kernel: Arc<dyn KernelApi>, config: &SupervisorConfig) -> Self {
        Self {
            kernel,
            support_package_dir: config.support_package_dir.clone(),
            support_package_probe: config.support_package_probe.clone(),
            poll_interval: config.install_poll_interval(),
            retry_budget: config.install_retry_budget.max(1),
            deadline: config.install_deadline(),
        }
    }

    /// Install dependencies for `plugin_dir` and wait for the support package, if any
    pub async fn install(&self, plugin_dir: &Path) -> Result<(), PluginError> {
        match self.deadline {
            Some(deadline) => timeout(deadline, self.install_and_wait(plugin_dir))
                .await
                .map_err(|_| {
                    PluginError::Install(format!(
                        "support package did not appear in {:?} within {:?}",
                        plugin_dir, deadline
                    ))
                })?,
            None => self.install_and_wait(plugin_dir).await,
        }
    }

    async fn install_and_wait(&self, plugin_dir: &Path) -> Result<(), PluginError> {
        self.request_install(plugin_dir).await?;
        if self.support_package_dir.is_none() {
            debug!("No support package configured, not waiting on {:?}", plugin_dir);
            return Ok(());
        }

        let mut failed_polls = 0u32;
        loop {
            sleep(self.poll_interval).await;
            if self.support_package_ready(plugin_dir) {
                info!("Support package ready in {:?}", plugin_dir);
                return Ok(());
            }

            failed_polls += 1;
            if failed_polls >= self.retry_budget {
                warn!(
                    "Support package still missing in {:?} after {} probes, requesting installation again",
                    plugin_dir, failed_polls
                );
                failed_polls = 0;
                self.request_install(plugin_dir).await?;
            }
        }
    }

    /// Ask the kernel to install the support package and the plugin's dependencies
    async fn request_install(&self, plugin_dir: &Path) -> Result<(), PluginError> {
        let path = plugin_dir.to_string_lossy();

        if let Some(support) = &self.support_package_dir {
            let response = self
                .kernel
                .call_api(
                    CORE_MODULE,
                    "pnpm_install_specific",
                    json!({ "path": path, "dep": support.to_string_lossy() }),
                )
                .await?;
            log_install_response("pnpm_install_specific", &response);
        }

        let response = self
            .kernel
            .call_api(CORE_MODULE, "pnpm_install", json!({ "path": path }))
            .await?;
        log_install_response("pnpm_install", &response);
        Ok(())
    }

    /// Whether the support package is fully linked under `plugin_dir`
    pub fn support_package_ready(&self, plugin_dir: &Path) -> bool {
        let package = plugin_dir.join(&self.support_package_probe);
        if !package.join("index.js").is_file() {
            return false;
        }
        std::fs::read_to_string(package.join("package.json"))
            .ok()
            .and_then(|s| serde_json::from_str::<Value>(&s).ok())
            .is_some()
    }
}

fn log_install_response(cmd: &str, response: &ApiResponse) {
    match response {
        ApiResponse::NotFound => warn!("Kernel does not provide {}", cmd),
        ApiResponse::Found { error: Some(e), .. } => warn!("{} reported: {}", cmd, e),
        ApiResponse::Found { .. } => debug!("{} accepted", cmd),
    }
}
