use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tokio::{io::AsyncWriteExt, process::Command, time::sleep};
use tracing::{debug, info, warn};

// "text file busy" means an init container is still writing the plugin
// binary; every other failure aborts immediately.
const BUSY_RETRIES: usize = 5;
const BUSY_RETRY_PAUSE: Duration = Duration::from_secs(1);
const BUSY_MARKER: &str = "text file busy";

#[derive(thiserror::Error, Debug)]
pub enum PluginError {
    // the plugin printed a CNI error object on stdout
    #[error("plugin {plugin} failed (code {code}): {msg}; {details}")]
    Reported {
        plugin: String,
        code: u32,
        msg: String,
        details: String,
    },

    #[error("plugin {plugin} failed: {stderr}")]
    Stderr { plugin: String, stderr: String },

    #[error("plugin {plugin} failed with no diagnostic output: {reason}")]
    Process { plugin: String, reason: anyhow::Error },
}

#[derive(Debug, Deserialize)]
struct ReportedError {
    code: Option<u32>,
    msg: Option<String>,
    #[serde(default)]
    details: String,
}

pub struct PluginExec {
    chroot_dir: Option<PathBuf>,
}

impl PluginExec {
    pub fn new(chroot_dir: Option<PathBuf>) -> Self {
        Self { chroot_dir }
    }

    pub async fn exec_plugin(
        &self,
        plugin: &Path,
        stdin: &[u8],
        env: &HashMap<String, String>,
    ) -> Result<Vec<u8>, PluginError> {
        let plugin_name = plugin.display().to_string();

        let output = with_busy_retry(BUSY_RETRY_PAUSE, || self.invoke(plugin, stdin, env))
            .await
            .map_err(|e| PluginError::Process {
                plugin: plugin_name.clone(),
                reason: e,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if output.status.success() {
            if !stderr.is_empty() {
                // diagnostic only, a successful delegate stays successful
                info!(plugin = %plugin_name, "delegate stderr: {stderr}");
            }
            return Ok(output.stdout);
        }

        Err(structured_error(&plugin_name, &output, stderr))
    }

    async fn invoke(
        &self,
        plugin: &Path,
        stdin_bytes: &[u8],
        env: &HashMap<String, String>,
    ) -> Result<Output> {
        let mut cmd = Command::new(plugin);
        cmd.env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(root) = self.chroot_dir.clone() {
            debug!(plugin = %plugin.display(), root = %root.display(), "Executing under chroot");
            unsafe {
                cmd.pre_exec(move || {
                    nix::unistd::chroot(root.as_path()).map_err(std::io::Error::from)?;
                    nix::unistd::chdir("/").map_err(std::io::Error::from)
                });
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", plugin.display()))?;

        let mut child_stdin = child.stdin.take().context("plugin stdin was not piped")?;
        child_stdin
            .write_all(stdin_bytes)
            .await
            .context("failed to write the plugin's stdin")?;
        drop(child_stdin);

        child
            .wait_with_output()
            .await
            .with_context(|| format!("failed to collect output of {}", plugin.display()))
    }
}

async fn with_busy_retry<T, F, Fut>(pause: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut remaining = BUSY_RETRIES;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if remaining > 0 && is_busy(&e) => {
                remaining -= 1;
                warn!(error = %format!("{e:#}"), remaining, "Plugin binary busy, retrying");
                sleep(pause).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_busy(err: &anyhow::Error) -> bool {
    format!("{err:#}").to_lowercase().contains(BUSY_MARKER)
}

fn structured_error(plugin: &str, output: &Output, stderr: String) -> PluginError {
    if let Ok(reported) = serde_json::from_slice::<ReportedError>(&output.stdout) {
        if reported.code.is_some() || reported.msg.is_some() {
            return PluginError::Reported {
                plugin: plugin.to_string(),
                code: reported.code.unwrap_or(999),
                msg: reported.msg.unwrap_or_default(),
                details: reported.details,
            };
        }
    }

    if !stderr.is_empty() {
        return PluginError::Stderr {
            plugin: plugin.to_string(),
            stderr,
        };
    }

    PluginError::Process {
        plugin: plugin.to_string(),
        reason: anyhow!("plugin exited with {}", output.status),
    }
}
