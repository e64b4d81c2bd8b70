use std::path::PathBuf;

use anyhow::{Context, Result};
use common::{CniResult, DEFAULT_NETWORK_NAME};
use serde_json::Value;
use tracing::debug;

use crate::{exec::PluginExec, server::CniCmd};

// the merged configuration names the primary CNI config by path; it is
// read at invocation time, so delegate changes take effect immediately
pub struct Dispatcher {
    exec: PluginExec,
    bin_dir: String,
}

impl Dispatcher {
    pub fn new(exec: PluginExec, bin_dir: String) -> Self {
        Self { exec, bin_dir }
    }

    pub async fn add(&self, cmd: &CniCmd) -> Result<CniResult> {
        let stdout = self.invoke_delegate(cmd).await?;
        serde_json::from_slice(&stdout).context("delegate returned an unparseable CNI result")
    }

    pub async fn del(&self, cmd: &CniCmd) -> Result<()> {
        self.invoke_delegate(cmd).await.map(|_| ())
    }

    pub async fn check(&self, cmd: &CniCmd) -> Result<()> {
        self.invoke_delegate(cmd).await.map(|_| ())
    }

    async fn invoke_delegate(&self, cmd: &CniCmd) -> Result<Vec<u8>> {
        let (plugin, stdin) = self.delegate_invocation(cmd).await?;
        debug!(plugin = %plugin.display(), "Invoking the cluster-network delegate");
        let stdout = self
            .exec
            .exec_plugin(&plugin, &stdin, &cmd.delegate_env(&self.bin_dir))
            .await?;
        Ok(stdout)
    }

    async fn delegate_invocation(&self, cmd: &CniCmd) -> Result<(PathBuf, Vec<u8>)> {
        let conf: Value =
            serde_json::from_str(&cmd.config).context("malformed merged configuration")?;
        let cluster_network = conf
            .get("clusterNetwork")
            .and_then(Value::as_str)
            .context("merged configuration carries no clusterNetwork path")?;

        let raw = tokio::fs::read_to_string(cluster_network)
            .await
            .with_context(|| format!("failed to read the cluster network config {cluster_network}"))?;
        let parsed: Value = serde_json::from_str(&raw)
            .with_context(|| format!("malformed cluster network config {cluster_network}"))?;

        // conflist files delegate to their head entry
        let mut delegate = match parsed.get("plugins").and_then(Value::as_array) {
            Some(plugins) => plugins
                .first()
                .cloned()
                .context("cluster network conflist has no plugins")?,
            None => parsed,
        };

        let obj = delegate
            .as_object_mut()
            .context("cluster network delegate entry is not a JSON object")?;
        obj.insert(
            "name".to_string(),
            conf.get("name")
                .cloned()
                .unwrap_or_else(|| Value::String(DEFAULT_NETWORK_NAME.to_string())),
        );
        if let Some(version) = conf.get("cniVersion") {
            obj.insert("cniVersion".to_string(), version.clone());
        }

        let plugin_type = obj
            .get("type")
            .and_then(Value::as_str)
            .context("cluster network delegate has no type")?;
        let plugin = PathBuf::from(&self.bin_dir).join(plugin_type);

        Ok((plugin, serde_json::to_vec(&delegate)?))
    }
}
