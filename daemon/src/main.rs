use std::sync::Arc;

use anyhow::Result;
use common::socket_path;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    config::DaemonConfig, dispatch::Dispatcher, error::DaemonError, exec::PluginExec,
    manager::ConfigManager, server::CniServer,
};

mod config;
mod dispatch;
mod error;
mod exec;
mod generator;
mod k8s;
mod manager;
mod server;

#[tokio::main]
async fn main() -> Result<()> {
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(non_blocking))
        .init();

    let daemon_config = DaemonConfig::load()?;
    let token = CancellationToken::new();

    let mut manager = ConfigManager::new(daemon_config.conf.clone(), token.clone()).await?;

    let kube_client = match Client::try_default().await {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(error = %e, "No Kubernetes client available, pod UIDs must come via CNI_ARGS");
            None
        }
    };

    let bin_dir = daemon_config
        .conf
        .bin_dir
        .clone()
        .unwrap_or_else(|| "/opt/cni/bin".to_string());
    let dispatcher = Arc::new(Dispatcher::new(
        PluginExec::new(daemon_config.chroot_dir.clone()),
        bin_dir,
    ));
    let server = CniServer::new(
        socket_path(&daemon_config.conf.socket_dir),
        Some(daemon_config.config_override.clone()),
        dispatcher,
        kube_client,
    );

    let monitor_token = token.clone();
    let monitor = tokio::spawn(async move { manager.monitor(monitor_token).await });
    let server_task = tokio::spawn(async move { server.run().await });

    tokio::select! {
        res = monitor => {
            if let Err(e) = res? {
                if let Some(DaemonError::ReadinessGone(path)) = e.downcast_ref::<DaemonError>() {
                    error!(
                        readiness = %path.display(),
                        "Primary network went away, exiting so the supervisor restarts us"
                    );
                    std::process::exit(2);
                }
                return Err(e);
            }
        }
        res = server_task => res??,
        _ = signal::ctrl_c() => {
            info!("Exiting...");
            token.cancel();
        }
    }

    Ok(())
}
