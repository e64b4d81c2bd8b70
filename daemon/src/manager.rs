use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use common::{RESERVED_CONF_FILE, RESERVED_CONF_PREFIX};
use notify::{
    Event, EventKind, RecursiveMode, Watcher,
    event::ModifyKind,
};
use tokio::{sync::mpsc, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::DaemonError,
    generator::{MultusConf, PrimaryConf, check_version_compatibility},
};

const DISCOVERY_ATTEMPTS: usize = 600;
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct ConfigManager {
    conf: MultusConf,
    primary_path: PathBuf,
    derived_path: PathBuf,
    readiness_file: Option<PathBuf>,
}

impl ConfigManager {
    #[instrument(name = "config_manager", skip_all, err)]
    pub async fn new(mut conf: MultusConf, token: CancellationToken) -> Result<Self> {
        let autoconfig_dir = conf
            .multus_autoconfig_dir
            .clone()
            .unwrap_or_else(|| conf.cni_config_dir.clone());

        let primary_path = match conf.multus_master_cni.as_deref() {
            Some(name) if !name.is_empty() => Path::new(&autoconfig_dir).join(name),
            _ => {
                find_primary_conf(
                    Path::new(&autoconfig_dir),
                    DISCOVERY_ATTEMPTS,
                    DISCOVERY_INTERVAL,
                    &token,
                )
                .await?
            }
        };
        info!(primary = %primary_path.display(), "Using primary CNI config");

        conf.cluster_network = primary_path.display().to_string();

        let derived_path = match conf.multus_config_file.as_deref().filter(|f| !f.is_empty()) {
            Some(file) => PathBuf::from(file),
            None => Path::new(&conf.cni_config_dir).join(RESERVED_CONF_FILE),
        };
        if let Some(parent) = derived_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let readiness_file = conf
            .readiness_indicator_file
            .clone()
            .filter(|f| !f.is_empty())
            .map(PathBuf::from);

        let mut manager = Self {
            conf,
            primary_path,
            derived_path,
            readiness_file,
        };

        match manager.generate_config().await? {
            Some(serialized) => manager.persist(&serialized).await?,
            None => warn!("Primary CNI config not readable yet, derived config not written"),
        }

        Ok(manager)
    }

    pub fn primary_path(&self) -> &Path {
        &self.primary_path
    }

    pub fn derived_path(&self) -> &Path {
        &self.derived_path
    }

    // an unreadable primary is transient and yields None; bad JSON or a
    // version incompatibility is a real error, and either way the
    // previous on-disk derived file stays untouched
    pub async fn generate_config(&mut self) -> Result<Option<String>> {
        let raw = match tokio::fs::read_to_string(&self.primary_path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    primary = %self.primary_path.display(),
                    error = %e,
                    "Failed to read the primary CNI config"
                );
                return Ok(None);
            }
        };

        let mut primary = PrimaryConf::parse(&raw)
            .with_context(|| format!("in primary config {}", self.primary_path.display()))?;

        if self.conf.force_cni_version {
            // Rewrites a file this daemon does not own; kept for parity
            // with the documented forceCNIVersion behavior.
            self.force_primary_version(&raw).await?;
            primary.cni_version = self.conf.cni_version.clone();
        } else {
            check_version_compatibility(&self.conf.cni_version, &primary.cni_version)?;
        }

        self.conf.set_capabilities(primary.enabled_capabilities());

        if self.conf.override_network_name {
            if primary.name.is_empty() {
                bail!(
                    "cannot override the network name: primary config {} has no name",
                    self.primary_path.display()
                );
            }
            self.conf.name = primary.name.clone();
        }

        Ok(Some(self.conf.serialize()?))
    }

    pub async fn persist(&self, serialized: &str) -> Result<()> {
        atomic_write(&self.derived_path, serialized.as_bytes(), 0o600)
            .await
            .with_context(|| {
                format!("failed to persist derived config {}", self.derived_path.display())
            })?;
        debug!(derived = %self.derived_path.display(), "Derived CNI config written");
        Ok(())
    }

    async fn force_primary_version(&self, raw: &str) -> Result<()> {
        let mut value: serde_json::Value = serde_json::from_str(raw)
            .with_context(|| format!("in primary config {}", self.primary_path.display()))?;
        let obj = value
            .as_object_mut()
            .context("primary config is not a JSON object")?;
        obj.insert(
            "cniVersion".to_string(),
            serde_json::Value::String(self.conf.cni_version.clone()),
        );

        atomic_write(&self.primary_path, &serde_json::to_vec(&value)?, 0o600)
            .await
            .with_context(|| {
                format!(
                    "failed to rewrite cniVersion in {}",
                    self.primary_path.display()
                )
            })
    }

    // returns Ok on cancellation; the only error it surfaces is the
    // fatal readiness-file removal, which the caller turns into exit
    #[instrument(name = "monitor", skip_all, err)]
    pub async fn monitor(&mut self, token: CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;

        let watch_dir = self
            .primary_path
            .parent()
            .context("primary config path has no parent directory")?
            .to_path_buf();
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

        if let Some(parent) = self.readiness_file.as_ref().and_then(|f| f.parent()) {
            if parent != watch_dir {
                watcher.watch(parent, RecursiveMode::NonRecursive)?;
            }
        }

        info!(dir = %watch_dir.display(), "Watching for primary CNI config changes");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Configuration monitor cancelled");
                    return Ok(());
                }
                event = rx.recv() => {
                    match event {
                        Some(Ok(event)) => self.handle_event(event).await?,
                        Some(Err(e)) => warn!(error = %e, "Watcher produced an error"),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: Event) -> Result<()> {
        let removal = matches!(
            event.kind,
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
        );
        let write = matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any)
        );

        for path in &event.paths {
            if removal && Some(path.as_path()) == self.readiness_file.as_deref() {
                error!(readiness = %path.display(), "Readiness indicator removed, shutting down");
                if let Err(e) = tokio::fs::remove_file(&self.derived_path).await {
                    warn!(error = %e, "Failed to delete the derived config");
                }
                return Err(DaemonError::ReadinessGone(path.clone()).into());
            }

            if write && *path == self.primary_path {
                debug!(primary = %path.display(), "Primary CNI config changed, regenerating");
                match self.generate_config().await {
                    Ok(Some(serialized)) => {
                        if let Err(e) = self.persist(&serialized).await {
                            warn!(error = %format!("{e:#}"), "Failed to persist the derived config");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "Failed to regenerate the derived config")
                    }
                }
            }
        }

        Ok(())
    }
}

// temp file in the destination dir + rename, so a concurrent reader
// never observes a partial file
async fn atomic_write(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let temp_name = format!(
        "{}.tmp.{}",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id()
    );
    let temp_path = path.with_file_name(temp_name);

    tokio::fs::write(&temp_path, contents).await?;
    tokio::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(mode)).await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

// lexicographically-first conf/conflist in the autoconfig dir, skipping
// the reserved prefix so the daemon never delegates to itself
async fn find_primary_conf(
    dir: &Path,
    attempts: usize,
    interval: Duration,
    token: &CancellationToken,
) -> Result<PathBuf> {
    for attempt in 1..=attempts {
        if let Some(path) = first_eligible_conf(dir).await? {
            return Ok(path);
        }
        debug!(dir = %dir.display(), attempt, attempts, "No primary CNI config yet");

        if attempt < attempts {
            tokio::select! {
                _ = token.cancelled() => bail!("cancelled while waiting for a primary CNI config"),
                _ = sleep(interval) => {}
            }
        }
    }

    Err(DaemonError::PrimaryConfNotFound {
        dir: dir.to_path_buf(),
        attempts,
    }
    .into())
}

async fn first_eligible_conf(dir: &Path) -> Result<Option<PathBuf>> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read {}", dir.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.metadata().await?.is_file() {
            continue;
        }
        let Some(ext) = path.extension().and_then(OsStr::to_str) else {
            continue;
        };
        if !matches!(ext, "conf" | "conflist") {
            continue;
        }
        let Some(name) = path.file_name().and_then(OsStr::to_str) else {
            continue;
        };
        if name.starts_with(RESERVED_CONF_PREFIX) {
            continue;
        }
        candidates.push(path);
    }

    candidates.sort_unstable();
    Ok(candidates.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn create_file(dir: &Path, name: &str, content: &str) -> Result<PathBuf> {
        let path = dir.join(name);
        tokio::fs::write(&path, content).await?;
        Ok(path)
    }

    fn daemon_conf(dir: &Path, extra: &str) -> MultusConf {
        MultusConf::parse(&format!(
            r#"{{"cniVersion":"0.4.0","cniConfigDir":"{}"{extra}}}"#,
            dir.display()
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn generates_derived_config_from_primary() -> Result<()> {
        let dir = tempdir()?;
        let primary = create_file(
            dir.path(),
            "10-ovn.conf",
            r#"{"cniVersion":"0.4.0","name":"ovn","type":"ovn-k8s-cni-overlay"}"#,
        )
        .await?;

        let manager =
            ConfigManager::new(daemon_conf(dir.path(), ""), CancellationToken::new()).await?;

        let written = tokio::fs::read_to_string(manager.derived_path()).await?;
        assert_eq!(
            written,
            format!(
                r#"{{"cniVersion":"0.4.0","name":"multus-cni-network","clusterNetwork":"{}","type":"multus-shim"}}"#,
                primary.display()
            )
        );
        Ok(())
    }

    #[tokio::test]
    async fn regeneration_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        create_file(
            dir.path(),
            "10-calico.conflist",
            r#"{"cniVersion":"1.0.0","name":"k8s-pod-network","plugins":[
                {"type":"calico","capabilities":{"bandwidth":true}},
                {"type":"portmap","capabilities":{"portMappings":true}}
            ]}"#,
        )
        .await?;

        let mut manager =
            ConfigManager::new(daemon_conf(dir.path(), ""), CancellationToken::new()).await?;

        let first = manager.generate_config().await?.unwrap();
        let second = manager.generate_config().await?.unwrap();
        assert_eq!(first, second);
        assert!(first.contains(r#""capabilities":{"bandwidth":true,"portMappings":true}"#));
        Ok(())
    }

    #[tokio::test]
    async fn version_gate_fails_load_and_keeps_stale_file() -> Result<()> {
        let dir = tempdir()?;
        create_file(
            dir.path(),
            "10-flannel.conf",
            r#"{"cniVersion":"0.3.0","name":"flannel","type":"flannel"}"#,
        )
        .await?;
        let stale = create_file(dir.path(), RESERVED_CONF_FILE, "stale").await?;

        let err = ConfigManager::new(daemon_conf(dir.path(), ""), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.chain().any(|c| c.to_string().contains("version incompatibility")));
        assert_eq!(tokio::fs::read_to_string(&stale).await?, "stale");
        Ok(())
    }

    #[tokio::test]
    async fn override_network_name_takes_primary_name() -> Result<()> {
        let dir = tempdir()?;
        create_file(
            dir.path(),
            "10-ovn.conf",
            r#"{"cniVersion":"0.4.0","name":"ovn","type":"ovn-k8s-cni-overlay"}"#,
        )
        .await?;

        let manager = ConfigManager::new(
            daemon_conf(dir.path(), r#","overrideNetworkName":true"#),
            CancellationToken::new(),
        )
        .await?;

        let written = tokio::fs::read_to_string(manager.derived_path()).await?;
        assert!(written.contains(r#""name":"ovn""#));
        Ok(())
    }

    #[tokio::test]
    async fn override_network_name_requires_primary_name() -> Result<()> {
        let dir = tempdir()?;
        create_file(
            dir.path(),
            "10-anon.conf",
            r#"{"cniVersion":"0.4.0","type":"bridge"}"#,
        )
        .await?;

        let err = ConfigManager::new(
            daemon_conf(dir.path(), r#","overrideNetworkName":true"#),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(format!("{err:#}").contains("has no name"));
        Ok(())
    }

    #[tokio::test]
    async fn force_cni_version_rewrites_primary_file() -> Result<()> {
        let dir = tempdir()?;
        let primary = create_file(
            dir.path(),
            "10-flannel.conf",
            r#"{"cniVersion":"0.3.0","name":"flannel","type":"flannel"}"#,
        )
        .await?;

        ConfigManager::new(
            daemon_conf(dir.path(), r#","forceCNIVersion":true"#),
            CancellationToken::new(),
        )
        .await?;

        let rewritten: serde_json::Value =
            serde_json::from_str(&tokio::fs::read_to_string(&primary).await?)?;
        assert_eq!(rewritten["cniVersion"], "0.4.0");
        Ok(())
    }

    #[tokio::test]
    async fn multus_config_file_overrides_the_derived_destination() -> Result<()> {
        let dir = tempdir()?;
        create_file(
            dir.path(),
            "10-ovn.conf",
            r#"{"cniVersion":"0.4.0","name":"ovn","type":"ovn-k8s-cni-overlay"}"#,
        )
        .await?;

        let dest = dir.path().join("multus.d").join("custom-multus.conf");
        let extra = format!(r#","multusConfigFile":"{}""#, dest.display());
        let manager =
            ConfigManager::new(daemon_conf(dir.path(), &extra), CancellationToken::new()).await?;

        assert_eq!(manager.derived_path(), dest);
        let written = tokio::fs::read_to_string(&dest).await?;
        assert!(written.contains(r#""type":"multus-shim""#));
        assert!(!tokio::fs::try_exists(dir.path().join(RESERVED_CONF_FILE)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn discovery_never_selects_the_reserved_file() -> Result<()> {
        let dir = tempdir()?;
        create_file(dir.path(), RESERVED_CONF_FILE, "{}").await?;

        let err = find_primary_conf(
            dir.path(),
            3,
            Duration::from_millis(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("after 3 attempts"));
        Ok(())
    }

    #[tokio::test]
    async fn discovery_picks_lexicographically_first_conf() -> Result<()> {
        let dir = tempdir()?;
        create_file(dir.path(), "99-last.conflist", "{}").await?;
        let expected = create_file(dir.path(), "05-first.conf", "{}").await?;
        create_file(dir.path(), "00-multus.conf", "{}").await?;
        create_file(dir.path(), "ignore.json", "{}").await?;

        let found = find_primary_conf(
            dir.path(),
            1,
            Duration::from_millis(5),
            &CancellationToken::new(),
        )
        .await?;
        assert_eq!(found, expected);
        Ok(())
    }

    #[tokio::test]
    async fn persist_is_atomic_under_a_concurrent_reader() -> Result<()> {
        let dir = tempdir()?;
        create_file(
            dir.path(),
            "10-ovn.conf",
            r#"{"cniVersion":"0.4.0","name":"ovn","type":"ovn-k8s-cni-overlay"}"#,
        )
        .await?;

        let manager = std::sync::Arc::new(
            ConfigManager::new(daemon_conf(dir.path(), ""), CancellationToken::new()).await?,
        );
        let derived = manager.derived_path().to_path_buf();

        let long_a = format!(r#"{{"cniVersion":"0.4.0","name":"{}"}}"#, "a".repeat(4096));
        let long_b = format!(r#"{{"cniVersion":"0.4.0","name":"{}"}}"#, "b".repeat(4096));

        let writer = {
            let manager = manager.clone();
            let (a, b) = (long_a.clone(), long_b.clone());
            tokio::spawn(async move {
                for i in 0..200 {
                    let contents = if i % 2 == 0 { &a } else { &b };
                    manager.persist(contents).await.unwrap();
                }
            })
        };

        for _ in 0..200 {
            let seen = tokio::fs::read_to_string(&derived).await?;
            assert!(
                serde_json::from_str::<serde_json::Value>(&seen).is_ok(),
                "reader observed a partial write"
            );
            tokio::task::yield_now().await;
        }

        writer.await?;
        Ok(())
    }

    #[tokio::test]
    async fn monitor_regenerates_on_primary_change() -> Result<()> {
        let dir = tempdir()?;
        let primary = create_file(
            dir.path(),
            "10-ovn.conf",
            r#"{"cniVersion":"0.4.0","name":"ovn","type":"ovn-k8s-cni-overlay"}"#,
        )
        .await?;

        let mut manager =
            ConfigManager::new(daemon_conf(dir.path(), ""), CancellationToken::new()).await?;
        let derived = manager.derived_path().to_path_buf();

        let token = CancellationToken::new();
        let monitor_token = token.clone();
        let monitor = tokio::spawn(async move { manager.monitor(monitor_token).await });

        // give the watcher a moment to install before changing the file
        sleep(Duration::from_millis(300)).await;
        tokio::fs::write(
            &primary,
            r#"{"cniVersion":"0.4.0","name":"ovn","type":"ovn-k8s-cni-overlay","capabilities":{"portMappings":true}}"#,
        )
        .await?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let written = tokio::fs::read_to_string(&derived).await?;
            if written.contains(r#""capabilities":{"portMappings":true}"#) {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "derived config was not regenerated, last contents: {written}"
            );
            sleep(Duration::from_millis(100)).await;
        }

        token.cancel();
        monitor.await??;
        Ok(())
    }

    #[tokio::test]
    async fn monitor_treats_readiness_removal_as_fatal() -> Result<()> {
        let dir = tempdir()?;
        create_file(
            dir.path(),
            "10-ovn.conf",
            r#"{"cniVersion":"0.4.0","name":"ovn","type":"ovn-k8s-cni-overlay"}"#,
        )
        .await?;
        let readiness = create_file(dir.path(), "readiness", "ok").await?;

        let extra = format!(r#","readinessIndicatorFile":"{}""#, readiness.display());
        let mut manager =
            ConfigManager::new(daemon_conf(dir.path(), &extra), CancellationToken::new()).await?;
        let derived = manager.derived_path().to_path_buf();
        assert!(tokio::fs::try_exists(&derived).await?);

        let monitor =
            tokio::spawn(async move { manager.monitor(CancellationToken::new()).await });

        sleep(Duration::from_millis(300)).await;
        tokio::fs::remove_file(&readiness).await?;

        let err = monitor.await?.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DaemonError>(),
            Some(DaemonError::ReadinessGone(_))
        ));
        assert!(!tokio::fs::try_exists(&derived).await?);
        Ok(())
    }
}
