use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result, bail};
use common::{DEFAULT_NETWORK_NAME, DEFAULT_SOCKET_DIR, SHIM_PLUGIN_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DaemonError;

// Field declaration order is the on-disk schema order, so `serialize` is
// deterministic for a given state. Fields after `plugin_type` configure
// the daemon itself and are never part of the derived output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultusConf {
    pub cni_version: String,
    #[serde(default = "default_network_name")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_dir: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capabilities: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_to_stderr: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_options: Option<Value>,
    // path to the primary CNI config, never an embedded copy
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_network: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub namespace_isolation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_namespaces: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_indicator_file: Option<String>,
    #[serde(rename = "type", default = "default_plugin_type")]
    pub plugin_type: String,

    #[serde(default = "default_cni_config_dir", skip_serializing)]
    pub cni_config_dir: String,
    #[serde(default = "default_socket_dir", skip_serializing)]
    pub socket_dir: String,
    #[serde(default, skip_serializing)]
    pub multus_autoconfig_dir: Option<String>,
    #[serde(default, skip_serializing)]
    pub multus_master_cni: Option<String>,
    // destination of the derived config; defaults to the reserved name
    // inside cni_config_dir
    #[serde(default, skip_serializing)]
    pub multus_config_file: Option<String>,
    #[serde(default, skip_serializing)]
    pub force_cni_version: bool,
    #[serde(default, skip_serializing)]
    pub override_network_name: bool,
}

fn default_network_name() -> String {
    DEFAULT_NETWORK_NAME.to_string()
}

fn default_plugin_type() -> String {
    SHIM_PLUGIN_TYPE.to_string()
}

fn default_cni_config_dir() -> String {
    "/etc/cni/net.d".to_string()
}

fn default_socket_dir() -> String {
    DEFAULT_SOCKET_DIR.to_string()
}

impl MultusConf {
    pub fn parse(raw: &str) -> Result<Self> {
        let conf: Self =
            serde_json::from_str(raw).context("malformed daemon configuration JSON")?;
        parse_version(&conf.cni_version)
            .with_context(|| format!("bad cniVersion {:?} in daemon configuration", conf.cni_version))?;
        Ok(conf)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read daemon configuration {}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn set_capabilities(&mut self, capabilities: BTreeMap<String, bool>) {
        self.capabilities = capabilities.into_iter().filter(|(_, on)| *on).collect();
    }

    pub fn serialize(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize the derived CNI configuration")
    }
}

// partial view of the primary CNI config, conf or conflist
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryConf {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub capabilities: Option<BTreeMap<String, bool>>,
    #[serde(default)]
    pub plugins: Option<Vec<PluginEntry>>,
}

#[derive(Debug, Deserialize)]
pub struct PluginEntry {
    #[serde(default)]
    pub capabilities: Option<BTreeMap<String, bool>>,
}

impl PrimaryConf {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("malformed primary CNI configuration")
    }

    // top-level map when present, otherwise the union across the
    // conflist entries; only enabled capabilities are reported
    pub fn enabled_capabilities(&self) -> BTreeMap<String, bool> {
        let mut merged = BTreeMap::new();

        match (&self.capabilities, &self.plugins) {
            (Some(caps), _) => merged.extend(caps.clone()),
            (None, Some(plugins)) => {
                for entry in plugins {
                    if let Some(caps) = &entry.capabilities {
                        for (name, on) in caps {
                            if *on {
                                merged.insert(name.clone(), true);
                            }
                        }
                    }
                }
            }
            (None, None) => {}
        }

        merged.retain(|_, on| *on);
        merged
    }
}

// a derived config of 0.4.0 or newer cannot delegate to a primary plugin
// speaking an older CNI dialect; below the gate the primary's version is
// not even looked at
pub fn check_version_compatibility(derived: &str, primary: &str) -> Result<()> {
    const GATE: (u32, u32, u32) = (0, 4, 0);

    let derived_v = parse_version(derived)
        .with_context(|| format!("bad cniVersion {derived:?} in the derived config"))?;
    if derived_v < GATE {
        return Ok(());
    }

    let primary_v = parse_version(primary)
        .with_context(|| format!("bad cniVersion {primary:?} in the primary config"))?;
    if primary_v < GATE {
        bail!(DaemonError::VersionIncompatible {
            derived: derived.to_string(),
            primary: primary.to_string(),
        });
    }

    Ok(())
}

fn parse_version(version: &str) -> Result<(u32, u32, u32)> {
    let mut parts = version.split('.');
    let mut next = || -> Result<u32> {
        match parts.next() {
            Some(p) => p.parse().with_context(|| format!("bad version component {p:?}")),
            None => Ok(0),
        }
    };

    let parsed = (next()?, next()?, next()?);
    if parts.next().is_some() {
        bail!("version {version:?} has too many components");
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_conf(cni_version: &str) -> MultusConf {
        MultusConf::parse(&format!(r#"{{"cniVersion":"{cni_version}"}}"#)).unwrap()
    }

    #[test]
    fn defaults_fill_name_and_type() {
        let conf = minimal_conf("0.4.0");
        assert_eq!(conf.name, "multus-cni-network");
        assert_eq!(conf.plugin_type, "multus-shim");
        assert_eq!(conf.cni_config_dir, "/etc/cni/net.d");
    }

    #[test]
    fn serializes_in_schema_order_with_empty_fields_dropped() {
        let mut conf = minimal_conf("0.4.0");
        conf.cluster_network = "/etc/cni/net.d/10-ovn.conf".to_string();

        assert_eq!(
            conf.serialize().unwrap(),
            r#"{"cniVersion":"0.4.0","name":"multus-cni-network","clusterNetwork":"/etc/cni/net.d/10-ovn.conf","type":"multus-shim"}"#
        );
    }

    #[test]
    fn serialization_is_idempotent() {
        let mut conf = minimal_conf("1.0.0");
        conf.cluster_network = "/etc/cni/net.d/10-calico.conflist".to_string();
        conf.set_capabilities(BTreeMap::from([("portMappings".to_string(), true)]));

        assert_eq!(conf.serialize().unwrap(), conf.serialize().unwrap());
    }

    #[test]
    fn disabled_capabilities_are_dropped() {
        let primary = PrimaryConf::parse(
            r#"{"cniVersion":"0.4.0","capabilities":{"portMappings":true,"tuning":false}}"#,
        )
        .unwrap();

        let caps = primary.enabled_capabilities();
        assert_eq!(caps, BTreeMap::from([("portMappings".to_string(), true)]));
    }

    #[test]
    fn conflist_capabilities_union_across_entries() {
        let primary = PrimaryConf::parse(
            r#"{
                "cniVersion": "0.4.0",
                "name": "net",
                "plugins": [
                    {"type": "bridge", "capabilities": {"portMappings": true}},
                    {"type": "tuning", "capabilities": {"mac": true, "ips": false}},
                    {"type": "portmap"}
                ]
            }"#,
        )
        .unwrap();

        let caps = primary.enabled_capabilities();
        assert_eq!(
            caps,
            BTreeMap::from([
                ("portMappings".to_string(), true),
                ("mac".to_string(), true)
            ])
        );
    }

    #[test]
    fn version_gate_rejects_old_primary() {
        let err = check_version_compatibility("0.4.0", "0.3.0").unwrap_err();
        assert!(err.to_string().contains("version incompatibility"));
    }

    #[test]
    fn version_gate_accepts_new_enough_primary() {
        check_version_compatibility("0.4.0", "0.4.0").unwrap();
        check_version_compatibility("1.0.0", "1.1.0").unwrap();
        // an old derived config is not gated at all
        check_version_compatibility("0.3.1", "0.3.0").unwrap();
    }

    #[test]
    fn bad_versions_are_rejected() {
        assert!(check_version_compatibility("0.4.0", "banana").is_err());
        assert!(check_version_compatibility("0.4.0", "").is_err());
        assert!(MultusConf::parse(r#"{"cniVersion":"1.0.0.0.0"}"#).is_err());
    }

    #[test]
    fn old_derived_ignores_the_primary_version_entirely() {
        check_version_compatibility("0.3.1", "").unwrap();
        check_version_compatibility("0.3.0", "banana").unwrap();
    }
}
