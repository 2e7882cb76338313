use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{CniError, Result};

/// Mode used when the network configuration does not name one.
pub const DEFAULT_MODE: &str = "host-gw";

/// Version assumed for results when the configuration omits `cniVersion`.
pub const DEFAULT_RESULT_VERSION: &str = "0.3.0";

pub const DEFAULT_SETTINGS_PATH: &str = "/etc/tinycni/tinycni.json";
pub const SETTINGS_PATH_ENV: &str = "TINYCNI_CONFIG";
pub const NODE_NAME_ENV: &str = "NODE_NAME";

/// Longest interface name the kernel accepts (IFNAMSIZ minus the NUL).
pub const MAX_IFNAME_LEN: usize = libc::IFNAMSIZ - 1;

static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.\-]*$").expect("static name pattern compiles")
});

/// Host-wide settings for the plugin binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginSettings {
    /// Directory backing the shared address pool store
    pub store_dir: PathBuf,
    /// Append logs here instead of stderr
    pub log_file: Option<PathBuf>,
    /// Default log filter when RUST_LOG is unset
    pub log_level: String,
    /// Name of this node in the shared store
    pub node_name: Option<String>,
    /// MTU used when the network configuration has none
    pub mtu: u32,
    /// Kubeconfig used for pod metadata lookups; in-cluster config otherwise
    pub kubeconfig: Option<PathBuf>,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("/var/lib/tinycni/store"),
            log_file: None,
            log_level: "info".to_string(),
            node_name: None,
            mtu: 1500,
            kubeconfig: None,
        }
    }
}

impl PluginSettings {
    /// Load settings from `$TINYCNI_CONFIG` or the default path. A missing
    /// file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = env::var_os(SETTINGS_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH));
        let mut settings = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        if let Ok(node_name) = env::var(NODE_NAME_ENV) {
            if !node_name.is_empty() {
                settings.node_name = Some(node_name);
            }
        }
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|err| {
            CniError::Config(format!("failed to read settings {}: {err}", path.display()))
        })?;
        serde_json::from_slice(&bytes).map_err(|err| {
            CniError::Config(format!("failed to parse settings {}: {err}", path.display()))
        })
    }

    /// Configured node name, falling back to the host name.
    pub fn resolve_node_name(&self) -> Result<String> {
        if let Some(name) = self.node_name.as_ref().filter(|n| !n.is_empty()) {
            return Ok(name.clone());
        }
        let hostname = nix::unistd::gethostname()
            .map_err(|err| CniError::Internal(format!("failed to read host name: {err}")))?;
        Ok(hostname.to_string_lossy().into_owned())
    }
}

/// Address entry inside the IPAM section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpamAddress {
    #[serde(default)]
    pub address: String,
}

/// IPAM (IP Address Management) configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IPAMConfig {
    /// Type of IPAM plugin
    #[serde(rename = "type")]
    pub ipam_type: String,
    /// Subnet CIDR
    pub subnet: String,
    #[serde(rename = "rangeStart")]
    pub range_start: String,
    #[serde(rename = "rangeEnd")]
    pub range_end: String,
    /// Gateway IP
    pub gateway: String,
    pub addresses: Vec<IpamAddress>,
    /// Routes, passed through untouched
    pub routes: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    #[serde(rename = "testConfig")]
    pub test_config: HashMap<String, serde_json::Value>,
}

/// Network configuration delivered on stdin
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Name of the network
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// IPAM configuration
    pub ipam: Option<IPAMConfig>,
    #[serde(rename = "runtimeConfig")]
    pub runtime_config: Option<RuntimeConfig>,
    pub bridge: String,
    pub subnet: String,
    /// Network mode; empty means the default mode
    pub mode: String,
    /// Interface MTU
    pub mtu: Option<u32>,
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| CniError::Decoding(format!("failed to parse network configuration: {err}")))
    }

    /// Mode and result version with defaults applied
    pub fn base_info(&self) -> (String, String) {
        let mode = if self.mode.is_empty() {
            DEFAULT_MODE.to_string()
        } else {
            self.mode.clone()
        };
        let cni_version = if self.cni_version.is_empty() {
            DEFAULT_RESULT_VERSION.to_string()
        } else {
            self.cni_version.clone()
        };
        (mode, cni_version)
    }

    /// Create a default configuration for a network
    pub fn new_default(name: &str, mode: &str, mtu: Option<u32>) -> Self {
        Self {
            cni_version: crate::version::CURRENT_VERSION.to_string(),
            name: name.to_string(),
            plugin_type: "tinycni".to_string(),
            mode: mode.to_string(),
            mtu,
            ..Self::default()
        }
    }
}

#[derive(Deserialize)]
struct NameProbe {
    #[serde(default)]
    name: String,
}

/// Check that a raw configuration decodes and carries a valid network name.
pub fn validate_config(stdin_data: &[u8]) -> Result<()> {
    let probe: NameProbe = serde_json::from_slice(stdin_data)
        .map_err(|err| CniError::Decoding(format!("error unmarshalling network config: {err}")))?;
    if probe.name.is_empty() {
        return Err(CniError::Config("missing network name".to_string()));
    }
    validate_network_name(&probe.name)
}

pub fn validate_network_name(name: &str) -> Result<()> {
    if !NAME_PATTERN.is_match(name) {
        return Err(CniError::Config(format!(
            "invalid characters found in network name {name:?}"
        )));
    }
    Ok(())
}

pub fn validate_container_id(container_id: &str) -> Result<()> {
    if container_id.is_empty() {
        return Err(CniError::Environment("missing containerID".to_string()));
    }
    if !NAME_PATTERN.is_match(container_id) {
        return Err(CniError::Environment(format!(
            "invalid characters in containerID {container_id:?}"
        )));
    }
    Ok(())
}

pub fn validate_interface_name(ifname: &str) -> Result<()> {
    if ifname.is_empty() {
        return Err(CniError::Environment("interface name is empty".to_string()));
    }
    if ifname.len() > MAX_IFNAME_LEN {
        return Err(CniError::Environment(format!(
            "interface name is too long: {ifname:?} exceeds {MAX_IFNAME_LEN} bytes"
        )));
    }
    if ifname == "." || ifname == ".." {
        return Err(CniError::Environment(format!(
            "interface name is . or ..: {ifname:?}"
        )));
    }
    if ifname.chars().any(|c| c == '/' || c == ':' || c.is_whitespace()) {
        return Err(CniError::Environment(format!(
            "interface name contains / or : or whitespace characters: {ifname:?}"
        )));
    }
    debug!(ifname, "interface name accepted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_name_must_be_present() {
        assert!(matches!(validate_config(br#"{"name":""}"#), Err(CniError::Config(_))));
        assert!(validate_config(br#"{"name":"net1"}"#).is_ok());
        assert!(matches!(validate_config(b"{"), Err(CniError::Decoding(_))));
        assert!(validate_config(br#"{"name":"-bad"}"#).is_err());
    }

    #[test]
    fn interface_names() {
        assert!(validate_interface_name("eth0").is_ok());
        assert!(validate_interface_name("").is_err());
        assert!(validate_interface_name("..").is_err());
        assert!(validate_interface_name("eth 0").is_err());
        assert!(validate_interface_name("a/b").is_err());
        assert!(validate_interface_name("abcdefghijklmnop").is_err());
    }

    #[test]
    fn base_info_defaults() {
        let conf = NetConf::parse(br#"{"name":"n"}"#).unwrap();
        assert_eq!(conf.base_info(), ("host-gw".to_string(), "0.3.0".to_string()));

        let conf = NetConf::parse(br#"{"name":"n","mode":"other","cniVersion":"1.0.0"}"#).unwrap();
        assert_eq!(conf.base_info(), ("other".to_string(), "1.0.0".to_string()));
    }

    #[test]
    fn full_config_parses() {
        let conf = NetConf::parse(
            br#"{
                "cniVersion": "0.4.0",
                "name": "pods",
                "type": "tinycni",
                "ipam": {"type": "tinycni", "subnet": "10.1.0.0/24", "addresses": [{"address": "10.1.0.9/24"}], "routes": [{"dst": "0.0.0.0/0"}]},
                "runtimeConfig": {"testConfig": {"k": 1}},
                "bridge": "cni0",
                "subnet": "10.1.0.0/24",
                "mtu": 1450
            }"#,
        )
        .unwrap();
        let ipam = conf.ipam.as_ref().unwrap();
        assert_eq!(ipam.addresses[0].address, "10.1.0.9/24");
        assert!(ipam.routes.is_some());
        assert_eq!(conf.runtime_config.unwrap().test_config["k"], 1);
        assert_eq!(conf.mtu, Some(1450));
    }
}
