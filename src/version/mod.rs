//! CNI protocol version handling.
//!
//! Versions are compared as semantic versions; `x.y` is accepted and read as
//! `x.y.0`, matching what runtimes have historically sent.

use semver::Version;
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::error::{CniError, Result};

/// Version this plugin speaks natively.
pub const CURRENT_VERSION: &str = "1.0.0";

/// Every version the plugin can answer, in declared order.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.1.0", "0.2.0", "0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// CHECK did not exist before this version.
pub const CHECK_MIN_VERSION: &str = "0.4.0";

/// Version assumed when a configuration omits `cniVersion`.
pub const IMPLICIT_CONFIG_VERSION: &str = "0.1.0";

/// Descriptor returned by the VERSION command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(rename = "supportedVersions")]
    pub supported_versions: Vec<String>,
}

impl PluginInfo {
    pub fn new(versions: &[&str]) -> Self {
        Self {
            cni_version: CURRENT_VERSION.to_string(),
            supported_versions: versions.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// All versions this plugin supports
    pub fn all() -> Self {
        Self::new(SUPPORTED_VERSIONS)
    }

    pub fn supported_versions(&self) -> &[String] {
        &self.supported_versions
    }

    pub fn supports(&self, version: &str) -> bool {
        self.supported_versions.iter().any(|v| v == version)
    }

    pub fn encode(&self, out: &mut dyn Write) -> Result<()> {
        let json = serde_json::to_string(self)
            .map_err(|err| CniError::Io(format!("failed to encode version info: {err}")))?;
        writeln!(out, "{}", json)?;
        Ok(())
    }
}

/// Parse a CNI version string.
pub fn parse_version(version: &str) -> Result<Version> {
    let trimmed = version.trim();
    let normalized = match trimmed.split('.').count() {
        2 => format!("{trimmed}.0"),
        _ => trimmed.to_string(),
    };
    Version::parse(&normalized)
        .map_err(|err| CniError::Decoding(format!("failed to parse version {version:?}: {err}")))
}

pub fn greater_than_or_equal_to(version: &str, other: &str) -> Result<bool> {
    Ok(parse_version(version)? >= parse_version(other)?)
}

#[derive(Deserialize)]
struct VersionProbe {
    #[serde(default, rename = "cniVersion")]
    cni_version: String,
}

/// Extract the declared `cniVersion` from a raw configuration.
pub fn decode_config_version(stdin_data: &[u8]) -> Result<String> {
    let probe: VersionProbe = serde_json::from_slice(stdin_data)
        .map_err(|err| CniError::Decoding(format!("decoding version from network config: {err}")))?;
    if probe.cni_version.is_empty() {
        return Ok(IMPLICIT_CONFIG_VERSION.to_string());
    }
    Ok(probe.cni_version)
}

/// Check that the configuration's version is one the plugin supports.
pub fn reconcile(config_version: &str, info: &PluginInfo) -> Result<()> {
    if info.supports(config_version) {
        return Ok(());
    }
    Err(CniError::version(
        "incompatible CNI versions",
        format!(
            "config is {:?}, plugin supports {:?}",
            config_version,
            info.supported_versions()
        ),
    ))
}
