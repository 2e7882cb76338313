use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::IpAddr;

use crate::error::{CniError, Result as PluginResult};
use crate::version;

/// CNI command arguments
#[derive(Debug, Clone, Default)]
pub struct CmdArgs {
    /// Container ID
    pub container_id: String,
    /// Network namespace path
    pub netns: String,
    /// Interface name
    pub ifname: String,
    /// Legacy `K=V;K=V` argument string from CNI_ARGS
    pub args: String,
    /// Plugin search path
    pub path: String,
    /// Standard input data
    pub stdin_data: Vec<u8>,
}

/// Current result format (CNI 1.0.0)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Result {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Interfaces created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,
    /// IP configurations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<IPConfig>>,
    /// Routes to configure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<Route>>,
}

/// Interface information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,
    /// MAC address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Sandbox path (network namespace)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// IP configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IPConfig {
    /// Interface index this IP is assigned to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// IP address with prefix length
    pub address: String,
    /// Gateway
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// Route configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR
    pub dst: String,
    /// Gateway for this route
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

/// `ips` entry as encoded for 0.3.x and 0.4.0 consumers
#[derive(Debug, Serialize)]
struct VersionedIPConfig<'a> {
    version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    interface: Option<usize>,
    address: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Result040<'a> {
    #[serde(rename = "cniVersion")]
    cni_version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    interfaces: Option<&'a Vec<Interface>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ips: Option<Vec<VersionedIPConfig<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    routes: Option<&'a Vec<Route>>,
}

#[derive(Debug, Serialize)]
struct LegacyIP<'a> {
    ip: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    routes: Option<&'a Vec<Route>>,
}

/// 0.1.0 / 0.2.0 results carry at most one address per family
#[derive(Debug, Serialize)]
struct Result020<'a> {
    #[serde(rename = "cniVersion")]
    cni_version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip4: Option<LegacyIP<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip6: Option<LegacyIP<'a>>,
}

fn address_family(address: &str) -> PluginResult<&'static str> {
    let ip = address.split('/').next().unwrap_or_default();
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => Ok("4"),
        Ok(IpAddr::V6(_)) => Ok("6"),
        Err(err) => Err(CniError::Internal(format!(
            "result carries invalid address {address}: {err}"
        ))),
    }
}

impl Result {
    /// Create a new empty result
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            interfaces: None,
            ips: None,
            routes: None,
        }
    }

    /// Add an interface to the result, returning its index
    pub fn add_interface(&mut self, interface: Interface) -> usize {
        let interfaces = self.interfaces.get_or_insert_with(Vec::new);
        interfaces.push(interface);
        interfaces.len() - 1
    }

    /// Add an IP configuration to the result
    pub fn add_ip(&mut self, ip: IPConfig) {
        self.ips.get_or_insert_with(Vec::new).push(ip);
    }

    /// Add a route to the result
    pub fn add_route(&mut self, route: Route) {
        self.routes.get_or_insert_with(Vec::new).push(route);
    }

    /// Encode the result in the layout expected by a `cni_version` consumer.
    pub fn to_version(&self, cni_version: &str) -> PluginResult<serde_json::Value> {
        let parsed = version::parse_version(cni_version)?;
        let value = if parsed.major >= 1 {
            let mut current = self.clone();
            current.cni_version = cni_version.to_string();
            serde_json::to_value(&current)
        } else if parsed.minor >= 3 {
            let ips = match &self.ips {
                Some(ips) => Some(
                    ips.iter()
                        .map(|ip| {
                            Ok(VersionedIPConfig {
                                version: address_family(&ip.address)?,
                                interface: ip.interface,
                                address: &ip.address,
                                gateway: ip.gateway.as_deref(),
                            })
                        })
                        .collect::<PluginResult<Vec<_>>>()?,
                ),
                None => None,
            };
            serde_json::to_value(Result040 {
                cni_version,
                interfaces: self.interfaces.as_ref(),
                ips,
                routes: self.routes.as_ref(),
            })
        } else {
            let mut legacy = Result020 {
                cni_version,
                ip4: None,
                ip6: None,
            };
            for ip in self.ips.iter().flatten() {
                let slot = match address_family(&ip.address)? {
                    "4" => &mut legacy.ip4,
                    _ => &mut legacy.ip6,
                };
                if slot.is_none() {
                    *slot = Some(LegacyIP {
                        ip: &ip.address,
                        gateway: ip.gateway.as_deref(),
                        routes: self.routes.as_ref(),
                    });
                }
            }
            serde_json::to_value(legacy)
        };
        value.map_err(|err| CniError::Internal(format!("failed to encode result: {err}")))
    }

    /// Print result as JSON at the given version
    pub fn print_as(&self, cni_version: &str, out: &mut dyn Write) -> PluginResult<()> {
        let value = self.to_version(cni_version)?;
        let json = serde_json::to_string_pretty(&value)
            .map_err(|err| CniError::Internal(format!("failed to encode result: {err}")))?;
        writeln!(out, "{}", json)?;
        Ok(())
    }
}

/// Error document written to stdout when an invocation fails
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDocument {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl ErrorDocument {
    pub fn from_error(err: &CniError) -> Self {
        Self {
            cni_version: version::CURRENT_VERSION.to_string(),
            code: err.code(),
            msg: err.to_string(),
            details: err.details(),
        }
    }

    pub fn print(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let json = serde_json::to_string(self)?;
        writeln!(out, "{}", json)
    }
}
