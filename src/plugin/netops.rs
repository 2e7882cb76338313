use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{CniError, Result};

/// Route to install
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    pub dst: IpNetwork,
    pub via: Option<IpAddr>,
    pub dev: String,
    /// Gateway is reachable on the link even outside the interface's prefix
    pub onlink: bool,
    /// `scope link` route straight out of `dev`
    pub scope_link: bool,
}

impl RouteSpec {
    /// Default route for the family of `gateway`, out of `dev`.
    pub fn default_via(gateway: IpAddr, dev: &str) -> Result<Self> {
        let any = match gateway {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let dst = IpNetwork::new(any, 0)
            .map_err(|err| CniError::Internal(format!("building default route: {err}")))?;
        Ok(Self {
            dst,
            via: Some(gateway),
            dev: dev.to_string(),
            onlink: true,
            scope_link: false,
        })
    }

    /// Single-address route for `ip` out of `dev`.
    pub fn host(ip: IpAddr, dev: &str) -> Result<Self> {
        let prefix = if ip.is_ipv4() { 32 } else { 128 };
        let dst = IpNetwork::new(ip, prefix)
            .map_err(|err| CniError::Internal(format!("building host route for {ip}: {err}")))?;
        Ok(Self {
            dst,
            via: None,
            dev: dev.to_string(),
            onlink: false,
            scope_link: true,
        })
    }
}

/// Kernel link, address, route and sysctl operations used by the driver.
///
/// Every method acts on whatever network namespace is current; use
/// [`NetworkOps::in_netns`] to act inside a container.
pub trait NetworkOps {
    /// Run `f` with `netns` as the current network namespace, restoring the
    /// original namespace afterwards whether or not `f` succeeds.
    fn in_netns(&self, netns: &str, f: &mut dyn FnMut() -> Result<()>) -> Result<()>;

    fn create_veth(&self, name: &str, peer: &str, mtu: u32) -> Result<()>;

    fn move_to_netns(&self, link: &str, netns: &str) -> Result<()>;

    fn rename_link(&self, from: &str, to: &str) -> Result<()>;

    fn set_mac(&self, link: &str, mac: &str) -> Result<()>;

    fn set_mtu(&self, link: &str, mtu: u32) -> Result<()>;

    fn set_up(&self, link: &str) -> Result<()>;

    fn add_address(&self, link: &str, address: &IpNetwork) -> Result<()>;

    fn add_route(&self, route: &RouteSpec) -> Result<()>;

    fn link_exists(&self, link: &str) -> Result<bool>;

    fn link_addresses(&self, link: &str) -> Result<Vec<IpNetwork>>;

    /// Returns false when the link did not exist.
    fn delete_link(&self, link: &str) -> Result<bool>;

    fn write_sysctl(&self, path: &str, value: &str) -> Result<()>;
}
