use ipnetwork::IpNetwork;
use serde::Deserialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::process::{Command, Output};
use tracing::debug;

use super::netns::with_netns;
use super::netops::{NetworkOps, RouteSpec};
use crate::error::{CniError, Result};

/// [`NetworkOps`] backed by the iproute2 `ip` tool and `/proc/sys`
#[derive(Debug, Clone)]
pub struct IpRoute2 {
    binary: String,
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self {
            binary: "ip".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    local: String,
    prefixlen: u8,
}

#[derive(Debug, Deserialize)]
struct LinkAddrs {
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

impl IpRoute2 {
    pub fn new() -> Self {
        Self::default()
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        debug!("{} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|err| CniError::Namespace(format!("failed to execute {}: {err}", self.binary)))
    }

    fn run_checked(&self, args: &[&str], what: &str) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(CniError::Namespace(format!(
                "{what}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }

    fn family_flag(address: &IpNetwork) -> &'static str {
        match address {
            IpNetwork::V4(_) => "-4",
            IpNetwork::V6(_) => "-6",
        }
    }
}

impl NetworkOps for IpRoute2 {
    fn in_netns(&self, netns: &str, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        with_netns(netns, f)
    }

    fn create_veth(&self, name: &str, peer: &str, mtu: u32) -> Result<()> {
        let mtu = mtu.to_string();
        self.run_checked(
            &[
                "link", "add", name, "mtu", &mtu, "type", "veth", "peer", "name", peer, "mtu", &mtu,
            ],
            &format!("failed to create veth pair {name}/{peer}"),
        )?;
        Ok(())
    }

    fn move_to_netns(&self, link: &str, netns: &str) -> Result<()> {
        self.run_checked(
            &["link", "set", "dev", link, "netns", netns],
            &format!("failed to move {link} into {netns}"),
        )?;
        Ok(())
    }

    fn rename_link(&self, from: &str, to: &str) -> Result<()> {
        self.run_checked(
            &["link", "set", "dev", from, "name", to],
            &format!("failed to rename {from} to {to}"),
        )?;
        Ok(())
    }

    fn set_mac(&self, link: &str, mac: &str) -> Result<()> {
        self.run_checked(
            &["link", "set", "dev", link, "address", mac],
            &format!("failed to set MAC {mac} on {link}"),
        )?;
        Ok(())
    }

    fn set_mtu(&self, link: &str, mtu: u32) -> Result<()> {
        self.run_checked(
            &["link", "set", "dev", link, "mtu", &mtu.to_string()],
            &format!("failed to set MTU {mtu} on {link}"),
        )?;
        Ok(())
    }

    fn set_up(&self, link: &str) -> Result<()> {
        self.run_checked(
            &["link", "set", "dev", link, "up"],
            &format!("failed to set {link} up"),
        )?;
        Ok(())
    }

    fn add_address(&self, link: &str, address: &IpNetwork) -> Result<()> {
        let address_str = address.to_string();
        self.run_checked(
            &[Self::family_flag(address), "addr", "add", &address_str, "dev", link],
            &format!("failed to add {address} to {link}"),
        )?;
        Ok(())
    }

    fn add_route(&self, route: &RouteSpec) -> Result<()> {
        let dst = route.dst.to_string();
        let via = route.via.map(|gw| gw.to_string());
        let mut args = vec![Self::family_flag(&route.dst), "route", "add", dst.as_str()];
        if let Some(via) = via.as_deref() {
            args.extend(["via", via]);
        }
        args.extend(["dev", route.dev.as_str()]);
        if route.scope_link {
            args.extend(["scope", "link"]);
        }
        if route.onlink {
            args.push("onlink");
        }
        self.run_checked(&args, &format!("failed to add route to {dst} via {}", route.dev))?;
        Ok(())
    }

    fn link_exists(&self, link: &str) -> Result<bool> {
        Ok(self.run(&["link", "show", "dev", link])?.status.success())
    }

    fn link_addresses(&self, link: &str) -> Result<Vec<IpNetwork>> {
        let output = self.run_checked(
            &["-j", "addr", "show", "dev", link],
            &format!("failed to list addresses of {link}"),
        )?;
        let links: Vec<LinkAddrs> = serde_json::from_slice(&output.stdout)
            .map_err(|err| CniError::Namespace(format!("failed to parse ip addr output: {err}")))?;
        links
            .into_iter()
            .flat_map(|l| l.addr_info)
            .map(|info| {
                let ip = info.local.parse().map_err(|err| {
                    CniError::Namespace(format!("ip reported invalid address {:?}: {err}", info.local))
                })?;
                IpNetwork::new(ip, info.prefixlen)
                    .map_err(|err| CniError::Namespace(format!("ip reported invalid prefix: {err}")))
            })
            .collect()
    }

    fn delete_link(&self, link: &str) -> Result<bool> {
        if !self.link_exists(link)? {
            return Ok(false);
        }
        self.run_checked(&["link", "delete", link], &format!("failed to delete {link}"))?;
        Ok(true)
    }

    fn write_sysctl(&self, path: &str, value: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|err| CniError::Namespace(format!("failed to open {path}: {err}")))?;
        file.write_all(value.as_bytes())
            .map_err(|err| CniError::Namespace(format!("failed to write {path}: {err}")))?;
        Ok(())
    }
}
