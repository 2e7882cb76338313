use ipnetwork::IpNetwork;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::warn;

use crate::error::{CniError, Result};
use crate::store::{AllocatedIp, Subnet};

/// Largest pool materialised in memory (host bits).
pub const MAX_POOL_HOST_BITS: u8 = 16;

/// Allocator-facing view of a [`Subnet`].
///
/// `free` and `allocated` partition the eligible host addresses of the CIDR
/// and are both kept sorted.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolData {
    pub name: String,
    pub id: String,
    pub cidr: IpNetwork,
    pub gateway: Option<IpAddr>,
    free: BTreeSet<IpAddr>,
    allocated: BTreeSet<IpAddr>,
}

fn offset(addr: IpAddr, by: u128) -> Option<IpAddr> {
    match addr {
        IpAddr::V4(v4) => u32::from(v4)
            .checked_add(u32::try_from(by).ok()?)
            .map(|n| IpAddr::V4(Ipv4Addr::from(n))),
        IpAddr::V6(v6) => u128::from(v6)
            .checked_add(by)
            .map(|n| IpAddr::V6(Ipv6Addr::from(n))),
    }
}

pub fn parse_cidr(cidr: &str) -> Result<IpNetwork> {
    let parsed: IpNetwork = cidr
        .parse()
        .map_err(|err| CniError::Allocation(format!("invalid subnet CIDR {cidr:?}: {err}")))?;
    // Normalise 10.0.0.7/24 to 10.0.0.0/24.
    IpNetwork::new(parsed.network(), parsed.prefix())
        .map_err(|err| CniError::Allocation(format!("invalid subnet CIDR {cidr:?}: {err}")))
}

/// Gateway of a subnet: the explicit one, else the first host address.
/// Point-to-point sized blocks have no implicit gateway.
pub fn subnet_gateway(subnet: &Subnet, cidr: &IpNetwork) -> Result<Option<IpAddr>> {
    if let Some(gateway) = subnet.gateway.as_deref().filter(|g| !g.is_empty()) {
        let gateway: IpAddr = gateway.parse().map_err(|err| {
            CniError::Allocation(format!(
                "subnet {} has invalid gateway {gateway:?}: {err}",
                subnet.name
            ))
        })?;
        if !cidr.contains(gateway) {
            return Err(CniError::Allocation(format!(
                "gateway {gateway} of subnet {} lies outside {cidr}",
                subnet.name
            )));
        }
        return Ok(Some(gateway));
    }
    let host_bits = max_prefix(cidr) - cidr.prefix();
    if host_bits < 2 {
        return Ok(None);
    }
    Ok(offset(cidr.network(), 1))
}

fn max_prefix(cidr: &IpNetwork) -> u8 {
    match cidr {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    }
}

/// Every address of `cidr` that may be handed to a pod.
pub fn eligible_addresses(cidr: &IpNetwork, gateway: Option<IpAddr>) -> Result<BTreeSet<IpAddr>> {
    let host_bits = max_prefix(cidr) - cidr.prefix();
    if host_bits > MAX_POOL_HOST_BITS {
        return Err(CniError::Allocation(format!(
            "subnet {cidr} is too large for a pool (at most /{} for this family)",
            max_prefix(cidr) - MAX_POOL_HOST_BITS
        )));
    }
    let mut excluded: Vec<IpAddr> = gateway.into_iter().collect();
    match cidr {
        IpNetwork::V4(net) if host_bits >= 2 => {
            excluded.push(IpAddr::V4(net.network()));
            excluded.push(IpAddr::V4(net.broadcast()));
        }
        IpNetwork::V6(net) if host_bits >= 1 => {
            excluded.push(IpAddr::V6(net.network()));
        }
        _ => {}
    }
    Ok(cidr.iter().filter(|ip| !excluded.contains(ip)).collect())
}

impl PoolData {
    pub fn from_subnet(subnet: &Subnet) -> Result<Self> {
        let cidr = parse_cidr(&subnet.cidr)?;
        let gateway = subnet_gateway(subnet, &cidr)?;
        let mut free = eligible_addresses(&cidr, gateway)?;
        let mut allocated = BTreeSet::new();
        for entry in &subnet.allocated_ips {
            let ip: IpAddr = entry.ip.parse().map_err(|err| {
                CniError::Allocation(format!(
                    "subnet {} records invalid address {:?}: {err}",
                    subnet.name, entry.ip
                ))
            })?;
            if free.remove(&ip) {
                allocated.insert(ip);
            } else if !allocated.contains(&ip) {
                warn!(subnet = %subnet.name, %ip, "dropping allocation outside the eligible range");
            }
        }
        Ok(Self {
            name: subnet.name.clone(),
            id: subnet.id.clone(),
            cidr,
            gateway,
            free,
            allocated,
        })
    }

    pub fn free(&self) -> impl Iterator<Item = &IpAddr> {
        self.free.iter()
    }

    pub fn allocated(&self) -> impl Iterator<Item = &IpAddr> {
        self.allocated.iter()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn is_allocated(&self, ip: &IpAddr) -> bool {
        self.allocated.contains(ip)
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.cidr.contains(*ip)
    }

    /// Move the lowest free address to the allocated set.
    pub fn take_lowest(&mut self) -> Option<IpAddr> {
        let ip = self.free.pop_first()?;
        self.allocated.insert(ip);
        Some(ip)
    }

    /// Move `ip` back to the free set. Returns false if it was not allocated.
    pub fn release(&mut self, ip: &IpAddr) -> bool {
        if !self.allocated.remove(ip) {
            return false;
        }
        self.free.insert(*ip);
        true
    }

    /// Persist the allocated set into its subnet document.
    pub fn write_back(&self, subnet: &mut Subnet) {
        subnet.allocated_ips = self
            .allocated
            .iter()
            .map(|ip| AllocatedIp { ip: ip.to_string() })
            .collect();
    }
}
