//! Host-gateway network mode.
//!
//! Each pod gets one end of a veth pair; the host end carries no address and
//! answers for the pod's gateway through proxy ARP/NDP, while a /32 (or /128)
//! host route sends return traffic straight down the pair.

use ipnetwork::IpNetwork;
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, info, warn};

pub mod iproute;
pub mod netns;
pub mod netops;
pub mod sysctl;

pub use iproute::IpRoute2;
pub use netops::{NetworkOps, RouteSpec};

use crate::config::{NetConf, MAX_IFNAME_LEN};
use crate::error::{CniError, Result};
use crate::ipam::{Allocation, Allocator};
use crate::k8s::{self, PodMetadata};
use crate::registry::CniDriver;
use crate::store::{self, FixedIp, Pod, PodEth};
use crate::types::{CmdArgs, IPConfig, Interface, Result as CniResult, Route};

pub const MODE: &str = "host-gw";

pub const HOST_VETH_PREFIX: &str = "tiny";
/// Name of the container end while it still lives in the host namespace
pub const PEER_VETH_PREFIX: &str = "tinp";
pub const HOST_VETH_MAC: &str = "ee:ee:ee:ee:ee:ee";
pub const DEFAULT_MTU: u32 = 1500;

pub const FALLBACK_GATEWAY_V4: Ipv4Addr = Ipv4Addr::new(169, 254, 1, 1);
pub const FALLBACK_GATEWAY_V6: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1);

pub const POD_NAMESPACE_ARG: &str = "K8S_POD_NAMESPACE";
pub const POD_NAME_ARG: &str = "K8S_POD_NAME";

/// Parse a legacy `K=V;K=V` argument string.
pub fn parse_cni_args(args: &str) -> Result<HashMap<String, String>> {
    let mut parsed = HashMap::new();
    if args.is_empty() {
        return Ok(parsed);
    }
    for pair in args.split(';') {
        let mut parts = pair.split('=');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(key), Some(value), None) => {
                parsed.insert(key.to_string(), value.to_string());
            }
            _ => {
                return Err(CniError::NetworkResolution(format!(
                    "ARGS: invalid pair {pair:?}"
                )))
            }
        }
    }
    Ok(parsed)
}

/// `prefix` followed by as much of `id` as fits in an interface name.
pub fn veth_name(prefix: &str, id: &str) -> String {
    let mut name = prefix.to_string();
    for c in id.chars() {
        if name.len() + c.len_utf8() > MAX_IFNAME_LEN {
            break;
        }
        name.push(c);
    }
    name
}

/// Host end of the veth pair for a container.
pub fn host_veth_name(container_id: &str) -> String {
    veth_name(HOST_VETH_PREFIX, container_id)
}

/// Random locally administered unicast MAC starting with `de`.
pub fn random_mac() -> Result<String> {
    let mut bytes = [0u8; 5];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| CniError::Internal("failed to generate random MAC address".to_string()))?;
    Ok(std::iter::once(0xde)
        .chain(bytes)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":"))
}

fn fallback_gateway(address: &IpNetwork) -> IpAddr {
    match address {
        IpNetwork::V4(_) => IpAddr::V4(FALLBACK_GATEWAY_V4),
        IpNetwork::V6(_) => IpAddr::V6(FALLBACK_GATEWAY_V6),
    }
}

/// Pod identity carried in CNI_ARGS
fn pod_identity(args: &HashMap<String, String>) -> Option<(&str, &str)> {
    let namespace = args.get(POD_NAMESPACE_ARG).filter(|v| !v.is_empty())?;
    let name = args.get(POD_NAME_ARG).filter(|v| !v.is_empty())?;
    Some((namespace.as_str(), name.as_str()))
}

/// Host-gateway driver
pub struct HostGatewayPlugin {
    /// Orchestrator lookups for the pod's network
    pods: Box<dyn PodMetadata>,
    allocator: Allocator,
    /// Kernel operations
    ops: Box<dyn NetworkOps>,
    /// MTU used when the network configuration has none
    mtu: u32,
}

impl HostGatewayPlugin {
    pub fn new(pods: Box<dyn PodMetadata>, allocator: Allocator, ops: Box<dyn NetworkOps>) -> Self {
        Self {
            pods,
            allocator,
            ops,
            mtu: DEFAULT_MTU,
        }
    }

    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    fn mtu_for(&self, conf: &NetConf) -> u32 {
        conf.mtu.filter(|mtu| *mtu > 0).unwrap_or(self.mtu)
    }

    fn load_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let record = store::get_json::<Pod>(
            self.allocator.store().as_ref(),
            &store::pod_key(namespace, name),
        )?;
        Ok(record.map(|(pod, _)| pod))
    }

    /// Give back every address recorded on `pod`.
    fn release_recorded(&self, pod: &Pod) -> Result<()> {
        for eth in &pod.pod_eths {
            for fixed in &eth.fixed_ips {
                match fixed.ipaddress.parse::<IpAddr>() {
                    Ok(ip) => {
                        self.allocator.release(&eth.network_crd, ip)?;
                    }
                    Err(err) => warn!(
                        pod = %pod.name,
                        "skipping invalid recorded address {:?}: {}",
                        fixed.ipaddress,
                        err
                    ),
                }
            }
        }
        Ok(())
    }

    fn delete_host_veth(&self, host_veth: &str) -> Result<()> {
        if self.ops.delete_link(host_veth)? {
            info!(host_veth, "deleted host veth");
        } else {
            debug!(host_veth, "host veth already gone");
        }
        Ok(())
    }

    /// Tear down everything `pod` records. Links go first and the record is
    /// removed before any address is released, so a retry after a partial
    /// failure can never release an address twice.
    fn teardown(&self, namespace: &str, name: &str, pod: &Pod) -> Result<()> {
        for eth in &pod.pod_eths {
            self.delete_host_veth(&eth.host_veth)?;
        }
        self.allocator
            .store()
            .delete(&store::pod_key(namespace, name))?;
        self.release_recorded(pod)
    }

    /// A record left behind by an earlier sandbox of the same pod would pin
    /// addresses forever, so it is cleared before allocating again.
    fn clear_stale_record(&self, args: &CmdArgs, namespace: &str, name: &str) -> Result<()> {
        let Some(stale) = self.load_pod(namespace, name)? else {
            return Ok(());
        };
        if stale.container_id == args.container_id {
            info!(pod = name, "repeated ADD for the same container, starting over");
        } else {
            warn!(
                pod = name,
                old = %stale.container_id,
                new = %args.container_id,
                "pod record belongs to an earlier sandbox, releasing its addresses"
            );
        }
        self.teardown(namespace, name, &stale)
    }

    /// Build and configure the veth pair. On failure the host end is deleted,
    /// which takes the container end with it.
    fn attach(
        &self,
        args: &CmdArgs,
        allocation: &Allocation,
        host_veth: &str,
        container_mac: &str,
        mtu: u32,
    ) -> Result<()> {
        let peer = veth_name(PEER_VETH_PREFIX, &args.container_id);
        self.ops.create_veth(host_veth, &peer, mtu)?;
        info!(host_veth, peer = %peer, "created veth pair");

        let configured = self.configure_pair(args, allocation, host_veth, &peer, container_mac, mtu);
        if let Err(err) = configured {
            if let Err(cleanup) = self.ops.delete_link(host_veth) {
                warn!(host_veth, "failed to remove veth after error: {}", cleanup);
            }
            return Err(err);
        }
        Ok(())
    }

    fn configure_pair(
        &self,
        args: &CmdArgs,
        allocation: &Allocation,
        host_veth: &str,
        peer: &str,
        container_mac: &str,
        mtu: u32,
    ) -> Result<()> {
        let gateway = allocation
            .gateway
            .unwrap_or_else(|| fallback_gateway(&allocation.address));
        let default_route = RouteSpec::default_via(gateway, &args.ifname)?;

        self.ops.move_to_netns(peer, &args.netns)?;
        self.ops.in_netns(&args.netns, &mut || {
            self.ops.rename_link(peer, &args.ifname)?;
            self.ops.set_mac(&args.ifname, container_mac)?;
            self.ops.set_mtu(&args.ifname, mtu)?;
            self.ops.add_address(&args.ifname, &allocation.address)?;
            self.ops.set_up(&args.ifname)?;
            self.ops.add_route(&default_route)
        })?;
        debug!(ifname = %args.ifname, %gateway, "configured container interface");

        self.ops.set_mac(host_veth, HOST_VETH_MAC)?;
        self.ops.set_mtu(host_veth, mtu)?;
        self.ops.set_up(host_veth)?;
        self.ops
            .add_route(&RouteSpec::host(allocation.address.ip(), host_veth)?)?;

        let is_v4 = allocation.address.is_ipv4();
        sysctl::configure_sysctls(self.ops.as_ref(), host_veth, is_v4, !is_v4)
    }

    fn bootstrap_inner(
        &self,
        args: &CmdArgs,
        conf: &NetConf,
        namespace: &str,
        name: &str,
        allocation: &Allocation,
    ) -> Result<CniResult> {
        let container_mac = random_mac()?;
        let host_veth = host_veth_name(&args.container_id);
        let mtu = self.mtu_for(conf);

        self.attach(args, allocation, &host_veth, &container_mac, mtu)?;

        let gateway = allocation
            .gateway
            .unwrap_or_else(|| fallback_gateway(&allocation.address));
        let record = Pod {
            name: name.to_string(),
            namespace: namespace.to_string(),
            container_id: args.container_id.clone(),
            node_name: self.allocator.node_name().to_string(),
            pod_eths: vec![PodEth {
                network_crd: allocation.network.clone(),
                subnet_name: allocation.subnet_name.clone(),
                mac: container_mac.clone(),
                if_name: args.ifname.clone(),
                host_veth: host_veth.clone(),
                fixed_ips: vec![FixedIp {
                    subnet_id: allocation.subnet_id.clone(),
                    ipaddress: allocation.address.ip().to_string(),
                    gateway_ip: gateway.to_string(),
                }],
            }],
        };
        let persisted = store::put_json(
            self.allocator.store().as_ref(),
            &store::pod_key(namespace, name),
            &record,
        );
        if let Err(err) = persisted {
            if let Err(cleanup) = self.ops.delete_link(&host_veth) {
                warn!(host_veth = %host_veth, "failed to remove veth after error: {}", cleanup);
            }
            return Err(err.into());
        }

        let mut result = CniResult::new(&conf.cni_version);
        result.add_interface(Interface {
            name: host_veth,
            mac: Some(HOST_VETH_MAC.to_string()),
            sandbox: None,
        });
        let container = result.add_interface(Interface {
            name: args.ifname.clone(),
            mac: Some(container_mac),
            sandbox: Some(args.netns.clone()),
        });
        result.add_ip(IPConfig {
            interface: Some(container),
            address: allocation.address.to_string(),
            gateway: Some(gateway.to_string()),
        });
        let any = if allocation.address.is_ipv4() { "0.0.0.0/0" } else { "::/0" };
        result.add_route(Route {
            dst: any.to_string(),
            gw: Some(gateway.to_string()),
        });
        Ok(result)
    }
}

impl CniDriver for HostGatewayPlugin {
    fn mode(&self) -> &str {
        MODE
    }

    fn bootstrap(&self, args: &CmdArgs, conf: &NetConf) -> Result<CniResult> {
        let cni_args = parse_cni_args(&args.args)?;
        let (namespace, name) = pod_identity(&cni_args).ok_or_else(|| {
            CniError::NetworkResolution(format!(
                "{POD_NAMESPACE_ARG} and {POD_NAME_ARG} must be set in CNI_ARGS"
            ))
        })?;
        let network = k8s::resolve_network(self.pods.as_ref(), namespace, name)?;
        info!(pod = name, namespace, %network, "attaching pod");

        self.clear_stale_record(args, namespace, name)?;
        let allocation = self.allocator.allocate(&network)?;

        match self.bootstrap_inner(args, conf, namespace, name, &allocation) {
            Ok(result) => {
                info!(pod = name, address = %allocation.address, "pod attached");
                Ok(result)
            }
            Err(err) => {
                warn!(pod = name, "attach failed, releasing {}: {}", allocation.address, err);
                if let Err(release) = self.allocator.release(&network, allocation.address.ip()) {
                    warn!(pod = name, "failed to release {}: {}", allocation.address, release);
                }
                Err(err)
            }
        }
    }

    fn unmount(&self, args: &CmdArgs, _conf: &NetConf) -> Result<()> {
        let cni_args = parse_cni_args(&args.args)?;
        let derived = host_veth_name(&args.container_id);

        if let Some((namespace, name)) = pod_identity(&cni_args) {
            match self.load_pod(namespace, name)? {
                Some(pod) if pod.container_id == args.container_id => {
                    self.teardown(namespace, name, &pod)?;
                    info!(pod = name, namespace, "pod detached");
                }
                Some(pod) => debug!(
                    pod = name,
                    owner = %pod.container_id,
                    "pod record belongs to another sandbox, leaving it alone"
                ),
                None => debug!(pod = name, namespace, "no pod record"),
            }
        }

        self.delete_host_veth(&derived)
    }

    fn check(&self, args: &CmdArgs, _conf: &NetConf) -> Result<()> {
        let cni_args = parse_cni_args(&args.args)?;
        let Some((namespace, name)) = pod_identity(&cni_args) else {
            warn!("no pod identity in CNI_ARGS, nothing to check");
            return Ok(());
        };
        let Some(pod) = self.load_pod(namespace, name)? else {
            warn!(pod = name, namespace, "no pod record, nothing to check");
            return Ok(());
        };
        let Some(eth) = pod.pod_eths.iter().find(|eth| eth.if_name == args.ifname) else {
            warn!(pod = name, ifname = %args.ifname, "interface not recorded for pod");
            return Ok(());
        };
        if !self.ops.link_exists(&eth.host_veth)? {
            warn!(pod = name, host_veth = %eth.host_veth, "host veth is missing");
            return Ok(());
        }

        let mut present = None;
        self.ops.in_netns(&args.netns, &mut || {
            present = if self.ops.link_exists(&args.ifname)? {
                Some(self.ops.link_addresses(&args.ifname)?)
            } else {
                None
            };
            Ok(())
        })?;
        let Some(addresses) = present else {
            warn!(pod = name, ifname = %args.ifname, "container interface is missing");
            return Ok(());
        };

        for fixed in &eth.fixed_ips {
            let expected: IpAddr = fixed.ipaddress.parse().map_err(|err| {
                CniError::Internal(format!(
                    "pod record carries invalid address {:?}: {err}",
                    fixed.ipaddress
                ))
            })?;
            if !addresses.iter().any(|address| address.ip() == expected) {
                return Err(CniError::Namespace(format!(
                    "{} in {} does not carry the recorded address {}",
                    args.ifname, args.netns, expected
                )));
            }
        }
        debug!(pod = name, "interface matches pod record");
        Ok(())
    }
}
