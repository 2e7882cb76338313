// Shared fakes for the integration tests. Not every test binary uses all of them.
#![allow(dead_code)]

use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tinycni::error::{CniError, Result};
use tinycni::k8s::{PodMetadata, NETWORK_ANNOTATION};
use tinycni::plugin::{NetworkOps, RouteSpec};
use tinycni::store::{self, MemoryStore, NetworkCrd, Store, Subnet};
use tinycni::types::CmdArgs;

pub const HOST: &str = "host";
pub const NETNS: &str = "/var/run/netns/test";

/// Pods known to the fake orchestrator, keyed by `namespace/name`
#[derive(Default)]
pub struct FakePods {
    pods: HashMap<String, (HashMap<String, String>, HashMap<String, String>)>,
}

impl FakePods {
    pub fn with_annotated(namespace: &str, name: &str, network: &str) -> Self {
        let mut pods = Self::default();
        pods.add(
            namespace,
            name,
            HashMap::new(),
            HashMap::from([(NETWORK_ANNOTATION.to_string(), network.to_string())]),
        );
        pods
    }

    pub fn add(
        &mut self,
        namespace: &str,
        name: &str,
        labels: HashMap<String, String>,
        annotations: HashMap<String, String>,
    ) {
        self.pods
            .insert(format!("{namespace}/{name}"), (labels, annotations));
    }
}

impl PodMetadata for FakePods {
    fn pod_labels_and_annotations(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(HashMap<String, String>, HashMap<String, String>)> {
        self.pods
            .get(&format!("{namespace}/{name}"))
            .cloned()
            .ok_or_else(|| CniError::NetworkResolution(format!("pod {namespace}/{name} not found")))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FakeLink {
    pub namespace: String,
    pub name: String,
    /// Both ends of a veth pair share this id
    pub pair: u32,
    pub mac: Option<String>,
    pub mtu: u32,
    pub up: bool,
    pub addresses: Vec<IpNetwork>,
}

#[derive(Debug, Default)]
pub struct KernelState {
    pub current: String,
    pub next_pair: u32,
    pub links: Vec<FakeLink>,
    pub routes: Vec<(String, RouteSpec)>,
    pub sysctls: Vec<(String, String)>,
    /// Operation that fails when invoked
    pub fail_on: Option<&'static str>,
    /// Sysctl whose write fails, matched on the last path component
    pub failing_sysctl: Option<&'static str>,
}

impl KernelState {
    fn link_mut(&mut self, name: &str) -> Result<&mut FakeLink> {
        let current = self.current.clone();
        self.links
            .iter_mut()
            .find(|l| l.namespace == current && l.name == name)
            .ok_or_else(|| CniError::Namespace(format!("link {name} not found in {current}")))
    }

    pub fn find(&self, namespace: &str, name: &str) -> Option<&FakeLink> {
        self.links
            .iter()
            .find(|l| l.namespace == namespace && l.name == name)
    }
}

/// Records kernel operations instead of performing them
#[derive(Debug, Clone)]
pub struct FakeKernel {
    pub state: Arc<Mutex<KernelState>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(KernelState {
                current: HOST.to_string(),
                ..KernelState::default()
            })),
        }
    }

    pub fn failing_on(op: &'static str) -> Self {
        let kernel = Self::new();
        kernel.state.lock().unwrap().fail_on = Some(op);
        kernel
    }

    pub fn failing_sysctl(name: &'static str) -> Self {
        let kernel = Self::new();
        kernel.state.lock().unwrap().failing_sysctl = Some(name);
        kernel
    }

    /// Change the injected failure of a running kernel.
    pub fn fail_on(&self, op: Option<&'static str>) {
        self.state.lock().unwrap().fail_on = op;
    }

    fn enter(&self, op: &str) -> Result<std::sync::MutexGuard<'_, KernelState>> {
        let state = self.state.lock().unwrap();
        if state.fail_on == Some(op) {
            return Err(CniError::Namespace(format!("injected {op} failure")));
        }
        Ok(state)
    }
}

impl NetworkOps for FakeKernel {
    fn in_netns(&self, netns: &str, f: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let original = {
            let mut state = self.enter("in_netns")?;
            std::mem::replace(&mut state.current, netns.to_string())
        };
        let outcome = f();
        self.state.lock().unwrap().current = original;
        outcome
    }

    fn create_veth(&self, name: &str, peer: &str, mtu: u32) -> Result<()> {
        let mut state = self.enter("create_veth")?;
        let pair = state.next_pair;
        state.next_pair += 1;
        let namespace = state.current.clone();
        for end in [name, peer] {
            if state.find(&namespace, end).is_some() {
                return Err(CniError::Namespace(format!("{end} already exists")));
            }
            state.links.push(FakeLink {
                namespace: namespace.clone(),
                name: end.to_string(),
                pair,
                mac: None,
                mtu,
                up: false,
                addresses: Vec::new(),
            });
        }
        Ok(())
    }

    fn move_to_netns(&self, link: &str, netns: &str) -> Result<()> {
        let mut state = self.enter("move_to_netns")?;
        state.link_mut(link)?.namespace = netns.to_string();
        Ok(())
    }

    fn rename_link(&self, from: &str, to: &str) -> Result<()> {
        let mut state = self.enter("rename_link")?;
        state.link_mut(from)?.name = to.to_string();
        Ok(())
    }

    fn set_mac(&self, link: &str, mac: &str) -> Result<()> {
        let mut state = self.enter("set_mac")?;
        state.link_mut(link)?.mac = Some(mac.to_string());
        Ok(())
    }

    fn set_mtu(&self, link: &str, mtu: u32) -> Result<()> {
        let mut state = self.enter("set_mtu")?;
        state.link_mut(link)?.mtu = mtu;
        Ok(())
    }

    fn set_up(&self, link: &str) -> Result<()> {
        let mut state = self.enter("set_up")?;
        state.link_mut(link)?.up = true;
        Ok(())
    }

    fn add_address(&self, link: &str, address: &IpNetwork) -> Result<()> {
        let mut state = self.enter("add_address")?;
        state.link_mut(link)?.addresses.push(*address);
        Ok(())
    }

    fn add_route(&self, route: &RouteSpec) -> Result<()> {
        let mut state = self.enter("add_route")?;
        state.link_mut(&route.dev)?;
        let current = state.current.clone();
        state.routes.push((current, route.clone()));
        Ok(())
    }

    fn link_exists(&self, link: &str) -> Result<bool> {
        let mut state = self.enter("link_exists")?;
        Ok(state.link_mut(link).is_ok())
    }

    fn link_addresses(&self, link: &str) -> Result<Vec<IpNetwork>> {
        let mut state = self.enter("link_addresses")?;
        Ok(state.link_mut(link)?.addresses.clone())
    }

    fn delete_link(&self, link: &str) -> Result<bool> {
        let mut state = self.enter("delete_link")?;
        let Ok(pair) = state.link_mut(link).map(|l| l.pair) else {
            return Ok(false);
        };
        state.links.retain(|l| l.pair != pair);
        state.routes.retain(|(_, route)| route.dev != link);
        Ok(true)
    }

    fn write_sysctl(&self, path: &str, value: &str) -> Result<()> {
        let mut state = self.enter("write_sysctl")?;
        if state
            .failing_sysctl
            .is_some_and(|name| path.rsplit('/').next() == Some(name))
        {
            return Err(CniError::Namespace(format!("injected failure writing {path}")));
        }
        state.sysctls.push((path.to_string(), value.to_string()));
        Ok(())
    }
}

pub fn subnet(name: &str, cidr: &str) -> Subnet {
    Subnet {
        name: name.to_string(),
        id: format!("{name}-id"),
        cidr: cidr.to_string(),
        gateway: None,
        allocated_ips: Vec::new(),
    }
}

/// Memory store holding one network made of `subnets`.
pub fn store_with_network(network: &str, subnets: Vec<Subnet>) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let crd = NetworkCrd {
        name: network.to_string(),
        subnets,
    };
    store::put_json(&*store, &store::network_key(network), &crd).unwrap();
    store
}

pub fn network(store: &dyn Store, name: &str) -> NetworkCrd {
    store::get_json::<NetworkCrd>(store, &store::network_key(name))
        .unwrap()
        .map(|(crd, _)| crd)
        .unwrap()
}

pub fn pod_args(container_id: &str, namespace: &str, pod: &str, config: &str) -> CmdArgs {
    CmdArgs {
        container_id: container_id.to_string(),
        netns: NETNS.to_string(),
        ifname: "eth0".to_string(),
        args: format!("IgnoreUnknown=1;K8S_POD_NAMESPACE={namespace};K8S_POD_NAME={pod}"),
        path: "/opt/cni/bin".to_string(),
        stdin_data: config.as_bytes().to_vec(),
    }
}
