//! Exclusive address allocation against the shared pool.
//!
//! The in-process mutex only serialises threads of one plugin process. What
//! keeps two *processes* from handing out the same address is that every pool
//! mutation is committed with a compare-and-swap on the network document and
//! retried from a fresh read when another writer won.

use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub mod pool;

pub use pool::PoolData;

use crate::error::{CniError, Result};
use crate::store::{self, NetworkCrd, Node, Store, Subnet};

/// Optimistic commit attempts before giving up on a contended network.
pub const MAX_COMMIT_ATTEMPTS: usize = 16;

/// Outcome of a successful allocation
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    /// Pod address carrying the subnet prefix length
    pub address: IpNetwork,
    pub gateway: Option<IpAddr>,
    pub network: String,
    pub subnet_name: String,
    pub subnet_id: String,
}

/// Pool view of `subnet`, or `None` when its document cannot be used. One
/// broken subnet must not take the rest of the network down with it.
fn usable_pool(network: &str, subnet: &Subnet) -> Option<PoolData> {
    match PoolData::from_subnet(subnet) {
        Ok(pool) => Some(pool),
        Err(err) => {
            warn!(%network, subnet = %subnet.name, "skipping unusable subnet: {}", err);
            None
        }
    }
}

pub struct Allocator {
    store: Arc<dyn Store>,
    node_name: String,
    lock: Mutex<()>,
    node_ip_cache: Mutex<HashMap<String, Option<IpAddr>>>,
    cidr_cache: Mutex<HashMap<String, Option<IpNetwork>>>,
}

impl Allocator {
    pub fn new(store: Arc<dyn Store>, node_name: &str) -> Self {
        Self {
            store,
            node_name: node_name.to_string(),
            lock: Mutex::new(()),
            node_ip_cache: Mutex::new(HashMap::new()),
            cidr_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        // The mutex protects no data of its own, so a poisoned guard is still usable.
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load_node(&self, node_name: &str) -> Result<Option<Node>> {
        Ok(store::get_json::<Node>(self.store.as_ref(), &store::node_key(node_name))?
            .map(|(node, _)| node))
    }

    /// IP of `node_name`, looked up once per allocator.
    pub fn node_ip(&self, node_name: &str) -> Result<Option<IpAddr>> {
        let mut cache = self.node_ip_cache.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(cached) = cache.get(node_name) {
            return Ok(*cached);
        }
        let ip = match self.load_node(node_name)? {
            Some(node) => match node.node_ip.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(err) => {
                    warn!(node = node_name, "ignoring invalid node IP {:?}: {}", node.node_ip, err);
                    None
                }
            },
            None => None,
        };
        cache.insert(node_name.to_string(), ip);
        Ok(ip)
    }

    /// Preferred pod CIDR of `node_name`, looked up once per allocator.
    pub fn node_cidr(&self, node_name: &str) -> Result<Option<IpNetwork>> {
        let mut cache = self.cidr_cache.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(cached) = cache.get(node_name) {
            return Ok(*cached);
        }
        let cidr = match self.load_node(node_name)?.and_then(|node| node.pod_cidr) {
            Some(cidr) => match pool::parse_cidr(&cidr) {
                Ok(cidr) => Some(cidr),
                Err(err) => {
                    warn!(node = node_name, "ignoring invalid pod CIDR: {}", err);
                    None
                }
            },
            None => None,
        };
        cache.insert(node_name.to_string(), cidr);
        Ok(cidr)
    }

    fn load_network(&self, network: &str) -> Result<Option<(NetworkCrd, u64)>> {
        Ok(store::get_json(self.store.as_ref(), &store::network_key(network))?)
    }

    /// Subnet indices in the order they should be tried: the node's own block
    /// first, then declaration order.
    fn subnet_order(&self, crd: &NetworkCrd, preferred: Option<IpNetwork>) -> Vec<usize> {
        let mut order: Vec<usize> = (0..crd.subnets.len()).collect();
        if let Some(preferred) = preferred {
            order.sort_by_key(|&i| {
                let matches = pool::parse_cidr(&crd.subnets[i].cidr)
                    .map(|cidr| cidr == preferred)
                    .unwrap_or(false);
                !matches
            });
        }
        order
    }

    /// Pool views of every subnet of `network`.
    pub fn pools(&self, network: &str) -> Result<Vec<PoolData>> {
        let (crd, _) = self.load_network(network)?.ok_or_else(|| {
            CniError::NetworkResolution(format!("network {network} does not exist"))
        })?;
        crd.subnets.iter().map(PoolData::from_subnet).collect()
    }

    /// Hand out the lowest free address of `network`.
    pub fn allocate(&self, network: &str) -> Result<Allocation> {
        let _guard = self.guard();
        let preferred = self.node_cidr(&self.node_name)?;
        let key = store::network_key(network);

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let (mut crd, revision) = self.load_network(network)?.ok_or_else(|| {
                CniError::NetworkResolution(format!("network {network} does not exist"))
            })?;

            let mut chosen = None;
            for index in self.subnet_order(&crd, preferred) {
                let Some(mut pool) = usable_pool(network, &crd.subnets[index]) else {
                    continue;
                };
                if let Some(ip) = pool.take_lowest() {
                    pool.write_back(&mut crd.subnets[index]);
                    chosen = Some((ip, pool));
                    break;
                }
            }
            let (ip, pool) = chosen.ok_or_else(|| {
                CniError::Allocation(format!("no free address left in network {network}"))
            })?;

            if store::cas_json(self.store.as_ref(), &key, Some(revision), &crd)? {
                let address = IpNetwork::new(ip, pool.cidr.prefix())
                    .map_err(|err| CniError::Internal(format!("building pod address: {err}")))?;
                info!(%network, subnet = %pool.name, %address, "allocated address");
                return Ok(Allocation {
                    address,
                    gateway: pool.gateway,
                    network: network.to_string(),
                    subnet_name: pool.name,
                    subnet_id: pool.id,
                });
            }
            debug!(%network, attempt, "network document changed underneath us, retrying");
        }

        Err(CniError::Allocation(format!(
            "gave up allocating in {network} after {MAX_COMMIT_ATTEMPTS} conflicting updates"
        )))
    }

    /// Return `ip` to the free set of `network`. Releasing an address that is
    /// not allocated, or that belongs to a network which no longer exists, is
    /// a no-op and returns false.
    pub fn release(&self, network: &str, ip: IpAddr) -> Result<bool> {
        let _guard = self.guard();
        let key = store::network_key(network);

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let Some((mut crd, revision)) = self.load_network(network)? else {
                warn!(%network, %ip, "network is gone, nothing to release");
                return Ok(false);
            };

            let mut released = false;
            for subnet in crd.subnets.iter_mut() {
                let Some(mut pool) = usable_pool(network, subnet) else {
                    continue;
                };
                if pool.contains(&ip) && pool.release(&ip) {
                    pool.write_back(subnet);
                    released = true;
                    break;
                }
            }
            if !released {
                debug!(%network, %ip, "address was not allocated");
                return Ok(false);
            }

            if store::cas_json(self.store.as_ref(), &key, Some(revision), &crd)? {
                info!(%network, %ip, "released address");
                return Ok(true);
            }
            debug!(%network, attempt, "network document changed underneath us, retrying");
        }

        Err(CniError::Allocation(format!(
            "gave up releasing {ip} in {network} after {MAX_COMMIT_ATTEMPTS} conflicting updates"
        )))
    }
}
