use serde::{Deserialize, Serialize};

/// Cluster member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(rename = "nodeIp")]
    pub node_ip: String,
    /// Pod block this node prefers to allocate from
    #[serde(rename = "podCidr", default, skip_serializing_if = "Option::is_none")]
    pub pod_cidr: Option<String>,
}

/// Logical network spanning one or more subnets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkCrd {
    pub name: String,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocatedIp {
    pub ip: String,
}

/// Allocatable block inside a network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnet {
    pub name: String,
    pub id: String,
    pub cidr: String,
    /// Explicit gateway; the first host address is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default)]
    pub allocated_ips: Vec<AllocatedIp>,
}

/// Attachment record for one pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    #[serde(rename = "nameSpace")]
    pub namespace: String,
    #[serde(rename = "containerId")]
    pub container_id: String,
    #[serde(rename = "nodeName", default)]
    pub node_name: String,
    #[serde(rename = "podEths", default)]
    pub pod_eths: Vec<PodEth>,
}

/// One NIC attachment of a pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodEth {
    pub network_crd: String,
    #[serde(rename = "subnetName")]
    pub subnet_name: String,
    pub mac: String,
    #[serde(rename = "ifName", default)]
    pub if_name: String,
    #[serde(rename = "hostVeth", default)]
    pub host_veth: String,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedIp {
    pub subnet_id: String,
    pub ipaddress: String,
    pub gateway_ip: String,
}
