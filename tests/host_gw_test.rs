mod common;

use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;

use common::{
    network, pod_args, store_with_network, subnet, FakeKernel, FakePods, HOST, NETNS,
};
use tinycni::commands::{cmd_add, cmd_check, cmd_del};
use tinycni::ipam::{Allocator, PoolData};
use tinycni::plugin::{HostGatewayPlugin, RouteSpec, HOST_VETH_MAC};
use tinycni::registry::CniManager;
use tinycni::store::{self, MemoryStore, Pod, Store};

const CONFIG: &str = r#"{"cniVersion":"1.0.0","name":"pods","type":"tinycni"}"#;
const CONTAINER: &str = "abcdef0123456789";
const HOST_VETH: &str = "tinyabcdef01234";

fn manager(store: Arc<MemoryStore>, pods: FakePods, kernel: FakeKernel) -> CniManager {
    let allocator = Allocator::new(store, "node-a");
    let plugin = HostGatewayPlugin::new(Box::new(pods), allocator, Box::new(kernel));
    let mut manager = CniManager::new();
    manager.register(Box::new(plugin)).unwrap();
    manager
}

fn setup(kernel: FakeKernel) -> (Arc<MemoryStore>, CniManager) {
    let store = store_with_network("pods", vec![subnet("a", "10.244.1.0/24")]);
    let manager = manager(
        store.clone(),
        FakePods::with_annotated("default", "web", "pods"),
        kernel,
    );
    (store, manager)
}

fn allocated(store: &dyn Store) -> Vec<String> {
    network(store, "pods").subnets[0]
        .allocated_ips
        .iter()
        .map(|a| a.ip.clone())
        .collect()
}

fn pod_record(store: &dyn Store, name: &str) -> Option<Pod> {
    store::get_json::<Pod>(store, &store::pod_key("default", name))
        .unwrap()
        .map(|(pod, _)| pod)
}

#[test]
fn test_add_wires_pod_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let kernel = FakeKernel::new();
    let (store, mut manager) = setup(kernel.clone());
    let args = pod_args(CONTAINER, "default", "web", CONFIG);

    let mut out = Vec::new();
    cmd_add(&mut manager, &args, &mut out)?;
    let result: Value = serde_json::from_slice(&out)?;

    assert_eq!(result["cniVersion"], "1.0.0");
    let interfaces = result["interfaces"].as_array().ok_or("no interfaces")?;
    assert_eq!(interfaces.len(), 2);
    assert_eq!(interfaces[0]["name"], HOST_VETH);
    assert_eq!(interfaces[0]["mac"], HOST_VETH_MAC);
    assert!(interfaces[0].get("sandbox").is_none());
    assert_eq!(interfaces[1]["name"], "eth0");
    assert_eq!(interfaces[1]["sandbox"], NETNS);

    let ips = result["ips"].as_array().ok_or("no ips")?;
    assert_eq!(ips.len(), 1);
    assert_eq!(ips[0]["interface"], 1);
    assert_eq!(ips[0]["address"], "10.244.1.2/24");
    assert_eq!(ips[0]["gateway"], "10.244.1.1");

    // The address left the free set.
    assert_eq!(allocated(&*store), vec!["10.244.1.2"]);
    let pool = PoolData::from_subnet(&network(&*store, "pods").subnets[0])?;
    let ip: IpAddr = "10.244.1.2".parse()?;
    assert!(!pool.free().any(|free| *free == ip));

    let state = kernel.state.lock().unwrap();
    let container = state.find(NETNS, "eth0").ok_or("container link missing")?;
    assert!(container.up);
    assert_eq!(container.addresses, vec!["10.244.1.2/24".parse::<ipnetwork::IpNetwork>()?]);
    let container_mac = container.mac.clone().ok_or("container MAC unset")?;
    assert!(container_mac.starts_with("de:"));
    assert_eq!(interfaces[1]["mac"], container_mac.as_str());

    let host = state.find(HOST, HOST_VETH).ok_or("host veth missing")?;
    assert!(host.up);
    assert_eq!(host.mac.as_deref(), Some(HOST_VETH_MAC));
    assert_eq!(host.pair, container.pair);
    assert_eq!(host.mtu, 1500);

    assert!(state.routes.contains(&(
        HOST.to_string(),
        RouteSpec::host(ip, HOST_VETH)?
    )));
    assert!(state.routes.contains(&(
        NETNS.to_string(),
        RouteSpec::default_via("10.244.1.1".parse()?, "eth0")?
    )));
    assert!(state.sysctls.contains(&(
        format!("/proc/sys/net/ipv4/conf/{HOST_VETH}/proxy_arp"),
        "1".to_string()
    )));
    assert!(state
        .sysctls
        .iter()
        .all(|(path, _)| !path.contains("disable_ipv6")));

    let record = pod_record(&*store, "web").ok_or("pod record missing")?;
    assert_eq!(record.container_id, CONTAINER);
    assert_eq!(record.node_name, "node-a");
    assert_eq!(record.pod_eths.len(), 1);
    assert_eq!(record.pod_eths[0].host_veth, HOST_VETH);
    assert_eq!(record.pod_eths[0].mac, container_mac);
    assert_eq!(record.pod_eths[0].fixed_ips[0].ipaddress, "10.244.1.2");
    assert_eq!(record.pod_eths[0].fixed_ips[0].subnet_id, "a-id");

    Ok(())
}

#[test]
fn test_add_uses_configured_mtu() -> Result<(), Box<dyn std::error::Error>> {
    let kernel = FakeKernel::new();
    let (_store, mut manager) = setup(kernel.clone());
    let config = r#"{"cniVersion":"0.4.0","name":"pods","type":"tinycni","mtu":1450}"#;
    let args = pod_args(CONTAINER, "default", "web", config);

    let mut out = Vec::new();
    cmd_add(&mut manager, &args, &mut out)?;
    let result: Value = serde_json::from_slice(&out)?;
    assert_eq!(result["cniVersion"], "0.4.0");
    assert_eq!(result["ips"][0]["version"], "4");

    let state = kernel.state.lock().unwrap();
    assert_eq!(state.find(HOST, HOST_VETH).map(|l| l.mtu), Some(1450));
    assert_eq!(state.find(NETNS, "eth0").map(|l| l.mtu), Some(1450));

    Ok(())
}

#[test]
fn test_add_failure_rolls_back() {
    for op in ["create_veth", "move_to_netns", "add_route", "write_sysctl"] {
        let kernel = FakeKernel::failing_on(op);
        let (store, mut manager) = setup(kernel.clone());
        let args = pod_args(CONTAINER, "default", "web", CONFIG);

        let mut out = Vec::new();
        let err = cmd_add(&mut manager, &args, &mut out).unwrap_err();
        assert_eq!(err.code(), 102, "failing {op}");
        assert!(out.is_empty(), "failing {op}");

        assert!(allocated(&*store).is_empty(), "failing {op}");
        assert!(pod_record(&*store, "web").is_none(), "failing {op}");
        assert!(kernel.state.lock().unwrap().links.is_empty(), "failing {op}");
    }
}

#[test]
fn test_add_without_network_touches_nothing() {
    let kernel = FakeKernel::new();
    let store = store_with_network("pods", vec![subnet("a", "10.244.1.0/24")]);
    let mut manager = manager(store.clone(), FakePods::default(), kernel.clone());
    let args = pod_args(CONTAINER, "default", "web", CONFIG);

    let err = cmd_add(&mut manager, &args, &mut Vec::new()).unwrap_err();
    assert_eq!(err.code(), 100);
    assert!(allocated(&*store).is_empty());
    assert!(kernel.state.lock().unwrap().links.is_empty());
}

#[test]
fn test_add_with_malformed_args_fails() {
    let (_store, mut manager) = setup(FakeKernel::new());
    let mut args = pod_args(CONTAINER, "default", "web", CONFIG);
    args.args = "K8S_POD_NAMESPACE".to_string();

    let err = cmd_add(&mut manager, &args, &mut Vec::new()).unwrap_err();
    assert_eq!(err.code(), 100);
}

#[test]
fn test_add_on_exhausted_pool_fails_fast() {
    let kernel = FakeKernel::new();
    // .0 network, .1 gateway, .3 broadcast: only .2 is assignable.
    let store = store_with_network("pods", vec![subnet("tiny", "10.0.0.0/30")]);
    let mut pods = FakePods::with_annotated("default", "web", "pods");
    pods.add(
        "default",
        "api",
        [("tinycni.io/network".to_string(), "pods".to_string())].into(),
        Default::default(),
    );
    let mut manager = manager(store.clone(), pods, kernel.clone());

    cmd_add(
        &mut manager,
        &pod_args(CONTAINER, "default", "web", CONFIG),
        &mut Vec::new(),
    )
    .unwrap();
    let err = cmd_add(
        &mut manager,
        &pod_args("fedcba9876543210", "default", "api", CONFIG),
        &mut Vec::new(),
    )
    .unwrap_err();

    assert_eq!(err.code(), 101);
    assert_eq!(kernel.state.lock().unwrap().links.len(), 2);
}

#[test]
fn test_repeated_add_does_not_leak_addresses() -> Result<(), Box<dyn std::error::Error>> {
    let kernel = FakeKernel::new();
    let (store, mut manager) = setup(kernel.clone());
    let args = pod_args(CONTAINER, "default", "web", CONFIG);

    cmd_add(&mut manager, &args, &mut Vec::new())?;
    cmd_add(&mut manager, &args, &mut Vec::new())?;

    assert_eq!(allocated(&*store).len(), 1);
    assert_eq!(kernel.state.lock().unwrap().links.len(), 2);

    Ok(())
}

#[test]
fn test_del_releases_and_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
    let kernel = FakeKernel::new();
    let (store, mut manager) = setup(kernel.clone());
    let args = pod_args(CONTAINER, "default", "web", CONFIG);

    cmd_add(&mut manager, &args, &mut Vec::new())?;
    cmd_del(&mut manager, &args)?;

    assert!(allocated(&*store).is_empty());
    assert!(pod_record(&*store, "web").is_none());
    assert!(kernel.state.lock().unwrap().links.is_empty());

    cmd_del(&mut manager, &args)?;

    let mut no_netns = args.clone();
    no_netns.netns = String::new();
    cmd_del(&mut manager, &no_netns)?;

    Ok(())
}

#[test]
fn test_del_without_record_removes_derived_veth() -> Result<(), Box<dyn std::error::Error>> {
    use tinycni::plugin::NetworkOps;

    let kernel = FakeKernel::new();
    let (_store, mut manager) = setup(kernel.clone());
    kernel.create_veth(HOST_VETH, "tinpleftover", 1500)?;

    cmd_del(&mut manager, &pod_args(CONTAINER, "default", "web", CONFIG))?;
    assert!(kernel.state.lock().unwrap().links.is_empty());

    Ok(())
}

#[test]
fn test_check_matches_recorded_address() -> Result<(), Box<dyn std::error::Error>> {
    let kernel = FakeKernel::new();
    let (_store, mut manager) = setup(kernel.clone());
    let args = pod_args(CONTAINER, "default", "web", CONFIG);

    // Nothing recorded yet.
    cmd_check(&mut manager, &args)?;

    cmd_add(&mut manager, &args, &mut Vec::new())?;
    cmd_check(&mut manager, &args)?;

    {
        let mut state = kernel.state.lock().unwrap();
        let link = state
            .links
            .iter_mut()
            .find(|l| l.namespace == NETNS && l.name == "eth0")
            .ok_or("container link missing")?;
        link.addresses.clear();
    }
    let err = cmd_check(&mut manager, &args).unwrap_err();
    assert_eq!(err.code(), 102);

    kernel.state.lock().unwrap().links.clear();
    cmd_check(&mut manager, &args)?;

    Ok(())
}

fn annotated_pods(names: &[&str]) -> FakePods {
    let mut pods = FakePods::default();
    for name in names {
        pods.add(
            "default",
            name,
            Default::default(),
            [("tinycni.io/network".to_string(), "pods".to_string())].into(),
        );
    }
    pods
}

fn added_address(
    manager: &mut CniManager,
    container_id: &str,
    pod: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut out = Vec::new();
    cmd_add(manager, &pod_args(container_id, "default", pod, CONFIG), &mut out)?;
    let result: Value = serde_json::from_slice(&out)?;
    Ok(result["ips"][0]["address"]
        .as_str()
        .ok_or("no address")?
        .to_string())
}

#[test]
fn test_retried_del_never_frees_a_reassigned_address() -> Result<(), Box<dyn std::error::Error>> {
    let kernel = FakeKernel::new();
    let store = store_with_network("pods", vec![subnet("a", "10.244.1.0/24")]);
    let mut manager = manager(
        store.clone(),
        annotated_pods(&["web", "api", "db"]),
        kernel.clone(),
    );
    let web = pod_args(CONTAINER, "default", "web", CONFIG);

    assert_eq!(added_address(&mut manager, CONTAINER, "web")?, "10.244.1.2/24");

    kernel.fail_on(Some("delete_link"));
    assert_eq!(cmd_del(&mut manager, &web).unwrap_err().code(), 102);
    kernel.fail_on(None);

    // Nothing was given back while the pod was still wired.
    assert_eq!(allocated(&*store), vec!["10.244.1.2"]);
    assert!(pod_record(&*store, "web").is_some());

    let api = added_address(&mut manager, "1111111111111111", "api")?;
    assert_eq!(api, "10.244.1.3/24");

    cmd_del(&mut manager, &web)?;
    cmd_del(&mut manager, &web)?;
    assert!(pod_record(&*store, "web").is_none());

    let db = added_address(&mut manager, "2222222222222222", "db")?;
    assert_ne!(api, db);
    assert_eq!(db, "10.244.1.2/24");
    assert_eq!(allocated(&*store), vec!["10.244.1.2", "10.244.1.3"]);

    Ok(())
}

#[test]
fn test_failed_stale_cleanup_keeps_addresses_pinned() -> Result<(), Box<dyn std::error::Error>> {
    let kernel = FakeKernel::new();
    let (store, mut manager) = setup(kernel.clone());
    let args = pod_args(CONTAINER, "default", "web", CONFIG);

    cmd_add(&mut manager, &args, &mut Vec::new())?;

    kernel.fail_on(Some("delete_link"));
    assert!(cmd_add(&mut manager, &args, &mut Vec::new()).is_err());
    kernel.fail_on(None);
    assert_eq!(allocated(&*store), vec!["10.244.1.2"]);
    assert!(pod_record(&*store, "web").is_some());

    cmd_add(&mut manager, &args, &mut Vec::new())?;
    assert_eq!(allocated(&*store), vec!["10.244.1.2"]);
    assert_eq!(kernel.state.lock().unwrap().links.len(), 2);

    Ok(())
}

fn sysctl_set(kernel: &FakeKernel, path: &str, value: &str) -> bool {
    kernel
        .state
        .lock()
        .unwrap()
        .sysctls
        .contains(&(path.to_string(), value.to_string()))
}

#[test]
fn test_best_effort_sysctl_failures_do_not_fail_add() -> Result<(), Box<dyn std::error::Error>> {
    for name in ["proxy_delay", "accept_ra"] {
        let kernel = FakeKernel::failing_sysctl(name);
        let (store, mut manager) = setup(kernel.clone());

        cmd_add(
            &mut manager,
            &pod_args(CONTAINER, "default", "web", CONFIG),
            &mut Vec::new(),
        )?;

        assert_eq!(allocated(&*store), vec!["10.244.1.2"], "failing {name}");
        assert!(sysctl_set(
            &kernel,
            &format!("/proc/sys/net/ipv4/conf/{HOST_VETH}/proxy_arp"),
            "1"
        ));
        let state = kernel.state.lock().unwrap();
        assert!(state.sysctls.iter().all(|(path, _)| !path.ends_with(name)));
        assert!(state.find(HOST, HOST_VETH).is_some(), "failing {name}");
    }

    Ok(())
}

#[test]
fn test_required_sysctl_failures_roll_back() {
    for name in ["route_localnet", "proxy_arp", "forwarding"] {
        let kernel = FakeKernel::failing_sysctl(name);
        let (store, mut manager) = setup(kernel.clone());

        let err = cmd_add(
            &mut manager,
            &pod_args(CONTAINER, "default", "web", CONFIG),
            &mut Vec::new(),
        )
        .unwrap_err();

        assert_eq!(err.code(), 102, "failing {name}");
        assert!(allocated(&*store).is_empty(), "failing {name}");
        assert!(kernel.state.lock().unwrap().links.is_empty(), "failing {name}");
    }
}

#[test]
fn test_ipv6_pod_gets_ipv6_sysctls() -> Result<(), Box<dyn std::error::Error>> {
    let kernel = FakeKernel::new();
    let store = store_with_network("pods", vec![subnet("v6", "fd00::/120")]);
    let mut manager = manager(
        store,
        FakePods::with_annotated("default", "web", "pods"),
        kernel.clone(),
    );

    let mut out = Vec::new();
    cmd_add(&mut manager, &pod_args(CONTAINER, "default", "web", CONFIG), &mut out)?;
    let result: Value = serde_json::from_slice(&out)?;
    assert_eq!(result["ips"][0]["address"], "fd00::2/120");
    assert_eq!(result["ips"][0]["gateway"], "fd00::1");
    assert_eq!(result["routes"][0]["dst"], "::/0");

    for (sysctl, value) in [
        ("disable_ipv6", "0"),
        ("proxy_ndp", "1"),
        ("forwarding", "1"),
        ("accept_ra", "0"),
    ] {
        assert!(
            sysctl_set(&kernel, &format!("/proc/sys/net/ipv6/conf/{HOST_VETH}/{sysctl}"), value),
            "{sysctl}"
        );
    }

    let state = kernel.state.lock().unwrap();
    assert!(state.sysctls.iter().all(|(path, _)| !path.contains("/ipv4/")));
    assert!(state.routes.contains(&(
        HOST.to_string(),
        RouteSpec::host("fd00::2".parse()?, HOST_VETH)?
    )));
    assert!(state.routes.contains(&(
        NETNS.to_string(),
        RouteSpec::default_via("fd00::1".parse()?, "eth0")?
    )));

    Ok(())
}

#[test]
fn test_point_to_point_subnets_use_fallback_gateway() -> Result<(), Box<dyn std::error::Error>> {
    let cases = [
        ("10.0.0.0/31", "10.0.0.0/31", "169.254.1.1"),
        ("fd00::/127", "fd00::1/127", "fe80::1"),
    ];

    for (cidr, address, gateway) in cases {
        let kernel = FakeKernel::new();
        let store = store_with_network("pods", vec![subnet("p2p", cidr)]);
        let mut manager = manager(
            store.clone(),
            FakePods::with_annotated("default", "web", "pods"),
            kernel.clone(),
        );

        let mut out = Vec::new();
        cmd_add(&mut manager, &pod_args(CONTAINER, "default", "web", CONFIG), &mut out)?;
        let result: Value = serde_json::from_slice(&out)?;
        assert_eq!(result["ips"][0]["address"], address, "{cidr}");
        assert_eq!(result["ips"][0]["gateway"], gateway, "{cidr}");
        assert_eq!(result["routes"][0]["gw"], gateway, "{cidr}");

        assert!(kernel.state.lock().unwrap().routes.contains(&(
            NETNS.to_string(),
            RouteSpec::default_via(gateway.parse()?, "eth0")?
        )));
        let record = pod_record(&*store, "web").ok_or("pod record missing")?;
        assert_eq!(record.pod_eths[0].fixed_ips[0].gateway_ip, gateway);
    }

    Ok(())
}
