use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ipnetwork::IpNetwork;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tinycni::config::{NetConf, PluginSettings, DEFAULT_MODE};
use tinycni::ipam::pool::{self, PoolData};
use tinycni::plugin::HOST_VETH_PREFIX;
use tinycni::store::{self, FileStore, NetworkCrd, Node, Pod, Store, Subnet};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// A command line tool to administer the tinycni address pool
#[derive(Parser)]
#[command(name = "tinycni-ctl", author, version, about)]
struct Cli {
    /// Plugin settings file (defaults to $TINYCNI_CONFIG or /etc/tinycni/tinycni.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Store directory, overriding the settings
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage cluster nodes
    Node {
        #[command(subcommand)]
        command: NodeCommands,
    },

    /// Manage logical networks
    Network {
        #[command(subcommand)]
        command: NetworkCommands,
    },

    /// Manage subnets of a network
    Subnet {
        #[command(subcommand)]
        command: SubnetCommands,
    },

    /// Inspect pod attachment records
    Pod {
        #[command(subcommand)]
        command: PodCommands,
    },

    /// Generate a network configuration for the plugin
    Generate {
        /// Network name
        #[arg(long, default_value = "tinycni")]
        name: String,

        /// Network mode
        #[arg(long, default_value = DEFAULT_MODE)]
        mode: String,

        /// Interface MTU
        #[arg(long)]
        mtu: Option<u32>,

        /// Output file path
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Status of host veth interfaces
    Status,
}

#[derive(Subcommand)]
enum NodeCommands {
    /// Create or update a node
    Set {
        #[arg(long)]
        name: String,

        /// Node IP address
        #[arg(long)]
        ip: String,

        /// Pod CIDR this node prefers to allocate from
        #[arg(long)]
        pod_cidr: Option<String>,
    },

    /// List nodes
    List,
}

#[derive(Subcommand)]
enum NetworkCommands {
    /// Create an empty network
    Create {
        #[arg(long)]
        name: String,
    },

    /// Show a network with its pool usage
    Show {
        #[arg(long)]
        name: String,
    },

    /// List networks
    List,
}

#[derive(Subcommand)]
enum SubnetCommands {
    /// Add a subnet to a network
    Add {
        #[arg(long)]
        network: String,

        #[arg(long)]
        name: String,

        /// Subnet CIDR
        #[arg(long)]
        cidr: String,

        /// Gateway, defaults to the first host address
        #[arg(long)]
        gateway: Option<String>,
    },
}

#[derive(Subcommand)]
enum PodCommands {
    /// List pod records
    List {
        /// Only pods in this namespace
        #[arg(long)]
        namespace: Option<String>,
    },

    /// Show one pod record
    Show {
        #[arg(long)]
        namespace: String,

        #[arg(long)]
        name: String,
    },
}

#[derive(Debug)]
struct VethStatus {
    name: String,
    state: String,
    mac: String,
    pod: Option<String>,
}

fn open_store(cli: &Cli) -> Result<FileStore> {
    let settings = match &cli.config {
        Some(path) => PluginSettings::from_file(path)?,
        None => PluginSettings::load()?,
    };
    let dir = cli.store_dir.clone().unwrap_or(settings.store_dir);
    debug!("using store at {}", dir.display());
    FileStore::open(&dir).with_context(|| format!("Failed to open store at {}", dir.display()))
}

fn set_node(store: &dyn Store, name: &str, ip: &str, pod_cidr: Option<String>) -> Result<()> {
    ip.parse::<std::net::IpAddr>()
        .with_context(|| format!("Invalid node IP {ip}"))?;
    let pod_cidr = pod_cidr
        .map(|cidr| pool::parse_cidr(&cidr).map(|c| c.to_string()))
        .transpose()?;
    let node = Node {
        name: name.to_string(),
        node_ip: ip.to_string(),
        pod_cidr,
    };
    store::put_json(store, &store::node_key(name), &node)?;
    info!("Node {} set", name);
    Ok(())
}

fn create_network(store: &dyn Store, name: &str) -> Result<()> {
    tinycni::config::validate_network_name(name)?;
    let crd = NetworkCrd {
        name: name.to_string(),
        subnets: Vec::new(),
    };
    if !store::cas_json(store, &store::network_key(name), None, &crd)? {
        bail!("Network {} already exists", name);
    }
    info!("Network {} created", name);
    Ok(())
}

fn overlaps(a: &IpNetwork, b: &IpNetwork) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

fn add_subnet(
    store: &dyn Store,
    network: &str,
    name: &str,
    cidr: &str,
    gateway: Option<String>,
) -> Result<Subnet> {
    let key = store::network_key(network);
    let (mut crd, revision) = store::get_json::<NetworkCrd>(store, &key)?
        .with_context(|| format!("Network {network} does not exist"))?;

    let parsed = pool::parse_cidr(cidr)?;
    for existing in &crd.subnets {
        if existing.name == name {
            bail!("Subnet {} already exists in network {}", name, network);
        }
        if overlaps(&pool::parse_cidr(&existing.cidr)?, &parsed) {
            bail!("{} overlaps subnet {} ({})", parsed, existing.name, existing.cidr);
        }
    }

    let subnet = Subnet {
        name: name.to_string(),
        id: uuid::Uuid::new_v4().to_string(),
        cidr: parsed.to_string(),
        gateway,
        allocated_ips: Vec::new(),
    };
    // Rejects oversized blocks and gateways outside the CIDR.
    let pool = PoolData::from_subnet(&subnet)?;
    debug!("Subnet {} offers {} addresses", name, pool.free_count());

    crd.subnets.push(subnet.clone());
    if !store::cas_json(store, &key, Some(revision), &crd)? {
        bail!("Network {} changed while adding the subnet, retry", network);
    }
    Ok(subnet)
}

fn pool_report(crd: &NetworkCrd) -> Result<()> {
    println!("Network {}:", crd.name);
    if crd.subnets.is_empty() {
        println!("  (no subnets)");
    }
    for subnet in &crd.subnets {
        let pool = PoolData::from_subnet(subnet)?;
        let allocated = pool.allocated().count();
        println!("  Subnet {} ({}):", pool.name, pool.id);
        println!("    CIDR: {}", pool.cidr);
        if let Some(gateway) = pool.gateway {
            println!("    Gateway: {}", gateway);
        }
        println!("    Allocated: {}", allocated);
        println!("    Free: {}", pool.free_count());
    }
    Ok(())
}

fn get_veth_status(pods: &[Pod]) -> Result<Vec<VethStatus>> {
    let output = Command::new("ip")
        .args(["-j", "link", "show", "type", "veth"])
        .output()
        .context("Failed to execute ip link show command")?;

    if !output.status.success() {
        bail!(
            "Failed to get interface status: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let interfaces: Vec<serde_json::Value> =
        serde_json::from_slice(&output.stdout).context("Failed to parse ip link output")?;

    let mut status = Vec::new();
    for iface in interfaces {
        let Some(name) = iface.get("ifname").and_then(|v| v.as_str()) else {
            continue;
        };
        if !name.starts_with(HOST_VETH_PREFIX) {
            continue;
        }
        let pod = pods
            .iter()
            .find(|pod| pod.pod_eths.iter().any(|eth| eth.host_veth == name))
            .map(|pod| format!("{}/{}", pod.namespace, pod.name));
        status.push(VethStatus {
            name: name.to_string(),
            state: iface
                .get("operstate")
                .and_then(|v| v.as_str())
                .unwrap_or("UNKNOWN")
                .to_string(),
            mac: iface
                .get("address")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            pod,
        });
    }

    Ok(status)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Configure logging based on verbosity
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set default subscriber")?;

    match &cli.command {
        Commands::Node { command } => {
            let store = open_store(&cli)?;
            match command {
                NodeCommands::Set { name, ip, pod_cidr } => {
                    set_node(&store, name, ip, pod_cidr.clone())?;
                    println!("Node {} set to {}", name, ip);
                }
                NodeCommands::List => {
                    let nodes: Vec<Node> = store::list_json(&store, &store::nodes_key())?;
                    println!("Nodes:");
                    for node in nodes {
                        match node.pod_cidr {
                            Some(cidr) => println!("  {} ({}, pod CIDR {})", node.name, node.node_ip, cidr),
                            None => println!("  {} ({})", node.name, node.node_ip),
                        }
                    }
                }
            }
        }

        Commands::Network { command } => {
            let store = open_store(&cli)?;
            match command {
                NetworkCommands::Create { name } => {
                    create_network(&store, name)?;
                    println!("Network {} created successfully", name);
                }
                NetworkCommands::Show { name } => {
                    let (crd, _) = store::get_json::<NetworkCrd>(&store, &store::network_key(name))?
                        .with_context(|| format!("Network {name} does not exist"))?;
                    pool_report(&crd)?;
                }
                NetworkCommands::List => {
                    let networks: Vec<NetworkCrd> =
                        store::list_json(&store, &store::networks_key())?;
                    println!("Networks:");
                    for crd in networks {
                        println!("  {} ({} subnets)", crd.name, crd.subnets.len());
                    }
                }
            }
        }

        Commands::Subnet { command } => {
            let store = open_store(&cli)?;
            match command {
                SubnetCommands::Add {
                    network,
                    name,
                    cidr,
                    gateway,
                } => {
                    let subnet = add_subnet(&store, network, name, cidr, gateway.clone())?;
                    println!(
                        "Subnet {} ({}) added to network {} with id {}",
                        subnet.name, subnet.cidr, network, subnet.id
                    );
                }
            }
        }

        Commands::Pod { command } => {
            let store = open_store(&cli)?;
            match command {
                PodCommands::List { namespace } => {
                    let prefix = match namespace {
                        Some(ns) => format!("{}{}/", store::pods_key(), ns),
                        None => store::pods_key(),
                    };
                    let pods: Vec<Pod> = store::list_json(&store, &prefix)?;
                    println!("Pods:");
                    for pod in pods {
                        let ips: Vec<&str> = pod
                            .pod_eths
                            .iter()
                            .flat_map(|eth| eth.fixed_ips.iter().map(|ip| ip.ipaddress.as_str()))
                            .collect();
                        println!(
                            "  {}/{} on {} [{}]",
                            pod.namespace,
                            pod.name,
                            pod.node_name,
                            ips.join(", ")
                        );
                    }
                }
                PodCommands::Show { namespace, name } => {
                    let (pod, _) =
                        store::get_json::<Pod>(&store, &store::pod_key(namespace, name))?
                            .with_context(|| format!("No record for pod {namespace}/{name}"))?;
                    println!("{}", serde_json::to_string_pretty(&pod)?);
                }
            }
        }

        Commands::Generate {
            name,
            mode,
            mtu,
            output,
        } => {
            tinycni::config::validate_network_name(name)?;
            let config = NetConf::new_default(name, mode, *mtu);
            let config_json = serde_json::to_string_pretty(&config)?;

            if let Some(path) = output {
                fs::write(path, config_json)?;
                println!("Network configuration written to {}", path.display());
            } else {
                println!("{}", config_json);
            }
        }

        Commands::Status => {
            let pods: Vec<Pod> = match open_store(&cli) {
                Ok(store) => store::list_json(&store, &store::pods_key())?,
                Err(err) => {
                    debug!("no pod records available: {:#}", err);
                    Vec::new()
                }
            };
            let status = get_veth_status(&pods)?;

            if status.is_empty() {
                println!("No host veth interfaces found");
            } else {
                println!("Host veth status:");
                for veth in status {
                    println!("  {}:", veth.name);
                    println!("    State: {}", veth.state);
                    println!("    MAC: {}", veth.mac);
                    if let Some(pod) = veth.pod {
                        println!("    Pod: {}", pod);
                    }
                }
            }
        }
    }

    Ok(())
}
