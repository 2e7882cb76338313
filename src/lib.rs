//! Host-gateway CNI plugin for Kubernetes
//!
//! This implementation provides a pure Rust CNI plugin that:
//! - Allocates pod addresses from a shared, cluster-visible pool
//! - Wires each pod to the host with a veth pair
//! - Routes pod traffic through host routes instead of an overlay
//! - Records every attachment so it can be checked and torn down

pub mod commands;
pub mod config;
pub mod error;
pub mod ipam;
pub mod k8s;
pub mod plugin;
pub mod registry;
pub mod store;
pub mod types;
pub mod version;

// Re-export commonly used items
pub use commands::{cmd_add, cmd_check, cmd_del, run_cni, Dispatcher};
pub use config::{NetConf, PluginSettings};
pub use error::CniError;
pub use ipam::Allocator;
pub use plugin::HostGatewayPlugin;
pub use registry::{CniDriver, CniManager};
