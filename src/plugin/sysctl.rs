use tracing::warn;

use super::netops::NetworkOps;
use crate::error::{CniError, Result};

fn set(ops: &dyn NetworkOps, path: String, value: &str, fatal: bool) -> Result<()> {
    match ops.write_sysctl(&path, value) {
        Ok(()) => Ok(()),
        Err(err) if fatal => Err(CniError::Namespace(format!(
            "failed to set {}={}: {}",
            sysctl_name(&path),
            value,
            err
        ))),
        Err(err) => {
            warn!("failed to set {}={}: {}", sysctl_name(&path), value, err);
            Ok(())
        }
    }
}

/// `/proc/sys/net/ipv4/conf/x/forwarding` -> `net.ipv4.conf.x.forwarding`
fn sysctl_name(path: &str) -> String {
    path.trim_start_matches("/proc/sys/").replace('/', ".")
}

/// Tune the host side of a pod's veth for host-gateway routing.
///
/// Proxy ARP/NDP lets the host answer for the pod's gateway, so the host end
/// never needs an address of its own.
pub fn configure_sysctls(
    ops: &dyn NetworkOps,
    host_veth: &str,
    has_ipv4: bool,
    has_ipv6: bool,
) -> Result<()> {
    if has_ipv4 {
        set(ops, format!("/proc/sys/net/ipv4/conf/{host_veth}/route_localnet"), "1", true)?;
        set(ops, format!("/proc/sys/net/ipv4/neigh/{host_veth}/proxy_delay"), "0", false)?;
        set(ops, format!("/proc/sys/net/ipv4/conf/{host_veth}/proxy_arp"), "1", true)?;
        set(ops, format!("/proc/sys/net/ipv4/conf/{host_veth}/forwarding"), "1", true)?;
    }

    if has_ipv6 {
        set(ops, format!("/proc/sys/net/ipv6/conf/{host_veth}/disable_ipv6"), "0", true)?;
        set(ops, format!("/proc/sys/net/ipv6/conf/{host_veth}/proxy_ndp"), "1", true)?;
        set(ops, format!("/proc/sys/net/ipv6/conf/{host_veth}/forwarding"), "1", true)?;
    }

    set(ops, format!("/proc/sys/net/ipv6/conf/{host_veth}/accept_ra"), "0", false)
}
