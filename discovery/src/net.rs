//! Network interface and address selection.

use std::net::Ipv4Addr;

use netdev::Interface;

/// Interface name prefixes that belong to container bridges, virtual switches
/// and tunnels. Addresses on these never end up in announcements.
const BLOCKED_INTERFACE_PREFIXES: &[&str] = &[
    "docker", "br-", "veth", "virbr", "lxc", "lxd", "podman", "cni", "tun", "tap", "wg",
];

fn is_blocked_interface(name: &str) -> bool {
    BLOCKED_INTERFACE_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Interfaces suitable for multicast discovery: up, multicast-capable,
/// not loopback and not a container bridge.
pub fn multicast_interfaces() -> Vec<Interface> {
    netdev::get_interfaces()
        .into_iter()
        .filter(|iface| iface.is_up() && iface.is_multicast() && !iface.is_loopback())
        .filter(|iface| !is_blocked_interface(&iface.name))
        .collect()
}

/// The IPv4 addresses a participant advertises in its A records.
pub fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    multicast_interfaces()
        .into_iter()
        .flat_map(|iface| iface.ipv4.into_iter().map(|net| net.addr()))
        .filter(|addr| !addr.is_loopback())
        .collect()
}
