//! Network setup for sandboxed children
//!
//! The work is split across the namespace boundary. The spawner, which runs
//! in the parent network namespace and must hold CAP_NET_ADMIN there,
//! creates the veth pair and pushes the child side into the child's network
//! namespace by PID reference, then configures the kernel side. The child,
//! which holds CAP_NET_ADMIN only over its own namespace, configures its
//! side of the pair: address, link up, default route. A readiness gate in
//! the spawn path guarantees the child does not look for its veth before
//! the spawner has created it.
//!
//! Without a [`NetworkConfig`] the child still gets an unshared, empty
//! network namespace; only loopback is brought up.

use super::SandboxError;
use super::netlink::{NetlinkSocket, ifindex};
use crate::protocol::NetworkConfig;

/// Peer addresses sit on one /24
const VETH_PREFIX_LEN: u8 = 24;

/// Bring up loopback in the current (freshly unshared) network namespace.
pub fn loopback_only() -> Result<(), SandboxError> {
    let mut nl = NetlinkSocket::open_route()?;
    nl.link_up("lo")
}

/// Spawner-side half: create the veth pair with the peer in the network
/// namespace of `child_pid`, then address and raise the kernel side.
///
/// Requires CAP_NET_ADMIN in the spawner's namespace. The peer cannot be
/// created from inside the child: a process in the new PID namespace has no
/// PID it could use to name the parent namespace.
pub fn configure_host_side(child_pid: i32, config: &NetworkConfig) -> Result<(), SandboxError> {
    let mut nl = NetlinkSocket::open_route()?;
    nl.create_veth(&config.kernel_veth_name, &config.child_veth_name, child_pid)?;
    let index = ifindex(&config.kernel_veth_name)?;
    nl.add_address(index, config.kernel_ipv4, VETH_PREFIX_LEN)?;
    nl.link_up(&config.kernel_veth_name)
}

/// Child-side half: loopback up, then address, raise, and route the child
/// end of the veth pair. Runs after the readiness gate, so the interface is
/// already present in this namespace.
pub fn configure_child_side(config: &NetworkConfig) -> Result<(), SandboxError> {
    let mut nl = NetlinkSocket::open_route()?;
    nl.link_up("lo")?;
    let index = ifindex(&config.child_veth_name)?;
    nl.add_address(index, config.child_ipv4, VETH_PREFIX_LEN)?;
    nl.link_up(&config.child_veth_name)?;
    nl.add_default_route(config.child_ipv4_gateway)
}
