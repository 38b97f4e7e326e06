//! Interface discovery (C1): pick the outbound-preferred IPv4 address and
//! its subnet broadcast address.
//!
//! The "ask the OS" trick (connect a UDP socket toward a public endpoint,
//! read back the local binding) mirrors the socket setup idiom in
//! `93e2c7cc_Dr1mH4X-RustSyncCV-Client_.../lan-discovery.rs`
//! (other_examples). Interface enumeration uses `if-addrs`, a crate none
//! of the five example repos pull in (the teacher is a media server, not
//! a network-interface-aware tool) but which is the natural, real-world
//! answer to "list this host's interfaces and their netmasks" — `ipnetwork`
//! (present, feature-gated, in the teacher's own dependency tree) turns
//! the matched interface's address/netmask pair into a broadcast address.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use ipnetwork::Ipv4Network;
use tracing::warn;

use crate::error::{MapcastError, Result};

/// A well-known, unroutable destination used only to force the OS to pick
/// an outbound interface; no packet is ever actually sent to it.
const ROUTE_PROBE_ADDR: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 80);

/// The result of interface discovery: the address this host would use to
/// reach the LAN, and the broadcast address for that address's subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub preferred_ip: Ipv4Addr,
    pub broadcast_ip: Ipv4Addr,
}

/// Find the outbound-preferred IPv4 address.
fn preferred_ipv4() -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(SocketAddr::from(ROUTE_PROBE_ADDR))?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(addr) => Ok(addr),
        IpAddr::V6(_) => Err(MapcastError::InterfaceDiscoveryFailed),
    }
}

/// Find the broadcast address of the subnet containing `ip`, by matching
/// it against the host's enumerated interfaces.
fn broadcast_for(ip: Ipv4Addr) -> Option<Ipv4Addr> {
    let interfaces = if_addrs::get_if_addrs().ok()?;
    for iface in interfaces {
        if let if_addrs::IfAddr::V4(v4) = iface.addr {
            if v4.ip == ip {
                let prefix = u32::from(v4.netmask).count_ones() as u8;
                let network = Ipv4Network::new(ip, prefix).ok()?;
                return Some(network.broadcast());
            }
        }
    }
    None
}

/// Run interface discovery. Falls back to the limited broadcast address
/// (`255.255.255.255`) if the interface's broadcast cannot be determined;
/// only a failure to find *any* outbound IPv4 is fatal to discovery (the
/// caller treats that as "presence disabled, non-fatal" per spec §4.1).
pub fn discover() -> Result<InterfaceInfo> {
    let preferred_ip = preferred_ipv4()?;
    let broadcast_ip = broadcast_for(preferred_ip).unwrap_or_else(|| {
        warn!(
            "could not resolve subnet broadcast address for {}, falling back to limited broadcast",
            preferred_ip
        );
        Ipv4Addr::BROADCAST
    });

    Ok(InterfaceInfo {
        preferred_ip,
        broadcast_ip,
    })
}
