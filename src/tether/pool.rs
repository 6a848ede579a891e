//! Address pool allocation
//!
//! Picks the next free host address inside a device's configured subnets
//! for a newly added peer. An address is free when it is neither the
//! network nor the broadcast address of its subnet and is not covered by
//! any existing peer's allowed IPs.
//!
//! Allocation is deterministic: lowest host first within a subnet, and
//! subnets are tried in configuration order.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::TetherError;

/// Which address family an allocation request accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    /// IPv4 only
    V4,
    /// IPv6 only
    V6,
    /// Either family
    Any,
}

impl IpFamily {
    /// Whether a subnet belongs to this family
    pub fn admits(&self, net: &IpNet) -> bool {
        match (self, net) {
            (IpFamily::V4, IpNet::V4(_)) => true,
            (IpFamily::V6, IpNet::V6(_)) => true,
            (IpFamily::Any, _) => true,
            _ => false,
        }
    }
}

/// Pick the next free host address
///
/// `addresses` are the device's configured subnets in configuration
/// order; `used` is the union of allowed-IPs across the device's current
/// peers. The result carries a host-only mask (`/32` or `/128`).
pub fn next_available(
    addresses: &[IpNet],
    used: &[IpNet],
    family: IpFamily,
) -> Result<IpNet, TetherError> {
    let subnets: Vec<IpNet> = addresses
        .iter()
        .filter(|net| family.admits(net))
        .map(|net| net.trunc())
        .collect();

    if subnets.is_empty() {
        return Err(TetherError::NoAddressesFound);
    }

    for subnet in &subnets {
        if let Some(found) = first_free(subnet, used) {
            return Ok(found);
        }
    }

    Err(TetherError::NoAvailableIp)
}

/// Lowest free host in one subnet, if any
fn first_free(subnet: &IpNet, used: &[IpNet]) -> Option<IpNet> {
    match subnet {
        IpNet::V4(net) => {
            let network = u32::from(net.network());
            let broadcast = u32::from(net.broadcast());
            let mut candidate = network.checked_add(1)?;
            while candidate < broadcast {
                let ip = Ipv4Addr::from(candidate);
                if !is_used(used, IpAddr::V4(ip)) {
                    return Ipv4Net::new(ip, 32).ok().map(IpNet::V4);
                }
                candidate = candidate.checked_add(1)?;
            }
            None
        }
        IpNet::V6(net) => {
            let network = u128::from(net.network());
            let last = u128::from(net.broadcast());
            let mut candidate = network.checked_add(1)?;
            while candidate < last {
                let ip = Ipv6Addr::from(candidate);
                if !is_used(used, IpAddr::V6(ip)) {
                    return Ipv6Net::new(ip, 128).ok().map(IpNet::V6);
                }
                candidate = candidate.checked_add(1)?;
            }
            None
        }
    }
}

fn is_used(used: &[IpNet], candidate: IpAddr) -> bool {
    used.iter().any(|net| net.contains(&candidate))
}
