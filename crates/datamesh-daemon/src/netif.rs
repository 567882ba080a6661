//! Interface discovery - local IPv4 addresses and the broadcast target

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::{debug, warn};

use datamesh_core::NodeConfig;

/// One configured interface that has an IPv4 address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub addr: Ipv4Addr,
    pub netmask: Option<Ipv4Addr>,
}

impl Interface {
    /// Directed broadcast from the OS netmask, else the address-class guess
    pub fn broadcast(&self) -> Ipv4Addr {
        match self.netmask {
            Some(mask) => directed_broadcast(self.addr, mask),
            None => heuristic_broadcast(self.addr),
        }
    }
}

pub fn directed_broadcast(addr: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) | !u32::from(mask))
}

/// `/8` for `10.x.x.x`, `/24` for anything else
pub fn heuristic_broadcast(addr: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = addr.octets();
    if a == 10 {
        Ipv4Addr::new(a, 255, 255, 255)
    } else {
        Ipv4Addr::new(a, b, c, 255)
    }
}

/// IPv4 addresses of the named interfaces, in the order given.
/// Interfaces that are absent or have no IPv4 address are skipped.
pub fn discover(names: &[String]) -> Vec<Interface> {
    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("getifaddrs failed: {}", e);
            return Vec::new();
        }
    };

    let mut found: BTreeMap<String, Interface> = BTreeMap::new();
    for ifa in addrs {
        if found.contains_key(&ifa.interface_name) || !names.contains(&ifa.interface_name) {
            continue;
        }
        let Some(sin) = ifa.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
            continue;
        };
        let netmask = ifa
            .netmask
            .as_ref()
            .and_then(|m| m.as_sockaddr_in())
            .map(|m| *SocketAddrV4::from(*m).ip());

        let iface = Interface {
            name: ifa.interface_name.clone(),
            addr: *SocketAddrV4::from(*sin).ip(),
            netmask,
        };
        debug!(iface = %iface.name, addr = %iface.addr, "interface up");
        found.insert(ifa.interface_name, iface);
    }

    names.iter().filter_map(|name| found.remove(name)).collect()
}

/// Where presence datagrams go: config override, then the primary
/// (first) interface, then the limited broadcast address
pub fn broadcast_target(config: &NodeConfig, interfaces: &[Interface]) -> Ipv4Addr {
    if let Some(addr) = config.broadcast_addr {
        return addr;
    }
    match interfaces.first() {
        Some(primary) => primary.broadcast(),
        None => {
            warn!("No configured interface is up, using limited broadcast");
            Ipv4Addr::BROADCAST
        }
    }
}

pub fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(addr: [u8; 4], mask: Option<[u8; 4]>) -> Interface {
        Interface {
            name: "eth0".into(),
            addr: Ipv4Addr::from(addr),
            netmask: mask.map(Ipv4Addr::from),
        }
    }

    #[test]
    fn test_heuristic_broadcast() {
        assert_eq!(
            heuristic_broadcast(Ipv4Addr::new(10, 1, 2, 3)),
            Ipv4Addr::new(10, 255, 255, 255)
        );
        assert_eq!(
            heuristic_broadcast(Ipv4Addr::new(192, 168, 1, 20)),
            Ipv4Addr::new(192, 168, 1, 255)
        );
    }

    #[test]
    fn test_netmask_wins_over_heuristic() {
        assert_eq!(
            iface([10, 1, 2, 3], Some([255, 255, 0, 0])).broadcast(),
            Ipv4Addr::new(10, 1, 255, 255)
        );
        assert_eq!(
            iface([172, 16, 4, 9], Some([255, 255, 252, 0])).broadcast(),
            Ipv4Addr::new(172, 16, 7, 255)
        );
        assert_eq!(
            iface([10, 1, 2, 3], None).broadcast(),
            Ipv4Addr::new(10, 255, 255, 255)
        );
    }

    #[test]
    fn test_broadcast_target_fallbacks() {
        let config = NodeConfig::default();
        assert_eq!(broadcast_target(&config, &[]), Ipv4Addr::BROADCAST);

        let primary = iface([192, 168, 0, 7], Some([255, 255, 255, 0]));
        assert_eq!(
            broadcast_target(&config, &[primary.clone()]),
            Ipv4Addr::new(192, 168, 0, 255)
        );

        let config = NodeConfig {
            broadcast_addr: Some(Ipv4Addr::LOCALHOST),
            ..NodeConfig::default()
        };
        assert_eq!(broadcast_target(&config, &[primary]), Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn test_discover_unknown_names() {
        assert!(discover(&["no-such-if0".to_string()]).is_empty());
        assert!(discover(&[]).is_empty());
    }
}
