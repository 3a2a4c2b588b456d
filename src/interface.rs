//! Link-layer interface inventory.
//!
//! Snapshots of every interface the kernel reports, refreshed wholesale on
//! interface-list changes. Each IFState keeps its own private copy of the
//! snapshot it was created from.

use std::io;

use nix::net::if_::{self, InterfaceFlags};
use tracing::debug;

/// Immutable snapshot of one link-layer interface.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    pub flags: InterfaceFlags,
    /// Hardware address, when the interface has one.
    pub link_addr: Option<[u8; 6]>,
}

impl Interface {
    pub fn is_loopback(&self) -> bool {
        self.flags.contains(InterfaceFlags::IFF_LOOPBACK)
    }

    pub fn supports_multicast(&self) -> bool {
        self.flags.contains(InterfaceFlags::IFF_MULTICAST)
    }

    pub fn is_point_to_point(&self) -> bool {
        self.flags.contains(InterfaceFlags::IFF_POINTOPOINT)
    }
}

/// The set of interfaces currently known to the daemon.
pub struct Inventory {
    interfaces: Vec<Interface>,
}

impl Inventory {
    pub fn empty() -> Self {
        Inventory {
            interfaces: Vec::new(),
        }
    }

    /// Build an inventory from pre-made snapshots (tests, fixtures).
    pub fn from_interfaces(interfaces: Vec<Interface>) -> Self {
        Inventory { interfaces }
    }

    /// Re-enumerate all interfaces from the kernel.
    pub fn refresh(&mut self) -> io::Result<()> {
        let mut interfaces: Vec<Interface> = Vec::new();

        for ifaddr in nix::ifaddrs::getifaddrs().map_err(io::Error::from)? {
            let position = interfaces
                .iter()
                .position(|i| i.name == ifaddr.interface_name);
            let index = match position {
                Some(index) => index,
                None => {
                    let ifindex = if_::if_nametoindex(ifaddr.interface_name.as_str())
                        .map(|i| i as u32)
                        .unwrap_or(0);
                    interfaces.push(Interface {
                        name: ifaddr.interface_name.clone(),
                        index: ifindex,
                        flags: ifaddr.flags,
                        link_addr: None,
                    });
                    interfaces.len() - 1
                }
            };
            let entry = &mut interfaces[index];

            if let Some(link) = ifaddr.address.as_ref().and_then(|a| a.as_link_addr())
                && let Some(mac) = link.addr()
                && mac != [0u8; 6]
            {
                entry.link_addr = Some(mac);
            }
        }

        debug!(count = interfaces.len(), "interface inventory refreshed");
        self.interfaces = interfaces;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interface> {
        self.interfaces.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.interfaces.iter().map(|i| i.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ethernet(name: &str) -> Interface {
        Interface {
            name: name.to_string(),
            index: 2,
            flags: InterfaceFlags::IFF_UP
                | InterfaceFlags::IFF_RUNNING
                | InterfaceFlags::IFF_MULTICAST,
            link_addr: Some([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]),
        }
    }

    #[test]
    fn test_capability_predicates() {
        let eth = ethernet("en0");
        assert!(eth.supports_multicast());
        assert!(!eth.is_loopback());

        let lo = Interface {
            name: "lo".to_string(),
            index: 1,
            flags: InterfaceFlags::IFF_UP | InterfaceFlags::IFF_LOOPBACK,
            link_addr: None,
        };
        assert!(lo.is_loopback());
        assert!(!lo.supports_multicast());
    }

    #[test]
    fn test_inventory_lookup() {
        let inv = Inventory::from_interfaces(vec![ethernet("en0"), ethernet("en1")]);
        assert!(inv.contains("en0"));
        assert!(inv.get("en1").is_some());
        assert!(inv.get("en2").is_none());
        assert_eq!(inv.names(), vec!["en0".to_string(), "en1".to_string()]);
    }
}
