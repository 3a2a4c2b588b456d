//! Per-interface state: each IFState owns the services configured on one
//! interface, its private link-local service included, plus the cached link
//! status and the last kernel address snapshot used for change detection.

use std::collections::BTreeMap;
use std::net::Ipv6Addr;

use crate::error::ConfigError;
use crate::interface::Interface;
use crate::kernel::{KernelAddress, LinkStatus};
use crate::service::{Service, ServiceKey};

/// State of one physical interface.
pub struct IfState {
    pub interface: Interface,
    pub link: LinkStatus,
    services: Vec<Service>,
    /// Last kernel-reported address list, for StateChange delta detection.
    pub last_addresses: Vec<KernelAddress>,
}

impl IfState {
    pub fn new(interface: Interface) -> Self {
        IfState {
            interface,
            link: LinkStatus::unknown(),
            services: Vec::new(),
            last_addresses: Vec::new(),
        }
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn service_index(&self, key: &ServiceKey) -> Option<usize> {
        self.services.iter().position(|s| s.key == *key)
    }

    pub fn service_mut(&mut self, key: &ServiceKey) -> Option<&mut Service> {
        self.services.iter_mut().find(|s| s.key == *key)
    }

    pub fn service_at_mut(&mut self, index: usize) -> &mut Service {
        &mut self.services[index]
    }

    pub fn link_local_service(&self) -> Option<&Service> {
        self.services.iter().find(|s| s.key.is_link_local())
    }

    pub fn has_dynamic_service(&self) -> bool {
        self.services.iter().any(|s| s.method.is_dynamic())
    }

    /// Insert a new service, upholding the per-interface invariants: one
    /// service per key, one dynamic service, one link-local service.
    pub fn add_service(&mut self, service: Service) -> Result<usize, ConfigError> {
        if self.service_index(&service.key).is_some() {
            return Err(ConfigError::Internal(format!(
                "service {} already exists",
                service.key
            )));
        }
        if service.key.is_link_local() && self.link_local_service().is_some() {
            return Err(ConfigError::Internal(format!(
                "{}: link-local service already exists",
                self.interface.name
            )));
        }
        if service.method.is_dynamic() && self.has_dynamic_service() {
            return Err(ConfigError::InvalidOperation(format!(
                "{}: a dynamic configuration method is already active",
                self.interface.name
            )));
        }
        self.services.push(service);
        Ok(self.services.len() - 1)
    }

    /// Detach the service at `index`. The caller must already have delivered
    /// the stop event.
    pub fn take_service(&mut self, index: usize) -> Service {
        self.services.remove(index)
    }

    /// True when only the private link-local service remains.
    pub fn only_link_local_left(&self) -> bool {
        self.services.iter().all(|s| s.key.is_link_local())
    }

    /// Addresses held by every service except the one identified by `key`.
    /// Used to skip kernel removal of shared addresses.
    pub fn peer_addresses(&self, key: &ServiceKey) -> Vec<Ipv6Addr> {
        self.services
            .iter()
            .filter(|s| s.key != *key)
            .flat_map(|s| s.info.addresses.iter().map(|a| a.addr))
            .collect()
    }

    pub fn service_keys(&self) -> Vec<ServiceKey> {
        self.services.iter().map(|s| s.key.clone()).collect()
    }
}

/// All live IFStates, keyed by interface name.
pub struct IfStateTable {
    map: BTreeMap<String, IfState>,
}

impl IfStateTable {
    pub fn new() -> Self {
        IfStateTable {
            map: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&IfState> {
        self.map.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut IfState> {
        self.map.get_mut(name)
    }

    /// IFStates are created lazily the first time a service is configured on
    /// an interface.
    pub fn get_or_create(&mut self, interface: &Interface) -> &mut IfState {
        self.map
            .entry(interface.name.clone())
            .or_insert_with(|| IfState::new(interface.clone()))
    }

    pub fn remove(&mut self, name: &str) -> Option<IfState> {
        self.map.remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &IfState)> {
        self.map.iter()
    }
}

impl Default for IfStateTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::MethodId;
    use crate::test_util::test_interface;

    #[test]
    fn test_add_service_invariants() {
        let mut ifstate = IfState::new(test_interface("en0"));

        ifstate
            .add_service(Service::new(ServiceKey::link_local("en0"), MethodId::LinkLocal))
            .unwrap();
        // Second link-local service rejected.
        assert!(
            ifstate
                .add_service(Service::new(
                    ServiceKey::link_local("en0"),
                    MethodId::LinkLocal
                ))
                .is_err()
        );

        ifstate
            .add_service(Service::new(ServiceKey::new("en0", "s1"), MethodId::Automatic))
            .unwrap();
        // Second dynamic service rejected.
        let err = ifstate
            .add_service(Service::new(ServiceKey::new("en0", "s2"), MethodId::SixToFour))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid-operation");

        // Manual services with distinct keys are fine.
        ifstate
            .add_service(Service::new(ServiceKey::new("en0", "s3"), MethodId::Manual))
            .unwrap();
        assert_eq!(ifstate.services().len(), 3);
    }

    #[test]
    fn test_peer_addresses() {
        let mut ifstate = IfState::new(test_interface("en0"));
        let i1 = ifstate
            .add_service(Service::new(ServiceKey::new("en0", "s1"), MethodId::Manual))
            .unwrap();
        ifstate
            .add_service(Service::new(ServiceKey::new("en0", "s2"), MethodId::Manual))
            .unwrap();

        ifstate.service_at_mut(i1).hold_address(crate::service::HeldAddress {
            addr: "2001:db8::1".parse().unwrap(),
            prefix_len: 64,
            flags: 0,
        });

        let peers = ifstate.peer_addresses(&ServiceKey::new("en0", "s2"));
        assert_eq!(peers, vec!["2001:db8::1".parse::<Ipv6Addr>().unwrap()]);
        assert!(ifstate.peer_addresses(&ServiceKey::new("en0", "s1")).is_empty());
    }

    #[test]
    fn test_table_lifecycle() {
        let mut table = IfStateTable::new();
        let iface = test_interface("en0");

        table.get_or_create(&iface);
        assert!(table.get("en0").is_some());
        assert_eq!(table.names(), vec!["en0".to_string()]);

        table.remove("en0");
        assert!(table.get("en0").is_none());
    }
}
