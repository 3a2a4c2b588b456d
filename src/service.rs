//! Services: one administrator-visible configuration instance per
//! (method, bound interface) pair, plus the per-service store publication.

use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use serde_json::{Value, json};
use tracing::debug;

use crate::kernel::AddressManager;
use crate::method::MethodState;
use crate::store::Store;

/// Configuration method identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodId {
    Manual,
    LinkLocal,
    /// Stateless autoconfiguration via router discovery.
    Automatic,
    SixToFour,
}

impl MethodId {
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodId::Manual => "manual",
            MethodId::LinkLocal => "link-local",
            MethodId::Automatic => "automatic",
            MethodId::SixToFour => "6to4",
        }
    }

    /// Dynamic methods acquire addresses from the outside world; at most one
    /// of them may run per interface.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, MethodId::Automatic | MethodId::SixToFour)
    }
}

impl std::str::FromStr for MethodId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(MethodId::Manual),
            "link-local" => Ok(MethodId::LinkLocal),
            "automatic" => Ok(MethodId::Automatic),
            "6to4" => Ok(MethodId::SixToFour),
            _ => Err(()),
        }
    }
}

/// Identifies one service: its interface plus the opaque serviceID, which is
/// absent for the interface's private link-local service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub interface: String,
    pub id: Option<String>,
}

impl ServiceKey {
    pub fn new(interface: &str, id: &str) -> Self {
        ServiceKey {
            interface: interface.to_string(),
            id: Some(id.to_string()),
        }
    }

    pub fn link_local(interface: &str) -> Self {
        ServiceKey {
            interface: interface.to_string(),
            id: None,
        }
    }

    pub fn is_link_local(&self) -> bool {
        self.id.is_none()
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}/{}", self.interface, id),
            None => write!(f, "{}/link-local", self.interface),
        }
    }
}

/// One address a service currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeldAddress {
    pub addr: Ipv6Addr,
    pub prefix_len: u8,
    pub flags: u32,
}

impl HeldAddress {
    /// Network mask derived from the prefix length.
    pub fn prefix_mask(&self) -> Ipv6Addr {
        Ipv6Net::new(Ipv6Addr::UNSPECIFIED, self.prefix_len)
            .map(|n| n.netmask())
            .unwrap_or(Ipv6Addr::UNSPECIFIED)
    }
}

/// Addresses a service holds plus its discovered/assigned default router.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressInfo {
    pub addresses: Vec<HeldAddress>,
    pub router: Option<Ipv6Addr>,
}

/// What a service last wrote to the store, for idempotent publication.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Published {
    Success(Value),
    Failure(&'static str),
}

/// One configuration instance bound to an interface.
pub struct Service {
    pub key: ServiceKey,
    pub method: MethodId,
    /// Method-private state. `Some` exactly while the service is started.
    pub state: Option<MethodState>,
    pub info: AddressInfo,
    published: Option<Published>,
}

impl Service {
    pub fn new(key: ServiceKey, method: MethodId) -> Self {
        Service {
            key,
            method,
            state: None,
            info: AddressInfo::default(),
            published: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.state.is_some()
    }

    /// Store path of this service's address record.
    pub fn store_path(&self) -> String {
        match &self.key.id {
            Some(id) => format!(
                "state/network/interface/{}/ipv6/{}",
                self.key.interface, id
            ),
            None => format!(
                "state/network/interface/{}/ipv6/link-local",
                self.key.interface
            ),
        }
    }

    /// Store path of this service's failure record.
    pub fn status_path(&self) -> String {
        format!("{}/status", self.store_path())
    }

    /// Publish the current address info. A republish of identical content is
    /// a no-op.
    pub fn publish_success(&mut self, store: &mut Store) {
        let record = json!({
            "addresses": self.info.addresses.iter().map(|a| a.addr.to_string()).collect::<Vec<_>>(),
            "prefix_lens": self.info.addresses.iter().map(|a| a.prefix_len).collect::<Vec<_>>(),
            "flags": self.info.addresses.iter().map(|a| a.flags).collect::<Vec<_>>(),
            "router": self.info.router.map(|r| r.to_string()),
        });
        if self.published == Some(Published::Success(record.clone())) {
            return;
        }
        debug!(service = %self.key, "publishing address info");
        store.remove(&self.status_path());
        store.set(&self.store_path(), record.clone());
        self.published = Some(Published::Success(record));
    }

    /// Publish a failure: the address record is cleared, not emptied, and the
    /// failure kind lands on the status path. Repeating the same failure is a
    /// no-op.
    pub fn publish_failure(&mut self, store: &mut Store, kind: &'static str) {
        if self.published == Some(Published::Failure(kind)) {
            return;
        }
        debug!(service = %self.key, kind, "publishing failure");
        store.remove(&self.store_path());
        store.set(&self.status_path(), json!({ "status": kind }));
        self.published = Some(Published::Failure(kind));
    }

    /// Remove every trace of this service from the store.
    pub fn clear_publication(&mut self, store: &mut Store) {
        store.remove(&self.store_path());
        store.remove(&self.status_path());
        self.published = None;
    }

    /// Record `addr` as held. Call only after the kernel add succeeded.
    pub fn hold_address(&mut self, addr: HeldAddress) {
        if !self.info.addresses.iter().any(|a| a.addr == addr.addr) {
            self.info.addresses.push(addr);
        }
    }

    /// Remove every held address from the kernel and the in-memory record.
    ///
    /// An address still referenced by another service on the same interface
    /// is skipped at the kernel layer (shared ownership by address); the
    /// in-memory record is cleared either way.
    pub fn withdraw_addresses(
        &mut self,
        kernel: &mut dyn AddressManager,
        peer_addresses: &[Ipv6Addr],
    ) {
        for held in std::mem::take(&mut self.info.addresses) {
            if peer_addresses.contains(&held.addr) {
                debug!(
                    service = %self.key,
                    address = %held.addr,
                    "address shared with another service, kernel removal skipped"
                );
                continue;
            }
            if let Err(e) = kernel.remove_address(&self.key.interface, held.addr) {
                debug!(
                    service = %self.key,
                    address = %held.addr,
                    error = %e,
                    "kernel address removal failed"
                );
            }
        }
        self.info.router = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeKernel;

    fn held(addr: &str, prefix_len: u8) -> HeldAddress {
        HeldAddress {
            addr: addr.parse().unwrap(),
            prefix_len,
            flags: 0,
        }
    }

    #[test]
    fn test_method_id_roundtrip() {
        for id in [
            MethodId::Manual,
            MethodId::LinkLocal,
            MethodId::Automatic,
            MethodId::SixToFour,
        ] {
            let parsed: MethodId = id.as_str().parse().unwrap();
            assert_eq!(id, parsed);
        }
        assert!("dhcp".parse::<MethodId>().is_err());
    }

    #[test]
    fn test_prefix_mask() {
        assert_eq!(
            held("2001:db8::1", 64).prefix_mask(),
            "ffff:ffff:ffff:ffff::".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(
            held("2002:102:304:1::1", 16).prefix_mask(),
            "ffff::".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn test_publish_is_idempotent() {
        let mut store = Store::new();
        let mut svc = Service::new(ServiceKey::new("en0", "s1"), MethodId::Manual);
        svc.hold_address(held("2001:db8::1", 64));

        svc.publish_success(&mut store);
        let first = store.get(&svc.store_path()).cloned();
        svc.publish_success(&mut store);
        assert_eq!(store.get(&svc.store_path()).cloned(), first);

        svc.publish_failure(&mut store, "media-inactive");
        assert!(store.get(&svc.store_path()).is_none());
        assert_eq!(
            store.get(&svc.status_path()).unwrap()["status"],
            "media-inactive"
        );

        svc.clear_publication(&mut store);
        assert!(store.get(&svc.status_path()).is_none());
    }

    #[test]
    fn test_withdraw_skips_shared_addresses() {
        let mut kernel = FakeKernel::new();
        let mut svc = Service::new(ServiceKey::new("en0", "s1"), MethodId::Manual);
        svc.hold_address(held("2001:db8::1", 64));
        svc.hold_address(held("2001:db8::2", 64));

        let shared: Vec<Ipv6Addr> = vec!["2001:db8::2".parse().unwrap()];
        svc.withdraw_addresses(&mut kernel, &shared);

        assert_eq!(
            kernel.removed_addresses(),
            vec!["2001:db8::1".parse::<Ipv6Addr>().unwrap()]
        );
        assert!(svc.info.addresses.is_empty());
    }
}
