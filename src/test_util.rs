//! Test fixtures: a recording fake kernel, fake router-discovery I/O, and a
//! harness bundling everything a method state machine touches.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::Ipv6Addr;

use nix::net::if_::InterfaceFlags;

use crate::interface::Interface;
use crate::kernel::{AddressManager, KernelAddress, LinkStatus};
use crate::method::{Ipv4Primary, MethodCtx, MethodIo};
use crate::service::{MethodId, Service, ServiceKey};
use crate::store::Store;
use crate::timer::{TimerEvent, Timers};

/// An up, running, multicast-capable ethernet-like interface.
pub fn test_interface(name: &str) -> Interface {
    Interface {
        name: name.to_string(),
        index: 2,
        flags: InterfaceFlags::IFF_UP
            | InterfaceFlags::IFF_RUNNING
            | InterfaceFlags::IFF_MULTICAST,
        link_addr: Some([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]),
    }
}

pub fn loopback_interface(name: &str) -> Interface {
    Interface {
        name: name.to_string(),
        index: 1,
        flags: InterfaceFlags::IFF_UP
            | InterfaceFlags::IFF_RUNNING
            | InterfaceFlags::IFF_LOOPBACK,
        link_addr: None,
    }
}

/// [`AddressManager`] that records every call and tracks the applied set.
pub struct FakeKernel {
    /// Coarse call log, one entry per operation.
    pub calls: Vec<String>,
    pub forwarding: bool,
    pub link_local_ready: bool,
    pub link: LinkStatus,
    /// Address lists returned by `interface_addresses`, keyed by interface.
    pub addresses: HashMap<String, Vec<KernelAddress>>,
    /// Fail the next `add_address` call.
    pub fail_add: bool,
    applied: Vec<(String, Ipv6Addr, u8)>,
    removed: Vec<(String, Ipv6Addr)>,
}

impl FakeKernel {
    pub fn new() -> Self {
        FakeKernel {
            calls: Vec::new(),
            forwarding: false,
            link_local_ready: true,
            link: LinkStatus {
                valid: true,
                active: true,
            },
            addresses: HashMap::new(),
            fail_add: false,
            applied: Vec::new(),
            removed: Vec::new(),
        }
    }

    /// Addresses currently applied (added and not since removed).
    pub fn applied_addresses(&self) -> Vec<Ipv6Addr> {
        self.applied.iter().map(|(_, addr, _)| *addr).collect()
    }

    /// Every address ever removed, in removal order.
    pub fn removed_addresses(&self) -> Vec<Ipv6Addr> {
        self.removed.iter().map(|(_, addr)| *addr).collect()
    }
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressManager for FakeKernel {
    fn add_address(&mut self, ifname: &str, addr: Ipv6Addr, prefix_len: u8) -> io::Result<()> {
        self.calls
            .push(format!("add_address {ifname} {addr}/{prefix_len}"));
        if self.fail_add {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        }
        self.applied.push((ifname.to_string(), addr, prefix_len));
        Ok(())
    }

    fn remove_address(&mut self, ifname: &str, addr: Ipv6Addr) -> io::Result<()> {
        self.calls.push(format!("remove_address {ifname} {addr}"));
        self.applied.retain(|(i, a, _)| !(i == ifname && *a == addr));
        self.removed.push((ifname.to_string(), addr));
        Ok(())
    }

    fn interface_addresses(&mut self, ifname: &str) -> io::Result<Vec<KernelAddress>> {
        Ok(self.addresses.get(ifname).cloned().unwrap_or_default())
    }

    fn attach_protocol(&mut self, ifname: &str) -> io::Result<()> {
        self.calls.push(format!("attach_protocol {ifname}"));
        Ok(())
    }

    fn detach_protocol(&mut self, ifname: &str) -> io::Result<()> {
        self.calls.push(format!("detach_protocol {ifname}"));
        Ok(())
    }

    fn start_link_local(&mut self, ifname: &str) -> io::Result<()> {
        self.calls.push(format!("start_link_local {ifname}"));
        Ok(())
    }

    fn stop_link_local(&mut self, ifname: &str) -> io::Result<()> {
        self.calls.push(format!("stop_link_local {ifname}"));
        Ok(())
    }

    fn link_local_ready(&mut self, _ifname: &str) -> io::Result<bool> {
        Ok(self.link_local_ready)
    }

    fn set_accept_router_advertisements(&mut self, ifname: &str, accept: bool) -> io::Result<()> {
        let mode = if accept { "on" } else { "off" };
        self.calls.push(format!("accept_ra {ifname} {mode}"));
        Ok(())
    }

    fn forwarding_enabled(&mut self) -> io::Result<bool> {
        Ok(self.forwarding)
    }

    fn flush_prefixes(&mut self) -> io::Result<()> {
        self.calls.push("flush_prefixes".to_string());
        Ok(())
    }

    fn flush_routes(&mut self) -> io::Result<()> {
        self.calls.push("flush_routes".to_string());
        Ok(())
    }

    fn flush_interface_routes(&mut self, ifname: &str) -> io::Result<()> {
        self.calls.push(format!("flush_interface_routes {ifname}"));
        Ok(())
    }

    fn link_status(&mut self, _ifname: &str) -> io::Result<LinkStatus> {
        Ok(self.link)
    }
}

/// [`MethodIo`] that records sockets, solicitations and resolutions.
pub struct FakeMethodIo {
    pub open: HashSet<ServiceKey>,
    pub solicitations: Vec<(ServiceKey, Vec<u8>)>,
    pub resolves: Vec<(ServiceKey, String)>,
    pub cancelled: Vec<ServiceKey>,
    pub fail_open: bool,
}

impl FakeMethodIo {
    pub fn new() -> Self {
        FakeMethodIo {
            open: HashSet::new(),
            solicitations: Vec::new(),
            resolves: Vec::new(),
            cancelled: Vec::new(),
            fail_open: false,
        }
    }
}

impl Default for FakeMethodIo {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodIo for FakeMethodIo {
    fn open_ra(&mut self, key: &ServiceKey, _interface: &Interface) -> io::Result<()> {
        if self.fail_open {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        }
        self.open.insert(key.clone());
        Ok(())
    }

    fn send_solicitation(&mut self, key: &ServiceKey, message: &[u8]) -> io::Result<()> {
        self.solicitations.push((key.clone(), message.to_vec()));
        Ok(())
    }

    fn close_ra(&mut self, key: &ServiceKey) {
        self.open.remove(key);
    }

    fn resolve_relay(&mut self, key: &ServiceKey, name: &str) {
        self.resolves.push((key.clone(), name.to_string()));
    }

    fn cancel_resolve(&mut self, key: &ServiceKey) {
        self.cancelled.push(key.clone());
    }
}

/// Everything a state-machine test needs, in one place.
pub struct Harness {
    pub interface: Interface,
    pub link: LinkStatus,
    pub peer_addresses: Vec<Ipv6Addr>,
    pub kernel: FakeKernel,
    pub store: Store,
    pub timers: Timers,
    pub io: FakeMethodIo,
    pub ipv4_primary: Ipv4Primary,
}

impl Harness {
    pub fn new(interface: Interface) -> Self {
        Harness {
            interface,
            link: LinkStatus {
                valid: true,
                active: true,
            },
            peer_addresses: Vec::new(),
            kernel: FakeKernel::new(),
            store: Store::new(),
            timers: Timers::new(),
            io: FakeMethodIo::new(),
            ipv4_primary: Ipv4Primary::default(),
        }
    }

    pub fn ctx(&mut self) -> MethodCtx<'_> {
        MethodCtx {
            interface: &self.interface,
            link: self.link,
            peer_addresses: self.peer_addresses.clone(),
            kernel: &mut self.kernel,
            store: &mut self.store,
            timers: &mut self.timers,
            io: &mut self.io,
            ipv4_primary: &self.ipv4_primary,
        }
    }

    pub fn new_service(&self, id: &str, method: MethodId) -> Service {
        Service::new(ServiceKey::new(&self.interface.name, id), method)
    }

    pub fn link_local_service(&self) -> Service {
        Service::new(
            ServiceKey::link_local(&self.interface.name),
            MethodId::LinkLocal,
        )
    }

    /// Route a fired timer event back into the service.
    pub fn fire(&mut self, service: &mut Service, event: TimerEvent) {
        if let TimerEvent::Service { kind, .. } = event {
            let mut ctx = self.ctx();
            crate::method::timer(service, kind, &mut ctx);
        }
    }
}
