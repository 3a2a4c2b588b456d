//! Configuration-method dispatch.
//!
//! This module is the only place that knows all four configuration methods.
//! Each method implements [`ConfigMethod`], one shared event contract; the
//! dispatcher validates interface capability, guards the coarse service
//! lifecycle (absent → starting → active → absent) and funnels every
//! lifecycle event into the per-method entry point.
//!
//! Lifecycle guarantees enforced here rather than per method:
//! - `start` is never delivered re-entrantly (private state must be absent);
//! - `stop` unconditionally withdraws held addresses and clears the store
//!   publication after the method's own teardown ran;
//! - events other than `start` are dropped for services that are not active.

pub mod linklocal;
pub mod manual;
pub mod rtadv;
pub mod sixtofour;

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::icmp6::RecvPacket;
use crate::interface::Interface;
use crate::kernel::{AddressManager, KernelAddress, LinkStatus};
use crate::service::{MethodId, Service, ServiceKey};
use crate::store::Store;
use crate::timer::{TimerKind, Timers};

/// Grace period between link going down and unpublishing a service.
pub const LINK_INACTIVE_GRACE: Duration = Duration::from_secs(20);

/// One statically configured address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticAddress {
    pub addr: Ipv6Addr,
    pub prefix_len: u8,
}

/// Where 6to4 encapsulated traffic exits to the IPv6 internet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAddress {
    Ipv6(Ipv6Addr),
    Ipv4(Ipv4Addr),
    /// Resolved asynchronously when the service starts.
    Name(String),
}

impl std::str::FromStr for RelayAddress {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(());
        }
        if let Ok(v6) = s.parse::<Ipv6Addr>() {
            return Ok(RelayAddress::Ipv6(v6));
        }
        if let Ok(v4) = s.parse::<Ipv4Addr>() {
            return Ok(RelayAddress::Ipv4(v4));
        }
        Ok(RelayAddress::Name(s.to_string()))
    }
}

/// Per-method configuration payload carried by start/change events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodData {
    Manual { addresses: Vec<StaticAddress> },
    LinkLocal,
    Automatic,
    SixToFour { relay: RelayAddress },
}

impl MethodData {
    pub fn method_id(&self) -> MethodId {
        match self {
            MethodData::Manual { .. } => MethodId::Manual,
            MethodData::LinkLocal => MethodId::LinkLocal,
            MethodData::Automatic => MethodId::Automatic,
            MethodData::SixToFour { .. } => MethodId::SixToFour,
        }
    }
}

/// Current primary IPv4 service, as read from the dynamic store. 6to4
/// derives its address from the first eligible entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ipv4Primary {
    pub addresses: Vec<Ipv4Addr>,
}

/// Asynchronous I/O the method state machines may request: the raw
/// router-discovery socket and relay name resolution. Implemented over real
/// sockets by the daemon and by a recording fake in tests.
pub trait MethodIo {
    /// Open the per-service router-discovery socket.
    fn open_ra(&mut self, key: &ServiceKey, interface: &Interface) -> io::Result<()>;

    /// Send a Router Solicitation message on the service's socket.
    fn send_solicitation(&mut self, key: &ServiceKey, message: &[u8]) -> io::Result<()>;

    /// Release the service's socket and its read registration.
    fn close_ra(&mut self, key: &ServiceKey);

    /// Start resolving a relay name; completion arrives as an event.
    fn resolve_relay(&mut self, key: &ServiceKey, name: &str);

    /// Cancel an in-flight relay resolution.
    fn cancel_resolve(&mut self, key: &ServiceKey);
}

/// Everything a state machine may touch while handling one event.
pub struct MethodCtx<'a> {
    pub interface: &'a Interface,
    pub link: LinkStatus,
    /// Addresses held by sibling services on the same interface; kernel
    /// removal of these is skipped.
    pub peer_addresses: Vec<Ipv6Addr>,
    pub kernel: &'a mut dyn AddressManager,
    pub store: &'a mut Store,
    pub timers: &'a mut Timers,
    pub io: &'a mut dyn MethodIo,
    pub ipv4_primary: &'a Ipv4Primary,
}

/// Events delivered through the per-method entry point.
pub enum MethodEvent<'a> {
    Start(&'a MethodData),
    Stop,
    Change(&'a MethodData),
    Media(LinkStatus),
    StateChange(&'a [KernelAddress]),
    Ipv4PrimaryChange,
    Timer(TimerKind),
    Packet(&'a RecvPacket),
    RelayResolved(&'a [IpAddr]),
}

/// What a method reports back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    /// Change cannot be applied in place; the caller must stop and restart.
    NeedsStop,
}

/// Method-private state; `Some` on a service exactly while it is started.
pub enum MethodState {
    Manual(manual::ManualState),
    LinkLocal(linklocal::LinkLocalState),
    Automatic(rtadv::RtadvState),
    SixToFour(sixtofour::SixToFourState),
}

/// One configuration method's state machine.
pub trait ConfigMethod: Sync {
    fn method_id(&self) -> MethodId;

    /// The shared event entry point.
    fn handle(
        &self,
        service: &mut Service,
        event: MethodEvent<'_>,
        ctx: &mut MethodCtx<'_>,
    ) -> Result<Outcome, ConfigError>;
}

static METHODS: &[&dyn ConfigMethod] = &[
    &manual::ManualMethod,
    &linklocal::LinkLocalMethod,
    &rtadv::RtadvMethod,
    &sixtofour::SixToFourMethod,
];

/// Look up the state machine for a method identifier.
pub fn lookup(id: MethodId) -> Option<&'static dyn ConfigMethod> {
    METHODS.iter().copied().find(|m| m.method_id() == id)
}

fn validate_interface(id: MethodId, interface: &Interface) -> Result<(), ConfigError> {
    if id != MethodId::SixToFour
        && !interface.supports_multicast()
        && !interface.is_loopback()
    {
        return Err(ConfigError::InvalidOperation(format!(
            "{} does not support multicast",
            interface.name
        )));
    }
    if interface.is_loopback() && id.is_dynamic() {
        return Err(ConfigError::InvalidOperation(format!(
            "{} cannot run on a loopback interface",
            id.as_str()
        )));
    }
    Ok(())
}

/// Start a service. Shape errors are published once and leave the service
/// absent; no kernel state is mutated on the failure paths.
pub fn start(
    service: &mut Service,
    data: &MethodData,
    ctx: &mut MethodCtx<'_>,
) -> Result<(), ConfigError> {
    let result = (|| {
        let method = lookup(service.method).ok_or_else(|| {
            ConfigError::OperationNotSupported(service.method.as_str().to_string())
        })?;
        if service.is_started() {
            return Err(ConfigError::Internal(format!(
                "{}: start while already started",
                service.key
            )));
        }
        validate_interface(service.method, ctx.interface)?;
        method.handle(service, MethodEvent::Start(data), ctx)?;
        Ok(())
    })();

    if let Err(ref e) = result {
        warn!(service = %service.key, error = %e, "service start failed");
        // A re-entrant start must not disturb the running service; any other
        // failure left the service absent and is surfaced once.
        if !service.is_started() {
            service.publish_failure(ctx.store, e.kind());
        }
    }
    result
}

/// Stop a service. Always withdraws held addresses and clears the store
/// publication, whatever the method's own teardown did.
pub fn stop(service: &mut Service, ctx: &mut MethodCtx<'_>) -> Result<(), ConfigError> {
    if !service.is_started() {
        return Err(ConfigError::Internal(format!(
            "{}: stop of a service that was never started",
            service.key
        )));
    }
    if let Some(method) = lookup(service.method)
        && let Err(e) = method.handle(service, MethodEvent::Stop, ctx)
    {
        warn!(service = %service.key, error = %e, "method stop reported an error");
    }
    let peers = std::mem::take(&mut ctx.peer_addresses);
    service.withdraw_addresses(ctx.kernel, &peers);
    ctx.peer_addresses = peers;
    service.clear_publication(ctx.store);
    service.state = None;
    Ok(())
}

/// Deliver new configuration. Returns true when the caller must stop and
/// restart the service to apply it.
pub fn change(
    service: &mut Service,
    data: &MethodData,
    ctx: &mut MethodCtx<'_>,
) -> Result<bool, ConfigError> {
    if !service.is_started() {
        return Err(ConfigError::Internal(format!(
            "{}: change of a service that was never started",
            service.key
        )));
    }
    let method = lookup(service.method)
        .ok_or_else(|| ConfigError::OperationNotSupported(service.method.as_str().to_string()))?;
    let outcome = method.handle(service, MethodEvent::Change(data), ctx)?;
    Ok(outcome == Outcome::NeedsStop)
}

fn deliver(service: &mut Service, event: MethodEvent<'_>, ctx: &mut MethodCtx<'_>) {
    if !service.is_started() {
        debug!(service = %service.key, "event for inactive service dropped");
        return;
    }
    let Some(method) = lookup(service.method) else {
        return;
    };
    if let Err(e) = method.handle(service, event, ctx) {
        warn!(service = %service.key, error = %e, "event handling failed");
    }
}

/// Deliver the kernel's authoritative address list for the interface.
pub fn state_change(service: &mut Service, addrs: &[KernelAddress], ctx: &mut MethodCtx<'_>) {
    deliver(service, MethodEvent::StateChange(addrs), ctx);
}

/// Deliver a link-status change.
pub fn media(service: &mut Service, link: LinkStatus, ctx: &mut MethodCtx<'_>) {
    deliver(service, MethodEvent::Media(link), ctx);
}

/// Deliver a change of the primary IPv4 service (6to4 only cares).
pub fn ipv4_primary_change(service: &mut Service, ctx: &mut MethodCtx<'_>) {
    deliver(service, MethodEvent::Ipv4PrimaryChange, ctx);
}

/// Deliver a fired per-service timer.
pub fn timer(service: &mut Service, kind: TimerKind, ctx: &mut MethodCtx<'_>) {
    deliver(service, MethodEvent::Timer(kind), ctx);
}

/// Deliver an inbound router-discovery packet.
pub fn packet(service: &mut Service, pkt: &RecvPacket, ctx: &mut MethodCtx<'_>) {
    deliver(service, MethodEvent::Packet(pkt), ctx);
}

/// Deliver the result of a relay name resolution.
pub fn relay_resolved(service: &mut Service, addrs: &[IpAddr], ctx: &mut MethodCtx<'_>) {
    deliver(service, MethodEvent::RelayResolved(addrs), ctx);
}
