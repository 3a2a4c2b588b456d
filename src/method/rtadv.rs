//! Stateless autoconfiguration via router discovery ("Automatic").
//!
//! Host-side implementation of IPv6 router discovery: solicit on-link
//! routers with exponential backoff, validate inbound Router Advertisements,
//! then let the kernel derive addresses from the advertised prefixes and
//! publish whatever it reports as autoconfigured. Re-enters solicitation
//! when the link flaps or the address set collapses back to link-local only.

use std::net::Ipv6Addr;
use std::time::Duration;

use smoltcp::phy::{Checksum, ChecksumCapabilities};
use smoltcp::wire::{Icmpv6Message, Icmpv6Packet, Icmpv6Repr, NdiscRepr, RawHardwareAddress};
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::icmp6::{ALL_ROUTERS, RecvPacket};
use crate::interface::Interface;
use crate::kernel::KernelAddress;
use crate::method::{
    ConfigMethod, LINK_INACTIVE_GRACE, MethodCtx, MethodEvent, MethodState, Outcome,
};
use crate::service::{HeldAddress, MethodId, Service};
use crate::timer::{TimerEvent, TimerHandle, TimerKind};

/// Retry budget for the solicitation sub-loop.
const MAX_SOLICITATIONS: u32 = 10;

/// First inter-solicitation delay; doubles up to [`MAX_SOLICIT_INTERVAL`].
const INITIAL_SOLICIT_INTERVAL: Duration = Duration::from_secs(1);

/// Ceiling for the solicitation backoff.
const MAX_SOLICIT_INTERVAL: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Soliciting,
    /// A router answered; waiting for / tracking kernel-derived addresses.
    Responded,
    /// Retry budget exhausted. Not fatal: anything already obtained stays.
    Exhausted,
}

pub struct RtadvState {
    phase: Phase,
    solicits_sent: u32,
    solicit_timer: Option<TimerHandle>,
    link_timer: Option<TimerHandle>,
    router: Option<Ipv6Addr>,
}

pub struct RtadvMethod;

fn take_state(service: &mut Service) -> Result<RtadvState, ConfigError> {
    match service.state.take() {
        Some(MethodState::Automatic(st)) => Ok(st),
        other => {
            service.state = other;
            Err(ConfigError::Internal(format!(
                "{}: router-discovery state missing",
                service.key
            )))
        }
    }
}

/// Delay to wait after the n-th solicitation was sent.
fn solicit_interval(sent: u32) -> Duration {
    let exp = sent.saturating_sub(1).min(31);
    let secs = 1u64 << exp;
    INITIAL_SOLICIT_INTERVAL
        .saturating_mul(secs as u32)
        .min(MAX_SOLICIT_INTERVAL)
}

/// Router Solicitation message bytes (ICMPv6 only; the kernel fills in the
/// checksum on raw ICMPv6 sockets).
fn build_router_solicitation(interface: &Interface) -> Vec<u8> {
    let lladdr = interface
        .link_addr
        .map(|mac| RawHardwareAddress::from_bytes(&mac));
    let repr = Icmpv6Repr::Ndisc(NdiscRepr::RouterSolicit { lladdr });

    let mut caps = ChecksumCapabilities::default();
    caps.icmpv6 = Checksum::None;

    let mut buf = vec![0u8; repr.buffer_len()];
    let mut packet = Icmpv6Packet::new_unchecked(&mut buf);
    repr.emit(&Ipv6Addr::UNSPECIFIED, &ALL_ROUTERS, &mut packet, &caps);
    buf
}

/// Validate an inbound datagram as a usable Router Advertisement.
fn accept_advertisement(pkt: &RecvPacket, interface: &Interface) -> Result<(), &'static str> {
    if pkt.ifindex != interface.index {
        return Err("wrong interface");
    }
    if pkt.hop_limit != 255 {
        return Err("hop limit not 255");
    }
    if !pkt.source.is_unicast_link_local() {
        return Err("source not link-local");
    }
    let packet = Icmpv6Packet::new_checked(pkt.data.as_slice()).map_err(|_| "truncated")?;
    if packet.msg_type() != Icmpv6Message::RouterAdvert {
        return Err("not a router advertisement");
    }
    if packet.msg_code() != 0 {
        return Err("nonzero code");
    }
    let repr = NdiscRepr::parse(&packet).map_err(|_| "malformed")?;
    let NdiscRepr::RouterAdvert {
        router_lifetime, ..
    } = repr
    else {
        return Err("not a router advertisement");
    };
    if router_lifetime.secs() == 0 {
        return Err("zero router lifetime");
    }
    Ok(())
}

fn cancel_solicit_timer(st: &mut RtadvState, ctx: &mut MethodCtx<'_>) {
    if let Some(timer) = st.solicit_timer.take() {
        ctx.timers.cancel(timer);
    }
}

fn cancel_link_timer(st: &mut RtadvState, ctx: &mut MethodCtx<'_>) {
    if let Some(timer) = st.link_timer.take() {
        ctx.timers.cancel(timer);
    }
}

fn schedule_solicit(
    service: &Service,
    st: &mut RtadvState,
    ctx: &mut MethodCtx<'_>,
    delay: Duration,
) {
    st.solicit_timer = Some(ctx.timers.schedule(
        delay,
        TimerEvent::Service {
            key: service.key.clone(),
            kind: TimerKind::Solicit,
        },
    ));
}

fn begin_soliciting(service: &mut Service, st: &mut RtadvState, ctx: &mut MethodCtx<'_>) {
    cancel_solicit_timer(st, ctx);
    st.phase = Phase::Soliciting;
    st.solicits_sent = 0;
    solicit_step(service, st, ctx);
}

fn solicit_step(service: &mut Service, st: &mut RtadvState, ctx: &mut MethodCtx<'_>) {
    if st.solicits_sent >= MAX_SOLICITATIONS {
        info!(
            service = %service.key,
            error = %ConfigError::NoRouterResponse,
            "solicitation budget exhausted"
        );
        st.phase = Phase::Exhausted;
        st.solicit_timer = None;
        return;
    }

    // The provisional link-local address may still be running duplicate
    // detection; waiting for it does not consume the retry budget.
    let ready = ctx
        .kernel
        .link_local_ready(&service.key.interface)
        .unwrap_or(false);
    if !ready {
        schedule_solicit(service, st, ctx, INITIAL_SOLICIT_INTERVAL);
        return;
    }

    let message = build_router_solicitation(ctx.interface);
    if let Err(e) = ctx.io.send_solicitation(&service.key, &message) {
        debug!(service = %service.key, error = %e, "router solicitation send failed");
    }
    st.solicits_sent += 1;
    let delay = solicit_interval(st.solicits_sent);
    schedule_solicit(service, st, ctx, delay);
}

impl RtadvMethod {
    fn start(&self, service: &mut Service, ctx: &mut MethodCtx<'_>) -> Result<Outcome, ConfigError> {
        // Router discovery is a host-only protocol.
        if ctx.kernel.forwarding_enabled()? {
            return Err(ConfigError::Internal(
                "IPv6 forwarding is enabled".to_string(),
            ));
        }
        ctx.kernel
            .set_accept_router_advertisements(&service.key.interface, true)?;
        if let Err(e) = ctx.io.open_ra(&service.key, ctx.interface) {
            let _ = ctx
                .kernel
                .set_accept_router_advertisements(&service.key.interface, false);
            return Err(e.into());
        }

        let mut st = RtadvState {
            phase: Phase::Idle,
            solicits_sent: 0,
            solicit_timer: None,
            link_timer: None,
            router: None,
        };
        begin_soliciting(service, &mut st, ctx);
        service.state = Some(MethodState::Automatic(st));
        Ok(Outcome::Handled)
    }

    fn solicit_due(
        &self,
        service: &mut Service,
        ctx: &mut MethodCtx<'_>,
    ) -> Result<Outcome, ConfigError> {
        let mut st = take_state(service)?;
        st.solicit_timer = None;
        if st.phase == Phase::Soliciting {
            solicit_step(service, &mut st, ctx);
        }
        service.state = Some(MethodState::Automatic(st));
        Ok(Outcome::Handled)
    }

    fn packet(
        &self,
        service: &mut Service,
        pkt: &RecvPacket,
        ctx: &mut MethodCtx<'_>,
    ) -> Result<Outcome, ConfigError> {
        let mut st = take_state(service)?;

        match accept_advertisement(pkt, ctx.interface) {
            Ok(()) => {
                if st.phase != Phase::Responded {
                    info!(
                        service = %service.key,
                        router = %pkt.source,
                        "router advertisement received"
                    );
                }
                // The kernel derives addresses from the advertised prefixes
                // on its own; publication waits for the address-list change.
                cancel_solicit_timer(&mut st, ctx);
                st.phase = Phase::Responded;
                st.router = Some(pkt.source);
            }
            Err(reason) => {
                debug!(
                    service = %service.key,
                    source = %pkt.source,
                    reason,
                    "router advertisement discarded"
                );
            }
        }

        service.state = Some(MethodState::Automatic(st));
        Ok(Outcome::Handled)
    }

    fn state_change(
        &self,
        service: &mut Service,
        addrs: &[KernelAddress],
        ctx: &mut MethodCtx<'_>,
    ) -> Result<Outcome, ConfigError> {
        let mut st = take_state(service)?;

        let autoconf: Vec<&KernelAddress> = addrs
            .iter()
            .filter(|a| a.is_autoconf() && !a.is_duplicated())
            .collect();
        let global: Vec<HeldAddress> = autoconf
            .iter()
            .filter(|a| !a.is_link_local())
            .map(|a| HeldAddress {
                addr: a.addr,
                prefix_len: a.prefix_len,
                flags: a.flags,
            })
            .collect();

        if !global.is_empty() {
            service.info.addresses = global;
            service.info.router = st.router;
            service.publish_success(ctx.store);
        } else if st.phase == Phase::Responded && ctx.link.is_active() {
            // Addresses collapsed to link-local only while the link is up:
            // the prefixes were flushed externally. Start over.
            warn!(
                service = %service.key,
                "autoconfigured addresses disappeared, soliciting again"
            );
            service.info.addresses.clear();
            service.info.router = None;
            st.router = None;
            begin_soliciting(service, &mut st, ctx);
        }

        service.state = Some(MethodState::Automatic(st));
        Ok(Outcome::Handled)
    }

    fn media(&self, service: &mut Service, ctx: &mut MethodCtx<'_>) -> Result<Outcome, ConfigError> {
        let mut st = take_state(service)?;
        let link = ctx.link;

        if link.is_active() {
            cancel_link_timer(&mut st, ctx);
            // Withdraw whatever survived the link transition; the routers on
            // the new link may advertise different prefixes.
            let peers = ctx.peer_addresses.clone();
            service.withdraw_addresses(ctx.kernel, &peers);
            st.router = None;
            begin_soliciting(service, &mut st, ctx);
        } else if link.is_inactive() {
            cancel_solicit_timer(&mut st, ctx);
            cancel_link_timer(&mut st, ctx);
            st.link_timer = Some(ctx.timers.schedule(
                LINK_INACTIVE_GRACE,
                TimerEvent::Service {
                    key: service.key.clone(),
                    kind: TimerKind::LinkInactive,
                },
            ));
        }

        service.state = Some(MethodState::Automatic(st));
        Ok(Outcome::Handled)
    }

    fn link_inactive_expired(
        &self,
        service: &mut Service,
        ctx: &mut MethodCtx<'_>,
    ) -> Result<Outcome, ConfigError> {
        let mut st = take_state(service)?;
        st.link_timer = None;
        st.phase = Phase::Idle;
        st.router = None;
        let peers = ctx.peer_addresses.clone();
        service.withdraw_addresses(ctx.kernel, &peers);
        service.publish_failure(ctx.store, ConfigError::MediaInactive.kind());
        service.state = Some(MethodState::Automatic(st));
        Ok(Outcome::Handled)
    }

    fn stop(&self, service: &mut Service, ctx: &mut MethodCtx<'_>) -> Result<Outcome, ConfigError> {
        let mut st = take_state(service)?;
        cancel_solicit_timer(&mut st, ctx);
        cancel_link_timer(&mut st, ctx);

        let ifname = service.key.interface.clone();
        if let Err(e) = ctx.kernel.set_accept_router_advertisements(&ifname, false) {
            debug!(interface = ifname, error = %e, "disabling advertisement acceptance failed");
        }
        ctx.io.close_ra(&service.key);
        // Discovered prefixes and routes are flushed globally; this is a
        // cross-service side effect of the underlying kernel interface.
        if let Err(e) = ctx.kernel.flush_prefixes() {
            debug!(error = %e, "prefix flush failed");
        }
        if let Err(e) = ctx.kernel.flush_routes() {
            debug!(error = %e, "route flush failed");
        }
        Ok(Outcome::Handled)
    }
}

impl ConfigMethod for RtadvMethod {
    fn method_id(&self) -> MethodId {
        MethodId::Automatic
    }

    fn handle(
        &self,
        service: &mut Service,
        event: MethodEvent<'_>,
        ctx: &mut MethodCtx<'_>,
    ) -> Result<Outcome, ConfigError> {
        match event {
            MethodEvent::Start(_) => self.start(service, ctx),
            MethodEvent::Stop => self.stop(service, ctx),
            // Automatic carries no user configuration; always compatible.
            MethodEvent::Change(_) => Ok(Outcome::Handled),
            MethodEvent::Media(_) => self.media(service, ctx),
            MethodEvent::StateChange(addrs) => self.state_change(service, addrs, ctx),
            MethodEvent::Timer(TimerKind::Solicit) => self.solicit_due(service, ctx),
            MethodEvent::Timer(TimerKind::LinkInactive) => {
                self.link_inactive_expired(service, ctx)
            }
            MethodEvent::Packet(pkt) => self.packet(service, pkt, ctx),
            _ => Ok(Outcome::Handled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{ADDR_FLAG_AUTOCONF, LinkStatus};
    use crate::method::{self, MethodData};
    use crate::service::ServiceKey;
    use crate::test_util::{Harness, test_interface};
    use std::time::Instant;

    fn start_rtadv(h: &mut Harness) -> Service {
        let mut svc = h.new_service("s1", MethodId::Automatic);
        let mut ctx = h.ctx();
        method::start(&mut svc, &MethodData::Automatic, &mut ctx).unwrap();
        svc
    }

    fn fire_all(h: &mut Harness, svc: &mut Service) -> usize {
        let fired = h
            .timers
            .pop_due(Instant::now() + Duration::from_secs(3600));
        let count = fired.len();
        for ev in fired {
            h.fire(svc, ev);
        }
        count
    }

    fn phase(svc: &Service) -> Phase {
        match svc.state {
            Some(MethodState::Automatic(ref st)) => st.phase,
            _ => panic!("not an automatic service"),
        }
    }

    fn build_ra(lifetime_secs: u64) -> Vec<u8> {
        let repr = Icmpv6Repr::Ndisc(NdiscRepr::RouterAdvert {
            hop_limit: 64,
            flags: smoltcp::wire::NdiscRouterFlags::empty(),
            router_lifetime: smoltcp::time::Duration::from_secs(lifetime_secs),
            reachable_time: smoltcp::time::Duration::from_secs(0),
            retrans_time: smoltcp::time::Duration::from_secs(0),
            lladdr: None,
            mtu: None,
            prefix_info: None,
        });
        let mut caps = ChecksumCapabilities::default();
        caps.icmpv6 = Checksum::None;
        let mut buf = vec![0u8; repr.buffer_len()];
        let mut packet = Icmpv6Packet::new_unchecked(&mut buf);
        repr.emit(
            &"fe80::1".parse::<Ipv6Addr>().unwrap(),
            &"ff02::1".parse::<Ipv6Addr>().unwrap(),
            &mut packet,
            &caps,
        );
        buf
    }

    fn ra_packet(h: &Harness, lifetime_secs: u64) -> RecvPacket {
        RecvPacket {
            data: build_ra(lifetime_secs),
            source: "fe80::1".parse().unwrap(),
            hop_limit: 255,
            ifindex: h.interface.index,
        }
    }

    #[test]
    fn test_solicit_interval_sequence() {
        let expected = [1u64, 2, 4, 8, 8, 8, 8, 8, 8, 8];
        for (i, secs) in expected.iter().enumerate() {
            assert_eq!(
                solicit_interval(i as u32 + 1),
                Duration::from_secs(*secs),
                "after send {}",
                i + 1
            );
        }
    }

    #[test]
    fn test_start_refused_when_forwarding() {
        let mut h = Harness::new(test_interface("en0"));
        h.kernel.forwarding = true;
        let mut svc = h.new_service("s1", MethodId::Automatic);
        let err = {
            let mut ctx = h.ctx();
            method::start(&mut svc, &MethodData::Automatic, &mut ctx).unwrap_err()
        };
        assert_eq!(err.kind(), "internal-error");
        assert!(h.io.open.is_empty());
    }

    #[test]
    fn test_solicitation_budget_exhausts_nonfatally() {
        let mut h = Harness::new(test_interface("en0"));
        let mut svc = start_rtadv(&mut h);

        // The start sent the first solicitation; drive the rest.
        for _ in 0..20 {
            if fire_all(&mut h, &mut svc) == 0 {
                break;
            }
        }
        assert_eq!(h.io.solicitations.len(), MAX_SOLICITATIONS as usize);
        assert_eq!(phase(&svc), Phase::Exhausted);
        // Non-fatal: still started, no failure published.
        assert!(svc.is_started());
        assert!(h.store.get(&svc.status_path()).is_none());
    }

    #[test]
    fn test_waiting_for_link_local_preserves_budget() {
        let mut h = Harness::new(test_interface("en0"));
        h.kernel.link_local_ready = false;
        let mut svc = start_rtadv(&mut h);

        for _ in 0..5 {
            fire_all(&mut h, &mut svc);
        }
        assert!(h.io.solicitations.is_empty());
        assert_eq!(phase(&svc), Phase::Soliciting);

        h.kernel.link_local_ready = true;
        fire_all(&mut h, &mut svc);
        assert_eq!(h.io.solicitations.len(), 1);
    }

    #[test]
    fn test_solicitation_carries_source_lladdr_option() {
        let h = Harness::new(test_interface("en0"));
        let msg = build_router_solicitation(&h.interface);
        let packet = Icmpv6Packet::new_checked(msg.as_slice()).unwrap();
        assert_eq!(packet.msg_type(), Icmpv6Message::RouterSolicit);
        let repr = NdiscRepr::parse(&packet).unwrap();
        match repr {
            NdiscRepr::RouterSolicit { lladdr } => {
                assert_eq!(
                    lladdr.unwrap().as_bytes(),
                    h.interface.link_addr.unwrap().as_slice()
                );
            }
            _ => panic!("expected a router solicitation"),
        }
    }

    #[test]
    fn test_bad_advertisements_rejected_without_timer_reset() {
        let mut h = Harness::new(test_interface("en0"));
        let mut svc = start_rtadv(&mut h);
        assert_eq!(h.timers.len(), 1);

        let bad_hop_limit = RecvPacket {
            hop_limit: 64,
            ..ra_packet(&h, 1800)
        };
        let zero_lifetime = ra_packet(&h, 0);
        let foreign_source = RecvPacket {
            source: "2001:db8::1".parse().unwrap(),
            ..ra_packet(&h, 1800)
        };
        let mut wrong_type = ra_packet(&h, 1800);
        wrong_type.data[0] = 135;
        let wrong_interface = RecvPacket {
            ifindex: h.interface.index + 1,
            ..ra_packet(&h, 1800)
        };

        for pkt in [
            bad_hop_limit,
            zero_lifetime,
            foreign_source,
            wrong_type,
            wrong_interface,
        ] {
            let mut ctx = h.ctx();
            method::packet(&mut svc, &pkt, &mut ctx);
        }

        assert_eq!(phase(&svc), Phase::Soliciting);
        // The solicitation timer is still pending.
        assert_eq!(h.timers.len(), 1);
    }

    #[test]
    fn test_valid_advertisement_waits_for_kernel_addresses() {
        let mut h = Harness::new(test_interface("en0"));
        let mut svc = start_rtadv(&mut h);

        let pkt = ra_packet(&h, 1800);
        {
            let mut ctx = h.ctx();
            method::packet(&mut svc, &pkt, &mut ctx);
        }
        assert_eq!(phase(&svc), Phase::Responded);
        // Solicitation cancelled, nothing published yet.
        assert_eq!(h.timers.len(), 0);
        assert!(h.store.get(&svc.store_path()).is_none());

        let report = vec![
            KernelAddress {
                addr: "fe80::1c2a:ff:fe00:1".parse().unwrap(),
                prefix_len: 64,
                flags: ADDR_FLAG_AUTOCONF,
            },
            KernelAddress {
                addr: "2001:db8:1::1c2a:ff:fe00:1".parse().unwrap(),
                prefix_len: 64,
                flags: ADDR_FLAG_AUTOCONF,
            },
            // Manually added address on the same interface: not ours.
            KernelAddress {
                addr: "2001:db8:2::5".parse().unwrap(),
                prefix_len: 64,
                flags: 0,
            },
        ];
        {
            let mut ctx = h.ctx();
            method::state_change(&mut svc, &report, &mut ctx);
        }

        let record = h.store.get(&svc.store_path()).unwrap().clone();
        assert_eq!(record["addresses"].as_array().unwrap().len(), 1);
        assert_eq!(record["addresses"][0], "2001:db8:1::1c2a:ff:fe00:1");
        assert_eq!(record["router"], "fe80::1");

        // Idempotence: the same snapshot again changes nothing.
        {
            let mut ctx = h.ctx();
            method::state_change(&mut svc, &report, &mut ctx);
        }
        assert_eq!(h.store.get(&svc.store_path()), Some(&record));
    }

    #[test]
    fn test_collapse_to_link_local_restarts_solicitation() {
        let mut h = Harness::new(test_interface("en0"));
        let mut svc = start_rtadv(&mut h);
        {
            let pkt = ra_packet(&h, 1800);
            let mut ctx = h.ctx();
            method::packet(&mut svc, &pkt, &mut ctx);
        }
        let sent_before = h.io.solicitations.len();

        // Only the link-local address remains: prefixes were flushed.
        let report = vec![KernelAddress {
            addr: "fe80::1c2a:ff:fe00:1".parse().unwrap(),
            prefix_len: 64,
            flags: ADDR_FLAG_AUTOCONF,
        }];
        {
            let mut ctx = h.ctx();
            method::state_change(&mut svc, &report, &mut ctx);
        }
        assert_eq!(phase(&svc), Phase::Soliciting);
        assert!(h.io.solicitations.len() > sent_before);
    }

    #[test]
    fn test_link_down_grace_withdraws_and_publishes_once() {
        let mut h = Harness::new(test_interface("en0"));
        let mut svc = start_rtadv(&mut h);

        h.link = LinkStatus {
            valid: true,
            active: false,
        };
        {
            let link = h.link;
            let mut ctx = h.ctx();
            method::media(&mut svc, link, &mut ctx);
        }
        fire_all(&mut h, &mut svc);
        assert_eq!(
            h.store.get(&svc.status_path()).unwrap()["status"],
            "media-inactive"
        );
        assert_eq!(phase(&svc), Phase::Idle);
    }

    #[test]
    fn test_stop_releases_socket_and_flushes() {
        let mut h = Harness::new(test_interface("en0"));
        let mut svc = start_rtadv(&mut h);
        let key = ServiceKey::new("en0", "s1");
        assert!(h.io.open.contains(&key));

        {
            let mut ctx = h.ctx();
            method::stop(&mut svc, &mut ctx).unwrap();
        }
        assert!(!h.io.open.contains(&key));
        assert!(h.kernel.calls.contains(&"accept_ra en0 off".to_string()));
        assert!(h.kernel.calls.contains(&"flush_prefixes".to_string()));
        assert!(h.kernel.calls.contains(&"flush_routes".to_string()));
        assert!(h.kernel.applied_addresses().is_empty());
        assert!(h.timers.is_empty());
    }
}
