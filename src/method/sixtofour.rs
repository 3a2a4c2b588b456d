//! 6to4 transition tunnelling.
//!
//! Derives a 2002::/16 address deterministically from the primary IPv4
//! service's first routable address and pairs it with a relay reachable for
//! encapsulated traffic. No protocol of its own: everything is recomputed
//! from IPv4 state and the configured relay.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::method::{
    ConfigMethod, MethodCtx, MethodData, MethodEvent, MethodState, Outcome, RelayAddress,
};
use crate::service::{HeldAddress, MethodId, Service};

/// Prefix length of the derived 6to4 address (2002::/16).
const SIXTOFOUR_PREFIX_LEN: u8 = 16;

pub struct SixToFourState {
    relay_config: RelayAddress,
    derived: Option<Ipv6Addr>,
    relay: Option<Ipv6Addr>,
    resolving: bool,
    applied: bool,
}

pub struct SixToFourMethod;

/// 2002:VVVV:WWWW:0001::1 for IPv4 address VV.VV.WW.WW.
pub fn derive_address(v4: Ipv4Addr) -> Ipv6Addr {
    let [a, b, c, d] = v4.octets();
    Ipv6Addr::new(
        0x2002,
        u16::from_be_bytes([a, b]),
        u16::from_be_bytes([c, d]),
        0x0001,
        0,
        0,
        0,
        0x0001,
    )
}

/// Same transform as [`derive_address`] with an empty host suffix.
pub fn derive_relay(v4: Ipv4Addr) -> Ipv6Addr {
    let [a, b, c, d] = v4.octets();
    Ipv6Addr::new(
        0x2002,
        u16::from_be_bytes([a, b]),
        u16::from_be_bytes([c, d]),
        0x0001,
        0,
        0,
        0,
        0,
    )
}

/// 6to4 needs a routable IPv4 address to embed.
fn eligible(v4: &Ipv4Addr) -> bool {
    !v4.is_private()
        && !v4.is_link_local()
        && !v4.is_loopback()
        && !v4.is_unspecified()
        && !v4.is_broadcast()
}

fn take_state(service: &mut Service) -> Result<SixToFourState, ConfigError> {
    match service.state.take() {
        Some(MethodState::SixToFour(st)) => Ok(st),
        other => {
            service.state = other;
            Err(ConfigError::Internal(format!(
                "{}: 6to4 state missing",
                service.key
            )))
        }
    }
}

fn candidate(ctx: &MethodCtx<'_>) -> Option<Ipv4Addr> {
    ctx.ipv4_primary.addresses.iter().copied().find(eligible)
}

fn resolve_relay_config(service: &Service, st: &mut SixToFourState, ctx: &mut MethodCtx<'_>) {
    match &st.relay_config {
        RelayAddress::Ipv6(addr) => st.relay = Some(*addr),
        RelayAddress::Ipv4(v4) => st.relay = Some(derive_relay(*v4)),
        RelayAddress::Name(name) => {
            st.resolving = true;
            ctx.io.resolve_relay(&service.key, name);
        }
    }
}

/// Apply and publish once both the derived address and a relay are known.
fn maybe_apply(service: &mut Service, st: &mut SixToFourState, ctx: &mut MethodCtx<'_>) {
    if !st.applied {
        let (Some(addr), Some(_)) = (st.derived, st.relay) else {
            return;
        };
        if let Err(e) =
            ctx.kernel
                .add_address(&service.key.interface, addr, SIXTOFOUR_PREFIX_LEN)
        {
            warn!(service = %service.key, address = %addr, error = %e, "6to4 address apply failed");
            service.publish_failure(ctx.store, ConfigError::Internal(String::new()).kind());
            return;
        }
        service.hold_address(HeldAddress {
            addr,
            prefix_len: SIXTOFOUR_PREFIX_LEN,
            flags: 0,
        });
        st.applied = true;
    }
    service.info.router = st.relay;
    service.publish_success(ctx.store);
}

impl SixToFourMethod {
    fn start(
        &self,
        service: &mut Service,
        data: &MethodData,
        ctx: &mut MethodCtx<'_>,
    ) -> Result<Outcome, ConfigError> {
        let MethodData::SixToFour { relay } = data else {
            return Err(ConfigError::InvalidParameter(
                "6to4 configuration expected".to_string(),
            ));
        };

        let mut st = SixToFourState {
            relay_config: relay.clone(),
            derived: None,
            relay: None,
            resolving: false,
            applied: false,
        };

        // No routable IPv4 address means nothing to derive; stay quiet until
        // the primary IPv4 service changes.
        st.derived = candidate(ctx).map(derive_address);
        if st.derived.is_none() {
            debug!(service = %service.key, "no routable IPv4 address, 6to4 idle");
        }

        resolve_relay_config(service, &mut st, ctx);
        maybe_apply(service, &mut st, ctx);

        service.state = Some(MethodState::SixToFour(st));
        Ok(Outcome::Handled)
    }

    fn relay_resolved(
        &self,
        service: &mut Service,
        answers: &[IpAddr],
        ctx: &mut MethodCtx<'_>,
    ) -> Result<Outcome, ConfigError> {
        let mut st = take_state(service)?;
        st.resolving = false;

        let relay = answers
            .iter()
            .find_map(|a| match a {
                IpAddr::V6(v6) => Some(*v6),
                IpAddr::V4(_) => None,
            })
            .or_else(|| {
                answers.iter().find_map(|a| match a {
                    IpAddr::V4(v4) => Some(derive_relay(*v4)),
                    IpAddr::V6(_) => None,
                })
            });

        match relay {
            Some(relay) => {
                st.relay = Some(relay);
                maybe_apply(service, &mut st, ctx);
            }
            None => {
                warn!(service = %service.key, "relay resolution returned no usable answers");
            }
        }

        service.state = Some(MethodState::SixToFour(st));
        Ok(Outcome::Handled)
    }

    fn ipv4_primary_change(
        &self,
        service: &mut Service,
        ctx: &mut MethodCtx<'_>,
    ) -> Result<Outcome, ConfigError> {
        let mut st = take_state(service)?;

        let derived = candidate(ctx).map(derive_address);
        if derived != st.derived {
            if st.applied {
                let peers = ctx.peer_addresses.clone();
                service.withdraw_addresses(ctx.kernel, &peers);
                service.clear_publication(ctx.store);
                st.applied = false;
            }
            st.derived = derived;
            maybe_apply(service, &mut st, ctx);
        }

        service.state = Some(MethodState::SixToFour(st));
        Ok(Outcome::Handled)
    }

    fn change(
        &self,
        service: &mut Service,
        data: &MethodData,
        ctx: &mut MethodCtx<'_>,
    ) -> Result<Outcome, ConfigError> {
        let MethodData::SixToFour { relay } = data else {
            return Err(ConfigError::InvalidParameter(
                "6to4 configuration expected".to_string(),
            ));
        };
        let mut st = take_state(service)?;

        // The derived address is not user-configurable; only the relay can
        // change, and it changes in place.
        if *relay != st.relay_config {
            if st.resolving {
                ctx.io.cancel_resolve(&service.key);
                st.resolving = false;
            }
            st.relay_config = relay.clone();
            st.relay = None;
            resolve_relay_config(service, &mut st, ctx);
            maybe_apply(service, &mut st, ctx);
        }

        service.state = Some(MethodState::SixToFour(st));
        Ok(Outcome::Handled)
    }

    fn stop(&self, service: &mut Service, ctx: &mut MethodCtx<'_>) -> Result<Outcome, ConfigError> {
        let st = take_state(service)?;
        if st.resolving {
            ctx.io.cancel_resolve(&service.key);
        }
        Ok(Outcome::Handled)
    }
}

impl ConfigMethod for SixToFourMethod {
    fn method_id(&self) -> MethodId {
        MethodId::SixToFour
    }

    fn handle(
        &self,
        service: &mut Service,
        event: MethodEvent<'_>,
        ctx: &mut MethodCtx<'_>,
    ) -> Result<Outcome, ConfigError> {
        match event {
            MethodEvent::Start(data) => self.start(service, data, ctx),
            MethodEvent::Stop => self.stop(service, ctx),
            MethodEvent::Change(data) => self.change(service, data, ctx),
            MethodEvent::Ipv4PrimaryChange => self.ipv4_primary_change(service, ctx),
            MethodEvent::RelayResolved(answers) => self.relay_resolved(service, answers, ctx),
            // The tunnel has no link state or kernel-derived addresses of
            // its own.
            _ => Ok(Outcome::Handled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method;
    use crate::service::ServiceKey;
    use crate::test_util::{Harness, test_interface};

    fn relay_v4() -> RelayAddress {
        RelayAddress::Ipv4("192.88.99.1".parse().unwrap())
    }

    fn start_6to4(h: &mut Harness, relay: RelayAddress) -> Service {
        let mut svc = h.new_service("s1", MethodId::SixToFour);
        let mut ctx = h.ctx();
        method::start(&mut svc, &MethodData::SixToFour { relay }, &mut ctx).unwrap();
        svc
    }

    #[test]
    fn test_deterministic_derivation() {
        let v4: Ipv4Addr = "1.2.3.4".parse().unwrap();
        assert_eq!(
            derive_address(v4),
            "2002:102:304:1::1".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(
            derive_relay(v4),
            "2002:102:304:1::".parse::<Ipv6Addr>().unwrap()
        );
    }

    #[test]
    fn test_private_and_link_local_ipv4_skipped() {
        for bad in ["10.1.2.3", "172.16.0.9", "192.168.1.1", "169.254.0.7", "127.0.0.1"] {
            assert!(!eligible(&bad.parse().unwrap()), "{bad} should be skipped");
        }
        assert!(eligible(&"198.51.100.17".parse().unwrap()));
    }

    #[test]
    fn test_applies_and_publishes_with_address_and_relay() {
        let mut h = Harness::new(test_interface("stf0"));
        h.ipv4_primary.addresses = vec!["10.0.0.2".parse().unwrap(), "1.2.3.4".parse().unwrap()];
        let svc = start_6to4(&mut h, relay_v4());

        assert_eq!(
            h.kernel.applied_addresses(),
            vec!["2002:102:304:1::1".parse::<Ipv6Addr>().unwrap()]
        );
        let record = h.store.get(&svc.store_path()).unwrap();
        assert_eq!(record["addresses"][0], "2002:102:304:1::1");
        assert_eq!(record["prefix_lens"][0], 16);
        assert_eq!(record["router"], "2002:c058:6301:1::");
    }

    #[test]
    fn test_no_routable_ipv4_stays_silent() {
        let mut h = Harness::new(test_interface("stf0"));
        h.ipv4_primary.addresses = vec!["192.168.1.5".parse().unwrap()];
        let mut svc = start_6to4(&mut h, relay_v4());

        assert!(h.kernel.applied_addresses().is_empty());
        assert!(h.store.get(&svc.store_path()).is_none());
        assert!(h.store.get(&svc.status_path()).is_none());

        // A routable address appearing later triggers derivation, and the
        // relay is already known, so publication is immediate.
        h.ipv4_primary.addresses = vec!["198.51.100.17".parse().unwrap()];
        {
            let mut ctx = h.ctx();
            method::ipv4_primary_change(&mut svc, &mut ctx);
        }
        assert_eq!(h.kernel.applied_addresses().len(), 1);
        assert!(h.store.get(&svc.store_path()).is_some());
    }

    #[test]
    fn test_primary_change_replaces_derived_address() {
        let mut h = Harness::new(test_interface("stf0"));
        h.ipv4_primary.addresses = vec!["1.2.3.4".parse().unwrap()];
        let mut svc = start_6to4(&mut h, relay_v4());

        h.ipv4_primary.addresses = vec!["198.51.100.17".parse().unwrap()];
        {
            let mut ctx = h.ctx();
            method::ipv4_primary_change(&mut svc, &mut ctx);
        }
        assert!(
            h.kernel
                .removed_addresses()
                .contains(&"2002:102:304:1::1".parse::<Ipv6Addr>().unwrap())
        );
        assert_eq!(
            h.kernel.applied_addresses(),
            vec!["2002:c633:6411:1::1".parse::<Ipv6Addr>().unwrap()]
        );
        let record = h.store.get(&svc.store_path()).unwrap();
        assert_eq!(record["addresses"][0], "2002:c633:6411:1::1");
    }

    #[test]
    fn test_named_relay_resolution() {
        let mut h = Harness::new(test_interface("stf0"));
        h.ipv4_primary.addresses = vec!["1.2.3.4".parse().unwrap()];
        let mut svc = start_6to4(
            &mut h,
            RelayAddress::Name("relay.example.net".to_string()),
        );

        // Resolution in flight: nothing applied yet.
        assert_eq!(
            h.io.resolves,
            vec![(ServiceKey::new("stf0", "s1"), "relay.example.net".to_string())]
        );
        assert!(h.kernel.applied_addresses().is_empty());

        // First IPv6 answer wins over earlier IPv4 answers.
        let answers = vec![
            IpAddr::V4("192.88.99.1".parse().unwrap()),
            IpAddr::V6("2001:db8::99".parse().unwrap()),
        ];
        {
            let mut ctx = h.ctx();
            method::relay_resolved(&mut svc, &answers, &mut ctx);
        }
        let record = h.store.get(&svc.store_path()).unwrap();
        assert_eq!(record["router"], "2001:db8::99");
    }

    #[test]
    fn test_named_relay_ipv4_only_answers_are_transformed() {
        let mut h = Harness::new(test_interface("stf0"));
        h.ipv4_primary.addresses = vec!["1.2.3.4".parse().unwrap()];
        let mut svc = start_6to4(
            &mut h,
            RelayAddress::Name("relay.example.net".to_string()),
        );

        let answers = vec![IpAddr::V4("192.88.99.1".parse().unwrap())];
        {
            let mut ctx = h.ctx();
            method::relay_resolved(&mut svc, &answers, &mut ctx);
        }
        let record = h.store.get(&svc.store_path()).unwrap();
        assert_eq!(record["router"], "2002:c058:6301:1::");
    }

    #[test]
    fn test_change_reevaluates_relay_only() {
        let mut h = Harness::new(test_interface("stf0"));
        h.ipv4_primary.addresses = vec!["1.2.3.4".parse().unwrap()];
        let mut svc = start_6to4(&mut h, relay_v4());

        // Unchanged relay: nothing happens.
        let needs_stop = {
            let mut ctx = h.ctx();
            method::change(
                &mut svc,
                &MethodData::SixToFour { relay: relay_v4() },
                &mut ctx,
            )
            .unwrap()
        };
        assert!(!needs_stop);

        // New relay: republished in place, derived address untouched.
        let needs_stop = {
            let mut ctx = h.ctx();
            method::change(
                &mut svc,
                &MethodData::SixToFour {
                    relay: RelayAddress::Ipv6("2001:db8::1".parse().unwrap()),
                },
                &mut ctx,
            )
            .unwrap()
        };
        assert!(!needs_stop);
        let record = h.store.get(&svc.store_path()).unwrap();
        assert_eq!(record["router"], "2001:db8::1");
        assert_eq!(record["addresses"][0], "2002:102:304:1::1");
        assert_eq!(h.kernel.applied_addresses().len(), 1);
    }

    #[test]
    fn test_stop_cancels_resolution_and_withdraws() {
        let mut h = Harness::new(test_interface("stf0"));
        h.ipv4_primary.addresses = vec!["1.2.3.4".parse().unwrap()];
        let mut svc = start_6to4(
            &mut h,
            RelayAddress::Name("relay.example.net".to_string()),
        );
        {
            let mut ctx = h.ctx();
            method::stop(&mut svc, &mut ctx).unwrap();
        }
        assert_eq!(h.io.cancelled, vec![ServiceKey::new("stf0", "s1")]);
        assert!(h.kernel.applied_addresses().is_empty());
        assert!(h.store.get(&svc.store_path()).is_none());
    }
}
