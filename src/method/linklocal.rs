//! Link-local configuration: the interface's private service.
//!
//! Attaches the IPv6 protocol and drives kernel link-local address
//! auto-generation from link state. One per interface, never externally
//! addressable.

use tracing::debug;

use crate::error::ConfigError;
use crate::kernel::KernelAddress;
use crate::method::{
    ConfigMethod, LINK_INACTIVE_GRACE, MethodCtx, MethodEvent, MethodState, Outcome,
};
use crate::service::{HeldAddress, MethodId, Service};
use crate::timer::{TimerEvent, TimerHandle, TimerKind};

pub struct LinkLocalState {
    generating: bool,
    link_timer: Option<TimerHandle>,
}

pub struct LinkLocalMethod;

fn take_state(service: &mut Service) -> Result<LinkLocalState, ConfigError> {
    match service.state.take() {
        Some(MethodState::LinkLocal(st)) => Ok(st),
        other => {
            service.state = other;
            Err(ConfigError::Internal(format!(
                "{}: link-local state missing",
                service.key
            )))
        }
    }
}

fn cancel_link_timer(st: &mut LinkLocalState, ctx: &mut MethodCtx<'_>) {
    if let Some(timer) = st.link_timer.take() {
        ctx.timers.cancel(timer);
    }
}

fn start_generation(
    service: &Service,
    st: &mut LinkLocalState,
    ctx: &mut MethodCtx<'_>,
) -> Result<(), ConfigError> {
    if !st.generating {
        ctx.kernel.start_link_local(&service.key.interface)?;
        st.generating = true;
    }
    Ok(())
}

impl LinkLocalMethod {
    fn start(&self, service: &mut Service, ctx: &mut MethodCtx<'_>) -> Result<Outcome, ConfigError> {
        ctx.kernel.attach_protocol(&service.key.interface)?;

        let mut st = LinkLocalState {
            generating: false,
            link_timer: None,
        };
        // Link status may not be known yet; generation is deferred to the
        // first media event in that case.
        if ctx.link.is_active() {
            start_generation(service, &mut st, ctx)?;
        }
        service.state = Some(MethodState::LinkLocal(st));
        Ok(Outcome::Handled)
    }

    fn media(&self, service: &mut Service, ctx: &mut MethodCtx<'_>) -> Result<Outcome, ConfigError> {
        let mut st = take_state(service)?;
        let link = ctx.link;

        if link.is_active() {
            cancel_link_timer(&mut st, ctx);
            if let Err(e) = start_generation(service, &mut st, ctx) {
                debug!(service = %service.key, error = %e, "link-local generation failed");
            }
        } else if link.is_inactive() {
            cancel_link_timer(&mut st, ctx);
            st.link_timer = Some(ctx.timers.schedule(
                LINK_INACTIVE_GRACE,
                TimerEvent::Service {
                    key: service.key.clone(),
                    kind: TimerKind::LinkInactive,
                },
            ));
        }

        service.state = Some(MethodState::LinkLocal(st));
        Ok(Outcome::Handled)
    }

    fn link_inactive_expired(
        &self,
        service: &mut Service,
        ctx: &mut MethodCtx<'_>,
    ) -> Result<Outcome, ConfigError> {
        let mut st = take_state(service)?;
        st.link_timer = None;
        if st.generating {
            if let Err(e) = ctx.kernel.stop_link_local(&service.key.interface) {
                debug!(service = %service.key, error = %e, "stopping link-local generation failed");
            }
            st.generating = false;
        }
        let peers = ctx.peer_addresses.clone();
        service.withdraw_addresses(ctx.kernel, &peers);
        service.publish_failure(ctx.store, ConfigError::MediaInactive.kind());
        service.state = Some(MethodState::LinkLocal(st));
        Ok(Outcome::Handled)
    }

    fn state_change(
        &self,
        service: &mut Service,
        addrs: &[KernelAddress],
        ctx: &mut MethodCtx<'_>,
    ) -> Result<Outcome, ConfigError> {
        let st = take_state(service)?;

        let link_local: Vec<HeldAddress> = addrs
            .iter()
            .filter(|a| a.is_link_local() && !a.is_duplicated() && !a.is_tentative())
            .map(|a| HeldAddress {
                addr: a.addr,
                prefix_len: a.prefix_len,
                flags: a.flags,
            })
            .collect();

        if !link_local.is_empty() {
            service.info.addresses = link_local;
            service.publish_success(ctx.store);
        }

        service.state = Some(MethodState::LinkLocal(st));
        Ok(Outcome::Handled)
    }

    fn stop(&self, service: &mut Service, ctx: &mut MethodCtx<'_>) -> Result<Outcome, ConfigError> {
        let mut st = take_state(service)?;
        cancel_link_timer(&mut st, ctx);

        let ifname = service.key.interface.clone();
        if let Err(e) = ctx.kernel.stop_link_local(&ifname) {
            debug!(interface = ifname, error = %e, "stopping link-local generation failed");
        }
        if let Err(e) = ctx.kernel.detach_protocol(&ifname) {
            debug!(interface = ifname, error = %e, "protocol detach failed");
        }
        if let Err(e) = ctx.kernel.flush_interface_routes(&ifname) {
            debug!(interface = ifname, error = %e, "route flush failed");
        }
        Ok(Outcome::Handled)
    }
}

impl ConfigMethod for LinkLocalMethod {
    fn method_id(&self) -> MethodId {
        MethodId::LinkLocal
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
            // Link-local carries no user configuration; always compatible.
            MethodEvent::Change(_) => Ok(Outcome::Handled),
            MethodEvent::Media(_) => self.media(service, ctx),
            MethodEvent::StateChange(addrs) => self.state_change(service, addrs, ctx),
            MethodEvent::Timer(TimerKind::LinkInactive) => {
                self.link_inactive_expired(service, ctx)
            }
            _ => Ok(Outcome::Handled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{ADDR_FLAG_AUTOCONF, ADDR_FLAG_TENTATIVE, LinkStatus};
    use crate::method::{self, MethodData};
    use crate::test_util::{Harness, test_interface};
    use std::time::{Duration, Instant};

    fn start_link_local(h: &mut Harness, svc: &mut Service) {
        let mut ctx = h.ctx();
        method::start(svc, &MethodData::LinkLocal, &mut ctx).unwrap();
    }

    #[test]
    fn test_start_attaches_and_generates() {
        let mut h = Harness::new(test_interface("en0"));
        let mut svc = h.link_local_service();
        start_link_local(&mut h, &mut svc);

        assert!(h.kernel.calls.contains(&"attach_protocol en0".to_string()));
        assert!(h.kernel.calls.contains(&"start_link_local en0".to_string()));
    }

    #[test]
    fn test_generation_deferred_until_link_known() {
        let mut h = Harness::new(test_interface("en0"));
        h.link = LinkStatus::unknown();
        let mut svc = h.link_local_service();
        start_link_local(&mut h, &mut svc);
        assert!(!h.kernel.calls.contains(&"start_link_local en0".to_string()));

        h.link = LinkStatus {
            valid: true,
            active: true,
        };
        {
            let link = h.link;
            let mut ctx = h.ctx();
            method::media(&mut svc, link, &mut ctx);
        }
        assert!(h.kernel.calls.contains(&"start_link_local en0".to_string()));
    }

    #[test]
    fn test_state_change_publishes_ready_link_local() {
        let mut h = Harness::new(test_interface("en0"));
        let mut svc = h.link_local_service();
        start_link_local(&mut h, &mut svc);

        let tentative = vec![KernelAddress {
            addr: "fe80::1c2a:ff:fe00:1".parse().unwrap(),
            prefix_len: 64,
            flags: ADDR_FLAG_AUTOCONF | ADDR_FLAG_TENTATIVE,
        }];
        {
            let mut ctx = h.ctx();
            method::state_change(&mut svc, &tentative, &mut ctx);
        }
        // Still running duplicate detection: nothing published.
        assert!(h.store.get(&svc.store_path()).is_none());

        let ready = vec![KernelAddress {
            addr: "fe80::1c2a:ff:fe00:1".parse().unwrap(),
            prefix_len: 64,
            flags: ADDR_FLAG_AUTOCONF,
        }];
        {
            let mut ctx = h.ctx();
            method::state_change(&mut svc, &ready, &mut ctx);
        }
        let record = h.store.get(&svc.store_path()).unwrap();
        assert_eq!(record["addresses"][0], "fe80::1c2a:ff:fe00:1");
    }

    #[test]
    fn test_link_down_grace_then_unpublish() {
        let mut h = Harness::new(test_interface("en0"));
        let mut svc = h.link_local_service();
        start_link_local(&mut h, &mut svc);

        h.link = LinkStatus {
            valid: true,
            active: false,
        };
        {
            let link = h.link;
            let mut ctx = h.ctx();
            method::media(&mut svc, link, &mut ctx);
        }
        let fired = h.timers.pop_due(Instant::now() + LINK_INACTIVE_GRACE + Duration::from_secs(1));
        assert_eq!(fired.len(), 1);
        for ev in fired {
            h.fire(&mut svc, ev);
        }
        assert!(h.kernel.calls.contains(&"stop_link_local en0".to_string()));
        assert_eq!(
            h.store.get(&svc.status_path()).unwrap()["status"],
            "media-inactive"
        );
    }

    #[test]
    fn test_stop_detaches_and_flushes_interface_routes() {
        let mut h = Harness::new(test_interface("en0"));
        let mut svc = h.link_local_service();
        start_link_local(&mut h, &mut svc);
        {
            let mut ctx = h.ctx();
            method::stop(&mut svc, &mut ctx).unwrap();
        }
        assert!(h.kernel.calls.contains(&"stop_link_local en0".to_string()));
        assert!(h.kernel.calls.contains(&"detach_protocol en0".to_string()));
        assert!(
            h.kernel
                .calls
                .contains(&"flush_interface_routes en0".to_string())
        );
        assert!(!svc.is_started());
    }
}
