//! Manual (static) address configuration.
//!
//! Deterministic, no protocol: the configured addresses are applied once the
//! link carries traffic and withdrawn when it stays down past the grace
//! period. Duplicate address detection failing on a configured address is a
//! fatal per-service conflict.

use tracing::{debug, error};

use crate::error::ConfigError;
use crate::kernel::KernelAddress;
use crate::method::{
    ConfigMethod, LINK_INACTIVE_GRACE, MethodCtx, MethodData, MethodEvent, MethodState, Outcome,
    StaticAddress,
};
use crate::service::{HeldAddress, MethodId, Service};
use crate::timer::{TimerEvent, TimerHandle, TimerKind};

pub struct ManualState {
    addresses: Vec<StaticAddress>,
    applied: bool,
    /// Set after a duplicate-address conflict; blocks re-application until
    /// the configuration changes.
    conflicted: bool,
    link_timer: Option<TimerHandle>,
}

pub struct ManualMethod;

fn take_state(service: &mut Service) -> Result<ManualState, ConfigError> {
    match service.state.take() {
        Some(MethodState::Manual(st)) => Ok(st),
        other => {
            service.state = other;
            Err(ConfigError::Internal(format!(
                "{}: manual state missing",
                service.key
            )))
        }
    }
}

fn same_addresses(a: &[StaticAddress], b: &[StaticAddress]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.contains(x))
}

fn apply(
    service: &mut Service,
    st: &mut ManualState,
    ctx: &mut MethodCtx<'_>,
) -> Result<(), ConfigError> {
    for sa in &st.addresses {
        ctx.kernel
            .add_address(&service.key.interface, sa.addr, sa.prefix_len)?;
        service.hold_address(HeldAddress {
            addr: sa.addr,
            prefix_len: sa.prefix_len,
            flags: 0,
        });
    }
    st.applied = true;
    service.publish_success(ctx.store);
    Ok(())
}

fn cancel_link_timer(st: &mut ManualState, ctx: &mut MethodCtx<'_>) {
    if let Some(timer) = st.link_timer.take() {
        ctx.timers.cancel(timer);
    }
}

impl ManualMethod {
    fn start(
        &self,
        service: &mut Service,
        data: &MethodData,
        ctx: &mut MethodCtx<'_>,
    ) -> Result<Outcome, ConfigError> {
        let MethodData::Manual { addresses } = data else {
            return Err(ConfigError::InvalidParameter(
                "manual configuration expected".to_string(),
            ));
        };
        if addresses.is_empty() {
            return Err(ConfigError::InvalidParameter(
                "no addresses configured".to_string(),
            ));
        }
        for sa in addresses {
            if sa.addr.is_unspecified() || sa.addr.is_multicast() {
                return Err(ConfigError::InvalidParameter(format!(
                    "{} is not assignable",
                    sa.addr
                )));
            }
        }

        let mut st = ManualState {
            addresses: addresses.clone(),
            applied: false,
            conflicted: false,
            link_timer: None,
        };

        // Loopback has no meaningful link state; apply right away. On other
        // interfaces wait for an active link.
        if ctx.interface.is_loopback() || ctx.link.is_active() {
            apply(service, &mut st, ctx)?;
        }

        service.state = Some(MethodState::Manual(st));
        Ok(Outcome::Handled)
    }

    fn media(&self, service: &mut Service, ctx: &mut MethodCtx<'_>) -> Result<Outcome, ConfigError> {
        let mut st = take_state(service)?;
        let link = ctx.link;

        if link.is_active() {
            cancel_link_timer(&mut st, ctx);
            if !st.applied && !st.conflicted {
                if let Err(e) = apply(service, &mut st, ctx) {
                    debug!(service = %service.key, error = %e, "address apply failed");
                    service.publish_failure(ctx.store, e.kind());
                }
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

        service.state = Some(MethodState::Manual(st));
        Ok(Outcome::Handled)
    }

    fn link_inactive_expired(
        &self,
        service: &mut Service,
        ctx: &mut MethodCtx<'_>,
    ) -> Result<Outcome, ConfigError> {
        let mut st = take_state(service)?;
        st.link_timer = None;
        st.applied = false;
        let peers = ctx.peer_addresses.clone();
        service.withdraw_addresses(ctx.kernel, &peers);
        service.publish_failure(ctx.store, ConfigError::MediaInactive.kind());
        service.state = Some(MethodState::Manual(st));
        Ok(Outcome::Handled)
    }

    fn state_change(
        &self,
        service: &mut Service,
        addrs: &[KernelAddress],
        ctx: &mut MethodCtx<'_>,
    ) -> Result<Outcome, ConfigError> {
        let mut st = take_state(service)?;

        let conflict = addrs
            .iter()
            .find(|a| a.is_duplicated() && st.addresses.iter().any(|c| c.addr == a.addr))
            .copied();

        if let Some(dup) = conflict {
            // External conflict the daemon cannot resolve; tell the user.
            error!(
                interface = service.key.interface,
                address = %dup.addr,
                "another host is using the configured address"
            );
            if let Err(e) = ctx.kernel.remove_address(&service.key.interface, dup.addr) {
                debug!(address = %dup.addr, error = %e, "conflicted address removal failed");
            }
            service.info.addresses.retain(|h| h.addr != dup.addr);
            st.applied = false;
            st.conflicted = true;
            service.publish_failure(ctx.store, ConfigError::AddressInUse(dup.addr).kind());
        } else if st.applied {
            service.publish_success(ctx.store);
        }

        service.state = Some(MethodState::Manual(st));
        Ok(Outcome::Handled)
    }

    fn change(
        &self,
        service: &mut Service,
        data: &MethodData,
        ctx: &mut MethodCtx<'_>,
    ) -> Result<Outcome, ConfigError> {
        let MethodData::Manual { addresses } = data else {
            return Err(ConfigError::InvalidParameter(
                "manual configuration expected".to_string(),
            ));
        };
        let mut st = take_state(service)?;
        let in_place = same_addresses(&st.addresses, addresses);
        if in_place {
            // Same address set: nothing to do, keep running.
            service.state = Some(MethodState::Manual(st));
            return Ok(Outcome::Handled);
        }
        cancel_link_timer(&mut st, ctx);
        service.state = Some(MethodState::Manual(st));
        Ok(Outcome::NeedsStop)
    }

    fn stop(&self, service: &mut Service, ctx: &mut MethodCtx<'_>) -> Result<Outcome, ConfigError> {
        let mut st = take_state(service)?;
        cancel_link_timer(&mut st, ctx);
        Ok(Outcome::Handled)
    }
}

impl ConfigMethod for ManualMethod {
    fn method_id(&self) -> MethodId {
        MethodId::Manual
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
            MethodEvent::Media(_) => self.media(service, ctx),
            MethodEvent::StateChange(addrs) => self.state_change(service, addrs, ctx),
            MethodEvent::Timer(TimerKind::LinkInactive) => {
                self.link_inactive_expired(service, ctx)
            }
            _ => Ok(Outcome::Handled),
        }
    }
}
