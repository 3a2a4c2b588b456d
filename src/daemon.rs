//! Daemon core: reconciles desired configuration from the dynamic store
//! against the live per-interface state and runs the single-threaded event
//! loop everything else is scheduled on.
//!
//! All state-machine processing is synchronous inside [`Engine`]; the only
//! suspension points are the timer facility, router-discovery socket
//! readability, and relay name resolution. Events for a service are
//! delivered in the order the daemon observes them.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{
    self, IPV4_PRIMARY_KEY, SETUP_PREFIX, ServiceConfig, ServiceSetup, parse_setup_key,
};
use crate::icmp6::{RaSocketSet, RecvPacket};
use crate::interface::{Interface, Inventory};
use crate::kernel::{AddressManager, LinkStatus, SysAddressManager};
use crate::method::{self, Ipv4Primary, MethodData, MethodCtx, MethodIo};
use crate::service::{MethodId, Service, ServiceKey};
use crate::store::Store;
use crate::timer::{TimerEvent, Timers};
use crate::ifstate::IfStateTable;

/// Asynchronous completions delivered into the event loop.
pub enum Event {
    RaPacket { key: ServiceKey, packet: RecvPacket },
    RelayResolved { key: ServiceKey, answers: Vec<IpAddr> },
}

pub type EventSender = UnboundedSender<Event>;

/// Production [`MethodIo`]: raw router-discovery sockets plus relay name
/// resolution on the runtime's blocking pool.
pub struct SysMethodIo {
    sockets: RaSocketSet,
    events: EventSender,
    resolves: HashMap<ServiceKey, JoinHandle<()>>,
}

impl SysMethodIo {
    pub fn new(events: EventSender) -> Self {
        SysMethodIo {
            sockets: RaSocketSet::new(events.clone()),
            events,
            resolves: HashMap::new(),
        }
    }
}

impl MethodIo for SysMethodIo {
    fn open_ra(&mut self, key: &ServiceKey, interface: &Interface) -> io::Result<()> {
        self.sockets.open(key, interface)
    }

    fn send_solicitation(&mut self, key: &ServiceKey, message: &[u8]) -> io::Result<()> {
        self.sockets.send_solicitation(key, message)
    }

    fn close_ra(&mut self, key: &ServiceKey) {
        self.sockets.close(key);
    }

    fn resolve_relay(&mut self, key: &ServiceKey, name: &str) {
        self.cancel_resolve(key);
        let events = self.events.clone();
        let task_key = key.clone();
        let name = name.to_string();
        let task = tokio::task::spawn_local(async move {
            let answers = match tokio::net::lookup_host((name.as_str(), 0)).await {
                Ok(found) => {
                    let mut answers: Vec<IpAddr> = Vec::new();
                    for sockaddr in found {
                        if !answers.contains(&sockaddr.ip()) {
                            answers.push(sockaddr.ip());
                        }
                    }
                    answers
                }
                Err(e) => {
                    debug!(name, error = %e, "relay resolution failed");
                    Vec::new()
                }
            };
            let _ = events.send(Event::RelayResolved {
                key: task_key,
                answers,
            });
        });
        self.resolves.insert(key.clone(), task);
    }

    fn cancel_resolve(&mut self, key: &ServiceKey) {
        if let Some(task) = self.resolves.remove(key) {
            task.abort();
        }
    }
}

/// The reconciliation engine. Owns every piece of daemon state; all event
/// handling happens synchronously on the caller's (single) thread.
pub struct Engine<K: AddressManager, IO: MethodIo> {
    inventory: Inventory,
    ifstates: IfStateTable,
    kernel: K,
    io: IO,
    store: Store,
    timers: Timers,
    ipv4_primary: Ipv4Primary,
}

impl<K: AddressManager, IO: MethodIo> Engine<K, IO> {
    pub fn new(kernel: K, io: IO) -> Self {
        Engine {
            inventory: Inventory::empty(),
            ifstates: IfStateTable::new(),
            kernel,
            io,
            store: Store::new(),
            timers: Timers::new(),
            ipv4_primary: Ipv4Primary::default(),
        }
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn timers_mut(&mut self) -> &mut Timers {
        &mut self.timers
    }

    /// Re-enumerate interfaces from the kernel.
    pub fn refresh_inventory(&mut self) -> io::Result<()> {
        self.inventory.refresh()
    }

    /// Deliver one event to one service with the full dispatch context.
    fn dispatch<F, R>(&mut self, key: &ServiceKey, f: F) -> Option<R>
    where
        F: FnOnce(&mut Service, &mut MethodCtx<'_>) -> R,
    {
        let ifstate = self.ifstates.get_mut(&key.interface)?;
        let interface = ifstate.interface.clone();
        let link = ifstate.link;
        let peer_addresses = ifstate.peer_addresses(key);
        let index = ifstate.service_index(key)?;
        let service = ifstate.service_at_mut(index);

        let mut ctx = MethodCtx {
            interface: &interface,
            link,
            peer_addresses,
            kernel: &mut self.kernel,
            store: &mut self.store,
            timers: &mut self.timers,
            io: &mut self.io,
            ipv4_primary: &self.ipv4_primary,
        };
        Some(f(service, &mut ctx))
    }

    /// Create the IFState for `ifname` if the interface exists, together
    /// with its private link-local service.
    fn ensure_ifstate(&mut self, ifname: &str) -> bool {
        if self.ifstates.get(ifname).is_some() {
            return true;
        }
        let Some(interface) = self.inventory.get(ifname).cloned() else {
            return false;
        };
        let link = self
            .kernel
            .link_status(ifname)
            .unwrap_or_else(|_| LinkStatus::unknown());

        let ifstate = self.ifstates.get_or_create(&interface);
        ifstate.link = link;
        info!(interface = ifname, "interface state created");

        let ll_key = ServiceKey::link_local(ifname);
        let ll = Service::new(ll_key.clone(), MethodId::LinkLocal);
        if self
            .ifstates
            .get_mut(ifname)
            .and_then(|s| s.add_service(ll).ok())
            .is_some()
        {
            self.dispatch(&ll_key, |svc, ctx| {
                let _ = method::start(svc, &MethodData::LinkLocal, ctx);
            });
        }
        true
    }

    /// Stop a service and detach it from its IFState.
    fn remove_service(&mut self, key: &ServiceKey) {
        info!(service = %key, "stopping service");
        self.dispatch(key, |svc, ctx| {
            if let Err(e) = method::stop(svc, ctx) {
                warn!(service = %svc.key, error = %e, "stop failed");
            }
        });
        if let Some(ifstate) = self.ifstates.get_mut(&key.interface)
            && let Some(index) = ifstate.service_index(key)
        {
            ifstate.take_service(index);
        }
    }

    /// Stop everything on an interface (link-local last) and drop its state.
    fn teardown_interface(&mut self, ifname: &str) {
        let Some(ifstate) = self.ifstates.get(ifname) else {
            return;
        };
        info!(interface = ifname, "tearing down interface state");
        let mut keys = ifstate.service_keys();
        keys.sort_by_key(|k| k.is_link_local());
        for key in keys {
            self.remove_service(&key);
        }
        self.ifstates.remove(ifname);
    }

    /// Apply one desired service configuration to the live state.
    fn apply_config(&mut self, desired: &ServiceConfig) {
        if !self.ensure_ifstate(&desired.interface) {
            debug!(
                service = desired.id,
                interface = desired.interface,
                "interface not present, service deferred"
            );
            return;
        }

        let key = ServiceKey::new(&desired.interface, &desired.id);
        let existing_method = self
            .ifstates
            .get(&desired.interface)
            .and_then(|s| s.services().iter().find(|svc| svc.key == key))
            .map(|svc| svc.method);

        match existing_method {
            Some(method_id) if method_id == desired.method => {
                let needs_stop = self
                    .dispatch(&key, |svc, ctx| method::change(svc, &desired.data, ctx))
                    .unwrap_or(Ok(false));
                match needs_stop {
                    Ok(false) => return,
                    Ok(true) => {
                        // Incompatible in place: forced stop, then restart.
                        self.dispatch(&key, |svc, ctx| {
                            let _ = method::stop(svc, ctx);
                        });
                        self.start_service(&key, desired);
                    }
                    Err(e) => {
                        warn!(service = %key, error = %e, "change failed");
                    }
                }
                return;
            }
            Some(_) => {
                // Method changed entirely: the old service goes away.
                self.remove_service(&key);
            }
            None => {}
        }

        let service = Service::new(key.clone(), desired.method);
        let added = self
            .ifstates
            .get_mut(&desired.interface)
            .map(|s| s.add_service(service));
        match added {
            Some(Ok(_)) => {
                info!(service = %key, method = desired.method.as_str(), "starting service");
                self.start_service(&key, desired);
            }
            Some(Err(e)) => {
                // Invariant violation (e.g. a second dynamic method); record
                // the failure where the service would have published.
                warn!(service = %key, error = %e, "service rejected");
                let mut rejected = Service::new(key, desired.method);
                rejected.publish_failure(&mut self.store, e.kind());
            }
            None => {}
        }
    }

    fn start_service(&mut self, key: &ServiceKey, desired: &ServiceConfig) {
        let started = self
            .dispatch(key, |svc, ctx| method::start(svc, &desired.data, ctx))
            .unwrap_or(Ok(()));
        if started.is_err() {
            // Failure already published; the service record goes away.
            if let Some(ifstate) = self.ifstates.get_mut(&key.interface)
                && let Some(index) = ifstate.service_index(key)
            {
                ifstate.take_service(index);
            }
        }
    }

    /// Reconcile the store's desired configuration against live services.
    pub fn reconcile(&mut self) {
        let mut desired: Vec<ServiceConfig> = Vec::new();
        for (store_key, value) in self.store.list(SETUP_PREFIX) {
            let Some(id) = parse_setup_key(&store_key) else {
                continue;
            };
            let setup: ServiceSetup = match serde_json::from_value(value) {
                Ok(setup) => setup,
                Err(e) => {
                    warn!(service = id, error = %e, "malformed setup record");
                    continue;
                }
            };
            match ServiceConfig::from_setup(id, &setup) {
                Ok(config) => desired.push(config),
                Err(e) => {
                    warn!(service = id, error = %e, "unusable setup record");
                }
            }
        }

        // Services that are no longer desired (or moved interfaces) stop.
        for ifname in self.ifstates.names() {
            let keys = self
                .ifstates
                .get(&ifname)
                .map(|s| s.service_keys())
                .unwrap_or_default();
            for key in keys {
                let Some(id) = key.id.clone() else {
                    continue;
                };
                let still_wanted = desired
                    .iter()
                    .any(|c| c.id == id && c.interface == key.interface);
                if !still_wanted {
                    self.remove_service(&key);
                }
            }
        }

        for config in &desired {
            self.apply_config(config);
        }

        // Interface state with nothing configured left on it goes away.
        let desired_interfaces: HashSet<String> =
            desired.iter().map(|c| c.interface.clone()).collect();
        for ifname in self.ifstates.names() {
            let only_ll = self
                .ifstates
                .get(&ifname)
                .map(|s| s.only_link_local_left())
                .unwrap_or(true);
            if only_ll && !desired_interfaces.contains(&ifname) {
                self.teardown_interface(&ifname);
            }
        }
    }

    /// Drop state for interfaces that disappeared and refresh the snapshots
    /// of those that remain.
    pub fn sync_interfaces(&mut self) {
        for ifname in self.ifstates.names() {
            match self.inventory.get(&ifname).cloned() {
                Some(interface) => {
                    if let Some(ifstate) = self.ifstates.get_mut(&ifname) {
                        ifstate.interface = interface;
                    }
                }
                None => self.teardown_interface(&ifname),
            }
        }
    }

    /// Compare kernel-reported link status and address lists against the
    /// cached copies and deliver Media/StateChange events for the deltas.
    pub fn poll_state(&mut self) {
        for ifname in self.ifstates.names() {
            let link = match self.kernel.link_status(&ifname) {
                Ok(link) => link,
                Err(e) => {
                    debug!(interface = ifname, error = %e, "link status unavailable");
                    continue;
                }
            };
            let changed = self
                .ifstates
                .get_mut(&ifname)
                .map(|ifstate| {
                    let changed = ifstate.link != link;
                    ifstate.link = link;
                    changed
                })
                .unwrap_or(false);
            if changed {
                info!(
                    interface = ifname,
                    active = link.active,
                    "link status changed"
                );
                self.deliver_media(&ifname, link);
            }

            let addresses = match self.kernel.interface_addresses(&ifname) {
                Ok(addresses) => addresses,
                Err(e) => {
                    debug!(interface = ifname, error = %e, "address list unavailable");
                    continue;
                }
            };
            let changed = self
                .ifstates
                .get_mut(&ifname)
                .map(|ifstate| {
                    let changed = ifstate.last_addresses != addresses;
                    if changed {
                        ifstate.last_addresses = addresses.clone();
                    }
                    changed
                })
                .unwrap_or(false);
            if changed {
                let keys = self
                    .ifstates
                    .get(&ifname)
                    .map(|s| s.service_keys())
                    .unwrap_or_default();
                for key in keys {
                    self.dispatch(&key, |svc, ctx| {
                        method::state_change(svc, &addresses, ctx);
                    });
                }
            }
        }

        self.refresh_ipv4_primary();
    }

    fn deliver_media(&mut self, ifname: &str, link: LinkStatus) {
        let keys = self
            .ifstates
            .get(ifname)
            .map(|s| s.service_keys())
            .unwrap_or_default();
        for key in keys {
            self.dispatch(&key, |svc, ctx| {
                method::media(svc, link, ctx);
            });
        }
    }

    fn refresh_ipv4_primary(&mut self) {
        let primary = config::parse_ipv4_primary(self.store.get(IPV4_PRIMARY_KEY));
        if primary == self.ipv4_primary {
            return;
        }
        info!(addresses = ?primary.addresses, "primary IPv4 service changed");
        self.ipv4_primary = primary;
        for ifname in self.ifstates.names() {
            let keys = self
                .ifstates
                .get(&ifname)
                .map(|s| {
                    s.services()
                        .iter()
                        .filter(|svc| svc.method == MethodId::SixToFour)
                        .map(|svc| svc.key.clone())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            for key in keys {
                self.dispatch(&key, |svc, ctx| {
                    method::ipv4_primary_change(svc, ctx);
                });
            }
        }
    }

    /// React to a changed store key the daemon subscribed to.
    pub fn handle_store_key(&mut self, key: &str) {
        if key == IPV4_PRIMARY_KEY {
            self.refresh_ipv4_primary();
        } else if parse_setup_key(key).is_some() {
            self.reconcile();
        }
    }

    /// Route an asynchronous completion to its service.
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::RaPacket { key, packet } => {
                self.dispatch(&key, |svc, ctx| {
                    method::packet(svc, &packet, ctx);
                });
            }
            Event::RelayResolved { key, answers } => {
                self.dispatch(&key, |svc, ctx| {
                    method::relay_resolved(svc, &answers, ctx);
                });
            }
        }
    }

    /// Route a fired per-service timer to its service.
    pub fn handle_timer(&mut self, event: TimerEvent) {
        if let TimerEvent::Service { key, kind } = event {
            self.dispatch(&key, |svc, ctx| {
                method::timer(svc, kind, ctx);
            });
        }
    }

    /// Stop every service; addresses are withdrawn on the way out.
    pub fn shutdown(&mut self) {
        for ifname in self.ifstates.names() {
            self.teardown_interface(&ifname);
        }
    }
}

/// Production engine over the real kernel and socket transports.
pub type SysEngine = Engine<SysAddressManager, SysMethodIo>;

/// CLI-level options for the daemon.
pub struct DaemonOptions {
    pub preferences: Option<PathBuf>,
    pub poll_interval: Duration,
}

/// The daemon: an engine plus the event loop around it.
pub struct Daemon {
    engine: SysEngine,
    events_rx: UnboundedReceiver<Event>,
    store_rx: UnboundedReceiver<String>,
    poll_interval: Duration,
}

impl Daemon {
    pub fn new(options: DaemonOptions) -> anyhow::Result<Self> {
        let (events_tx, events_rx) = unbounded_channel();
        let (store_tx, store_rx) = unbounded_channel();

        let kernel = SysAddressManager::new()?;
        let io = SysMethodIo::new(events_tx.clone());
        let mut engine = Engine::new(kernel, io);

        engine.store_mut().subscribe(SETUP_PREFIX, store_tx.clone());
        engine.store_mut().subscribe(IPV4_PRIMARY_KEY, store_tx);

        if let Some(path) = &options.preferences {
            let prefs = config::load_preferences(path)?;
            config::seed_store(engine.store_mut(), &prefs);
            info!(
                count = prefs.services.len(),
                path = %path.display(),
                "preferences seeded"
            );
        }

        Ok(Daemon {
            engine,
            events_rx,
            store_rx,
            poll_interval: options.poll_interval,
        })
    }

    fn poll_tick(&mut self) {
        if let Err(e) = self.engine.refresh_inventory() {
            warn!(error = %e, "interface enumeration failed");
        }
        self.engine.sync_interfaces();
        self.engine.reconcile();
        self.engine.poll_state();
    }

    /// Run until SIGINT/SIGTERM; stops every service before returning.
    pub async fn run(mut self) -> anyhow::Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        self.poll_tick();
        self.engine
            .timers_mut()
            .schedule(self.poll_interval, TimerEvent::Poll);

        loop {
            let wake = self
                .engine
                .timers_mut()
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = sigint.recv() => {
                    info!("received SIGINT, shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down...");
                    break;
                }
                Some(key) = self.store_rx.recv() => {
                    self.engine.handle_store_key(&key);
                }
                Some(event) = self.events_rx.recv() => {
                    self.engine.handle_event(event);
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {
                    for fired in self.engine.timers_mut().pop_due(Instant::now()) {
                        match fired {
                            TimerEvent::Poll => {
                                self.poll_tick();
                                self.engine
                                    .timers_mut()
                                    .schedule(self.poll_interval, TimerEvent::Poll);
                            }
                            other => self.engine.handle_timer(other),
                        }
                    }
                }
            }
        }

        self.engine.shutdown();
        Ok(())
    }
}
