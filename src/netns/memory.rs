//! In-memory [`NetworkHost`] for dry runs and tests.
//!
//! Models just enough kernel behaviour for the lifecycle to be exercised
//! without privileges: named namespaces with a loopback device, veth pairs
//! whose ends die together, TUN devices, addresses, routes that need a
//! reachable gateway or an existing device, NAT rules, resolv.conf overrides
//! and relay processes that react to signals.
//!
//! Every applied operation is recorded, so a dry run can print the exact
//! command lines a real host would see.

use super::error::HostError;
use super::host::{HostOp, NetworkHost, RouteSpec};
use super::relay::RelayCommand;
use super::spec::Ipv4Cidr;
use nix::sys::signal::Signal;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};

/// First PID handed out to simulated relays.
const FIRST_RELAY_PID: u32 = 40_000;

type FailurePredicate = Box<dyn Fn(&HostOp) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkKind {
    Loopback,
    Veth { peer: String },
    Tun,
    Physical,
}

#[derive(Debug, Clone)]
struct Link {
    kind: LinkKind,
    addresses: Vec<Ipv4Cidr>,
    up: bool,
}

impl Link {
    fn new(kind: LinkKind) -> Self {
        Self {
            kind,
            addresses: Vec::new(),
            up: false,
        }
    }
}

/// One network stack: the host's or a namespace's.
#[derive(Debug, Clone, Default)]
struct Stack {
    links: BTreeMap<String, Link>,
    routes: Vec<RouteSpec>,
}

impl Stack {
    fn with_loopback() -> Self {
        let mut stack = Stack::default();
        let mut lo = Link::new(LinkKind::Loopback);
        lo.addresses.push(Ipv4Cidr {
            addr: Ipv4Addr::LOCALHOST,
            prefix: 8,
        });
        stack.links.insert("lo".to_string(), lo);
        stack
    }

    /// Whether `gateway` is on-link through an up interface.
    fn reaches(&self, gateway: Ipv4Addr) -> bool {
        self.links
            .values()
            .any(|l| l.up && l.addresses.iter().any(|a| a.contains(gateway)))
    }

    /// Drop routes that depended on `link`.
    fn forget_link(&mut self, name: &str, link: &Link) {
        self.routes.retain(|r| {
            r.dev.as_deref() != Some(name)
                && !r
                    .via
                    .is_some_and(|via| link.addresses.iter().any(|a| a.contains(via)))
        });
    }
}

#[derive(Debug, Clone)]
struct Relay {
    namespace: String,
    command: String,
    alive: bool,
}

#[derive(Default)]
struct Model {
    host: Stack,
    namespaces: BTreeMap<String, Stack>,
    nat: BTreeSet<Ipv4Cidr>,
    resolv: BTreeMap<String, Vec<Ipv4Addr>>,
    forwarding: bool,
    relays: BTreeMap<u32, Relay>,
    next_pid: u32,
    log: Vec<String>,
    failures: Vec<FailurePredicate>,
    fail_spawn: bool,
    relay_exits: bool,
    relay_ignores_sigterm: bool,
}

impl Model {
    fn stack(&self, namespace: Option<&str>) -> Option<&Stack> {
        match namespace {
            None => Some(&self.host),
            Some(ns) => self.namespaces.get(ns),
        }
    }

    fn stack_mut(&mut self, namespace: Option<&str>) -> Option<&mut Stack> {
        match namespace {
            None => Some(&mut self.host),
            Some(ns) => self.namespaces.get_mut(ns),
        }
    }

    /// Remove a link and, for veth, its peer wherever it lives.
    fn remove_link(&mut self, namespace: Option<&str>, name: &str) -> Option<Link> {
        let stack = self.stack_mut(namespace)?;
        let link = stack.links.remove(name)?;
        stack.forget_link(name, &link);
        if let LinkKind::Veth { ref peer } = link.kind {
            self.remove_peer(peer, name);
        }
        Some(link)
    }

    fn remove_peer(&mut self, peer: &str, of: &str) {
        let is_peer = |l: &Link| matches!(&l.kind, LinkKind::Veth { peer } if peer == of);
        let stacks = std::iter::once(&mut self.host).chain(self.namespaces.values_mut());
        for stack in stacks {
            if let Some(link) = stack.links.get(peer).filter(|l| is_peer(*l)).cloned() {
                stack.links.remove(peer);
                stack.forget_link(peer, &link);
                return;
            }
        }
    }

    fn apply(&mut self, op: &HostOp) -> Result<(), String> {
        match op {
            HostOp::AddNamespace { name } => {
                if self.namespaces.contains_key(name) {
                    return Err(format!(
                        "Cannot create namespace file \"/run/netns/{}\": File exists",
                        name
                    ));
                }
                self.namespaces.insert(name.clone(), Stack::with_loopback());
            }
            HostOp::DeleteNamespace { name } => {
                let stack = self.namespaces.remove(name).ok_or_else(|| {
                    format!(
                        "Cannot remove namespace file \"/run/netns/{}\": No such file or directory",
                        name
                    )
                })?;
                // veth ends inside the namespace take their peers with them
                for (link_name, link) in stack.links {
                    if let LinkKind::Veth { peer } = link.kind {
                        self.remove_peer(&peer, &link_name);
                    }
                }
            }
            HostOp::AddVethPair { host, peer } => {
                for name in [host, peer] {
                    if self.host.links.contains_key(name) {
                        return Err("RTNETLINK answers: File exists".to_string());
                    }
                }
                self.host.links.insert(
                    host.clone(),
                    Link::new(LinkKind::Veth { peer: peer.clone() }),
                );
                self.host.links.insert(
                    peer.clone(),
                    Link::new(LinkKind::Veth { peer: host.clone() }),
                );
            }
            HostOp::MoveLink { link, namespace } => {
                if !self.namespaces.contains_key(namespace) {
                    return Err(format!("Invalid \"netns\" value \"{}\"", namespace));
                }
                if self
                    .namespaces
                    .get(namespace)
                    .is_some_and(|s| s.links.contains_key(link))
                {
                    return Err("RTNETLINK answers: File exists".to_string());
                }
                let mut moved = self
                    .host
                    .links
                    .remove(link)
                    .ok_or_else(|| format!("Cannot find device \"{}\"", link))?;
                // Moving a link between namespaces flushes its addresses
                moved.addresses.clear();
                moved.up = false;
                if let Some(target) = self.namespaces.get_mut(namespace) {
                    target.links.insert(link.clone(), moved);
                }
            }
            HostOp::DeleteLink { namespace, link } => {
                if self.stack(namespace.as_deref()).is_none() {
                    return Err(missing_namespace(namespace));
                }
                self.remove_link(namespace.as_deref(), link)
                    .ok_or_else(|| format!("Cannot find device \"{}\"", link))?;
            }
            HostOp::AddAddress {
                namespace,
                link,
                address,
            } => {
                let stack = self
                    .stack_mut(namespace.as_deref())
                    .ok_or_else(|| missing_namespace(namespace))?;
                let entry = stack
                    .links
                    .get_mut(link)
                    .ok_or_else(|| format!("Cannot find device \"{}\"", link))?;
                if entry.addresses.contains(address) {
                    return Err("RTNETLINK answers: File exists".to_string());
                }
                entry.addresses.push(*address);
            }
            HostOp::SetLinkUp { namespace, link } => {
                let stack = self
                    .stack_mut(namespace.as_deref())
                    .ok_or_else(|| missing_namespace(namespace))?;
                stack
                    .links
                    .get_mut(link)
                    .ok_or_else(|| format!("Cannot find device \"{}\"", link))?
                    .up = true;
            }
            HostOp::AddTun { namespace, link } => {
                let stack = self
                    .namespaces
                    .get_mut(namespace)
                    .ok_or_else(|| missing_namespace(&Some(namespace.clone())))?;
                if stack.links.contains_key(link) {
                    return Err("ioctl(TUNSETIFF): Device or resource busy".to_string());
                }
                stack.links.insert(link.clone(), Link::new(LinkKind::Tun));
            }
            HostOp::AddRoute { namespace, route } => {
                let stack = self
                    .stack_mut(namespace.as_deref())
                    .ok_or_else(|| missing_namespace(namespace))?;
                if let Some(ref dev) = route.dev
                    && !stack.links.get(dev).is_some_and(|l| l.up)
                {
                    return Err(format!("Cannot find device \"{}\"", dev));
                }
                if let Some(via) = route.via
                    && !stack.reaches(via)
                {
                    return Err("RTNETLINK answers: Network is unreachable".to_string());
                }
                if stack.routes.iter().any(|r| r.destination == route.destination) {
                    return Err("RTNETLINK answers: File exists".to_string());
                }
                stack.routes.push(route.clone());
            }
            HostOp::DeleteRoute { namespace, route } => {
                let stack = self
                    .stack_mut(namespace.as_deref())
                    .ok_or_else(|| missing_namespace(namespace))?;
                let before = stack.routes.len();
                stack.routes.retain(|r| r != route);
                if stack.routes.len() == before {
                    return Err("RTNETLINK answers: No such process".to_string());
                }
            }
            HostOp::EnableForwarding => self.forwarding = true,
            HostOp::DisableForwarding => self.forwarding = false,
            HostOp::AddMasquerade { source } => {
                self.nat.insert(source.subnet());
            }
            HostOp::DeleteMasquerade { source } => {
                if !self.nat.remove(&source.subnet()) {
                    return Err(
                        "iptables: Bad rule (does a matching rule exist in that chain?)."
                            .to_string(),
                    );
                }
            }
            HostOp::WriteResolvConf { namespace, servers } => {
                self.resolv.insert(namespace.clone(), servers.clone());
            }
            HostOp::RemoveResolvConf { namespace } => {
                self.resolv.remove(namespace);
            }
        }
        Ok(())
    }
}

fn missing_namespace(namespace: &Option<String>) -> String {
    match namespace {
        Some(ns) => format!(
            "Cannot open network namespace \"{}\": No such file or directory",
            ns
        ),
        None => "host stack unavailable".to_string(),
    }
}

/// What exists on a [`MemoryHost`] at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSnapshot {
    /// Namespace names.
    pub namespaces: Vec<String>,
    /// Host interfaces.
    pub host_links: Vec<String>,
    /// Interfaces per namespace.
    pub namespace_links: BTreeMap<String, Vec<String>>,
    /// Routes per namespace, as `destination` strings.
    pub namespace_routes: BTreeMap<String, Vec<String>>,
    /// Masqueraded subnets.
    pub nat_rules: Vec<Ipv4Cidr>,
    /// Namespaces with a resolv.conf override.
    pub resolv_confs: Vec<String>,
    /// PIDs of running relays.
    pub live_relays: Vec<u32>,
    /// Whether IPv4 forwarding is on.
    pub forwarding: bool,
}

/// Simulated host.
pub struct MemoryHost {
    model: Mutex<Model>,
    baseline: HostSnapshot,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    /// A host with `lo` and `eth0` and nothing else.
    pub fn new() -> Self {
        let mut model = Model {
            host: Stack::with_loopback(),
            next_pid: FIRST_RELAY_PID,
            ..Model::default()
        };
        let mut eth0 = Link::new(LinkKind::Physical);
        eth0.up = true;
        eth0.addresses.push(Ipv4Cidr {
            addr: Ipv4Addr::new(192, 168, 1, 10),
            prefix: 24,
        });
        model.host.links.insert("eth0".to_string(), eth0);

        let mut host = Self {
            model: Mutex::new(model),
            baseline: HostSnapshot {
                namespaces: Vec::new(),
                host_links: Vec::new(),
                namespace_links: BTreeMap::new(),
                namespace_routes: BTreeMap::new(),
                nat_rules: Vec::new(),
                resolv_confs: Vec::new(),
                live_relays: Vec::new(),
                forwarding: false,
            },
        };
        host.baseline = host.snapshot();
        host
    }

    fn lock(&self) -> MutexGuard<'_, Model> {
        self.model.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every operation matching `predicate` fail.
    pub fn fail_when(&self, predicate: impl Fn(&HostOp) -> bool + Send + Sync + 'static) {
        self.lock().failures.push(Box::new(predicate));
    }

    /// Make exactly `op` fail.
    pub fn fail_on(&self, op: HostOp) {
        self.fail_when(move |candidate| *candidate == op);
    }

    /// Stop injecting failures.
    pub fn clear_failures(&self) {
        let mut model = self.lock();
        model.failures.clear();
        model.fail_spawn = false;
        model.relay_exits = false;
    }

    /// Make relay spawns fail.
    pub fn fail_relay_spawn(&self) {
        self.lock().fail_spawn = true;
    }

    /// Make spawned relays exit immediately.
    pub fn relay_exits_on_start(&self) {
        self.lock().relay_exits = true;
    }

    /// Make relays ignore SIGTERM (they still die on SIGKILL).
    pub fn relay_ignores_sigterm(&self, ignore: bool) {
        self.lock().relay_ignores_sigterm = ignore;
    }

    /// Kill a relay behind the orchestrator's back.
    pub fn crash_relay(&self, pid: u32) {
        if let Some(relay) = self.lock().relays.get_mut(&pid) {
            relay.alive = false;
        }
    }

    /// Pre-create a namespace outside the orchestrator.
    pub fn add_namespace(&self, name: &str) {
        self.lock()
            .namespaces
            .insert(name.to_string(), Stack::with_loopback());
    }

    /// Pre-create a host interface outside the orchestrator.
    pub fn add_host_link(&self, name: &str) {
        self.lock()
            .host
            .links
            .insert(name.to_string(), Link::new(LinkKind::Physical));
    }

    /// Command lines of every successful operation, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// A host that already forwards IPv4 before any setup.
    pub fn with_forwarding() -> Self {
        let mut host = Self::new();
        host.lock().forwarding = true;
        host.baseline = host.snapshot();
        host
    }

    /// Namespace the relay with `pid` was started in.
    pub fn relay_namespace(&self, pid: u32) -> Option<String> {
        self.lock().relays.get(&pid).map(|r| r.namespace.clone())
    }

    /// Command line the relay with `pid` was started with.
    pub fn relay_command(&self, pid: u32) -> Option<String> {
        self.lock().relays.get(&pid).map(|r| r.command.clone())
    }

    /// Addresses on an interface.
    pub fn addresses(&self, namespace: Option<&str>, link: &str) -> Vec<Ipv4Cidr> {
        self.lock()
            .stack(namespace)
            .and_then(|s| s.links.get(link))
            .map(|l| l.addresses.clone())
            .unwrap_or_default()
    }

    /// Whether an interface is up.
    pub fn link_up(&self, namespace: Option<&str>, link: &str) -> bool {
        self.lock()
            .stack(namespace)
            .and_then(|s| s.links.get(link))
            .is_some_and(|l| l.up)
    }

    /// Routes in a stack.
    pub fn routes(&self, namespace: Option<&str>) -> Vec<RouteSpec> {
        self.lock()
            .stack(namespace)
            .map(|s| s.routes.clone())
            .unwrap_or_default()
    }

    /// Current state of the simulated host.
    pub fn snapshot(&self) -> HostSnapshot {
        let model = self.lock();
        HostSnapshot {
            namespaces: model.namespaces.keys().cloned().collect(),
            host_links: model.host.links.keys().cloned().collect(),
            namespace_links: model
                .namespaces
                .iter()
                .map(|(ns, s)| (ns.clone(), s.links.keys().cloned().collect()))
                .collect(),
            namespace_routes: model
                .namespaces
                .iter()
                .map(|(ns, s)| {
                    (
                        ns.clone(),
                        s.routes.iter().map(|r| r.destination.clone()).collect(),
                    )
                })
                .collect(),
            nat_rules: model.nat.iter().copied().collect(),
            resolv_confs: model.resolv.keys().cloned().collect(),
            live_relays: model
                .relays
                .iter()
                .filter(|(_, r)| r.alive)
                .map(|(pid, _)| *pid)
                .collect(),
            forwarding: model.forwarding,
        }
    }

    /// Whether the host looks exactly as it did when created.
    pub fn is_pristine(&self) -> bool {
        self.snapshot() == self.baseline
    }
}

impl NetworkHost for MemoryHost {
    fn apply(&self, op: &HostOp) -> Result<(), HostError> {
        let mut model = self.lock();
        if model.failures.iter().any(|fail| fail(op)) {
            return Err(HostError::Simulated(op.command_line()));
        }
        model.apply(op).map_err(|stderr| HostError::CommandError {
            cmd: op.command_line(),
            stderr,
        })?;
        model.log.push(op.command_line());
        Ok(())
    }

    fn namespace_exists(&self, name: &str) -> bool {
        self.lock().namespaces.contains_key(name)
    }

    fn link_exists(&self, namespace: Option<&str>, link: &str) -> bool {
        self.lock()
            .stack(namespace)
            .is_some_and(|s| s.links.contains_key(link))
    }

    fn masquerade_exists(&self, source: &Ipv4Cidr) -> bool {
        self.lock().nat.contains(&source.subnet())
    }

    fn resolv_conf_exists(&self, namespace: &str) -> bool {
        self.lock().resolv.contains_key(namespace)
    }

    fn forwarding_enabled(&self) -> bool {
        self.lock().forwarding
    }

    fn spawn_relay(&self, namespace: &str, command: &RelayCommand) -> Result<u32, HostError> {
        let mut model = self.lock();
        if model.fail_spawn {
            return Err(HostError::SpawnFailed {
                program: command.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "simulated"),
            });
        }
        if !model.namespaces.contains_key(namespace) {
            return Err(HostError::CommandError {
                cmd: format!("ip netns exec {} {}", namespace, command.command_line()),
                stderr: missing_namespace(&Some(namespace.to_string())),
            });
        }
        let pid = model.next_pid;
        model.next_pid += 1;
        let alive = !model.relay_exits;
        model.relays.insert(
            pid,
            Relay {
                namespace: namespace.to_string(),
                command: command.command_line(),
                alive,
            },
        );
        model.log.push(format!(
            "ip netns exec {} {}",
            namespace,
            command.command_line()
        ));
        Ok(pid)
    }

    fn process_alive(&self, pid: u32) -> bool {
        self.lock().relays.get(&pid).is_some_and(|r| r.alive)
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<(), HostError> {
        let mut model = self.lock();
        let ignores_term = model.relay_ignores_sigterm;
        let relay = model
            .relays
            .get_mut(&pid)
            .filter(|r| r.alive)
            .ok_or(HostError::NoSuchProcess { pid })?;
        match signal {
            Signal::SIGKILL => relay.alive = false,
            Signal::SIGTERM | Signal::SIGINT if !ignores_term => relay.alive = false,
            _ => {}
        }
        Ok(())
    }
}
